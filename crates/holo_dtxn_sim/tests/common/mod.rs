//! Shared helpers for simulator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use holo_dtxn_sim::cluster::{ClusterConfig, LocalCluster};
use holo_dtxn_sim::history::{OpRecord, OpResult};
use holo_dtxn_sim::workload::WorkloadConfig;

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn start(partitions: u64, k_factor: u32, initiators: u64) -> Arc<LocalCluster> {
    let mut config = ClusterConfig::new(partitions, k_factor);
    config.initiators = initiators;
    Arc::new(LocalCluster::start(config).expect("start cluster"))
}

pub fn start_with(config: ClusterConfig) -> Arc<LocalCluster> {
    Arc::new(LocalCluster::start(config).expect("start cluster"))
}

/// A short mixed workload; fixed seed so failures reproduce.
pub fn short_workload(seed: u64) -> WorkloadConfig {
    let mut config = WorkloadConfig::new(seed, Duration::from_millis(400));
    config.clients = 4;
    config.keys = 4;
    config.mp_pct = 20;
    config.write_pct = 60;
    config.abort_pct = 10;
    config
}

/// Settle and compare replicas, asserting each step.
pub async fn settle_and_verify(cluster: &LocalCluster) {
    assert!(
        cluster.settle(SETTLE_TIMEOUT).await.expect("settle"),
        "replicas did not catch up"
    );
    for report in cluster.verify_replicas().expect("verify") {
        assert!(
            report.is_consistent(),
            "partition {} diverged: {:?}",
            report.partition_id,
            report.divergence
        );
    }
}

pub fn value(op: &OpRecord) -> Option<i64> {
    match op.result {
        OpResult::Ok { value } => Some(value),
        _ => None,
    }
}
