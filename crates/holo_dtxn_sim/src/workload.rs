//! Seeded client workload against a `LocalCluster`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::join_all;
use holo_dtxn::dtxn::TxnTarget;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;

use crate::cluster::LocalCluster;
use crate::engine::{CounterArgs, Procedure};
use crate::history::{OpRecord, OpResult};

#[derive(Clone, Debug)]
pub struct WorkloadConfig {
    pub clients: usize,
    pub keys: usize,
    /// Percent of calls that span every partition.
    pub mp_pct: u8,
    /// Percent of calls that write.
    pub write_pct: u8,
    /// Percent of single-partition writes that abort after writing.
    pub abort_pct: u8,
    pub duration: Duration,
    pub seed: u64,
    pub op_timeout: Duration,
    /// Stop the whole run on the first call that errors or times out.
    pub fail_fast: bool,
}

impl WorkloadConfig {
    pub fn new(seed: u64, duration: Duration) -> Self {
        Self {
            clients: 4,
            keys: 8,
            mp_pct: 10,
            write_pct: 50,
            abort_pct: 5,
            duration,
            seed,
            op_timeout: Duration::from_secs(10),
            fail_fast: true,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.clients > 0, "clients must be > 0");
        anyhow::ensure!(self.keys > 0, "keys must be > 0");
        anyhow::ensure!(self.mp_pct <= 100, "mp_pct must be <= 100");
        anyhow::ensure!(self.write_pct <= 100, "write_pct must be <= 100");
        anyhow::ensure!(self.abort_pct <= 100, "abort_pct must be <= 100");
        Ok(())
    }
}

/// Drive `config.clients` concurrent clients until the deadline and return
/// every call they made, ordered by call time.
pub async fn run_workload(
    cluster: Arc<LocalCluster>,
    config: WorkloadConfig,
) -> anyhow::Result<Vec<OpRecord>> {
    config.validate()?;
    let keyspace: Arc<Vec<String>> = Arc::new(
        (0..config.keys)
            .map(|i| format!("{}_k{i}", config.seed))
            .collect(),
    );
    let start = time::Instant::now();
    let deadline = start + config.duration;

    let tasks = (0..config.clients).map(|client_id| {
        let cluster = cluster.clone();
        let keyspace = keyspace.clone();
        let config = config.clone();
        // Mix the base seed with the client id for a per-client stream.
        let seed = config.seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tokio::spawn(async move {
            run_client(client_id, cluster, keyspace, config, seed, start, deadline).await
        })
    });

    let mut all_ops = Vec::new();
    for result in join_all(tasks).await {
        let mut ops = result.context("client task panicked")??;
        all_ops.append(&mut ops);
    }
    all_ops.sort_by_key(|op| (op.call_us, op.client));
    Ok(all_ops)
}

fn pick_procedure(rng: &mut SmallRng, config: &WorkloadConfig) -> Procedure {
    let multi = rng.gen_range(0..100) < u32::from(config.mp_pct);
    let write = rng.gen_range(0..100) < u32::from(config.write_pct);
    match (multi, write) {
        (true, true) => Procedure::IncrementAll,
        (true, false) => Procedure::SumAll,
        (false, true) if rng.gen_range(0..100) < u32::from(config.abort_pct) => Procedure::Abort,
        (false, true) => Procedure::Increment,
        (false, false) => Procedure::Read,
    }
}

async fn run_client(
    client_id: usize,
    cluster: Arc<LocalCluster>,
    keyspace: Arc<Vec<String>>,
    config: WorkloadConfig,
    seed: u64,
    start: time::Instant,
    deadline: time::Instant,
) -> anyhow::Result<Vec<OpRecord>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let initiators = cluster.initiators();
    let initiator = initiators[client_id % initiators.len()].clone();
    let mut ops = Vec::new();

    while time::Instant::now() < deadline {
        let procedure = pick_procedure(&mut rng, &config);
        let key = keyspace[rng.gen_range(0..keyspace.len())].clone();
        let delta = rng.gen_range(1..=10);
        let (partition, target) = if procedure.multi_partition() {
            (None, TxnTarget::MultiPartition)
        } else {
            let partition = cluster.partition_for_key(&key);
            (Some(partition), TxnTarget::SinglePartition(partition))
        };
        let invocation = CounterArgs::new(key.clone(), delta).invocation(procedure)?;

        let call_us = start.elapsed().as_micros() as u64;
        let (txn_id, result) = match initiator.submit(invocation, procedure.read_only(), target) {
            Ok((txn_id, rx)) => {
                let result = match time::timeout(config.op_timeout, rx).await {
                    Ok(Ok(response)) => OpResult::from_response(&response),
                    Ok(Err(_)) => OpResult::Err {
                        error: "initiator dropped the call".to_string(),
                    },
                    Err(_) => OpResult::Err {
                        error: "call timed out".to_string(),
                    },
                };
                (Some(txn_id), result)
            }
            Err(err) => (
                None,
                OpResult::Err {
                    error: err.to_string(),
                },
            ),
        };
        let return_us = start.elapsed().as_micros() as u64;

        let error = match &result {
            OpResult::Err { error } => Some(error.clone()),
            _ => None,
        };
        ops.push(OpRecord {
            client: client_id,
            initiator: initiator.initiator_id(),
            txn_id,
            procedure,
            key,
            delta,
            partition,
            call_us,
            return_us,
            result,
        });
        if let Some(error) = error.filter(|_| config.fail_fast) {
            anyhow::bail!("client {client_id} call failed: {error}");
        }
    }
    tracing::debug!(client_id, ops = ops.len(), "client finished");
    Ok(ops)
}
