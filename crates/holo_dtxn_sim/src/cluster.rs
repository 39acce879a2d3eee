//! In-process cluster: every site and initiator runs as a tokio task over one
//! `LocalRouter`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use holo_dtxn::dtxn::{
    Address, DtxnResult, ExecutionSite, ExhaustedTxnPolicy, FaultEvent, Initiator,
    InitiatorConfig, InitiatorId, LocalRouter, Mailbox, Message, PartitionId, SiteConfig, SiteId,
    SiteTracker, StaticTopology,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time;

use crate::engine::{CounterEngine, ExecutedTxn, ExecutionLog};

/// How long a crashed site may take to stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub partitions: u64,
    /// Extra replicas per partition.
    pub k_factor: u32,
    pub initiators: u64,
    pub use_safety_dance: bool,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub exhausted_policy: ExhaustedTxnPolicy,
}

impl ClusterConfig {
    pub fn new(partitions: u64, k_factor: u32) -> Self {
        Self {
            partitions,
            k_factor,
            initiators: 1,
            use_safety_dance: false,
            poll_interval: Duration::from_millis(5),
            heartbeat_interval: Duration::from_millis(5),
            exhausted_policy: ExhaustedTxnPolicy::default(),
        }
    }

    pub fn replicas(&self) -> u64 {
        u64::from(self.k_factor) + 1
    }
}

/// How a site or initiator task ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutcome {
    Stopped,
    /// Killed by `fail_site`.
    Crashed,
    Halted { error: String, fatal: bool },
    Panicked { error: String },
    /// Did not stop within the shutdown timeout.
    Hung,
}

impl TaskOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskOutcome::Halted { fatal: true, .. })
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, TaskOutcome::Stopped | TaskOutcome::Crashed)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterOutcome {
    pub sites: BTreeMap<SiteId, TaskOutcome>,
    pub initiators: BTreeMap<InitiatorId, TaskOutcome>,
}

impl ClusterOutcome {
    pub fn is_clean(&self) -> bool {
        self.sites
            .values()
            .chain(self.initiators.values())
            .all(TaskOutcome::is_clean)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SiteSummary {
    pub site_id: SiteId,
    pub failed: bool,
    pub committed: usize,
    pub rolled_back: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionReport {
    pub partition_id: PartitionId,
    pub sites: Vec<SiteSummary>,
    /// First disagreement between replicas, if any.
    pub divergence: Option<String>,
}

impl PartitionReport {
    pub fn is_consistent(&self) -> bool {
        self.divergence.is_none()
    }
}

#[derive(Default)]
struct Tasks {
    sites: BTreeMap<SiteId, JoinHandle<DtxnResult<()>>>,
    initiators: BTreeMap<InitiatorId, JoinHandle<DtxnResult<()>>>,
}

pub struct LocalCluster {
    config: ClusterConfig,
    router: LocalRouter,
    topology: Arc<StaticTopology>,
    initiators: Vec<Arc<Initiator>>,
    logs: BTreeMap<SiteId, ExecutionLog>,
    failed: Mutex<BTreeSet<SiteId>>,
    tasks: Mutex<Tasks>,
}

impl LocalCluster {
    /// Spawn every site and initiator. Must be called inside a tokio runtime.
    pub fn start(config: ClusterConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(config.partitions > 0, "cluster needs at least one partition");
        anyhow::ensure!(config.initiators > 0, "cluster needs at least one initiator");

        let router = LocalRouter::new();
        let topology = Arc::new(StaticTopology::uniform(
            config.partitions,
            config.replicas(),
        ));
        let initiator_ids: Vec<InitiatorId> = (1..=config.initiators).collect();
        let mut tasks = Tasks::default();

        let mut logs = BTreeMap::new();
        for site_id in topology.all_sites() {
            let partition_id = topology
                .partition_for_site(site_id)
                .with_context(|| format!("site {site_id} has no partition"))?;
            let log = ExecutionLog::default();
            let mut site_config = SiteConfig::new(site_id, partition_id, initiator_ids.clone());
            site_config.use_safety_dance = config.use_safety_dance;
            site_config.poll_interval = config.poll_interval;
            let site = ExecutionSite::new(
                site_config,
                Box::new(CounterEngine::new(site_id, log.clone())),
                Arc::new(router.clone()),
                topology.clone(),
            );
            let inbox = router.register(Address::Site(site_id))?;
            tasks.sites.insert(site_id, tokio::spawn(site.run(inbox)));
            logs.insert(site_id, log);
        }

        let mut initiators = Vec::with_capacity(initiator_ids.len());
        for initiator_id in initiator_ids {
            let mut initiator_config = InitiatorConfig::new(initiator_id);
            initiator_config.k_factor = config.k_factor;
            initiator_config.heartbeat_interval = config.heartbeat_interval;
            initiator_config.exhausted_policy = config.exhausted_policy;
            let initiator = Arc::new(Initiator::new(
                initiator_config,
                Arc::new(router.clone()),
                topology.clone(),
            )?);
            let inbox = router.register(Address::Initiator(initiator_id))?;
            tasks
                .initiators
                .insert(initiator_id, tokio::spawn(initiator.clone().run(inbox)));
            initiators.push(initiator);
        }

        tracing::info!(
            partitions = config.partitions,
            k_factor = config.k_factor,
            sites = logs.len(),
            initiators = initiators.len(),
            safety_dance = config.use_safety_dance,
            "local cluster started"
        );
        Ok(Self {
            config,
            router,
            topology,
            initiators,
            logs,
            failed: Mutex::new(BTreeSet::new()),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn initiators(&self) -> &[Arc<Initiator>] {
        &self.initiators
    }

    pub fn sites(&self) -> Vec<SiteId> {
        self.logs.keys().copied().collect()
    }

    pub fn partition_of(&self, site_id: SiteId) -> Option<PartitionId> {
        self.topology.partition_for_site(site_id)
    }

    /// Partition owning `key`.
    pub fn partition_for_key(&self, key: &str) -> PartitionId {
        let hash = blake3::hash(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(prefix) % self.config.partitions
    }

    /// The lowest site id: partition 0's first replica, which coordinates
    /// multipartition work. None when losing a site would lose a partition.
    pub fn default_victim(&self) -> Option<SiteId> {
        if self.config.k_factor == 0 {
            return None;
        }
        self.logs.keys().next().copied()
    }

    pub fn execution_log(&self, site_id: SiteId) -> anyhow::Result<Vec<ExecutedTxn>> {
        let log = self
            .logs
            .get(&site_id)
            .with_context(|| format!("unknown site {site_id}"))?;
        let log = log
            .lock()
            .map_err(|_| anyhow::anyhow!("execution log lock poisoned"))?;
        Ok(log.clone())
    }

    fn tasks(&self) -> anyhow::Result<MutexGuard<'_, Tasks>> {
        self.tasks
            .lock()
            .map_err(|_| anyhow::anyhow!("cluster task lock poisoned"))
    }

    fn failed_sites(&self) -> anyhow::Result<BTreeSet<SiteId>> {
        Ok(self
            .failed
            .lock()
            .map_err(|_| anyhow::anyhow!("failed site lock poisoned"))?
            .clone())
    }

    /// Initiators whose loop already ended. Only a fatal error ends one
    /// before shutdown.
    pub fn stopped_initiators(&self) -> anyhow::Result<Vec<InitiatorId>> {
        Ok(self
            .tasks()?
            .initiators
            .iter()
            .filter(|(_, task)| task.is_finished())
            .map(|(initiator_id, _)| *initiator_id)
            .collect())
    }

    /// Crash `site_id` and report the failure to every survivor. The site is
    /// stopped before the fault goes out, so none of its messages trail it.
    pub async fn fail_site(&self, site_id: SiteId) -> anyhow::Result<()> {
        anyhow::ensure!(self.logs.contains_key(&site_id), "unknown site {site_id}");
        {
            let mut failed = self
                .failed
                .lock()
                .map_err(|_| anyhow::anyhow!("failed site lock poisoned"))?;
            anyhow::ensure!(failed.insert(site_id), "site {site_id} already failed");
        }
        let aborted = match self.tasks()?.sites.get(&site_id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        };
        if aborted {
            self.wait_for_site_stop(site_id).await?;
        }
        self.router.deregister(Address::Site(site_id))?;
        self.topology.mark_failed(site_id);

        let event = FaultEvent {
            failed_sites: BTreeSet::from([site_id]),
            failed_initiators: BTreeSet::new(),
        };
        for survivor in self.topology.live_sites() {
            self.router
                .send(Address::Site(survivor), Message::Fault(event.clone()))?;
        }
        for initiator in &self.initiators {
            initiator.handle_site_failure(site_id)?;
        }
        tracing::warn!(site_id, "site failed");
        Ok(())
    }

    async fn wait_for_site_stop(&self, site_id: SiteId) -> anyhow::Result<()> {
        let deadline = time::Instant::now() + STOP_TIMEOUT;
        loop {
            let finished = self
                .tasks()?
                .sites
                .get(&site_id)
                .map_or(true, |task| task.is_finished());
            if finished {
                return Ok(());
            }
            anyhow::ensure!(
                time::Instant::now() < deadline,
                "site {site_id} did not stop"
            );
            time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Wait until the live replicas of every partition have finished the same
    /// number of transactions. Returns false if that does not happen before
    /// `timeout`.
    pub async fn settle(&self, timeout: Duration) -> anyhow::Result<bool> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if self.replicas_caught_up()? {
                return Ok(true);
            }
            if time::Instant::now() >= deadline {
                return Ok(false);
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn replicas_caught_up(&self) -> anyhow::Result<bool> {
        for partition_id in self.topology.partitions() {
            let mut lengths = BTreeSet::new();
            for site_id in self.topology.live_sites_for_partition(partition_id) {
                lengths.insert(self.execution_log(site_id)?.len());
            }
            if lengths.len() > 1 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Compare what every replica of each partition executed. Live replicas
    /// must agree exactly. A failed replica must have executed a prefix of the
    /// survivors' sequence; only its last transaction's outcome may differ.
    pub fn verify_replicas(&self) -> anyhow::Result<Vec<PartitionReport>> {
        let failed = self.failed_sites()?;
        let mut reports = Vec::new();
        for partition_id in self.topology.partitions() {
            let mut sites = Vec::new();
            let mut logs = Vec::new();
            for site_id in self.sites() {
                if self.partition_of(site_id) != Some(partition_id) {
                    continue;
                }
                let log = self.execution_log(site_id)?;
                sites.push(SiteSummary {
                    site_id,
                    failed: failed.contains(&site_id),
                    committed: log.iter().filter(|txn| !txn.rolled_back).count(),
                    rolled_back: log.iter().filter(|txn| txn.rolled_back).count(),
                });
                logs.push((site_id, failed.contains(&site_id), log));
            }
            let divergence = compare_replicas(&logs);
            if let Some(detail) = &divergence {
                tracing::error!(partition_id, detail = %detail, "replicas diverged");
            }
            reports.push(PartitionReport {
                partition_id,
                sites,
                divergence,
            });
        }
        Ok(reports)
    }

    /// Close every inbox and collect how each task ended.
    pub async fn shutdown(&self, timeout: Duration) -> anyhow::Result<ClusterOutcome> {
        let tasks = std::mem::take(&mut *self.tasks()?);
        let failed = self.failed_sites()?;
        for initiator_id in tasks.initiators.keys() {
            self.router.deregister(Address::Initiator(*initiator_id))?;
        }
        for site_id in tasks.sites.keys() {
            self.router.deregister(Address::Site(*site_id))?;
        }

        let mut outcome = ClusterOutcome::default();
        for (initiator_id, task) in tasks.initiators {
            outcome
                .initiators
                .insert(initiator_id, join(task, timeout, false).await);
        }
        for (site_id, task) in tasks.sites {
            let crashed = failed.contains(&site_id);
            outcome
                .sites
                .insert(site_id, join(task, timeout, crashed).await);
        }
        tracing::info!(clean = outcome.is_clean(), "local cluster stopped");
        Ok(outcome)
    }
}

async fn join(task: JoinHandle<DtxnResult<()>>, timeout: Duration, crashed: bool) -> TaskOutcome {
    match time::timeout(timeout, task).await {
        Ok(Ok(Ok(()))) => TaskOutcome::Stopped,
        Ok(Ok(Err(err))) => TaskOutcome::Halted {
            fatal: err.is_fatal(),
            error: err.to_string(),
        },
        Ok(Err(err)) if err.is_cancelled() && crashed => TaskOutcome::Crashed,
        Ok(Err(err)) => TaskOutcome::Panicked {
            error: err.to_string(),
        },
        Err(_) => TaskOutcome::Hung,
    }
}

fn compare_replicas(logs: &[(SiteId, bool, Vec<ExecutedTxn>)]) -> Option<String> {
    let Some((reference_site, _, reference)) = logs.iter().find(|(_, failed, _)| !failed) else {
        return None;
    };
    for (site_id, failed, log) in logs {
        if site_id == reference_site {
            continue;
        }
        if !failed {
            if let Some(detail) = first_difference(reference, log, log.len().max(reference.len())) {
                return Some(format!(
                    "sites {reference_site} and {site_id} differ at {detail}"
                ));
            }
            continue;
        }
        if log.len() > reference.len() {
            return Some(format!(
                "failed site {site_id} executed {} txns, survivor {reference_site} only {}",
                log.len(),
                reference.len()
            ));
        }
        // The crashed replica may not have learned how its last transaction ended.
        let settled = log.len().saturating_sub(1);
        if let Some(detail) = first_difference(reference, log, settled) {
            return Some(format!(
                "failed site {site_id} and survivor {reference_site} differ at {detail}"
            ));
        }
        if let (Some(last), Some(expected)) = (log.last(), reference.get(settled)) {
            if last.txn_id != expected.txn_id {
                return Some(format!(
                    "failed site {site_id} last ran {} where survivor {reference_site} ran {}",
                    last.txn_id, expected.txn_id
                ));
            }
        }
    }
    None
}

fn first_difference(left: &[ExecutedTxn], right: &[ExecutedTxn], upto: usize) -> Option<String> {
    (0..upto).find_map(|index| match (left.get(index), right.get(index)) {
        (Some(a), Some(b)) if a.txn_id == b.txn_id && a.rolled_back == b.rolled_back => None,
        (a, b) => Some(format!(
            "position {index}: {} vs {}",
            describe(a),
            describe(b)
        )),
    })
}

fn describe(txn: Option<&ExecutedTxn>) -> String {
    match txn {
        Some(txn) if txn.rolled_back => format!("{} (rolled back)", txn.txn_id),
        Some(txn) => txn.txn_id.to_string(),
        None => "nothing".to_string(),
    }
}
