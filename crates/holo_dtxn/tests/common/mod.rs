//! Shared helpers for integration tests.
//!
//! `TestCluster` runs every site and initiator as a tokio task over a
//! `LocalRouter`. `LedgerEngine` keeps one balance per site and understands a
//! handful of procedures, enough to drive single- and multi-partition work.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use holo_dtxn::dtxn::{
    Address, ClientResponse, DependencyId, DependencyResults, DtxnResult, ExecutionEngine,
    ExecutionSite, FaultEvent, FragmentBatch, FragmentTask, Initiator, InitiatorConfig,
    InitiatorId, Invocation, LocalRouter, Mailbox, Message, PlanFragment, ProcedureStep, ResponseStatus,
    ResultTable, SiteConfig, SiteId, SiteTracker, StaticTopology, TxnId, TxnMeta, TxnTarget,
};
use tokio::task::JoinHandle;

/// Timeout for a single client call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub const BALANCE_DEP: DependencyId = DependencyId::multipartition(1);
const READ_FRAGMENT: u64 = 1;
const DEPOSIT_FRAGMENT: u64 = 2;

pub fn encode(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode(table: &ResultTable) -> i64 {
    let mut bytes = [0u8; 8];
    let len = table.as_bytes().len().min(8);
    bytes[..len].copy_from_slice(&table.as_bytes()[..len]);
    i64::from_le_bytes(bytes)
}

/// What a site's engine committed and rolled back, in order.
#[derive(Clone, Debug, Default)]
pub struct EngineLog {
    pub committed: Vec<TxnId>,
    pub rolled_back: Vec<TxnId>,
    pub balance: i64,
}

pub type SharedLog = Arc<Mutex<EngineLog>>;

/// Deterministic single-balance engine.
///
/// Procedures: `deposit` and `withdraw` (param: amount; an overdraft aborts
/// after writing), `balance`, `whoami` (answers with the site id, so replicas
/// disagree), `total` (multipartition read of every balance) and
/// `deposit_all` (multipartition write).
pub struct LedgerEngine {
    site_id: SiteId,
    balance: i64,
    undo: Option<(TxnId, i64)>,
    log: SharedLog,
}

impl LedgerEngine {
    pub fn new(site_id: SiteId, log: SharedLog) -> Self {
        Self {
            site_id,
            balance: 0,
            undo: None,
            log,
        }
    }

    fn apply_deposit(&mut self, txn_id: TxnId, amount: i64) {
        if self.undo.is_none() {
            self.undo = Some((txn_id, self.balance));
        }
        self.balance += amount;
    }

    fn fan_out(txn: &TxnMeta, fragment_id: u64, params: Vec<u8>) -> ProcedureStep {
        let task = FragmentTask {
            txn_id: txn.txn_id,
            initiator_id: txn.initiator_id,
            coordinator_id: txn.coordinator_id,
            read_only: txn.read_only,
            sysproc: false,
            is_final: true,
            fragments: vec![PlanFragment {
                fragment_id,
                params,
                input_dependency: None,
                output_dependency: BALANCE_DEP,
            }],
            attached_inputs: BTreeMap::new(),
        };
        ProcedureStep::Dispatch(vec![FragmentBatch {
            distributed: Some(task),
            local: None,
            resume_on: vec![BALANCE_DEP],
            is_final: true,
        }])
    }
}

fn amount(params: &[u8]) -> anyhow::Result<i64> {
    let bytes: [u8; 8] = params
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected an 8 byte amount, got {} bytes", params.len()))?;
    Ok(i64::from_le_bytes(bytes))
}

impl ExecutionEngine for LedgerEngine {
    fn start_procedure(
        &mut self,
        txn: &TxnMeta,
        invocation: &Invocation,
    ) -> anyhow::Result<ProcedureStep> {
        let step = match invocation.procedure.as_str() {
            "deposit" => {
                self.apply_deposit(txn.txn_id, amount(&invocation.params)?);
                ProcedureStep::Complete(ClientResponse::success(vec![ResultTable::new(encode(
                    self.balance,
                ))]))
            }
            "balance" => ProcedureStep::Complete(ClientResponse::success(vec![ResultTable::new(
                encode(self.balance),
            )])),
            "withdraw" => {
                self.apply_deposit(txn.txn_id, -amount(&invocation.params)?);
                if self.balance < 0 {
                    ProcedureStep::Complete(ClientResponse::failure(
                        ResponseStatus::UserAbort,
                        "insufficient funds",
                    ))
                } else {
                    ProcedureStep::Complete(ClientResponse::success(vec![ResultTable::new(
                        encode(self.balance),
                    )]))
                }
            }
            "whoami" => ProcedureStep::Complete(ClientResponse::success(vec![ResultTable::new(
                encode(self.site_id as i64),
            )])),
            "total" => Self::fan_out(txn, READ_FRAGMENT, Vec::new()),
            "deposit_all" => Self::fan_out(txn, DEPOSIT_FRAGMENT, invocation.params.clone()),
            other => anyhow::bail!("unknown procedure {other}"),
        };
        Ok(step)
    }

    fn resume_procedure(
        &mut self,
        txn: &TxnMeta,
        inputs: &DependencyResults,
    ) -> anyhow::Result<ProcedureStep> {
        if let Some(failure) = &inputs.failure {
            return Ok(ProcedureStep::Complete(ClientResponse::failure(
                ResponseStatus::UnexpectedFailure,
                failure.clone(),
            )));
        }
        let total: i64 = inputs.get(BALANCE_DEP).iter().map(decode).sum();
        tracing::debug!(txn_id = %txn.txn_id, total, "procedure resumed");
        Ok(ProcedureStep::Complete(ClientResponse::success(vec![
            ResultTable::new(encode(total)),
        ])))
    }

    fn execute_fragment(
        &mut self,
        txn: &TxnMeta,
        task: &FragmentTask,
        _inputs: &DependencyResults,
    ) -> anyhow::Result<Vec<(DependencyId, ResultTable)>> {
        let mut outputs = Vec::new();
        for fragment in &task.fragments {
            match fragment.fragment_id {
                READ_FRAGMENT => {}
                DEPOSIT_FRAGMENT => self.apply_deposit(txn.txn_id, amount(&fragment.params)?),
                other => anyhow::bail!("unknown fragment {other}"),
            }
            outputs.push((
                fragment.output_dependency,
                ResultTable::new(encode(self.balance)),
            ));
        }
        Ok(outputs)
    }

    fn complete_transaction(&mut self, txn_id: TxnId, rollback: bool) -> anyhow::Result<()> {
        if let Some((undo_txn, before)) = self.undo.take() {
            if undo_txn != txn_id {
                anyhow::bail!("txn {txn_id} completed while txn {undo_txn} holds undo state");
            }
            if rollback {
                self.balance = before;
            }
        }
        let mut log = self
            .log
            .lock()
            .map_err(|_| anyhow::anyhow!("engine log lock poisoned"))?;
        if rollback {
            log.rolled_back.push(txn_id);
        } else {
            log.committed.push(txn_id);
        }
        log.balance = self.balance;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ClusterOptions {
    pub partitions: u64,
    pub replicas: u64,
    pub initiators: u64,
    pub use_safety_dance: bool,
    pub recovering_sites: Vec<SiteId>,
}

impl ClusterOptions {
    pub fn new(partitions: u64, replicas: u64) -> Self {
        Self {
            partitions,
            replicas,
            initiators: 1,
            use_safety_dance: false,
            recovering_sites: Vec::new(),
        }
    }
}

/// Sites and initiators running as tokio tasks on one router.
pub struct TestCluster {
    pub router: LocalRouter,
    pub topology: Arc<StaticTopology>,
    pub initiators: Vec<Arc<Initiator>>,
    pub logs: BTreeMap<SiteId, SharedLog>,
    site_tasks: BTreeMap<SiteId, JoinHandle<DtxnResult<()>>>,
    initiator_tasks: BTreeMap<InitiatorId, JoinHandle<DtxnResult<()>>>,
}

impl TestCluster {
    pub fn start(options: ClusterOptions) -> Self {
        let router = LocalRouter::new();
        let topology = Arc::new(StaticTopology::uniform(options.partitions, options.replicas));
        let initiator_ids: Vec<InitiatorId> = (1..=options.initiators).collect();
        let k_factor = u32::try_from(options.replicas.saturating_sub(1)).expect("k factor");

        let mut logs = BTreeMap::new();
        let mut site_tasks = BTreeMap::new();
        for site_id in topology.live_sites() {
            let partition_id = topology.partition_for_site(site_id).expect("partition");
            let log = SharedLog::default();
            let mut config = SiteConfig::new(site_id, partition_id, initiator_ids.clone());
            config.use_safety_dance = options.use_safety_dance;
            config.start_recovering = options.recovering_sites.contains(&site_id);
            let site = ExecutionSite::new(
                config,
                Box::new(LedgerEngine::new(site_id, log.clone())),
                Arc::new(router.clone()),
                topology.clone(),
            );
            let inbox = router.register(Address::Site(site_id)).expect("register site");
            site_tasks.insert(site_id, tokio::spawn(site.run(inbox)));
            logs.insert(site_id, log);
        }

        let mut initiators = Vec::new();
        let mut initiator_tasks = BTreeMap::new();
        for initiator_id in initiator_ids {
            let mut config = InitiatorConfig::new(initiator_id);
            config.k_factor = k_factor;
            let initiator = Arc::new(
                Initiator::new(config, Arc::new(router.clone()), topology.clone())
                    .expect("initiator"),
            );
            let inbox = router
                .register(Address::Initiator(initiator_id))
                .expect("register initiator");
            initiator_tasks.insert(initiator_id, tokio::spawn(initiator.clone().run(inbox)));
            initiators.push(initiator);
        }

        Self {
            router,
            topology,
            initiators,
            logs,
            site_tasks,
            initiator_tasks,
        }
    }

    pub async fn call(
        &self,
        initiator: usize,
        procedure: &str,
        params: Vec<u8>,
        read_only: bool,
        target: TxnTarget,
    ) -> ClientResponse {
        let (_, rx) = self.initiators[initiator]
            .submit(Invocation::new(procedure, params), read_only, target)
            .expect("submit");
        tokio::time::timeout(CALL_TIMEOUT, rx)
            .await
            .expect("call timed out")
            .expect("initiator dropped the call")
    }

    pub fn log(&self, site_id: SiteId) -> EngineLog {
        self.logs[&site_id].lock().expect("log lock").clone()
    }

    /// Crash `site_id` and tell every survivor about it. The site is stopped
    /// first, so nothing it sends can trail the fault notice.
    pub async fn fail_site(&mut self, site_id: SiteId) {
        let task = self.site_tasks.remove(&site_id).expect("site task");
        task.abort();
        let stopped = tokio::time::timeout(CALL_TIMEOUT, task)
            .await
            .expect("site did not stop");
        assert!(
            stopped.as_ref().map_or_else(|err| err.is_cancelled(), |_| true),
            "site {site_id} panicked"
        );
        self.router
            .deregister(Address::Site(site_id))
            .expect("deregister");
        self.topology.mark_failed(site_id);
        let event = FaultEvent {
            failed_sites: [site_id].into_iter().collect(),
            failed_initiators: Default::default(),
        };
        for survivor in self.topology.live_sites() {
            self.router
                .send(Address::Site(survivor), Message::Fault(event.clone()))
                .expect("fault to site");
        }
        for initiator in &self.initiators {
            initiator
                .handle_site_failure(site_id)
                .expect("initiator fault handling");
        }
    }

    /// Wait for an initiator's loop to stop on its own.
    pub async fn join_initiator(&mut self, initiator_id: InitiatorId) -> DtxnResult<()> {
        let task = self
            .initiator_tasks
            .remove(&initiator_id)
            .expect("initiator task");
        tokio::time::timeout(CALL_TIMEOUT, task)
            .await
            .expect("initiator did not stop")
            .expect("initiator task panicked")
    }

    /// Close every inbox and collect how each site stopped.
    pub async fn shutdown(self) -> BTreeMap<SiteId, DtxnResult<()>> {
        for initiator_id in self.initiator_tasks.keys() {
            let _ = self.router.deregister(Address::Initiator(*initiator_id));
        }
        for site_id in self.site_tasks.keys() {
            let _ = self.router.deregister(Address::Site(*site_id));
        }
        for (_, task) in self.initiator_tasks {
            let _ = tokio::time::timeout(CALL_TIMEOUT, task).await;
        }
        let mut results = BTreeMap::new();
        for (site_id, task) in self.site_tasks {
            let result = tokio::time::timeout(CALL_TIMEOUT, task)
                .await
                .expect("site did not stop")
                .expect("site task panicked");
            results.insert(site_id, result);
        }
        results
    }
}
