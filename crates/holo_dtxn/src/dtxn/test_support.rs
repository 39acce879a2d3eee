//! Collaborator doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::topology::StaticTopology;
use super::txn_state::SiteContext;
use super::types::{
    Address, ClientResponse, DependencyId, ExecutionEngine, FragmentTask, Invocation, Mailbox,
    Message, ProcedureStep, ResultTable, SiteId, SiteTracker, TxnId, TxnMeta,
};
use super::work_unit::DependencyResults;

#[derive(Default)]
pub(crate) struct RecordingMailbox {
    sent: Mutex<Vec<(Address, Message)>>,
}

impl RecordingMailbox {
    pub(crate) fn take(&self) -> Vec<(Address, Message)> {
        std::mem::take(&mut *self.sent.lock().expect("mailbox lock"))
    }
}

impl Mailbox for RecordingMailbox {
    fn send(&self, to: Address, message: Message) -> anyhow::Result<()> {
        self.sent.lock().expect("mailbox lock").push((to, message));
        Ok(())
    }
}

/// Engine that plays back queued procedure steps and records every call.
/// With no steps queued, procedures complete successfully.
#[derive(Debug, Default)]
pub(crate) struct ScriptedEngine {
    pub steps: VecDeque<ProcedureStep>,
    pub fragment_output: Vec<(DependencyId, ResultTable)>,
    pub fail_fragments: bool,
    pub started: Vec<TxnId>,
    pub resumed_inputs: Vec<DependencyResults>,
    pub executed: Vec<TxnId>,
    pub completed: Vec<(TxnId, bool)>,
}

impl ScriptedEngine {
    fn next_step(&mut self) -> ProcedureStep {
        self.steps
            .pop_front()
            .unwrap_or_else(|| ProcedureStep::Complete(ClientResponse::success(Vec::new())))
    }
}

impl ExecutionEngine for ScriptedEngine {
    fn start_procedure(
        &mut self,
        txn: &TxnMeta,
        _invocation: &Invocation,
    ) -> anyhow::Result<ProcedureStep> {
        self.started.push(txn.txn_id);
        Ok(self.next_step())
    }

    fn resume_procedure(
        &mut self,
        _txn: &TxnMeta,
        inputs: &DependencyResults,
    ) -> anyhow::Result<ProcedureStep> {
        self.resumed_inputs.push(inputs.clone());
        Ok(self.next_step())
    }

    fn execute_fragment(
        &mut self,
        txn: &TxnMeta,
        _task: &FragmentTask,
        _inputs: &DependencyResults,
    ) -> anyhow::Result<Vec<(DependencyId, ResultTable)>> {
        self.executed.push(txn.txn_id);
        if self.fail_fragments {
            anyhow::bail!("scripted fragment failure");
        }
        Ok(self.fragment_output.clone())
    }

    fn complete_transaction(&mut self, txn_id: TxnId, rollback: bool) -> anyhow::Result<()> {
        self.completed.push((txn_id, rollback));
        Ok(())
    }
}

/// Cloneable handle so a test can inspect an engine owned by a site.
#[derive(Clone, Default)]
pub(crate) struct SharedEngine(Arc<Mutex<ScriptedEngine>>);

impl SharedEngine {
    pub(crate) fn new(engine: ScriptedEngine) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }

    fn with<T>(&self, f: impl FnOnce(&mut ScriptedEngine) -> T) -> T {
        f(&mut self.0.lock().expect("engine lock"))
    }

    pub(crate) fn started(&self) -> Vec<TxnId> {
        self.with(|engine| engine.started.clone())
    }

    pub(crate) fn completed(&self) -> Vec<(TxnId, bool)> {
        self.with(|engine| engine.completed.clone())
    }

    pub(crate) fn push_step(&self, step: ProcedureStep) {
        self.with(|engine| engine.steps.push_back(step));
    }

    pub(crate) fn set_fragment_output(&self, output: Vec<(DependencyId, ResultTable)>) {
        self.with(|engine| engine.fragment_output = output);
    }
}

impl ExecutionEngine for SharedEngine {
    fn start_procedure(
        &mut self,
        txn: &TxnMeta,
        invocation: &Invocation,
    ) -> anyhow::Result<ProcedureStep> {
        self.with(|engine| engine.start_procedure(txn, invocation))
    }

    fn resume_procedure(
        &mut self,
        txn: &TxnMeta,
        inputs: &DependencyResults,
    ) -> anyhow::Result<ProcedureStep> {
        self.with(|engine| engine.resume_procedure(txn, inputs))
    }

    fn execute_fragment(
        &mut self,
        txn: &TxnMeta,
        task: &FragmentTask,
        inputs: &DependencyResults,
    ) -> anyhow::Result<Vec<(DependencyId, ResultTable)>> {
        self.with(|engine| engine.execute_fragment(txn, task, inputs))
    }

    fn complete_transaction(&mut self, txn_id: TxnId, rollback: bool) -> anyhow::Result<()> {
        self.with(|engine| engine.complete_transaction(txn_id, rollback))
    }
}

/// Owns the collaborators a transaction state needs and lends them out.
pub(crate) struct Harness {
    pub engine: ScriptedEngine,
    pub mailbox: RecordingMailbox,
    pub topology: StaticTopology,
}

impl Harness {
    pub(crate) fn new(engine: ScriptedEngine, partitions: u64, replicas: u64) -> Self {
        Self {
            engine,
            mailbox: RecordingMailbox::default(),
            topology: StaticTopology::uniform(partitions, replicas),
        }
    }

    pub(crate) fn ctx(&mut self, site_id: SiteId) -> SiteContext<'_> {
        SiteContext {
            site_id,
            partition_id: self.topology.partition_for_site(site_id).unwrap_or_default(),
            engine: &mut self.engine,
            mailbox: &self.mailbox,
            topology: &self.topology,
        }
    }
}
