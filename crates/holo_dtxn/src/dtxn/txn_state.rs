//! Per-transaction state machines held by an execution site.
//!
//! The site only ever drives the transaction it polled from its admission
//! queue, through `do_work`, until the state reports done. Other states just
//! buffer incoming fragments and completions until their turn.

use std::collections::{BTreeSet, VecDeque};

use anyhow::Context;

use super::error::{DtxnResult, FatalError};
use super::multi_partition::{CoordinatorTxn, ParticipantTxn};
use super::types::{
    Address, ClientResponse, CompleteTransaction, CompleteTransactionResponse, ExecutionEngine,
    FragmentResponse, FragmentStatus, FragmentTask, InitiateResponse, InitiateTask, InitiatorId,
    Mailbox, Message, PartitionId, ProcedureStep, ReplayTask, ResponseStatus, ResultTable, SiteId,
    SiteTracker, TxnId, TxnMeta,
};
use super::work_unit::DependencyResults;

/// Collaborators lent to a transaction while it runs.
pub struct SiteContext<'a> {
    pub site_id: SiteId,
    pub partition_id: PartitionId,
    pub engine: &'a mut dyn ExecutionEngine,
    pub mailbox: &'a dyn Mailbox,
    pub topology: &'a dyn SiteTracker,
}

impl SiteContext<'_> {
    pub fn send(&self, to: Address, message: Message) -> DtxnResult<()> {
        let kind = message.kind();
        self.mailbox
            .send(to, message)
            .with_context(|| format!("site {} failed to send {kind} to {to}", self.site_id))?;
        Ok(())
    }

    pub fn send_to_sites(&self, sites: &[SiteId], message: Message) -> DtxnResult<()> {
        let kind = message.kind();
        self.mailbox
            .send_to_sites(sites, &message)
            .with_context(|| format!("site {} failed to broadcast {kind}", self.site_id))?;
        Ok(())
    }

    /// True when this site replicates the partition of `meta`'s coordinator
    /// without being the coordinator itself.
    pub fn is_coordinator_replica(&self, meta: &TxnMeta) -> bool {
        !meta.single_partition
            && meta.coordinator_id != self.site_id
            && self.topology.partition_for_site(meta.coordinator_id) == Some(self.partition_id)
    }

    pub fn respond_to_initiator(
        &self,
        meta: &TxnMeta,
        response: ClientResponse,
        recovering: bool,
    ) -> DtxnResult<()> {
        self.send(
            Address::Initiator(meta.initiator_id),
            Message::InitiateResponse(InitiateResponse {
                txn_id: meta.txn_id,
                site_id: self.site_id,
                initiator_id: meta.initiator_id,
                read_only: meta.read_only,
                recovering,
                response,
            }),
        )
    }
}

#[derive(Debug)]
pub struct SinglePartitionTxn {
    task: InitiateTask,
    suppress_response: bool,
    done: bool,
}

impl SinglePartitionTxn {
    pub fn new(task: InitiateTask) -> Self {
        Self {
            task,
            suppress_response: false,
            done: false,
        }
    }

    pub fn do_work(&mut self, ctx: &mut SiteContext<'_>) -> DtxnResult<bool> {
        if self.done {
            return Ok(true);
        }
        let meta = self.task.meta();
        let response = match ctx.engine.start_procedure(&meta, &self.task.invocation) {
            Ok(ProcedureStep::Complete(response)) => response,
            Ok(step) => {
                tracing::warn!(txn_id = %meta.txn_id, ?step, "single-partition procedure tried to distribute work");
                ClientResponse::failure(
                    ResponseStatus::UnexpectedFailure,
                    "single-partition procedure cannot dispatch fragments",
                )
            }
            Err(err) => {
                tracing::debug!(txn_id = %meta.txn_id, error = ?err, "procedure failed");
                ClientResponse::failure(ResponseStatus::UnexpectedFailure, format!("{err:#}"))
            }
        };
        ctx.engine
            .complete_transaction(meta.txn_id, !response.is_success())?;
        self.done = true;
        if self.suppress_response {
            tracing::debug!(txn_id = %meta.txn_id, "initiator gone; response dropped");
            return Ok(true);
        }
        ctx.respond_to_initiator(&meta, response, false)?;
        Ok(true)
    }
}

/// Re-execution of logged work. Sends nothing; any deviation from the
/// logged commit is fatal.
#[derive(Debug)]
pub struct ReplayTxn {
    task: ReplayTask,
    done: bool,
}

impl ReplayTxn {
    pub fn new(task: ReplayTask) -> Self {
        Self { task, done: false }
    }

    pub fn do_work(&mut self, ctx: &mut SiteContext<'_>) -> DtxnResult<bool> {
        if self.done {
            return Ok(true);
        }
        self.done = true;
        match &self.task {
            ReplayTask::Initiate(task) => {
                let meta = task.meta();
                let detail = match ctx.engine.start_procedure(&meta, &task.invocation) {
                    Ok(ProcedureStep::Complete(response)) if response.is_success() => {
                        ctx.engine.complete_transaction(meta.txn_id, false)?;
                        return Ok(true);
                    }
                    Ok(ProcedureStep::Complete(response)) => format!(
                        "logged commit now ends with {:?}: {}",
                        response.status, response.status_message
                    ),
                    Ok(_) => "replayed procedure tried to dispatch fragments".to_string(),
                    Err(err) => format!("{err:#}"),
                };
                ctx.engine.complete_transaction(meta.txn_id, true)?;
                Err(FatalError::ReplayDiverged {
                    txn_id: meta.txn_id,
                    detail,
                }
                .into())
            }
            ReplayTask::Fragment(task) => {
                let inputs = DependencyResults::from_attached(&task.attached_inputs);
                if let Err(err) = ctx.engine.execute_fragment(&task.meta(), task, &inputs) {
                    ctx.engine.complete_transaction(task.txn_id, true)?;
                    return Err(FatalError::ReplayDiverged {
                        txn_id: task.txn_id,
                        detail: format!("{err:#}"),
                    }
                    .into());
                }
                if task.is_final {
                    ctx.engine.complete_transaction(task.txn_id, false)?;
                }
                Ok(true)
            }
        }
    }
}

#[derive(Debug)]
enum RecoveringWork {
    Initiate(InitiateTask),
    Fragment(FragmentTask),
    Complete(CompleteTransaction),
}

/// Stand-in used while the site is rebuilding its data. Never touches the
/// engine; answers every request with a response flagged as recovering.
#[derive(Debug)]
pub struct RecoveringTxn {
    meta: TxnMeta,
    pending: VecDeque<RecoveringWork>,
    suppress_response: bool,
    done: bool,
}

impl RecoveringTxn {
    pub fn from_initiate(task: InitiateTask) -> Self {
        let meta = task.meta();
        let mut pending = VecDeque::new();
        pending.push_back(RecoveringWork::Initiate(task));
        Self {
            meta,
            pending,
            suppress_response: false,
            done: false,
        }
    }

    pub fn participant(meta: TxnMeta) -> Self {
        Self {
            meta,
            pending: VecDeque::new(),
            suppress_response: false,
            done: false,
        }
    }

    pub fn on_fragment_task(&mut self, task: FragmentTask) {
        self.pending.push_back(RecoveringWork::Fragment(task));
    }

    pub fn on_complete_transaction(&mut self, complete: CompleteTransaction) {
        self.pending.push_back(RecoveringWork::Complete(complete));
    }

    pub fn do_work(&mut self, ctx: &mut SiteContext<'_>) -> DtxnResult<bool> {
        while !self.done {
            let Some(work) = self.pending.pop_front() else {
                break;
            };
            match work {
                RecoveringWork::Initiate(task) => {
                    if !task.single_partition && !task.non_coordinator_sites.is_empty() {
                        // Participants are waiting on this coordinator; let them go.
                        ctx.send_to_sites(
                            &task.non_coordinator_sites,
                            Message::CompleteTransaction(CompleteTransaction {
                                txn_id: task.txn_id,
                                initiator_id: task.initiator_id,
                                coordinator_id: ctx.site_id,
                                rollback: true,
                                requires_ack: false,
                                response: None,
                            }),
                        )?;
                    }
                    self.done = true;
                    self.respond_recovering(ctx)?;
                }
                RecoveringWork::Fragment(task) => {
                    let dependencies = task
                        .output_dependencies()
                        .into_iter()
                        .map(|dep| (dep, ResultTable::empty()))
                        .collect();
                    ctx.send(
                        Address::Site(task.coordinator_id),
                        Message::FragmentResponse(FragmentResponse {
                            txn_id: task.txn_id,
                            executor_site_id: ctx.site_id,
                            destination_site_id: task.coordinator_id,
                            status: FragmentStatus::Success,
                            recovering: true,
                            dependencies,
                        }),
                    )?;
                    // A coordinator replica still waits for the decision.
                    if task.read_only
                        && task.is_final
                        && !ctx.is_coordinator_replica(&self.meta)
                    {
                        self.done = true;
                    }
                }
                RecoveringWork::Complete(complete) => {
                    self.done = true;
                    if complete.requires_ack {
                        ctx.send(
                            Address::Site(complete.coordinator_id),
                            Message::CompleteTransactionResponse(CompleteTransactionResponse {
                                txn_id: complete.txn_id,
                                site_id: ctx.site_id,
                            }),
                        )?;
                    }
                    // The initiator counts a coordinator replica as a responder.
                    if ctx.is_coordinator_replica(&self.meta) {
                        self.respond_recovering(ctx)?;
                    }
                }
            }
        }
        Ok(self.done)
    }

    fn respond_recovering(&self, ctx: &SiteContext<'_>) -> DtxnResult<()> {
        if self.suppress_response {
            return Ok(());
        }
        ctx.respond_to_initiator(
            &self.meta,
            ClientResponse::failure(
                ResponseStatus::GracefulFailure,
                format!("site {} is recovering", ctx.site_id),
            ),
            true,
        )
    }

    fn handle_site_faults(
        &mut self,
        failed_sites: &BTreeSet<SiteId>,
        failed_initiators: &BTreeSet<InitiatorId>,
    ) {
        if failed_initiators.contains(&self.meta.initiator_id) {
            self.suppress_response = true;
        }
        let is_participant = !self.meta.single_partition
            && !self
                .pending
                .iter()
                .any(|work| matches!(work, RecoveringWork::Initiate(_)));
        let decided = self
            .pending
            .iter()
            .any(|work| matches!(work, RecoveringWork::Complete(_)));
        if is_participant
            && !self.done
            && !decided
            && failed_sites.contains(&self.meta.coordinator_id)
        {
            self.pending.clear();
            self.pending
                .push_back(RecoveringWork::Complete(CompleteTransaction {
                    txn_id: self.meta.txn_id,
                    initiator_id: self.meta.initiator_id,
                    coordinator_id: self.meta.coordinator_id,
                    rollback: true,
                    requires_ack: false,
                    response: None,
                }));
        }
    }
}

/// A transaction as the site tracks it.
#[derive(Debug)]
pub enum TransactionState {
    SinglePartition(SinglePartitionTxn),
    Coordinator(CoordinatorTxn),
    Participant(ParticipantTxn),
    Replay(ReplayTxn),
    Recovering(RecoveringTxn),
}

impl TransactionState {
    pub fn txn_id(&self) -> TxnId {
        match self {
            TransactionState::SinglePartition(txn) => txn.task.txn_id,
            TransactionState::Coordinator(txn) => txn.meta().txn_id,
            TransactionState::Participant(txn) => txn.meta().txn_id,
            TransactionState::Replay(txn) => txn.task.txn_id(),
            TransactionState::Recovering(txn) => txn.meta.txn_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransactionState::SinglePartition(_) => "single_partition",
            TransactionState::Coordinator(_) => "coordinator",
            TransactionState::Participant(_) => "participant",
            TransactionState::Replay(_) => "replay",
            TransactionState::Recovering(_) => "recovering",
        }
    }

    pub fn is_single_partition(&self) -> bool {
        match self {
            TransactionState::SinglePartition(_) => true,
            TransactionState::Coordinator(_) | TransactionState::Participant(_) => false,
            TransactionState::Replay(txn) => {
                matches!(&txn.task, ReplayTask::Initiate(task) if task.single_partition)
            }
            TransactionState::Recovering(txn) => txn.meta.single_partition,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, TransactionState::Coordinator(_))
    }

    pub fn is_done(&self) -> bool {
        match self {
            TransactionState::SinglePartition(txn) => txn.done,
            TransactionState::Coordinator(txn) => txn.is_done(),
            TransactionState::Participant(txn) => txn.is_done(),
            TransactionState::Replay(txn) => txn.done,
            TransactionState::Recovering(txn) => txn.done,
        }
    }

    /// True while the state cannot make progress without another message.
    pub fn is_blocked(&self) -> bool {
        match self {
            TransactionState::SinglePartition(_) | TransactionState::Replay(_) => false,
            TransactionState::Coordinator(txn) => txn.is_blocked(),
            TransactionState::Participant(txn) => txn.is_blocked(),
            TransactionState::Recovering(txn) => !txn.done && txn.pending.is_empty(),
        }
    }

    pub fn do_work(&mut self, ctx: &mut SiteContext<'_>) -> DtxnResult<bool> {
        match self {
            TransactionState::SinglePartition(txn) => txn.do_work(ctx),
            TransactionState::Coordinator(txn) => txn.do_work(ctx),
            TransactionState::Participant(txn) => txn.do_work(ctx),
            TransactionState::Replay(txn) => txn.do_work(ctx),
            TransactionState::Recovering(txn) => txn.do_work(ctx),
        }
    }

    pub fn on_fragment_task(&mut self, task: FragmentTask) {
        match self {
            TransactionState::Participant(txn) => txn.on_fragment_task(task),
            TransactionState::Recovering(txn) => txn.on_fragment_task(task),
            other => tracing::warn!(
                txn_id = %task.txn_id,
                kind = other.kind(),
                "fragment task for non-participant state dropped"
            ),
        }
    }

    pub fn on_complete_transaction(&mut self, complete: CompleteTransaction) {
        match self {
            TransactionState::Participant(txn) => txn.on_complete_transaction(complete),
            TransactionState::Recovering(txn) => txn.on_complete_transaction(complete),
            other => tracing::warn!(
                txn_id = %complete.txn_id,
                kind = other.kind(),
                "completion for non-participant state dropped"
            ),
        }
    }

    pub fn on_fragment_response(
        &mut self,
        ctx: &mut SiteContext<'_>,
        response: FragmentResponse,
    ) -> DtxnResult<()> {
        match self {
            TransactionState::Coordinator(txn) => txn.on_fragment_response(ctx, response),
            other => {
                tracing::warn!(
                    txn_id = %response.txn_id,
                    kind = other.kind(),
                    "fragment response for non-coordinator state dropped"
                );
                Ok(())
            }
        }
    }

    pub fn on_complete_response(
        &mut self,
        ctx: &mut SiteContext<'_>,
        ack: CompleteTransactionResponse,
    ) -> DtxnResult<()> {
        match self {
            TransactionState::Coordinator(txn) => txn.on_complete_response(ctx, ack),
            other => {
                tracing::debug!(
                    txn_id = %ack.txn_id,
                    kind = other.kind(),
                    "completion ack for non-coordinator state dropped"
                );
                Ok(())
            }
        }
    }

    pub fn handle_site_faults(
        &mut self,
        ctx: &mut SiteContext<'_>,
        failed_sites: &BTreeSet<SiteId>,
        failed_initiators: &BTreeSet<InitiatorId>,
    ) -> DtxnResult<()> {
        match self {
            TransactionState::SinglePartition(txn) => {
                if failed_initiators.contains(&txn.task.initiator_id) {
                    txn.suppress_response = true;
                }
                Ok(())
            }
            TransactionState::Coordinator(txn) => {
                txn.handle_site_faults(ctx, failed_sites, failed_initiators)
            }
            TransactionState::Participant(txn) => {
                txn.handle_site_faults(failed_sites, failed_initiators);
                Ok(())
            }
            TransactionState::Replay(_) => Ok(()),
            TransactionState::Recovering(txn) => {
                txn.handle_site_faults(failed_sites, failed_initiators);
                Ok(())
            }
        }
    }
}
