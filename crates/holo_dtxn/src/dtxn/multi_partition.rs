//! Multipartition transaction state at the coordinator and at participants.
//!
//! The coordinator runs the procedure. Each batch it dispatches fans a
//! fragment out to every participating site, optionally runs a local
//! aggregation fragment once its inputs arrive, and parks a continuation that
//! hands the collected results back to the procedure. Continuations resume
//! newest first: a continuation created while an older one is pending bumps
//! the older one's stack count, and the count drops again only when the newer
//! continuation actually resumes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::error::{DtxnResult, FatalError};
use super::txn_state::SiteContext;
use super::types::{
    Address, ClientResponse, CompleteTransaction, CompleteTransactionResponse, DependencyId,
    FragmentBatch, FragmentResponse, FragmentStatus, FragmentTask, InitiateTask, InitiatorId,
    Message, ProcedureStep, ResponseStatus, ResultTable, SiteId, TxnId, TxnMeta,
};
use super::work_unit::{DependencyResults, WorkPayload, WorkUnit};

/// Ready and waiting work of one coordinator transaction.
#[derive(Debug)]
pub(super) struct WorkQueue {
    txn_id: TxnId,
    next_unit_id: u64,
    ready: VecDeque<WorkUnit>,
    waiting: BTreeMap<u64, WorkUnit>,
    /// Which waiting unit consumes each outstanding dependency.
    missing: BTreeMap<DependencyId, u64>,
    /// Continuations not yet resumed, oldest first.
    stack_frames: Vec<u64>,
}

impl WorkQueue {
    pub(super) fn new(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            next_unit_id: 1,
            ready: VecDeque::new(),
            waiting: BTreeMap::new(),
            missing: BTreeMap::new(),
            stack_frames: Vec::new(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_unit_id;
        self.next_unit_id += 1;
        id
    }

    pub(super) fn add_unit(
        &mut self,
        payload: WorkPayload,
        dependency_ids: &[DependencyId],
        expected_sites: &[SiteId],
    ) -> u64 {
        let id = self.allocate_id();
        let unit = WorkUnit::new(id, self.txn_id, payload, dependency_ids, expected_sites);
        if unit.all_dependencies_satisfied() {
            self.push_completed(unit);
        } else {
            self.park(unit);
        }
        id
    }

    /// Park a continuation that resumes the procedure once `dependency_ids`
    /// are satisfied and every newer continuation has resumed.
    pub(super) fn setup_procedure_resume(
        &mut self,
        is_final: bool,
        dependency_ids: &[DependencyId],
        expected_sites: &[SiteId],
    ) -> u64 {
        // An older continuation sitting in the ready queue has to wait again.
        let mut still_ready = VecDeque::with_capacity(self.ready.len());
        for unit in self.ready.drain(..) {
            if unit.should_resume_procedure() {
                self.waiting.insert(unit.id(), unit);
            } else {
                still_ready.push_back(unit);
            }
        }
        self.ready = still_ready;
        for frame in &self.stack_frames {
            if let Some(unit) = self.waiting.get_mut(frame) {
                unit.stack_count += 1;
            }
        }

        let id = self.allocate_id();
        self.stack_frames.push(id);
        let unit = WorkUnit::new(
            id,
            self.txn_id,
            WorkPayload::Resume { is_final },
            dependency_ids,
            expected_sites,
        );
        if unit.all_dependencies_satisfied() {
            self.push_completed(unit);
        } else {
            self.park(unit);
        }
        id
    }

    fn park(&mut self, unit: WorkUnit) {
        for dep in unit.dependency_ids() {
            if let Some(previous) = self.missing.insert(dep, unit.id()) {
                tracing::warn!(
                    txn_id = %self.txn_id,
                    dependency_id = %dep,
                    previous_unit = previous,
                    unit = unit.id(),
                    "dependency claimed by more than one work unit"
                );
            }
        }
        self.waiting.insert(unit.id(), unit);
    }

    fn complete_unit(&mut self, unit_id: u64) {
        let Some(unit) = self.waiting.remove(&unit_id) else {
            return;
        };
        for dep in unit.dependency_ids() {
            if self.missing.get(&dep) == Some(&unit_id) {
                self.missing.remove(&dep);
            }
        }
        self.push_completed(unit);
    }

    /// Continuations go ahead of the trailing run of continuations already
    /// queued; anything else goes to the back.
    fn push_completed(&mut self, unit: WorkUnit) {
        if unit.should_resume_procedure() {
            let mut at = self.ready.len();
            while at > 0 && self.ready[at - 1].should_resume_procedure() {
                at -= 1;
            }
            self.ready.insert(at, unit);
        } else {
            self.ready.push_back(unit);
        }
    }

    pub(super) fn pop_ready(&mut self) -> Option<WorkUnit> {
        let unit = self.ready.pop_front()?;
        if unit.should_resume_procedure() {
            self.on_resumed(unit.id());
        }
        Some(unit)
    }

    fn on_resumed(&mut self, unit_id: u64) {
        self.stack_frames.retain(|frame| *frame != unit_id);
        let frames = self.stack_frames.clone();
        for frame in frames {
            let Some(unit) = self.waiting.get_mut(&frame) else {
                continue;
            };
            unit.stack_count = unit.stack_count.saturating_sub(1);
            if unit.all_dependencies_satisfied() {
                self.complete_unit(frame);
            }
        }
    }

    /// Hand one arrival to the unit waiting on `dependency_id`.
    pub(super) fn deliver(
        &mut self,
        dependency_id: DependencyId,
        arrive: impl FnOnce(&mut WorkUnit) -> Result<(), FatalError>,
    ) -> Result<(), FatalError> {
        let Some(unit_id) = self.missing.get(&dependency_id).copied() else {
            tracing::debug!(
                txn_id = %self.txn_id,
                %dependency_id,
                "no work unit waiting on dependency"
            );
            return Ok(());
        };
        let Some(unit) = self.waiting.get_mut(&unit_id) else {
            return Ok(());
        };
        arrive(unit)?;
        if unit.all_dependencies_satisfied() {
            self.complete_unit(unit_id);
        }
        Ok(())
    }

    pub(super) fn remove_site(&mut self, site_id: SiteId) {
        let ids: Vec<u64> = self.waiting.keys().copied().collect();
        for id in ids {
            let Some(unit) = self.waiting.get_mut(&id) else {
                continue;
            };
            unit.remove_site(site_id);
            if unit.all_dependencies_satisfied() {
                self.complete_unit(id);
            }
        }
    }

    pub(super) fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub(super) fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.waiting.is_empty()
    }
}

enum Arrival {
    Table(ResultTable),
    Dummy,
    Failed(String),
}

/// The coordinating site's view of a multipartition transaction.
#[derive(Debug)]
pub struct CoordinatorTxn {
    task: InitiateTask,
    site_id: SiteId,
    /// Non-coordinating sites still taking part.
    participants: BTreeSet<SiteId>,
    work: WorkQueue,
    fragment_failure: Option<String>,
    final_response: Option<ClientResponse>,
    outstanding_acks: BTreeSet<SiteId>,
    suppress_response: bool,
    done: bool,
}

impl CoordinatorTxn {
    pub fn new(task: InitiateTask, site_id: SiteId) -> Self {
        let participants = task
            .non_coordinator_sites
            .iter()
            .copied()
            .filter(|site| *site != site_id)
            .collect();
        let mut work = WorkQueue::new(task.txn_id);
        work.add_unit(WorkPayload::Initiate(task.clone()), &[], &[]);
        Self {
            task,
            site_id,
            participants,
            work,
            fragment_failure: None,
            final_response: None,
            outstanding_acks: BTreeSet::new(),
            suppress_response: false,
            done: false,
        }
    }

    pub fn meta(&self) -> TxnMeta {
        self.task.meta()
    }

    pub fn participants(&self) -> Vec<SiteId> {
        self.participants.iter().copied().collect()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_blocked(&self) -> bool {
        !self.done && (self.final_response.is_some() || !self.work.has_ready())
    }

    pub fn suppress_response(&mut self) {
        self.suppress_response = true;
    }

    fn expected_sites(&self) -> Vec<SiteId> {
        let mut sites: Vec<SiteId> = self.participants.iter().copied().collect();
        sites.push(self.site_id);
        sites
    }

    pub fn do_work(&mut self, ctx: &mut SiteContext<'_>) -> DtxnResult<bool> {
        let meta = self.meta();
        while !self.done && self.final_response.is_none() {
            let Some(unit) = self.work.pop_ready() else {
                break;
            };
            let inputs = unit.results();
            match unit.into_payload() {
                WorkPayload::Initiate(task) => {
                    let step = ctx.engine.start_procedure(&meta, &task.invocation);
                    self.apply_step(ctx, step)?;
                }
                WorkPayload::Resume { is_final } => {
                    tracing::trace!(txn_id = %meta.txn_id, is_final, "resuming procedure");
                    let step = ctx.engine.resume_procedure(&meta, &inputs);
                    self.apply_step(ctx, step)?;
                }
                WorkPayload::Fragment(task) => self.run_local_fragment(ctx, &task, inputs)?,
                WorkPayload::Complete(_) => {
                    tracing::warn!(txn_id = %meta.txn_id, "coordinator ignoring completion work");
                }
            }
        }
        Ok(self.done)
    }

    fn apply_step(
        &mut self,
        ctx: &mut SiteContext<'_>,
        step: anyhow::Result<ProcedureStep>,
    ) -> DtxnResult<()> {
        match step {
            Ok(ProcedureStep::Dispatch(batches)) => {
                for batch in batches {
                    self.dispatch(ctx, batch)?;
                }
                Ok(())
            }
            Ok(ProcedureStep::Suspend) => {
                if self.work.is_idle() {
                    return self.finish(
                        ctx,
                        ClientResponse::failure(
                            ResponseStatus::UnexpectedFailure,
                            "procedure suspended without outstanding work",
                        ),
                    );
                }
                Ok(())
            }
            Ok(ProcedureStep::Complete(response)) => self.finish(ctx, response),
            Err(err) => {
                tracing::warn!(txn_id = %self.task.txn_id, error = ?err, "procedure failed");
                self.finish(
                    ctx,
                    ClientResponse::failure(ResponseStatus::UnexpectedFailure, format!("{err:#}")),
                )
            }
        }
    }

    fn dispatch(&mut self, ctx: &mut SiteContext<'_>, batch: FragmentBatch) -> DtxnResult<()> {
        let expected = self.expected_sites();
        self.work
            .setup_procedure_resume(batch.is_final, &batch.resume_on, &expected);

        if let Some(local) = batch.local {
            let inputs = local.pending_input_dependencies();
            self.work
                .add_unit(WorkPayload::Fragment(local), &inputs, &expected);
        }

        if let Some(mut distributed) = batch.distributed {
            distributed.is_final = batch.is_final;
            let targets = self.participants();
            if !targets.is_empty() {
                ctx.send_to_sites(&targets, Message::FragmentTask(distributed.clone()))?;
            }
            // The coordinator runs its own share like any participant.
            self.work
                .add_unit(WorkPayload::Fragment(distributed), &[], &[]);
        }
        Ok(())
    }

    fn run_local_fragment(
        &mut self,
        ctx: &mut SiteContext<'_>,
        task: &FragmentTask,
        inputs: DependencyResults,
    ) -> DtxnResult<()> {
        let mut all_inputs = DependencyResults::from_attached(&task.attached_inputs);
        all_inputs.merge(inputs);

        let outcome = match all_inputs.failure.clone() {
            Some(upstream) => Err(upstream),
            None => ctx
                .engine
                .execute_fragment(&self.meta(), task, &all_inputs)
                .map_err(|err| format!("{err:#}")),
        };
        let site_id = self.site_id;
        match outcome {
            Ok(outputs) => {
                for (dep, table) in outputs {
                    self.route(ctx, dep, site_id, Arrival::Table(table))?;
                }
            }
            Err(message) => {
                tracing::debug!(txn_id = %task.txn_id, %message, "local fragment failed");
                self.fragment_failure.get_or_insert(message.clone());
                for dep in task.output_dependencies() {
                    self.route(ctx, dep, site_id, Arrival::Failed(message.clone()))?;
                }
            }
        }
        Ok(())
    }

    fn route(
        &mut self,
        ctx: &SiteContext<'_>,
        dependency_id: DependencyId,
        site_id: SiteId,
        arrival: Arrival,
    ) -> DtxnResult<()> {
        match arrival {
            Arrival::Table(table) => {
                let Some(partition_id) = ctx.topology.partition_for_site(site_id) else {
                    tracing::warn!(
                        txn_id = %self.task.txn_id,
                        site_id,
                        "dropping result from site with no partition"
                    );
                    return Ok(());
                };
                self.work.deliver(dependency_id, |unit| {
                    unit.put_dependency(dependency_id, site_id, partition_id, table)
                })?;
            }
            Arrival::Dummy => {
                self.work.deliver(dependency_id, |unit| {
                    unit.put_dummy_dependency(dependency_id, site_id);
                    Ok(())
                })?;
            }
            Arrival::Failed(message) => {
                self.work.deliver(dependency_id, |unit| {
                    unit.put_failure(dependency_id, site_id, message);
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    pub fn on_fragment_response(
        &mut self,
        ctx: &mut SiteContext<'_>,
        response: FragmentResponse,
    ) -> DtxnResult<()> {
        let site_id = response.executor_site_id;
        if !self.participants.contains(&site_id) {
            tracing::debug!(
                txn_id = %response.txn_id,
                site_id,
                "ignoring fragment response from non-participant"
            );
            return Ok(());
        }
        for (dep, table) in response.dependencies {
            let arrival = if response.recovering {
                Arrival::Dummy
            } else {
                match &response.status {
                    FragmentStatus::Success => Arrival::Table(table),
                    FragmentStatus::Failed(message) => {
                        self.fragment_failure.get_or_insert(message.clone());
                        Arrival::Failed(message.clone())
                    }
                }
            };
            self.route(ctx, dep, site_id, arrival)?;
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &mut SiteContext<'_>, response: ClientResponse) -> DtxnResult<()> {
        let response = match &self.fragment_failure {
            Some(failure) if response.is_success() => ClientResponse::failure(
                ResponseStatus::UnexpectedFailure,
                format!("fragment failed: {failure}"),
            ),
            _ => response,
        };
        let rollback = !response.is_success();
        ctx.engine
            .complete_transaction(self.task.txn_id, rollback)?;

        let requires_ack = !self.task.read_only;
        // Replicas of this partition answer the initiator with the same response.
        let (replicas, others): (Vec<SiteId>, Vec<SiteId>) = self
            .participants
            .iter()
            .copied()
            .partition(|site| ctx.topology.partition_for_site(*site) == Some(ctx.partition_id));
        for (targets, attached) in [(replicas, Some(response.clone())), (others, None)] {
            if targets.is_empty() {
                continue;
            }
            ctx.send_to_sites(
                &targets,
                Message::CompleteTransaction(CompleteTransaction {
                    txn_id: self.task.txn_id,
                    initiator_id: self.task.initiator_id,
                    coordinator_id: self.site_id,
                    rollback,
                    requires_ack,
                    response: attached,
                }),
            )?;
        }
        if requires_ack {
            self.outstanding_acks = self.participants.clone();
        }
        tracing::debug!(
            txn_id = %self.task.txn_id,
            rollback,
            acks = self.outstanding_acks.len(),
            "multipartition transaction decided"
        );
        self.final_response = Some(response);
        self.maybe_respond(ctx)
    }

    fn maybe_respond(&mut self, ctx: &SiteContext<'_>) -> DtxnResult<()> {
        if self.done || !self.outstanding_acks.is_empty() {
            return Ok(());
        }
        let Some(response) = self.final_response.clone() else {
            return Ok(());
        };
        self.done = true;
        if self.suppress_response {
            tracing::debug!(txn_id = %self.task.txn_id, "initiator gone; response dropped");
            return Ok(());
        }
        ctx.respond_to_initiator(&self.meta(), response, false)
    }

    pub fn on_complete_response(
        &mut self,
        ctx: &mut SiteContext<'_>,
        ack: CompleteTransactionResponse,
    ) -> DtxnResult<()> {
        if !self.outstanding_acks.remove(&ack.site_id) {
            tracing::debug!(txn_id = %ack.txn_id, site_id = ack.site_id, "unexpected completion ack");
        }
        self.maybe_respond(ctx)
    }

    pub fn handle_site_faults(
        &mut self,
        ctx: &mut SiteContext<'_>,
        failed_sites: &BTreeSet<SiteId>,
        failed_initiators: &BTreeSet<InitiatorId>,
    ) -> DtxnResult<()> {
        if failed_initiators.contains(&self.task.initiator_id) {
            self.suppress_response();
        }
        for site in failed_sites {
            if self.participants.remove(site) {
                tracing::info!(txn_id = %self.task.txn_id, site_id = site, "participant failed");
            }
            self.outstanding_acks.remove(site);
            self.work.remove_site(*site);
        }
        self.maybe_respond(ctx)
    }
}

/// A non-coordinating site's view of a multipartition transaction.
///
/// A participant in the coordinator's own partition is a coordinator replica:
/// it holds the transaction open until the decision arrives, even when read
/// only, and then answers the initiator alongside the coordinator.
#[derive(Debug)]
pub struct ParticipantTxn {
    meta: TxnMeta,
    site_id: SiteId,
    pending: VecDeque<WorkPayload>,
    engine_completed: bool,
    suppress_response: bool,
    done: bool,
}

impl ParticipantTxn {
    pub fn new(meta: TxnMeta, site_id: SiteId) -> Self {
        Self {
            meta,
            site_id,
            pending: VecDeque::new(),
            engine_completed: false,
            suppress_response: false,
            done: false,
        }
    }

    pub fn meta(&self) -> TxnMeta {
        self.meta
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_blocked(&self) -> bool {
        !self.done && self.pending.is_empty()
    }

    pub fn on_fragment_task(&mut self, task: FragmentTask) {
        self.pending.push_back(WorkPayload::Fragment(task));
    }

    pub fn on_complete_transaction(&mut self, complete: CompleteTransaction) {
        self.pending.push_back(WorkPayload::Complete(complete));
    }

    pub fn do_work(&mut self, ctx: &mut SiteContext<'_>) -> DtxnResult<bool> {
        while !self.done {
            let Some(work) = self.pending.pop_front() else {
                break;
            };
            match work {
                WorkPayload::Fragment(task) => self.run_fragment(ctx, &task)?,
                WorkPayload::Complete(complete) => self.complete(ctx, complete)?,
                WorkPayload::Initiate(_) | WorkPayload::Resume { .. } => {
                    tracing::warn!(txn_id = %self.meta.txn_id, "participant ignoring procedure work");
                }
            }
        }
        Ok(self.done)
    }

    fn complete(
        &mut self,
        ctx: &mut SiteContext<'_>,
        complete: CompleteTransaction,
    ) -> DtxnResult<()> {
        if !self.engine_completed {
            ctx.engine
                .complete_transaction(self.meta.txn_id, complete.rollback)?;
            self.engine_completed = true;
        }
        self.done = true;
        if complete.requires_ack {
            ctx.send(
                Address::Site(complete.coordinator_id),
                Message::CompleteTransactionResponse(CompleteTransactionResponse {
                    txn_id: self.meta.txn_id,
                    site_id: self.site_id,
                }),
            )?;
        }
        if !ctx.is_coordinator_replica(&self.meta) || self.suppress_response {
            return Ok(());
        }
        let response = complete.response.unwrap_or_else(|| {
            ClientResponse::failure(
                ResponseStatus::GracefulFailure,
                format!(
                    "coordinator site {} rolled the transaction back",
                    complete.coordinator_id
                ),
            )
        });
        ctx.respond_to_initiator(&self.meta, response, false)
    }

    fn run_fragment(&mut self, ctx: &mut SiteContext<'_>, task: &FragmentTask) -> DtxnResult<()> {
        let inputs = DependencyResults::from_attached(&task.attached_inputs);
        let (status, dependencies) = match ctx.engine.execute_fragment(&self.meta, task, &inputs) {
            Ok(outputs) => (FragmentStatus::Success, outputs),
            Err(err) => {
                tracing::debug!(txn_id = %task.txn_id, error = ?err, "fragment failed");
                let empty = task
                    .output_dependencies()
                    .into_iter()
                    .map(|dep| (dep, ResultTable::empty()))
                    .collect();
                (FragmentStatus::Failed(format!("{err:#}")), empty)
            }
        };
        // Read-only work has nothing to undo, so the last batch ends it here.
        if task.read_only && task.is_final {
            let failed = status != FragmentStatus::Success;
            ctx.engine.complete_transaction(self.meta.txn_id, failed)?;
            self.engine_completed = true;
            self.done = !ctx.is_coordinator_replica(&self.meta);
        }
        ctx.send(
            Address::Site(task.coordinator_id),
            Message::FragmentResponse(FragmentResponse {
                txn_id: task.txn_id,
                executor_site_id: self.site_id,
                destination_site_id: task.coordinator_id,
                status,
                recovering: false,
                dependencies,
            }),
        )
    }

    /// Roll back once this transaction runs if its coordinator failed before
    /// its decision arrived. Every other participant rolls back too, so a
    /// coordinator replica answers the initiator with the rollback.
    pub fn handle_site_faults(
        &mut self,
        failed_sites: &BTreeSet<SiteId>,
        failed_initiators: &BTreeSet<InitiatorId>,
    ) {
        if failed_initiators.contains(&self.meta.initiator_id) {
            self.suppress_response = true;
        }
        let decided = self
            .pending
            .iter()
            .any(|work| matches!(work, WorkPayload::Complete(_)));
        if self.done || decided || !failed_sites.contains(&self.meta.coordinator_id) {
            return;
        }
        tracing::warn!(
            txn_id = %self.meta.txn_id,
            coordinator_id = self.meta.coordinator_id,
            "coordinator failed; participant will roll back"
        );
        self.pending.clear();
        self.pending
            .push_back(WorkPayload::Complete(CompleteTransaction {
                txn_id: self.meta.txn_id,
                initiator_id: self.meta.initiator_id,
                coordinator_id: self.meta.coordinator_id,
                rollback: true,
                requires_ack: false,
                response: Some(ClientResponse::failure(
                    ResponseStatus::GracefulFailure,
                    format!(
                        "coordinator site {} failed; transaction rolled back",
                        self.meta.coordinator_id
                    ),
                )),
            }));
    }
}
