//! Execution site: one replica of one partition.
//!
//! The site is single threaded. It admits incoming transactions into its
//! admission queue, runs the head of the queue to completion before polling
//! the next one, and routes fragment traffic to whichever transaction state
//! it belongs to. Any fatal error stops the site.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::time;

use super::admission::{AdmissionQueue, QueueState, QueuedTxn};
use super::error::{DtxnError, DtxnResult, FatalError};
use super::multi_partition::{CoordinatorTxn, ParticipantTxn};
use super::txn_state::{
    RecoveringTxn, ReplayTxn, SinglePartitionTxn, SiteContext, TransactionState,
};
use super::types::{
    Address, CompleteTransaction, ExecutionEngine, FaultEvent, FragmentTask, Heartbeat,
    HeartbeatResponse, InitiateTask, InitiatorId, Mailbox, Message, ParticipantNotice,
    PartitionId, ReplayTask, SiteId, SiteTracker, TxnId, TxnMeta,
};

/// Execution site settings.
#[derive(Clone, Debug)]
pub struct SiteConfig {
    pub site_id: SiteId,
    pub partition_id: PartitionId,
    /// Initiators whose transactions this site orders.
    pub initiators: Vec<InitiatorId>,
    /// Hold the queue head until every replica is known to have received it.
    pub use_safety_dance: bool,
    /// How long the loop waits for a message before re-checking progress.
    pub poll_interval: Duration,
    /// Start in recovering mode, answering with placeholders.
    pub start_recovering: bool,
}

impl SiteConfig {
    pub fn new(site_id: SiteId, partition_id: PartitionId, initiators: Vec<InitiatorId>) -> Self {
        Self {
            site_id,
            partition_id,
            initiators,
            use_safety_dance: false,
            poll_interval: Duration::from_millis(5),
            start_recovering: false,
        }
    }
}

/// One replica of one partition, driven by its own loop.
pub struct ExecutionSite {
    config: SiteConfig,
    engine: Box<dyn ExecutionEngine>,
    mailbox: Arc<dyn Mailbox>,
    topology: Arc<dyn SiteTracker>,
    queue: AdmissionQueue<(Address, Message)>,
    txns: BTreeMap<TxnId, TransactionState>,
    current: Option<TxnId>,
    last_completed: TxnId,
    completed: u64,
    recovering: bool,
}

impl ExecutionSite {
    pub fn new(
        config: SiteConfig,
        engine: Box<dyn ExecutionEngine>,
        mailbox: Arc<dyn Mailbox>,
        topology: Arc<dyn SiteTracker>,
    ) -> Self {
        let mut queue = AdmissionQueue::new(config.site_id, config.use_safety_dance);
        for initiator_id in &config.initiators {
            queue.register(*initiator_id);
        }
        let recovering = config.start_recovering;
        Self {
            config,
            engine,
            mailbox,
            topology,
            queue,
            txns: BTreeMap::new(),
            current: None,
            last_completed: TxnId::NONE,
            completed: 0,
            recovering,
        }
    }

    pub fn site_id(&self) -> SiteId {
        self.config.site_id
    }

    pub fn queue_state(&self) -> QueueState {
        self.queue.state()
    }

    pub fn last_completed_txn_id(&self) -> TxnId {
        self.last_completed
    }

    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    /// Transactions admitted but not yet finished, including the running one.
    pub fn pending_txn_count(&self) -> usize {
        self.txns.len()
    }

    pub fn current_txn_id(&self) -> Option<TxnId> {
        self.current
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Leave recovering mode. Transactions admitted from now on execute.
    pub fn finish_recovery(&mut self) {
        if self.recovering {
            tracing::info!(site_id = self.config.site_id, "site finished recovery");
        }
        self.recovering = false;
    }

    pub fn safe_to_recover(&self) -> Option<TxnId> {
        self.queue.safe_to_recover()
    }

    /// Deliver `message` to `to` once the transaction stream passes
    /// `after_txn_id`; the queue then stays in `reason`.
    pub fn schedule_blocking_action(
        &mut self,
        after_txn_id: TxnId,
        reason: QueueState,
        to: Address,
        message: Message,
    ) -> DtxnResult<()> {
        self.queue
            .schedule_blocking_action(after_txn_id, reason, (to, message))?;
        self.flush_fired()
    }

    fn send(&self, to: Address, message: Message) -> DtxnResult<()> {
        let kind = message.kind();
        self.mailbox
            .send(to, message)
            .with_context(|| format!("site {} failed to send {kind} to {to}", self.config.site_id))?;
        Ok(())
    }

    fn flush_fired(&mut self) -> DtxnResult<()> {
        for (to, message) in self.queue.take_fired() {
            self.send(to, message)?;
        }
        Ok(())
    }

    /// Newest id this site has run or is running.
    fn high_water(&self) -> TxnId {
        self.current.map_or(self.last_completed, |current| current.max(self.last_completed))
    }

    fn check_order(&self, txn_id: TxnId) -> DtxnResult<()> {
        let high_water = self.high_water();
        if txn_id <= high_water {
            return Err(FatalError::OrderingViolation {
                site_id: self.config.site_id,
                txn_id,
                last_completed: high_water,
            }
            .into());
        }
        Ok(())
    }

    fn admit(&mut self, initiator_id: InitiatorId, state: TransactionState) {
        let txn_id = state.txn_id();
        if self.queue.add(QueuedTxn {
            txn_id,
            initiator_id,
        }) {
            tracing::trace!(
                site_id = self.config.site_id,
                %txn_id,
                kind = state.kind(),
                "transaction admitted"
            );
            self.txns.insert(txn_id, state);
        }
    }

    pub fn handle_message(&mut self, message: Message) -> DtxnResult<()> {
        match message {
            Message::InitiateTask(task) => self.on_initiate(task)?,
            Message::ParticipantNotice(notice) => self.on_notice(notice)?,
            Message::FragmentTask(task) => self.on_fragment_task(task)?,
            Message::CompleteTransaction(complete) => self.on_complete_transaction(complete)?,
            Message::FragmentResponse(response) => {
                self.with_txn(response.txn_id, |state, ctx| {
                    state.on_fragment_response(ctx, response)
                })?;
            }
            Message::CompleteTransactionResponse(ack) => {
                self.with_txn(ack.txn_id, |state, ctx| state.on_complete_response(ctx, ack))?;
            }
            Message::Heartbeat(heartbeat) => self.on_heartbeat(heartbeat)?,
            Message::Replay(task) => self.on_replay(task)?,
            Message::Fault(event) => self.on_fault(event)?,
            Message::Marker(marker) => {
                tracing::info!(
                    site_id = self.config.site_id,
                    from_site = marker.site_id,
                    after_txn_id = %marker.after_txn_id,
                    label = %marker.label,
                    "stream marker received"
                );
            }
            other @ (Message::InitiateResponse(_) | Message::HeartbeatResponse(_)) => {
                tracing::warn!(
                    site_id = self.config.site_id,
                    kind = other.kind(),
                    "site ignoring initiator-bound message"
                );
            }
        }
        self.flush_fired()
    }

    fn with_txn(
        &mut self,
        txn_id: TxnId,
        apply: impl FnOnce(&mut TransactionState, &mut SiteContext<'_>) -> DtxnResult<()>,
    ) -> DtxnResult<()> {
        let Some(state) = self.txns.get_mut(&txn_id) else {
            tracing::debug!(
                site_id = self.config.site_id,
                %txn_id,
                "message for unknown transaction dropped"
            );
            return Ok(());
        };
        let mut ctx = SiteContext {
            site_id: self.config.site_id,
            partition_id: self.config.partition_id,
            engine: self.engine.as_mut(),
            mailbox: self.mailbox.as_ref(),
            topology: self.topology.as_ref(),
        };
        apply(state, &mut ctx)
    }

    fn on_initiate(&mut self, mut task: InitiateTask) -> DtxnResult<()> {
        if !task.single_partition && task.coordinator_id != self.config.site_id {
            // Coordinator replicas take part like any other participant.
            return self.on_notice(ParticipantNotice {
                txn_id: task.txn_id,
                initiator_id: task.initiator_id,
                coordinator_id: task.coordinator_id,
                read_only: task.read_only,
                safe_txn_id: task.safe_txn_id,
            });
        }
        if !self.queue.is_known_initiator(task.initiator_id) {
            tracing::warn!(
                site_id = self.config.site_id,
                txn_id = %task.txn_id,
                initiator_id = task.initiator_id,
                "initiate from unknown initiator dropped"
            );
            return Ok(());
        }
        if self.txns.contains_key(&task.txn_id) {
            tracing::warn!(site_id = self.config.site_id, txn_id = %task.txn_id, "duplicate initiate dropped");
            return Ok(());
        }
        self.check_order(task.txn_id)?;
        self.queue.note_received(
            task.initiator_id,
            task.txn_id,
            false,
            task.safe_txn_id,
        );

        let site_id = self.config.site_id;
        let initiator_id = task.initiator_id;
        let state = if self.recovering {
            TransactionState::Recovering(RecoveringTxn::from_initiate(task))
        } else if task.single_partition {
            TransactionState::SinglePartition(SinglePartitionTxn::new(task))
        } else {
            // Participants that failed before this arrived never get fragments.
            let live = self.topology.live_sites();
            task.non_coordinator_sites.retain(|site| live.contains(site));
            TransactionState::Coordinator(CoordinatorTxn::new(task, site_id))
        };
        self.admit(initiator_id, state);
        Ok(())
    }

    fn on_notice(&mut self, notice: ParticipantNotice) -> DtxnResult<()> {
        if !self.queue.is_known_initiator(notice.initiator_id) {
            tracing::warn!(
                site_id = self.config.site_id,
                txn_id = %notice.txn_id,
                initiator_id = notice.initiator_id,
                "participant notice from unknown initiator dropped"
            );
            return Ok(());
        }
        // A fragment from the coordinator may have created the state already.
        if !self.txns.contains_key(&notice.txn_id) {
            self.check_order(notice.txn_id)?;
            let state = self.participant_state(notice.meta())?;
            self.queue.note_received(
                notice.initiator_id,
                notice.txn_id,
                false,
                notice.safe_txn_id,
            );
            self.admit(notice.initiator_id, state);
        } else {
            self.queue.note_received(
                notice.initiator_id,
                notice.txn_id,
                false,
                notice.safe_txn_id,
            );
        }
        Ok(())
    }

    /// Participant state for `meta`. When the coordinator is already known
    /// to have failed, the state starts out rolling back; a coordinator
    /// replica then reports the rollback to the initiator.
    fn participant_state(&mut self, meta: TxnMeta) -> DtxnResult<TransactionState> {
        let mut state = if self.recovering {
            TransactionState::Recovering(RecoveringTxn::participant(meta))
        } else {
            TransactionState::Participant(ParticipantTxn::new(meta, self.config.site_id))
        };
        if !self.topology.live_sites().contains(&meta.coordinator_id) {
            let failed = BTreeSet::from([meta.coordinator_id]);
            let mut ctx = SiteContext {
                site_id: self.config.site_id,
                partition_id: self.config.partition_id,
                engine: self.engine.as_mut(),
                mailbox: self.mailbox.as_ref(),
                topology: self.topology.as_ref(),
            };
            state.handle_site_faults(&mut ctx, &failed, &BTreeSet::new())?;
        }
        Ok(state)
    }

    /// Create a participant for traffic that beat the initiator's notice.
    /// Returns false when the transaction is already over here.
    fn ensure_participant(&mut self, txn_id: TxnId, task_meta: TxnMeta) -> DtxnResult<bool> {
        if self.txns.contains_key(&txn_id) {
            return Ok(true);
        }
        if txn_id <= self.high_water() {
            tracing::debug!(
                site_id = self.config.site_id,
                %txn_id,
                "traffic for finished transaction dropped"
            );
            return Ok(false);
        }
        if !self.queue.is_known_initiator(task_meta.initiator_id) {
            tracing::warn!(
                site_id = self.config.site_id,
                %txn_id,
                initiator_id = task_meta.initiator_id,
                "traffic from unknown initiator dropped"
            );
            return Ok(false);
        }
        // The initiator's own message has not arrived yet, so its progress
        // is not noted here.
        let state = self.participant_state(task_meta)?;
        self.admit(task_meta.initiator_id, state);
        Ok(self.txns.contains_key(&txn_id))
    }

    fn on_fragment_task(&mut self, task: FragmentTask) -> DtxnResult<()> {
        if self.ensure_participant(task.txn_id, task.meta())? {
            if let Some(state) = self.txns.get_mut(&task.txn_id) {
                state.on_fragment_task(task);
            }
        }
        Ok(())
    }

    fn on_complete_transaction(&mut self, complete: CompleteTransaction) -> DtxnResult<()> {
        let meta = TxnMeta {
            txn_id: complete.txn_id,
            initiator_id: complete.initiator_id,
            coordinator_id: complete.coordinator_id,
            read_only: !complete.requires_ack,
            single_partition: false,
        };
        if self.ensure_participant(complete.txn_id, meta)? {
            if let Some(state) = self.txns.get_mut(&complete.txn_id) {
                state.on_complete_transaction(complete);
            }
        }
        Ok(())
    }

    fn on_heartbeat(&mut self, heartbeat: Heartbeat) -> DtxnResult<()> {
        if !self.queue.is_known_initiator(heartbeat.initiator_id) {
            tracing::debug!(
                site_id = self.config.site_id,
                initiator_id = heartbeat.initiator_id,
                "heartbeat from unknown initiator dropped"
            );
            return Ok(());
        }
        let last_received = self.queue.note_received(
            heartbeat.initiator_id,
            heartbeat.txn_id,
            true,
            heartbeat.safe_txn_id,
        );
        let blocked = matches!(
            self.queue.state(),
            QueueState::BlockedOrdering | QueueState::BlockedSafety
        );
        self.send(
            Address::Initiator(heartbeat.initiator_id),
            Message::HeartbeatResponse(HeartbeatResponse {
                site_id: self.config.site_id,
                initiator_id: heartbeat.initiator_id,
                last_received_txn_id: last_received,
                blocked,
            }),
        )
    }

    fn on_replay(&mut self, task: ReplayTask) -> DtxnResult<()> {
        if let Some(current) = self.current {
            return Err(DtxnError::rejected(format!(
                "cannot replay txn {} while txn {current} is running",
                task.txn_id()
            )));
        }
        let txn_id = task.txn_id();
        // Batches of one logged multipartition transaction share its id.
        let continues_last = matches!(task, ReplayTask::Fragment(_)) && txn_id == self.last_completed;
        if !continues_last {
            self.check_order(txn_id)?;
        }
        let mut ctx = SiteContext {
            site_id: self.config.site_id,
            partition_id: self.config.partition_id,
            engine: self.engine.as_mut(),
            mailbox: self.mailbox.as_ref(),
            topology: self.topology.as_ref(),
        };
        let mut state = TransactionState::Replay(ReplayTxn::new(task));
        state.do_work(&mut ctx)?;
        self.last_completed = txn_id;
        if !continues_last {
            self.completed += 1;
        }
        Ok(())
    }

    fn on_fault(&mut self, event: FaultEvent) -> DtxnResult<()> {
        tracing::info!(
            site_id = self.config.site_id,
            failed_sites = ?event.failed_sites,
            failed_initiators = ?event.failed_initiators,
            "handling fault"
        );
        for initiator_id in &event.failed_initiators {
            self.queue.remove_initiator(*initiator_id);
        }
        let mut ctx = SiteContext {
            site_id: self.config.site_id,
            partition_id: self.config.partition_id,
            engine: self.engine.as_mut(),
            mailbox: self.mailbox.as_ref(),
            topology: self.topology.as_ref(),
        };
        for state in self.txns.values_mut() {
            state.handle_site_faults(&mut ctx, &event.failed_sites, &event.failed_initiators)?;
        }
        Ok(())
    }

    /// Run the current transaction, and the ones after it, as far as they
    /// can go without further messages.
    pub fn try_to_make_progress(&mut self) -> DtxnResult<()> {
        loop {
            let txn_id = match self.current {
                Some(txn_id) => txn_id,
                None => match self.queue.poll() {
                    Some(next) => {
                        self.current = Some(next.txn_id);
                        next.txn_id
                    }
                    None => break,
                },
            };
            let Some(state) = self.txns.get_mut(&txn_id) else {
                tracing::warn!(site_id = self.config.site_id, %txn_id, "polled transaction has no state");
                self.current = None;
                continue;
            };
            if !state.is_done() {
                if state.is_blocked() {
                    break;
                }
                let mut ctx = SiteContext {
                    site_id: self.config.site_id,
                    partition_id: self.config.partition_id,
                    engine: self.engine.as_mut(),
                    mailbox: self.mailbox.as_ref(),
                    topology: self.topology.as_ref(),
                };
                state.do_work(&mut ctx)?;
            }
            if !state.is_done() {
                break;
            }
            self.finish_current(txn_id);
        }
        self.flush_fired()
    }

    fn finish_current(&mut self, txn_id: TxnId) {
        if let Some(state) = self.txns.remove(&txn_id) {
            tracing::trace!(
                site_id = self.config.site_id,
                %txn_id,
                kind = state.kind(),
                "transaction finished"
            );
        }
        self.last_completed = self.last_completed.max(txn_id);
        self.completed += 1;
        self.current = None;
    }

    /// Serve `inbox` until it closes or a fatal error stops the site.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Message>) -> DtxnResult<()> {
        tracing::info!(
            site_id = self.config.site_id,
            partition_id = self.config.partition_id,
            recovering = self.recovering,
            "execution site started"
        );
        let result = self.serve(&mut inbox).await;
        match &result {
            Ok(()) => tracing::info!(
                site_id = self.config.site_id,
                completed = self.completed,
                last_completed = %self.last_completed,
                "execution site stopped"
            ),
            Err(err) => tracing::error!(
                site_id = self.config.site_id,
                error = %err,
                fatal = err.is_fatal(),
                "execution site halted"
            ),
        }
        result
    }

    async fn serve(&mut self, inbox: &mut mpsc::UnboundedReceiver<Message>) -> DtxnResult<()> {
        while self.serve_one(inbox).await? {}
        Ok(())
    }

    /// Handle at most one message, waiting up to the poll interval for it,
    /// then run whatever became ready. Returns false once the inbox closes.
    async fn serve_one(
        &mut self,
        inbox: &mut mpsc::UnboundedReceiver<Message>,
    ) -> DtxnResult<bool> {
        match time::timeout(self.config.poll_interval, inbox.recv()).await {
            Ok(Some(message)) => self.handle_message(message)?,
            Ok(None) => return Ok(false),
            Err(_) => {}
        }
        self.try_to_make_progress()?;
        Ok(true)
    }
}
