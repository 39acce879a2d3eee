//! Transaction initiator.
//!
//! Assigns globally ordered ids to client invocations, fans them out to the
//! sites that must run them, and reconciles replica responses before
//! answering the client. Id assignment and the sends that follow happen under
//! one lock so every site sees this initiator's ids in increasing order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};

use super::error::{DtxnError, DtxnResult};
use super::inflight::{ExhaustedTxnPolicy, InFlightRegistry, InFlightTxn};
use super::txn_id::TxnIdGenerator;
use super::types::{
    Address, ClientResponse, Heartbeat, InitiateTask, InitiatorId, Invocation, Mailbox, Message,
    ParticipantNotice, PartitionId, SiteId, SiteTracker, TxnId,
};
use super::watermark::SafetyWatermarkTracker;

/// Initiator settings.
#[derive(Clone, Debug)]
pub struct InitiatorConfig {
    pub initiator_id: InitiatorId,
    /// Number of extra replicas per partition. Responses are cross-checked
    /// when this is above zero.
    pub k_factor: u32,
    pub heartbeat_interval: Duration,
    pub exhausted_policy: ExhaustedTxnPolicy,
}

impl InitiatorConfig {
    pub fn new(initiator_id: InitiatorId) -> Self {
        Self {
            initiator_id,
            k_factor: 0,
            heartbeat_interval: Duration::from_millis(5),
            exhausted_policy: ExhaustedTxnPolicy::default(),
        }
    }
}

/// Where a transaction runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnTarget {
    SinglePartition(PartitionId),
    MultiPartition,
}

struct InitiatorState {
    ids: TxnIdGenerator,
    registry: InFlightRegistry,
    safety: SafetyWatermarkTracker,
    waiters: BTreeMap<TxnId, oneshot::Sender<ClientResponse>>,
    next_coordinator: usize,
}

/// Assigns transaction ids and tracks responses for one initiator.
pub struct Initiator {
    config: InitiatorConfig,
    mailbox: Arc<dyn Mailbox>,
    topology: Arc<dyn SiteTracker>,
    state: Mutex<InitiatorState>,
}

impl Initiator {
    pub fn new(
        config: InitiatorConfig,
        mailbox: Arc<dyn Mailbox>,
        topology: Arc<dyn SiteTracker>,
    ) -> DtxnResult<Self> {
        let ids = TxnIdGenerator::new(config.initiator_id)?;
        Self::with_id_generator(config, mailbox, topology, ids)
    }

    pub fn with_id_generator(
        config: InitiatorConfig,
        mailbox: Arc<dyn Mailbox>,
        topology: Arc<dyn SiteTracker>,
        ids: TxnIdGenerator,
    ) -> DtxnResult<Self> {
        if ids.initiator_id() != config.initiator_id {
            return Err(DtxnError::rejected(format!(
                "id generator belongs to initiator {}, not {}",
                ids.initiator_id(),
                config.initiator_id
            )));
        }
        let state = InitiatorState {
            ids,
            registry: InFlightRegistry::new(config.exhausted_policy),
            safety: SafetyWatermarkTracker::new(topology.as_ref()),
            waiters: BTreeMap::new(),
            next_coordinator: 0,
        };
        Ok(Self {
            config,
            mailbox,
            topology,
            state: Mutex::new(state),
        })
    }

    pub fn initiator_id(&self) -> InitiatorId {
        self.config.initiator_id
    }

    fn lock(&self) -> DtxnResult<MutexGuard<'_, InitiatorState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("initiator state lock poisoned").into())
    }

    fn send(&self, to: Address, message: Message) -> DtxnResult<()> {
        self.mailbox.send(to, message)?;
        Ok(())
    }

    /// Number of transactions still waiting on replicas.
    pub fn in_flight(&self) -> DtxnResult<usize> {
        Ok(self.lock()?.registry.len())
    }

    pub fn last_txn_id(&self) -> DtxnResult<TxnId> {
        Ok(self.lock()?.ids.last_id())
    }

    pub fn safe_txn_id_for_site(&self, site_id: SiteId) -> DtxnResult<TxnId> {
        Ok(self.lock()?.safety.newest_safe_txn_id(site_id))
    }

    /// Assign an id to `invocation` and send it out. The receiver resolves
    /// with the client response.
    ///
    /// Every message goes out before the transaction is registered. Responses
    /// are handled under the same lock, so none can arrive unregistered, and a
    /// failed send leaves nothing in flight.
    pub fn submit(
        &self,
        invocation: Invocation,
        read_only: bool,
        target: TxnTarget,
    ) -> DtxnResult<(TxnId, oneshot::Receiver<ClientResponse>)> {
        let mut state = self.lock()?;
        let (txn_id, responders) = match target {
            TxnTarget::SinglePartition(partition_id) => {
                let sites = self.topology.live_sites_for_partition(partition_id);
                if sites.is_empty() {
                    return Err(DtxnError::rejected(format!(
                        "partition {partition_id} has no live replica"
                    )));
                }
                let txn_id = state.ids.next_id();
                for site_id in &sites {
                    let task = InitiateTask {
                        txn_id,
                        initiator_id: self.config.initiator_id,
                        coordinator_id: *site_id,
                        read_only,
                        single_partition: true,
                        safe_txn_id: state.safety.newest_safe_txn_id(*site_id),
                        non_coordinator_sites: Vec::new(),
                        invocation: invocation.clone(),
                    };
                    self.send(Address::Site(*site_id), Message::InitiateTask(task))?;
                }
                (txn_id, sites)
            }
            TxnTarget::MultiPartition => {
                let (coordinator_id, replicas) = self.pick_coordinator(&mut state)?;
                let participants = self.topology.all_sites_excluding(coordinator_id);
                let txn_id = state.ids.next_id();
                // The coordinator goes first so it is never behind its replicas.
                for site_id in &replicas {
                    let task = InitiateTask {
                        txn_id,
                        initiator_id: self.config.initiator_id,
                        coordinator_id,
                        read_only,
                        single_partition: false,
                        safe_txn_id: state.safety.newest_safe_txn_id(*site_id),
                        non_coordinator_sites: participants.clone(),
                        invocation: invocation.clone(),
                    };
                    self.send(Address::Site(*site_id), Message::InitiateTask(task))?;
                }
                for site_id in participants.iter().filter(|site| !replicas.contains(site)) {
                    let notice = ParticipantNotice {
                        txn_id,
                        initiator_id: self.config.initiator_id,
                        coordinator_id,
                        read_only,
                        safe_txn_id: state.safety.newest_safe_txn_id(*site_id),
                    };
                    self.send(Address::Site(*site_id), Message::ParticipantNotice(notice))?;
                }
                (txn_id, replicas)
            }
        };
        state.registry.register(InFlightTxn::new(
            txn_id,
            read_only,
            matches!(target, TxnTarget::SinglePartition(_)),
            responders,
            self.config.k_factor,
        ))?;
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(txn_id, tx);
        tracing::trace!(
            initiator_id = self.config.initiator_id,
            %txn_id,
            ?target,
            read_only,
            "transaction initiated"
        );
        Ok((txn_id, rx))
    }

    /// Rotate coordination across partitions. Returns the first live replica
    /// of the chosen partition and every live replica, coordinator first.
    fn pick_coordinator(&self, state: &mut InitiatorState) -> DtxnResult<(SiteId, Vec<SiteId>)> {
        let partitions = self.topology.partitions();
        for offset in 0..partitions.len() {
            let index = (state.next_coordinator + offset) % partitions.len();
            let replicas = self.topology.live_sites_for_partition(partitions[index]);
            if let Some(site_id) = replicas.first().copied() {
                state.next_coordinator = (index + 1) % partitions.len();
                return Ok((site_id, replicas));
            }
        }
        Err(DtxnError::rejected("no live site can coordinate"))
    }

    /// Announce progress to every live site so idle initiators do not hold
    /// back the other initiators' transactions.
    pub fn send_heartbeats(&self) -> DtxnResult<()> {
        let mut state = self.lock()?;
        let txn_id = state.ids.next_id();
        for site_id in self.topology.live_sites() {
            let heartbeat = Heartbeat {
                initiator_id: self.config.initiator_id,
                txn_id,
                safe_txn_id: state.safety.newest_safe_txn_id(site_id),
            };
            self.send(Address::Site(site_id), Message::Heartbeat(heartbeat))?;
        }
        Ok(())
    }

    /// Handle a message addressed to this initiator.
    pub fn deliver(&self, message: Message) -> DtxnResult<()> {
        match message {
            Message::InitiateResponse(response) => {
                let mut state = self.lock()?;
                if let Some(client_response) = state.registry.add_response(&response)? {
                    release(&mut state, response.txn_id, client_response);
                }
            }
            Message::HeartbeatResponse(response) => {
                self.lock()?
                    .safety
                    .update_from_executor(response.site_id, response.last_received_txn_id);
            }
            Message::Fault(event) => {
                for site_id in &event.failed_sites {
                    self.handle_site_failure(*site_id)?;
                }
            }
            Message::Marker(marker) => {
                tracing::info!(
                    initiator_id = self.config.initiator_id,
                    site_id = marker.site_id,
                    after_txn_id = %marker.after_txn_id,
                    label = %marker.label,
                    "stream marker received"
                );
            }
            other => {
                tracing::warn!(
                    initiator_id = self.config.initiator_id,
                    kind = other.kind(),
                    "initiator ignoring site-bound message"
                );
            }
        }
        Ok(())
    }

    pub fn handle_site_failure(&self, site_id: SiteId) -> DtxnResult<()> {
        let mut state = self.lock()?;
        state.safety.remove_state(site_id);
        let released = state.registry.handle_site_failure(site_id)?;
        tracing::info!(
            initiator_id = self.config.initiator_id,
            site_id,
            released = released.len(),
            "site failure handled"
        );
        for (txn_id, response) in released {
            release(&mut state, txn_id, response);
        }
        Ok(())
    }

    pub fn handle_site_rejoin(&self, site_id: SiteId, partition_id: PartitionId) -> DtxnResult<()> {
        self.lock()?
            .safety
            .add_rejoined_state(site_id, partition_id);
        Ok(())
    }

    /// Serve `inbox` and send heartbeats until the inbox closes or a fatal
    /// error stops the initiator.
    pub async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Message>,
    ) -> DtxnResult<()> {
        let mut ticker = time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(initiator_id = self.config.initiator_id, "initiator started");
        let result = loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => {
                        if let Err(err) = self.deliver(message) {
                            break Err(err);
                        }
                    }
                    None => break Ok(()),
                },
                _ = ticker.tick() => {
                    if let Err(err) = self.send_heartbeats() {
                        break Err(err);
                    }
                }
            }
        };
        if let Err(err) = &result {
            tracing::error!(
                initiator_id = self.config.initiator_id,
                error = %err,
                fatal = err.is_fatal(),
                "initiator halted"
            );
        }
        result
    }
}

fn release(state: &mut InitiatorState, txn_id: TxnId, response: ClientResponse) {
    match state.waiters.remove(&txn_id) {
        Some(waiter) => {
            if waiter.send(response).is_err() {
                tracing::debug!(%txn_id, "client stopped waiting for response");
            }
        }
        None => tracing::debug!(%txn_id, "no waiter for released response"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::dtxn::error::FatalError;
    use crate::dtxn::test_support::RecordingMailbox;
    use crate::dtxn::topology::StaticTopology;
    use crate::dtxn::txn_id::ID_EPOCH_MS;
    use crate::dtxn::types::{HeartbeatResponse, InitiateResponse};

    struct Fixture {
        initiator: Initiator,
        mailbox: Arc<RecordingMailbox>,
    }

    fn fixture(partitions: u64, replicas: u64, k_factor: u32) -> Fixture {
        let mailbox = Arc::new(RecordingMailbox::default());
        let topology = Arc::new(StaticTopology::uniform(partitions, replicas));
        let now = Arc::new(AtomicU64::new(ID_EPOCH_MS + 1_000));
        let ids = TxnIdGenerator::with_clock(
            3,
            Box::new(move || now.fetch_add(1, Ordering::SeqCst)),
        )
        .expect("generator");
        let mut config = InitiatorConfig::new(3);
        config.k_factor = k_factor;
        let initiator = Initiator::with_id_generator(config, mailbox.clone(), topology, ids)
            .expect("initiator");
        Fixture { initiator, mailbox }
    }

    fn response_from(site_id: SiteId, txn_id: TxnId, bytes: &[u8]) -> Message {
        Message::InitiateResponse(InitiateResponse {
            txn_id,
            site_id,
            initiator_id: 3,
            read_only: false,
            recovering: false,
            response: ClientResponse::success(vec![crate::dtxn::types::ResultTable::new(
                bytes.to_vec(),
            )]),
        })
    }

    #[test]
    fn single_partition_goes_to_every_replica() {
        let Fixture { initiator, mailbox } = fixture(2, 2, 1);
        let (txn_id, _rx) = initiator
            .submit(Invocation::new("put", Vec::new()), false, TxnTarget::SinglePartition(1))
            .expect("submit");
        assert_eq!(txn_id.initiator_id(), 3);
        let targets: Vec<Address> = mailbox.take().into_iter().map(|(to, _)| to).collect();
        assert_eq!(targets, vec![Address::Site(3), Address::Site(4)]);
    }

    #[tokio::test]
    async fn write_answers_after_all_replicas() {
        let Fixture { initiator, .. } = fixture(1, 2, 1);
        let (txn_id, mut rx) = initiator
            .submit(Invocation::new("put", Vec::new()), false, TxnTarget::SinglePartition(0))
            .expect("submit");
        initiator.deliver(response_from(1, txn_id, b"ok")).expect("deliver");
        assert!(rx.try_recv().is_err());
        initiator.deliver(response_from(2, txn_id, b"ok")).expect("deliver");
        let response = rx.await.expect("response");
        assert!(response.is_success());
        assert_eq!(initiator.in_flight().expect("in flight"), 0);
    }

    #[test]
    fn divergent_replicas_stop_the_initiator() {
        let Fixture { initiator, .. } = fixture(1, 2, 1);
        let (txn_id, _rx) = initiator
            .submit(Invocation::new("get", Vec::new()), true, TxnTarget::SinglePartition(0))
            .expect("submit");
        initiator.deliver(response_from(1, txn_id, b"a")).expect("deliver");
        match initiator.deliver(response_from(2, txn_id, b"b")) {
            Err(err) => assert!(matches!(
                err.as_fatal(),
                Some(FatalError::ReplicaMismatch { .. })
            )),
            Ok(()) => panic!("expected a fatal mismatch"),
        }
    }

    #[test]
    fn multipartition_notifies_every_other_site() {
        let Fixture { initiator, mailbox } = fixture(3, 1, 0);
        initiator
            .submit(Invocation::new("sum", Vec::new()), true, TxnTarget::MultiPartition)
            .expect("submit");
        let sent = mailbox.take();
        match sent.as_slice() {
            [(Address::Site(1), Message::InitiateTask(task)), (Address::Site(2), Message::ParticipantNotice(_)), (Address::Site(3), Message::ParticipantNotice(_))] =>
            {
                assert!(!task.single_partition);
                assert_eq!(task.non_coordinator_sites, vec![2, 3]);
            }
            other => panic!("unexpected messages: {other:?}"),
        }

        // The next multipartition transaction is coordinated elsewhere.
        initiator
            .submit(Invocation::new("sum", Vec::new()), true, TxnTarget::MultiPartition)
            .expect("submit");
        assert!(matches!(
            mailbox.take().first(),
            Some((Address::Site(2), Message::InitiateTask(_)))
        ));
    }

    #[test]
    fn heartbeats_carry_partition_watermarks() {
        let Fixture { initiator, mailbox } = fixture(1, 2, 1);
        for site_id in [1, 2] {
            initiator
                .deliver(Message::HeartbeatResponse(HeartbeatResponse {
                    site_id,
                    initiator_id: 3,
                    last_received_txn_id: TxnId(100 + site_id),
                    blocked: false,
                }))
                .expect("deliver");
        }
        assert_eq!(initiator.safe_txn_id_for_site(2).expect("safe"), TxnId(101));

        initiator.send_heartbeats().expect("heartbeats");
        let beats: Vec<Heartbeat> = mailbox
            .take()
            .into_iter()
            .filter_map(|(_, m)| match m {
                Message::Heartbeat(beat) => Some(beat),
                _ => None,
            })
            .collect();
        assert_eq!(beats.len(), 2);
        assert!(beats.iter().all(|beat| beat.safe_txn_id == TxnId(101)));
        assert!(beats.iter().all(|beat| beat.txn_id == beats[0].txn_id));
    }

    #[tokio::test]
    async fn site_failure_releases_cached_response() {
        let Fixture { initiator, .. } = fixture(1, 2, 1);
        let (txn_id, rx) = initiator
            .submit(Invocation::new("put", Vec::new()), false, TxnTarget::SinglePartition(0))
            .expect("submit");
        initiator.deliver(response_from(1, txn_id, b"ok")).expect("deliver");
        initiator.handle_site_failure(2).expect("failure");
        assert!(rx.await.expect("response").is_success());
    }

    #[test]
    fn partition_without_replicas_is_rejected() {
        let Fixture { initiator, .. } = fixture(1, 1, 0);
        match initiator.submit(Invocation::default(), false, TxnTarget::SinglePartition(9)) {
            Err(DtxnError::Rejected(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn multipartition_goes_to_every_coordinator_replica() {
        let Fixture { initiator, mailbox } = fixture(2, 2, 1);
        initiator
            .submit(Invocation::new("spread", Vec::new()), false, TxnTarget::MultiPartition)
            .expect("submit");
        let sent = mailbox.take();
        let kinds: Vec<(Address, &str)> = sent.iter().map(|(to, m)| (*to, m.kind())).collect();
        assert_eq!(
            kinds,
            vec![
                (Address::Site(1), "initiate_task"),
                (Address::Site(2), "initiate_task"),
                (Address::Site(3), "participant_notice"),
                (Address::Site(4), "participant_notice"),
            ]
        );
        for (_, message) in &sent[..2] {
            let Message::InitiateTask(task) = message else {
                panic!("expected initiate task");
            };
            assert_eq!(task.coordinator_id, 1);
            assert_eq!(task.non_coordinator_sites, vec![2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn coordinator_failure_is_survivable_with_a_replica() {
        let Fixture { initiator, .. } = fixture(2, 2, 1);
        let (txn_id, mut rx) = initiator
            .submit(Invocation::new("spread", Vec::new()), false, TxnTarget::MultiPartition)
            .expect("submit");
        initiator.handle_site_failure(1).expect("one failure with k = 1");
        assert!(rx.try_recv().is_err());

        initiator.deliver(response_from(2, txn_id, b"ok")).expect("deliver");
        assert!(rx.await.expect("response").is_success());
        assert_eq!(initiator.in_flight().expect("in flight"), 0);
    }

    #[tokio::test]
    async fn multipartition_write_waits_for_coordinator_replicas() {
        let Fixture { initiator, .. } = fixture(2, 2, 1);
        let (txn_id, mut rx) = initiator
            .submit(Invocation::new("spread", Vec::new()), false, TxnTarget::MultiPartition)
            .expect("submit");
        initiator.deliver(response_from(1, txn_id, b"ok")).expect("deliver");
        assert!(rx.try_recv().is_err());
        initiator.deliver(response_from(2, txn_id, b"ok")).expect("deliver");
        assert!(rx.await.expect("response").is_success());
    }

    /// Mailbox that refuses everything addressed to one site.
    struct RefusingMailbox {
        refused: SiteId,
        inner: RecordingMailbox,
    }

    impl Mailbox for RefusingMailbox {
        fn send(&self, to: Address, message: Message) -> anyhow::Result<()> {
            if to == Address::Site(self.refused) {
                anyhow::bail!("{to} unreachable");
            }
            self.inner.send(to, message)
        }
    }

    #[test]
    fn failed_send_leaves_nothing_in_flight() {
        let mailbox = Arc::new(RefusingMailbox {
            refused: 2,
            inner: RecordingMailbox::default(),
        });
        let topology = Arc::new(StaticTopology::uniform(1, 2));
        let initiator =
            Initiator::new(InitiatorConfig::new(3), mailbox.clone(), topology).expect("initiator");
        assert!(initiator
            .submit(Invocation::new("put", Vec::new()), false, TxnTarget::SinglePartition(0))
            .is_err());
        assert_eq!(initiator.in_flight().expect("in flight"), 0);
        assert!(initiator.lock().expect("lock").waiters.is_empty());
        // Site 1 already had the task; its answer is simply dropped.
        assert_eq!(mailbox.inner.take().len(), 1);
    }

    #[test]
    fn coordination_rotates_over_live_partitions() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let topology = Arc::new(StaticTopology::uniform(3, 1));
        let initiator = Initiator::new(InitiatorConfig::new(3), mailbox.clone(), topology.clone())
            .expect("initiator");
        let mut coordinators = Vec::new();
        for round in 0..5 {
            if round == 3 {
                topology.mark_failed(2);
            }
            initiator
                .submit(Invocation::new("sum", Vec::new()), true, TxnTarget::MultiPartition)
                .expect("submit");
            coordinators.extend(mailbox.take().into_iter().find_map(|(to, m)| match m {
                Message::InitiateTask(_) => Some(to),
                _ => None,
            }));
        }
        let sites = |ids: &[SiteId]| ids.iter().map(|id| Address::Site(*id)).collect::<Vec<_>>();
        assert_eq!(coordinators, sites(&[1, 2, 3, 1, 3]));
    }
}
