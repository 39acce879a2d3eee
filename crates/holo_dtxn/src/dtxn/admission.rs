//! Per-site admission queue.
//!
//! Transactions from every initiator are ordered by id, but the head may only
//! be released once no smaller id can still arrive. Each initiator's ids
//! arrive in increasing order, so the newest safe candidate is the minimum
//! over initiators of the last id seen from each. With the safety dance
//! enabled the head must additionally be at or below the newest id its
//! initiator has reported as received by every replica.
//!
//! Blocking actions stall the stream at an exact id: once the queue is past
//! the threshold the action's message is handed back to the site and the
//! queue stays in the action's blocked state for good.

use std::collections::BTreeMap;

use super::error::{DtxnError, DtxnResult};
use super::types::{InitiatorId, SiteId, TxnId};

/// Why the queue head can or cannot be released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueState {
    Unblocked,
    BlockedEmpty,
    BlockedOrdering,
    BlockedSafety,
    BlockedClosed,
}

impl QueueState {
    pub fn is_blocked(self) -> bool {
        self != QueueState::Unblocked
    }
}

/// Queue entry, ordered by transaction id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuedTxn {
    pub txn_id: TxnId,
    pub initiator_id: InitiatorId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct InitiatorProgress {
    last_seen: TxnId,
    last_safe: TxnId,
}

#[derive(Debug)]
struct BlockingAction<M> {
    after_txn_id: TxnId,
    reason: QueueState,
    message: M,
}

/// Per-site queue that releases transactions in global id order.
#[derive(Debug)]
pub struct AdmissionQueue<M> {
    site_id: SiteId,
    use_safety_dance: bool,
    pending: BTreeMap<TxnId, QueuedTxn>,
    /// Ordered by initiator id so iteration is deterministic.
    initiators: BTreeMap<InitiatorId, InitiatorProgress>,
    newest_candidate: TxnId,
    state: QueueState,
    /// Set once a blocking action fires; never cleared.
    forced: Option<QueueState>,
    actions: Vec<BlockingAction<M>>,
    fired: Vec<M>,
}

impl<M> AdmissionQueue<M> {
    pub fn new(site_id: SiteId, use_safety_dance: bool) -> Self {
        Self {
            site_id,
            use_safety_dance,
            pending: BTreeMap::new(),
            initiators: BTreeMap::new(),
            newest_candidate: TxnId::NONE,
            state: QueueState::BlockedEmpty,
            forced: None,
            actions: Vec::new(),
            fired: Vec::new(),
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn newest_candidate(&self) -> TxnId {
        self.newest_candidate
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_known_initiator(&self, initiator_id: InitiatorId) -> bool {
        self.initiators.contains_key(&initiator_id)
    }

    pub fn initiator_ids(&self) -> Vec<InitiatorId> {
        self.initiators.keys().copied().collect()
    }

    pub fn last_seen(&self, initiator_id: InitiatorId) -> Option<TxnId> {
        self.initiators.get(&initiator_id).map(|p| p.last_seen)
    }

    pub fn last_safe(&self, initiator_id: InitiatorId) -> Option<TxnId> {
        self.initiators.get(&initiator_id).map(|p| p.last_safe)
    }

    /// Start tracking an initiator. A new initiator has seen nothing, which
    /// pins the newest candidate at `TxnId::NONE` until it speaks.
    pub fn register(&mut self, initiator_id: InitiatorId) {
        if self.initiators.contains_key(&initiator_id) {
            return;
        }
        self.initiators
            .insert(initiator_id, InitiatorProgress::default());
        self.recompute_candidate();
        self.update_state();
    }

    /// Queue a transaction. Returns false when its initiator is unknown.
    pub fn add(&mut self, txn: QueuedTxn) -> bool {
        if !self.initiators.contains_key(&txn.initiator_id) {
            tracing::warn!(
                site_id = self.site_id,
                txn_id = %txn.txn_id,
                initiator_id = txn.initiator_id,
                "rejecting transaction from unknown initiator"
            );
            return false;
        }
        self.pending.insert(txn.txn_id, txn);
        self.update_state();
        true
    }

    /// Record that `txn_id` arrived from `initiator_id`, as a transaction or a
    /// heartbeat. Returns the last id seen from that initiator.
    pub fn note_received(
        &mut self,
        initiator_id: InitiatorId,
        txn_id: TxnId,
        is_heartbeat: bool,
        last_safe: TxnId,
    ) -> TxnId {
        let Some(progress) = self.initiators.get_mut(&initiator_id) else {
            tracing::debug!(
                site_id = self.site_id,
                initiator_id,
                %txn_id,
                is_heartbeat,
                "ignoring progress from unknown initiator"
            );
            return TxnId::NONE;
        };
        if txn_id > progress.last_seen {
            progress.last_seen = txn_id;
        }
        if last_safe > progress.last_safe {
            progress.last_safe = last_safe;
        }
        let last_seen = progress.last_seen;
        self.recompute_candidate();
        self.update_state();
        last_seen
    }

    /// Stop tracking a failed initiator. Its queued transactions stay and
    /// run in order.
    pub fn remove_initiator(&mut self, initiator_id: InitiatorId) -> bool {
        if !self.initiators.contains_key(&initiator_id) {
            return false;
        }
        self.note_received(initiator_id, TxnId::MAX, true, TxnId::NONE);
        self.initiators.remove(&initiator_id);
        self.recompute_candidate();
        self.update_state();
        tracing::info!(
            site_id = self.site_id,
            initiator_id,
            newest_candidate = %self.newest_candidate,
            "initiator removed from admission queue"
        );
        true
    }

    /// Head of the queue, if it may be released.
    pub fn peek(&self) -> Option<QueuedTxn> {
        if self.state != QueueState::Unblocked {
            return None;
        }
        self.pending.values().next().copied()
    }

    pub fn poll(&mut self) -> Option<QueuedTxn> {
        if self.state != QueueState::Unblocked {
            return None;
        }
        let (_, head) = self.pending.pop_first()?;
        self.update_state();
        Some(head)
    }

    /// Arrange for `message` to be handed back once the queue moves past
    /// `after_txn_id`, after which the queue is held in `reason`.
    pub fn schedule_blocking_action(
        &mut self,
        after_txn_id: TxnId,
        reason: QueueState,
        message: M,
    ) -> DtxnResult<()> {
        if !reason.is_blocked() {
            return Err(DtxnError::rejected(
                "a blocking action must name a blocked state",
            ));
        }
        let at = self
            .actions
            .partition_point(|action| action.after_txn_id <= after_txn_id);
        self.actions.insert(
            at,
            BlockingAction {
                after_txn_id,
                reason,
                message,
            },
        );
        self.update_state();
        Ok(())
    }

    /// Messages of blocking actions that fired since the last call.
    pub fn take_fired(&mut self) -> Vec<M> {
        std::mem::take(&mut self.fired)
    }

    /// Newest id a recovering peer may safely resume from, or `None` while
    /// an initiator has not been heard from or the queue is blocked on
    /// ordering or safety.
    pub fn safe_to_recover(&self) -> Option<TxnId> {
        if self.initiators.values().any(|p| p.last_seen.is_none()) {
            return None;
        }
        match self.state {
            QueueState::BlockedOrdering | QueueState::BlockedSafety => None,
            _ => Some(match self.pending.values().next() {
                Some(head) => head.txn_id.min(self.newest_candidate),
                None => self.newest_candidate,
            }),
        }
    }

    fn recompute_candidate(&mut self) {
        self.newest_candidate = self
            .initiators
            .values()
            .map(|p| p.last_seen)
            .min()
            .unwrap_or(TxnId::MAX);
    }

    fn update_state(&mut self) {
        let head = self.pending.values().next().copied();

        // The stream has crossed a threshold once the head is past it, or,
        // with nothing queued, once no id at or below it can still arrive.
        while let Some(action) = self.actions.first() {
            let crossed = match head {
                Some(head) => head.txn_id > action.after_txn_id,
                None => self.newest_candidate > action.after_txn_id,
            };
            if !crossed {
                break;
            }
            let action = self.actions.remove(0);
            tracing::info!(
                site_id = self.site_id,
                after_txn_id = %action.after_txn_id,
                reason = ?action.reason,
                "blocking action fired"
            );
            self.forced.get_or_insert(action.reason);
            self.fired.push(action.message);
        }

        let next = if let Some(forced) = self.forced {
            forced
        } else {
            match head {
                None => QueueState::BlockedEmpty,
                Some(head) if head.txn_id > self.newest_candidate => QueueState::BlockedOrdering,
                Some(head) => {
                    let unsafe_head = self.use_safety_dance
                        && self
                            .initiators
                            .get(&head.initiator_id)
                            .is_some_and(|p| head.txn_id > p.last_safe);
                    if unsafe_head {
                        QueueState::BlockedSafety
                    } else {
                        QueueState::Unblocked
                    }
                }
            }
        };

        if next != self.state {
            tracing::trace!(
                site_id = self.site_id,
                from = ?self.state,
                to = ?next,
                head = ?head.map(|h| h.txn_id),
                newest_candidate = %self.newest_candidate,
                "admission queue state changed"
            );
            self.state = next;
        }
    }
}
