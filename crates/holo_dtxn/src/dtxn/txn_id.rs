//! Transaction id layout and the per-initiator id generator.
//!
//! An id packs, from the most significant bit down: 40 bits of milliseconds
//! since 2008-01-01T00:00:00Z, a 10 bit per-millisecond counter and a 14 bit
//! initiator id. Ids from one generator are strictly increasing, and ids from
//! different initiators never collide.

use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{DtxnError, DtxnResult};
use super::types::{InitiatorId, TxnId};

/// 2008-01-01T00:00:00Z in unix milliseconds.
pub const ID_EPOCH_MS: u64 = 1_199_145_600_000;
pub const TIMESTAMP_BITS: u32 = 40;
pub const COUNTER_BITS: u32 = 10;
pub const INITIATOR_BITS: u32 = 14;

pub const MAX_COUNTER: u64 = (1 << COUNTER_BITS) - 1;
pub const MAX_INITIATOR_ID: InitiatorId = (1 << INITIATOR_BITS) - 1;
const MAX_TIMESTAMP_OFFSET: u64 = (1 << TIMESTAMP_BITS) - 1;

impl TxnId {
    pub fn from_parts(timestamp_ms: u64, counter: u64, initiator_id: InitiatorId) -> Self {
        let offset = timestamp_ms.saturating_sub(ID_EPOCH_MS) & MAX_TIMESTAMP_OFFSET;
        TxnId(
            (offset << (COUNTER_BITS + INITIATOR_BITS))
                | ((counter & MAX_COUNTER) << INITIATOR_BITS)
                | (initiator_id & MAX_INITIATOR_ID),
        )
    }

    /// Unix milliseconds encoded in the id.
    pub fn timestamp_ms(self) -> u64 {
        (self.0 >> (COUNTER_BITS + INITIATOR_BITS)) + ID_EPOCH_MS
    }

    pub fn counter(self) -> u64 {
        (self.0 >> INITIATOR_BITS) & MAX_COUNTER
    }

    pub fn initiator_id(self) -> InitiatorId {
        self.0 & MAX_INITIATOR_ID
    }
}

type Clock = Box<dyn FnMut() -> u64 + Send>;

pub struct TxnIdGenerator {
    initiator_id: InitiatorId,
    last_timestamp_ms: u64,
    counter: u64,
    last_id: TxnId,
    clock: Clock,
}

impl TxnIdGenerator {
    pub fn new(initiator_id: InitiatorId) -> DtxnResult<Self> {
        Self::with_clock(initiator_id, Box::new(system_clock_ms))
    }

    /// Generator driven by a caller-supplied millisecond clock.
    pub fn with_clock(initiator_id: InitiatorId, clock: Clock) -> DtxnResult<Self> {
        if initiator_id > MAX_INITIATOR_ID {
            return Err(DtxnError::rejected(format!(
                "initiator id {initiator_id} does not fit in {INITIATOR_BITS} bits"
            )));
        }
        Ok(Self {
            initiator_id,
            last_timestamp_ms: 0,
            counter: 0,
            last_id: TxnId::NONE,
            clock,
        })
    }

    pub fn initiator_id(&self) -> InitiatorId {
        self.initiator_id
    }

    pub fn last_id(&self) -> TxnId {
        self.last_id
    }

    pub fn next_id(&mut self) -> TxnId {
        // The epoch itself would encode as TxnId::NONE for initiator 0.
        let mut now = (self.clock)().max(ID_EPOCH_MS + 1);
        if now < self.last_timestamp_ms {
            let behind_ms = self.last_timestamp_ms - now;
            // Counter overflow borrows from the next millisecond, so small
            // gaps are expected.
            if behind_ms > 1_000 {
                tracing::warn!(
                    initiator_id = self.initiator_id,
                    behind_ms,
                    "clock moved backwards; reusing last id timestamp"
                );
            }
            now = self.last_timestamp_ms;
        }

        if now == self.last_timestamp_ms {
            self.counter += 1;
            if self.counter > MAX_COUNTER {
                now += 1;
                self.counter = 0;
            }
        } else {
            self.counter = 0;
        }
        self.last_timestamp_ms = now;

        let id = TxnId::from_parts(now, self.counter, self.initiator_id);
        debug_assert!(id > self.last_id);
        self.last_id = id;
        id
    }
}

fn system_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(ID_EPOCH_MS)
}
