//! Deterministic transaction core wiring.
//!
//! `types` defines the messages and collaborator contracts (mailbox, site
//! tracker, execution engine). `initiator` orders client work and reconciles
//! replica responses. `site` admits work through `admission` and drives the
//! per-transaction state machines in `txn_state` and `multi_partition`.

mod admission;
mod error;
mod inflight;
mod initiator;
mod local;
mod multi_partition;
mod site;
mod topology;
mod txn_id;
mod txn_state;
mod types;
mod watermark;
mod work_unit;

#[cfg(test)]
mod test_support;

pub use admission::{AdmissionQueue, QueueState, QueuedTxn};
pub use error::{DtxnError, DtxnResult, FatalError};
pub use inflight::{ExhaustedTxnPolicy, InFlightRegistry, InFlightTxn};
pub use initiator::{Initiator, InitiatorConfig, TxnTarget};
pub use local::LocalRouter;
pub use site::{ExecutionSite, SiteConfig};
pub use topology::StaticTopology;
pub use txn_id::{
    TxnIdGenerator, COUNTER_BITS, ID_EPOCH_MS, INITIATOR_BITS, MAX_COUNTER, MAX_INITIATOR_ID,
    TIMESTAMP_BITS,
};
pub use types::{
    Address, ClientResponse, CompleteTransaction, CompleteTransactionResponse, DependencyId,
    ExecutionEngine, FaultEvent, FragmentBatch, FragmentResponse, FragmentStatus, FragmentTask,
    Heartbeat, HeartbeatResponse, InitiateResponse, InitiateTask, InitiatorId, Invocation, Mailbox,
    MapKey, Message, ParticipantNotice, PartitionId, PlanFragment, ProcedureStep, ReplayTask,
    ResponseStatus, ResultTable, SiteId, SiteTracker, StreamMarker, TxnId, TxnMeta,
};
pub use watermark::SafetyWatermarkTracker;
pub use work_unit::{DependencyResults, DependencyTracker};
