//! Shared types for the transaction ordering core.
//!
//! Identifiers, boundary messages and the collaborator contracts live here
//! because they are used by the admission queue, the per-transaction state
//! machines, the execution site loop and the initiator alike. Wire framing is
//! owned by whichever `Mailbox` carries these messages.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::work_unit::DependencyResults;

/// Identifier of an execution site (one replica of one partition).
pub type SiteId = u64;
/// Identifier of a data partition.
pub type PartitionId = u64;
/// Identifier of a transaction initiator.
pub type InitiatorId = u64;

/// Globally ordered transaction identifier.
///
/// The layout (timestamp, counter, initiator id) is defined by
/// [`super::txn_id`]; everything else only relies on the total order.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Sentinel meaning "nothing seen yet".
    pub const NONE: TxnId = TxnId(0);
    /// Injected as the last-seen id of a departed initiator so it stops
    /// holding back the newest candidate.
    pub const MAX: TxnId = TxnId(u64::MAX);

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a value produced by a plan fragment.
///
/// The high bit marks a multipartition dependency (one result expected per
/// participating site). The next bit asks for results keyed per site instead
/// of per partition, which system procedures use to collect from every
/// replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyId(pub u32);

impl DependencyId {
    pub const MULTIPARTITION_FLAG: u32 = 1 << 31;
    pub const PER_SITE_FLAG: u32 = 1 << 30;
    const FLAGS: u32 = Self::MULTIPARTITION_FLAG | Self::PER_SITE_FLAG;

    pub const fn point(id: u32) -> Self {
        Self(id & !Self::FLAGS)
    }

    pub const fn multipartition(id: u32) -> Self {
        Self((id & !Self::FLAGS) | Self::MULTIPARTITION_FLAG)
    }

    /// Multipartition dependency whose results are keyed by site.
    pub const fn per_site(id: u32) -> Self {
        Self((id & !Self::FLAGS) | Self::FLAGS)
    }

    pub const fn is_multipartition(self) -> bool {
        self.0 & Self::MULTIPARTITION_FLAG != 0
    }

    pub const fn is_per_site(self) -> bool {
        self.0 & Self::PER_SITE_FLAG != 0
    }

    /// Key under which a result from `site_id` (owning `partition_id`) is stored.
    pub fn map_key(self, site_id: SiteId, partition_id: PartitionId) -> MapKey {
        if self.is_per_site() {
            MapKey::Site(site_id)
        } else {
            MapKey::Partition(partition_id)
        }
    }
}

impl fmt::Display for DependencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.0 & !Self::FLAGS;
        match (self.is_multipartition(), self.is_per_site()) {
            (true, true) => write!(f, "site-dep:{base}"),
            (true, false) => write!(f, "mp-dep:{base}"),
            _ => write!(f, "dep:{base}"),
        }
    }
}

/// Key for a stored dependency result. Replicas of a partition share a
/// partition key, so their results are compared instead of accumulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MapKey {
    Partition(PartitionId),
    Site(SiteId),
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Partition(id) => write!(f, "partition {id}"),
            MapKey::Site(id) => write!(f, "site {id}"),
        }
    }
}

/// Serialized result table. The core only compares and forwards the bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultTable(pub Vec<u8>);

impl ResultTable {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn same_contents(&self, other: &ResultTable) -> bool {
        self.0 == other.0
    }

    /// Hex blake3 digest, used when reporting mismatches.
    pub fn digest_hex(&self) -> String {
        blake3::hash(&self.0).to_hex().to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    UserAbort,
    GracefulFailure,
    UnexpectedFailure,
    /// Every replica failed after the transaction may have been applied.
    UnknownOutcome,
}

/// Client-visible result of a stored procedure invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub status: ResponseStatus,
    pub status_message: String,
    pub results: Vec<ResultTable>,
    /// Digest of the SQL statements the procedure ran, when the engine
    /// reports one. Compared across replicas.
    pub sql_hash: Option<[u8; 32]>,
}

impl ClientResponse {
    pub fn success(results: Vec<ResultTable>) -> Self {
        Self {
            status: ResponseStatus::Success,
            status_message: String::new(),
            results,
            sql_hash: None,
        }
    }

    pub fn failure(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            status_message: message.into(),
            results: Vec::new(),
            sql_hash: None,
        }
    }

    pub fn unknown_outcome(txn_id: TxnId) -> Self {
        Self::failure(
            ResponseStatus::UnknownOutcome,
            format!("all replicas failed before txn {txn_id} reported an outcome"),
        )
    }

    pub fn with_sql_hash(mut self, sql_hash: [u8; 32]) -> Self {
        self.sql_hash = Some(sql_hash);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Opaque stored procedure invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub procedure: String,
    pub params: Vec<u8>,
}

impl Invocation {
    pub fn new(procedure: impl Into<String>, params: impl Into<Vec<u8>>) -> Self {
        Self {
            procedure: procedure.into(),
            params: params.into(),
        }
    }
}

/// Per-transaction facts handed to the execution engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnMeta {
    pub txn_id: TxnId,
    pub initiator_id: InitiatorId,
    pub coordinator_id: SiteId,
    pub read_only: bool,
    pub single_partition: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    Site(SiteId),
    Initiator(InitiatorId),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Site(id) => write!(f, "site {id}"),
            Address::Initiator(id) => write!(f, "initiator {id}"),
        }
    }
}

/// Request to run a whole procedure. Sent to every replica of the target
/// partition for single-partition work. For multipartition work it goes to
/// every live replica of the coordinating partition: the one named by
/// `coordinator_id` runs the procedure and the others take part as
/// coordinator replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitiateTask {
    pub txn_id: TxnId,
    pub initiator_id: InitiatorId,
    pub coordinator_id: SiteId,
    pub read_only: bool,
    pub single_partition: bool,
    /// Newest id the initiator knows every replica of the receiving site's
    /// partition has seen.
    pub safe_txn_id: TxnId,
    /// Other sites taking part in a multipartition transaction.
    pub non_coordinator_sites: Vec<SiteId>,
    pub invocation: Invocation,
}

impl InitiateTask {
    pub fn meta(&self) -> TxnMeta {
        TxnMeta {
            txn_id: self.txn_id,
            initiator_id: self.initiator_id,
            coordinator_id: self.coordinator_id,
            read_only: self.read_only,
            single_partition: self.single_partition,
        }
    }
}

/// Tells a non-coordinating site that a multipartition transaction exists
/// so it can take its place in that site's order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantNotice {
    pub txn_id: TxnId,
    pub initiator_id: InitiatorId,
    pub coordinator_id: SiteId,
    pub read_only: bool,
    pub safe_txn_id: TxnId,
}

impl ParticipantNotice {
    pub fn meta(&self) -> TxnMeta {
        TxnMeta {
            txn_id: self.txn_id,
            initiator_id: self.initiator_id,
            coordinator_id: self.coordinator_id,
            read_only: self.read_only,
            single_partition: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanFragment {
    pub fragment_id: u64,
    pub params: Vec<u8>,
    pub input_dependency: Option<DependencyId>,
    pub output_dependency: DependencyId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentTask {
    pub txn_id: TxnId,
    pub initiator_id: InitiatorId,
    pub coordinator_id: SiteId,
    pub read_only: bool,
    pub sysproc: bool,
    /// Last batch of the procedure. Read-only participants finish on it.
    pub is_final: bool,
    pub fragments: Vec<PlanFragment>,
    /// Input tables shipped along with the task.
    pub attached_inputs: BTreeMap<DependencyId, Vec<ResultTable>>,
}

impl FragmentTask {
    pub fn meta(&self) -> TxnMeta {
        TxnMeta {
            txn_id: self.txn_id,
            initiator_id: self.initiator_id,
            coordinator_id: self.coordinator_id,
            read_only: self.read_only,
            single_partition: false,
        }
    }

    pub fn output_dependencies(&self) -> Vec<DependencyId> {
        self.fragments.iter().map(|f| f.output_dependency).collect()
    }

    /// Inputs the task must wait for before it can run locally. Inputs
    /// already attached are not waited on.
    pub fn pending_input_dependencies(&self) -> Vec<DependencyId> {
        let mut deps = BTreeSet::new();
        for fragment in &self.fragments {
            if let Some(dep) = fragment.input_dependency {
                if !self.attached_inputs.contains_key(&dep) {
                    deps.insert(dep);
                }
            }
        }
        deps.into_iter().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FragmentStatus {
    Success,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentResponse {
    pub txn_id: TxnId,
    pub executor_site_id: SiteId,
    pub destination_site_id: SiteId,
    pub status: FragmentStatus,
    /// The executor was recovering and produced placeholders.
    pub recovering: bool,
    pub dependencies: Vec<(DependencyId, ResultTable)>,
}

/// Commit or rollback decision from the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompleteTransaction {
    pub txn_id: TxnId,
    pub initiator_id: InitiatorId,
    pub coordinator_id: SiteId,
    pub rollback: bool,
    pub requires_ack: bool,
    /// Client response, attached for coordinator replicas so they can answer
    /// the initiator too.
    pub response: Option<ClientResponse>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompleteTransactionResponse {
    pub txn_id: TxnId,
    pub site_id: SiteId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitiateResponse {
    pub txn_id: TxnId,
    pub site_id: SiteId,
    pub initiator_id: InitiatorId,
    pub read_only: bool,
    pub recovering: bool,
    pub response: ClientResponse,
}

/// Periodic liveness/ordering signal from an initiator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub initiator_id: InitiatorId,
    pub txn_id: TxnId,
    pub safe_txn_id: TxnId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub site_id: SiteId,
    pub initiator_id: InitiatorId,
    pub last_received_txn_id: TxnId,
    pub blocked: bool,
}

/// Logged work re-executed in its original order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayTask {
    Initiate(InitiateTask),
    Fragment(FragmentTask),
}

impl ReplayTask {
    pub fn txn_id(&self) -> TxnId {
        match self {
            ReplayTask::Initiate(task) => task.txn_id,
            ReplayTask::Fragment(task) => task.txn_id,
        }
    }
}

/// Membership change delivered by the failure detector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FaultEvent {
    pub failed_sites: BTreeSet<SiteId>,
    pub failed_initiators: BTreeSet<InitiatorId>,
}

/// Side-effect message emitted when a scheduled blocking action fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMarker {
    pub site_id: SiteId,
    pub after_txn_id: TxnId,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    InitiateTask(InitiateTask),
    ParticipantNotice(ParticipantNotice),
    FragmentTask(FragmentTask),
    FragmentResponse(FragmentResponse),
    CompleteTransaction(CompleteTransaction),
    CompleteTransactionResponse(CompleteTransactionResponse),
    InitiateResponse(InitiateResponse),
    Heartbeat(Heartbeat),
    HeartbeatResponse(HeartbeatResponse),
    Replay(ReplayTask),
    Fault(FaultEvent),
    Marker(StreamMarker),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::InitiateTask(_) => "initiate_task",
            Message::ParticipantNotice(_) => "participant_notice",
            Message::FragmentTask(_) => "fragment_task",
            Message::FragmentResponse(_) => "fragment_response",
            Message::CompleteTransaction(_) => "complete_transaction",
            Message::CompleteTransactionResponse(_) => "complete_transaction_response",
            Message::InitiateResponse(_) => "initiate_response",
            Message::Heartbeat(_) => "heartbeat",
            Message::HeartbeatResponse(_) => "heartbeat_response",
            Message::Replay(_) => "replay",
            Message::Fault(_) => "fault",
            Message::Marker(_) => "marker",
        }
    }

    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            Message::InitiateTask(m) => Some(m.txn_id),
            Message::ParticipantNotice(m) => Some(m.txn_id),
            Message::FragmentTask(m) => Some(m.txn_id),
            Message::FragmentResponse(m) => Some(m.txn_id),
            Message::CompleteTransaction(m) => Some(m.txn_id),
            Message::CompleteTransactionResponse(m) => Some(m.txn_id),
            Message::InitiateResponse(m) => Some(m.txn_id),
            Message::Heartbeat(m) => Some(m.txn_id),
            Message::HeartbeatResponse(m) => Some(m.last_received_txn_id),
            Message::Replay(task) => Some(task.txn_id()),
            Message::Fault(_) | Message::Marker(_) => None,
        }
    }
}

/// Reliable, per-sender FIFO delivery of protocol messages.
pub trait Mailbox: Send + Sync + 'static {
    fn send(&self, to: Address, message: Message) -> anyhow::Result<()>;

    fn send_to_sites(&self, sites: &[SiteId], message: &Message) -> anyhow::Result<()> {
        for site in sites {
            self.send(Address::Site(*site), message.clone())?;
        }
        Ok(())
    }
}

/// Cluster topology as seen by the local process. Failed sites are not live.
pub trait SiteTracker: Send + Sync + 'static {
    fn partition_for_site(&self, site_id: SiteId) -> Option<PartitionId>;
    fn live_sites_for_partition(&self, partition_id: PartitionId) -> Vec<SiteId>;
    /// Every live site except `site_id`.
    fn all_sites_excluding(&self, site_id: SiteId) -> Vec<SiteId>;
    fn live_sites(&self) -> Vec<SiteId>;
    fn partitions(&self) -> Vec<PartitionId>;
}

/// One round of work a procedure asks for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragmentBatch {
    /// Sent to every non-coordinating site and run locally by the coordinator.
    pub distributed: Option<FragmentTask>,
    /// Run only at the coordinator, once its inputs have arrived.
    pub local: Option<FragmentTask>,
    /// Dependencies handed back to the procedure when it resumes.
    pub resume_on: Vec<DependencyId>,
    pub is_final: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcedureStep {
    Dispatch(Vec<FragmentBatch>),
    /// Waiting for dependencies requested by an earlier dispatch.
    Suspend,
    /// Finished. A non-success status rolls the transaction back.
    Complete(ClientResponse),
}

/// Storage engine and stored procedure runtime behind an execution site.
pub trait ExecutionEngine: Send + 'static {
    fn start_procedure(
        &mut self,
        txn: &TxnMeta,
        invocation: &Invocation,
    ) -> anyhow::Result<ProcedureStep>;

    fn resume_procedure(
        &mut self,
        txn: &TxnMeta,
        inputs: &DependencyResults,
    ) -> anyhow::Result<ProcedureStep>;

    fn execute_fragment(
        &mut self,
        txn: &TxnMeta,
        task: &FragmentTask,
        inputs: &DependencyResults,
    ) -> anyhow::Result<Vec<(DependencyId, ResultTable)>>;

    fn complete_transaction(&mut self, txn_id: TxnId, rollback: bool) -> anyhow::Result<()>;
}
