//! JSON history written after a simulator run.

use std::path::Path;

use anyhow::Context;
use holo_dtxn::dtxn::{
    ClientResponse, InitiatorId, PartitionId, ResponseStatus, SiteId, TxnId,
};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterOutcome, PartitionReport};
use crate::engine::{decode_value, Procedure};

/// Run parameters, kept so a history can be reproduced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryMeta {
    pub partitions: u64,
    pub k_factor: u32,
    pub initiators: u64,
    pub safety_dance: bool,
    pub clients: usize,
    pub keys: usize,
    pub mp_pct: u8,
    pub write_pct: u8,
    pub abort_pct: u8,
    pub duration_ms: u64,
    pub seed: u64,
    pub failed_site: Option<SiteId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct History {
    pub meta: HistoryMeta,
    pub ops: Vec<OpRecord>,
    pub replicas: Vec<PartitionReport>,
    pub outcome: ClusterOutcome,
}

/// Single procedure call made by a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpRecord {
    pub client: usize,
    pub initiator: InitiatorId,
    pub txn_id: Option<TxnId>,
    pub procedure: Procedure,
    pub key: String,
    pub delta: i64,
    /// `None` for multipartition calls.
    pub partition: Option<PartitionId>,
    pub call_us: u64,
    pub return_us: u64,
    pub result: OpResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpResult {
    Ok { value: i64 },
    Aborted { status: String, message: String },
    /// The cluster could not say whether the transaction committed.
    Unknown,
    Err { error: String },
}

impl OpResult {
    pub fn from_response(response: &ClientResponse) -> Self {
        match response.status {
            ResponseStatus::Success => match response.results.first().map(decode_value) {
                Some(Ok(value)) => OpResult::Ok { value },
                Some(Err(err)) => OpResult::Err {
                    error: err.to_string(),
                },
                None => OpResult::Ok { value: 0 },
            },
            ResponseStatus::UnknownOutcome => OpResult::Unknown,
            status => OpResult::Aborted {
                status: format!("{status:?}"),
                message: response.status_message.clone(),
            },
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, OpResult::Err { .. })
    }
}

/// Write `history` as pretty JSON, creating parent directories as needed.
pub fn write_history(path: &Path, history: &History) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let bytes = serde_json::to_vec_pretty(history).context("encode history")?;
    std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
