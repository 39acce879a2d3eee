//! Error model for the ordering core.
//!
//! Fatal errors mean replicas may have diverged or the ordering contract was
//! broken; the owning site or initiator must stop. Fragment and procedure
//! failures are not errors at this level: they travel as status codes inside
//! responses.

use thiserror::Error;

use super::types::{DependencyId, MapKey, SiteId, TxnId};

pub type DtxnResult<T> = Result<T, DtxnError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// A transaction arrived at or below one the site already completed.
    #[error("site {site_id} received txn {txn_id} at or below completed txn {last_completed}")]
    OrderingViolation {
        site_id: SiteId,
        txn_id: TxnId,
        last_completed: TxnId,
    },

    /// Two results for the same dependency and map key differ.
    #[error(
        "txn {txn_id} {dependency_id} at {key} produced different results ({first} vs {second})"
    )]
    NonDeterministicResult {
        txn_id: TxnId,
        dependency_id: DependencyId,
        key: MapKey,
        first: String,
        second: String,
    },

    #[error("replicas {first_site} and {second_site} answered txn {txn_id} differently: {detail}")]
    ReplicaMismatch {
        txn_id: TxnId,
        first_site: SiteId,
        second_site: SiteId,
        detail: String,
    },

    #[error("replicas {first_site} and {second_site} ran different SQL for txn {txn_id}")]
    SqlHashMismatch {
        txn_id: TxnId,
        first_site: SiteId,
        second_site: SiteId,
    },

    #[error("replay of txn {txn_id} diverged: {detail}")]
    ReplayDiverged { txn_id: TxnId, detail: String },

    /// Every replica failed or was recovering before any real response was cached.
    #[error("txn {txn_id} has no replica left that can answer it")]
    NoSafeResponse { txn_id: TxnId },
}

#[derive(Debug, Error)]
pub enum DtxnError {
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),

    /// The request was refused without touching any state.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A collaborator (mailbox, engine) failed.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl DtxnError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DtxnError::Fatal(_))
    }

    pub fn as_fatal(&self) -> Option<&FatalError> {
        match self {
            DtxnError::Fatal(err) => Some(err),
            _ => None,
        }
    }

    pub(crate) fn rejected(reason: impl Into<String>) -> Self {
        DtxnError::Rejected(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_are_flagged() {
        let err: DtxnError = FatalError::NoSafeResponse { txn_id: TxnId(7) }.into();
        assert!(err.is_fatal());
        assert_eq!(
            err.as_fatal(),
            Some(&FatalError::NoSafeResponse { txn_id: TxnId(7) })
        );
        assert_eq!(err.to_string(), "fatal: txn 7 has no replica left that can answer it");

        let err: DtxnError = anyhow::anyhow!("mailbox closed").into();
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "mailbox closed");
    }
}
