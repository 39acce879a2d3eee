//! Initiator-side registry of transactions awaiting replica responses.
//!
//! Read-only transactions are answered as soon as the first real response
//! arrives. Writes are answered once every outstanding replica has responded
//! or failed, so the client never sees a commit that a surviving replica
//! could still contradict. With replication, every response after the first
//! is checked against the cached one.

use std::collections::{BTreeMap, BTreeSet};

use super::error::{DtxnError, DtxnResult, FatalError};
use super::types::{ClientResponse, InitiateResponse, SiteId, TxnId};

/// What to do when every replica of a transaction failed or was recovering
/// before any real response was cached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExhaustedTxnPolicy {
    /// Stop the initiator with a fatal error.
    #[default]
    Halt,
    /// Answer the client with an unknown-outcome status and keep going.
    ReportUnknownOutcome,
}

/// One transaction waiting on its responders.
#[derive(Debug)]
pub struct InFlightTxn {
    txn_id: TxnId,
    read_only: bool,
    single_partition: bool,
    k_factor: u32,
    outstanding: BTreeSet<SiteId>,
    first_response: Option<(SiteId, ClientResponse)>,
    response_sent: bool,
}

impl InFlightTxn {
    pub fn new(
        txn_id: TxnId,
        read_only: bool,
        single_partition: bool,
        responders: impl IntoIterator<Item = SiteId>,
        k_factor: u32,
    ) -> Self {
        Self {
            txn_id,
            read_only,
            single_partition,
            k_factor,
            outstanding: responders.into_iter().collect(),
            first_response: None,
            response_sent: false,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn is_single_partition(&self) -> bool {
        self.single_partition
    }

    pub fn outstanding(&self) -> Vec<SiteId> {
        self.outstanding.iter().copied().collect()
    }

    pub fn has_all_responses(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn has_sent_response(&self) -> bool {
        self.response_sent
    }

    pub fn is_finished(&self) -> bool {
        self.response_sent && self.outstanding.is_empty()
    }

    /// Record a real response from `site_id`. Returns the client response
    /// when it may be released.
    pub fn add_response(
        &mut self,
        site_id: SiteId,
        response: ClientResponse,
    ) -> Result<Option<ClientResponse>, FatalError> {
        if !self.outstanding.remove(&site_id) {
            tracing::debug!(txn_id = %self.txn_id, site_id, "duplicate or unexpected response");
            return Ok(None);
        }
        match &self.first_response {
            None => self.first_response = Some((site_id, response)),
            Some((first_site, first)) => {
                if self.k_factor > 0 {
                    check_determinism(self.txn_id, *first_site, first, site_id, &response)?;
                }
            }
        }
        Ok(self.release_if_ready())
    }

    /// Record that `site_id` failed, or answered while recovering.
    pub fn add_failed_or_recovering_response(
        &mut self,
        site_id: SiteId,
        policy: ExhaustedTxnPolicy,
    ) -> Result<Option<ClientResponse>, FatalError> {
        if !self.outstanding.remove(&site_id) {
            return Ok(None);
        }
        if self.outstanding.is_empty() && self.first_response.is_none() && !self.response_sent {
            return match policy {
                ExhaustedTxnPolicy::Halt => Err(FatalError::NoSafeResponse {
                    txn_id: self.txn_id,
                }),
                ExhaustedTxnPolicy::ReportUnknownOutcome => {
                    tracing::warn!(txn_id = %self.txn_id, "no replica answered; outcome unknown");
                    self.response_sent = true;
                    Ok(Some(ClientResponse::unknown_outcome(self.txn_id)))
                }
            };
        }
        Ok(self.release_if_ready())
    }

    fn release_if_ready(&mut self) -> Option<ClientResponse> {
        if self.response_sent {
            return None;
        }
        let (_, response) = self.first_response.as_ref()?;
        if self.read_only || self.outstanding.is_empty() {
            self.response_sent = true;
            return Some(response.clone());
        }
        None
    }
}

fn check_determinism(
    txn_id: TxnId,
    first_site: SiteId,
    first: &ClientResponse,
    site_id: SiteId,
    response: &ClientResponse,
) -> Result<(), FatalError> {
    if let (Some(a), Some(b)) = (first.sql_hash, response.sql_hash) {
        if a != b {
            return Err(FatalError::SqlHashMismatch {
                txn_id,
                first_site,
                second_site: site_id,
            });
        }
    }
    let detail = if first.status != response.status {
        Some(format!("status {:?} vs {:?}", first.status, response.status))
    } else if first.results.len() != response.results.len() {
        Some(format!(
            "{} result tables vs {}",
            first.results.len(),
            response.results.len()
        ))
    } else {
        first
            .results
            .iter()
            .zip(&response.results)
            .position(|(a, b)| !a.same_contents(b))
            .map(|index| format!("result table {index} differs"))
    };
    match detail {
        Some(detail) => Err(FatalError::ReplicaMismatch {
            txn_id,
            first_site,
            second_site: site_id,
            detail,
        }),
        None => Ok(()),
    }
}

/// Transactions this initiator has sent and not yet fully answered.
#[derive(Debug)]
pub struct InFlightRegistry {
    txns: BTreeMap<TxnId, InFlightTxn>,
    policy: ExhaustedTxnPolicy,
}

impl InFlightRegistry {
    pub fn new(policy: ExhaustedTxnPolicy) -> Self {
        Self {
            txns: BTreeMap::new(),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    pub fn get(&self, txn_id: TxnId) -> Option<&InFlightTxn> {
        self.txns.get(&txn_id)
    }

    pub fn register(&mut self, txn: InFlightTxn) -> DtxnResult<()> {
        if self.txns.contains_key(&txn.txn_id) {
            return Err(DtxnError::rejected(format!(
                "txn {} is already in flight",
                txn.txn_id
            )));
        }
        self.txns.insert(txn.txn_id, txn);
        Ok(())
    }

    /// Route a site's response. Recovering responses count as failures.
    pub fn add_response(
        &mut self,
        response: &InitiateResponse,
    ) -> Result<Option<ClientResponse>, FatalError> {
        let Some(txn) = self.txns.get_mut(&response.txn_id) else {
            tracing::debug!(
                txn_id = %response.txn_id,
                site_id = response.site_id,
                "response for transaction no longer in flight"
            );
            return Ok(None);
        };
        let released = if response.recovering {
            txn.add_failed_or_recovering_response(response.site_id, self.policy)?
        } else {
            txn.add_response(response.site_id, response.response.clone())?
        };
        if txn.is_finished() {
            self.txns.remove(&response.txn_id);
        }
        Ok(released)
    }

    pub fn add_failed_or_recovering_response(
        &mut self,
        txn_id: TxnId,
        site_id: SiteId,
    ) -> Result<Option<ClientResponse>, FatalError> {
        let Some(txn) = self.txns.get_mut(&txn_id) else {
            return Ok(None);
        };
        let released = txn.add_failed_or_recovering_response(site_id, self.policy)?;
        if txn.is_finished() {
            self.txns.remove(&txn_id);
        }
        Ok(released)
    }

    /// Treat `site_id` as having failed for every in-flight transaction.
    /// Returns the client responses that became releasable.
    pub fn handle_site_failure(
        &mut self,
        site_id: SiteId,
    ) -> Result<Vec<(TxnId, ClientResponse)>, FatalError> {
        let affected: Vec<TxnId> = self
            .txns
            .iter()
            .filter(|(_, txn)| txn.outstanding.contains(&site_id))
            .map(|(id, _)| *id)
            .collect();
        let mut released = Vec::new();
        for txn_id in affected {
            if let Some(response) = self.add_failed_or_recovering_response(txn_id, site_id)? {
                released.push((txn_id, response));
            }
        }
        Ok(released)
    }
}
