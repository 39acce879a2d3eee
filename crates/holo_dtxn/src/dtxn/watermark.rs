//! Initiator-side safety watermarks.
//!
//! Tracks, per site, the newest transaction id that site reported as seen,
//! and per partition the minimum over its live replicas. An id at or below a
//! partition's watermark has been received by every replica of that
//! partition, so it can be announced to them as safe to execute.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{PartitionId, SiteId, SiteTracker, TxnId};

#[derive(Clone, Copy, Debug)]
struct SiteWatermark {
    partition_id: PartitionId,
    last_seen: TxnId,
}

#[derive(Clone, Debug, Default)]
struct PartitionWatermark {
    sites: BTreeSet<SiteId>,
    min_last_seen: TxnId,
}

/// Newest id every replica of each partition has confirmed receiving.
#[derive(Debug, Default)]
pub struct SafetyWatermarkTracker {
    sites: BTreeMap<SiteId, SiteWatermark>,
    partitions: BTreeMap<PartitionId, PartitionWatermark>,
}

impl SafetyWatermarkTracker {
    /// Tracker seeded with every live site of `topology`.
    pub fn new(topology: &dyn SiteTracker) -> Self {
        let mut tracker = Self::default();
        for site_id in topology.live_sites() {
            if let Some(partition_id) = topology.partition_for_site(site_id) {
                tracker.add_site(site_id, partition_id, TxnId::NONE);
            }
        }
        tracker
    }

    fn add_site(&mut self, site_id: SiteId, partition_id: PartitionId, last_seen: TxnId) {
        self.sites.insert(
            site_id,
            SiteWatermark {
                partition_id,
                last_seen,
            },
        );
        self.partitions
            .entry(partition_id)
            .or_default()
            .sites
            .insert(site_id);
        self.recompute(partition_id);
    }

    /// Newest id known to be seen by every replica of `site_id`'s partition.
    pub fn newest_safe_txn_id(&self, site_id: SiteId) -> TxnId {
        self.sites
            .get(&site_id)
            .and_then(|site| self.partitions.get(&site.partition_id))
            .map(|partition| partition.min_last_seen)
            .unwrap_or(TxnId::NONE)
    }

    pub fn partition_watermark(&self, partition_id: PartitionId) -> Option<TxnId> {
        self.partitions
            .get(&partition_id)
            .map(|partition| partition.min_last_seen)
    }

    /// Record a site's report. Older reports never lower the watermark.
    pub fn update_from_executor(&mut self, site_id: SiteId, last_seen: TxnId) {
        let Some(site) = self.sites.get_mut(&site_id) else {
            tracing::debug!(site_id, %last_seen, "ignoring watermark from untracked site");
            return;
        };
        if last_seen <= site.last_seen {
            return;
        }
        site.last_seen = last_seen;
        let partition_id = site.partition_id;
        self.recompute(partition_id);
    }

    /// Forget a failed site. Its partition minimum is recomputed over the
    /// survivors.
    pub fn remove_state(&mut self, site_id: SiteId) {
        let Some(site) = self.sites.remove(&site_id) else {
            return;
        };
        let Some(partition) = self.partitions.get_mut(&site.partition_id) else {
            return;
        };
        partition.sites.remove(&site_id);
        if partition.sites.is_empty() {
            tracing::warn!(
                site_id,
                partition_id = site.partition_id,
                "last tracked replica of partition removed"
            );
            self.partitions.remove(&site.partition_id);
        } else {
            self.recompute(site.partition_id);
        }
    }

    /// Track a rejoined site. It starts at the partition's current minimum
    /// so the watermark does not move backwards.
    pub fn add_rejoined_state(&mut self, site_id: SiteId, partition_id: PartitionId) {
        let start = self
            .partition_watermark(partition_id)
            .unwrap_or(TxnId::NONE);
        self.add_site(site_id, partition_id, start);
    }

    fn recompute(&mut self, partition_id: PartitionId) {
        let Some(partition) = self.partitions.get_mut(&partition_id) else {
            return;
        };
        let min = partition
            .sites
            .iter()
            .filter_map(|site| self.sites.get(site))
            .map(|site| site.last_seen)
            .min()
            .unwrap_or(TxnId::NONE);
        partition.min_last_seen = min;
    }
}
