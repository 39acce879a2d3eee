//! In-memory site tracker.
//!
//! Holds the static site-to-partition assignment and the set of sites the
//! failure detector has reported dead. Shared between the sites and
//! initiators of one process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use super::types::{PartitionId, SiteId, SiteTracker};

#[derive(Debug, Default)]
struct TopologyInner {
    partition_by_site: BTreeMap<SiteId, PartitionId>,
    failed: BTreeSet<SiteId>,
}

#[derive(Debug, Default)]
pub struct StaticTopology {
    inner: RwLock<TopologyInner>,
}

impl StaticTopology {
    pub fn new(assignments: impl IntoIterator<Item = (SiteId, PartitionId)>) -> Self {
        Self {
            inner: RwLock::new(TopologyInner {
                partition_by_site: assignments.into_iter().collect(),
                failed: BTreeSet::new(),
            }),
        }
    }

    /// `partitions` partitions with `replicas` sites each. Site ids start at 1
    /// and replicas of one partition are numbered consecutively.
    pub fn uniform(partitions: u64, replicas: u64) -> Self {
        Self::new((0..partitions).flat_map(|partition| {
            (0..replicas).map(move |replica| (partition * replicas + replica + 1, partition))
        }))
    }

    pub fn mark_failed(&self, site_id: SiteId) -> bool {
        match self.inner.write() {
            Ok(mut inner) => {
                inner.partition_by_site.contains_key(&site_id) && inner.failed.insert(site_id)
            }
            Err(_) => false,
        }
    }

    pub fn mark_rejoined(&self, site_id: SiteId) -> bool {
        match self.inner.write() {
            Ok(mut inner) => inner.failed.remove(&site_id),
            Err(_) => false,
        }
    }

    pub fn is_live(&self, site_id: SiteId) -> bool {
        self.inner
            .read()
            .map(|inner| {
                inner.partition_by_site.contains_key(&site_id) && !inner.failed.contains(&site_id)
            })
            .unwrap_or(false)
    }

    /// Every configured site, live or not.
    pub fn all_sites(&self) -> Vec<SiteId> {
        self.inner
            .read()
            .map(|inner| inner.partition_by_site.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl SiteTracker for StaticTopology {
    fn partition_for_site(&self, site_id: SiteId) -> Option<PartitionId> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.partition_by_site.get(&site_id).copied())
    }

    fn live_sites_for_partition(&self, partition_id: PartitionId) -> Vec<SiteId> {
        self.inner
            .read()
            .map(|inner| {
                inner
                    .partition_by_site
                    .iter()
                    .filter(|(site, partition)| {
                        **partition == partition_id && !inner.failed.contains(site)
                    })
                    .map(|(site, _)| *site)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn all_sites_excluding(&self, site_id: SiteId) -> Vec<SiteId> {
        self.live_sites()
            .into_iter()
            .filter(|site| *site != site_id)
            .collect()
    }

    fn live_sites(&self) -> Vec<SiteId> {
        self.inner
            .read()
            .map(|inner| {
                inner
                    .partition_by_site
                    .keys()
                    .filter(|site| !inner.failed.contains(site))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn partitions(&self) -> Vec<PartitionId> {
        self.inner
            .read()
            .map(|inner| {
                inner
                    .partition_by_site
                    .values()
                    .copied()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }
}
