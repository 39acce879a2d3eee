//! Work units and the dependency trackers that gate them.
//!
//! A work unit becomes runnable once every dependency it waits on has all of
//! its expected results. Point dependencies expect one result. Multipartition
//! dependencies expect one result per participating site; replicas of a
//! partition share a map key, so their tables are compared and must match.

use std::collections::{BTreeMap, BTreeSet};

use super::error::FatalError;
use super::types::{
    CompleteTransaction, DependencyId, FragmentTask, InitiateTask, MapKey, PartitionId,
    ResultTable, SiteId, TxnId,
};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Expectation {
    Point { arrived: bool },
    Sites(BTreeSet<SiteId>),
}

/// Results collected for one dependency, bucketed by partition or site.
#[derive(Clone, Debug)]
pub struct DependencyTracker {
    txn_id: TxnId,
    dependency_id: DependencyId,
    expected: Expectation,
    results: BTreeMap<MapKey, ResultTable>,
    failure: Option<String>,
}

impl DependencyTracker {
    pub fn new(
        txn_id: TxnId,
        dependency_id: DependencyId,
        expected_sites: impl IntoIterator<Item = SiteId>,
    ) -> Self {
        let expected = if dependency_id.is_multipartition() {
            Expectation::Sites(expected_sites.into_iter().collect())
        } else {
            Expectation::Point { arrived: false }
        };
        Self {
            txn_id,
            dependency_id,
            expected,
            results: BTreeMap::new(),
            failure: None,
        }
    }

    pub fn dependency_id(&self) -> DependencyId {
        self.dependency_id
    }

    /// Store a result. A second result under the same key must match the
    /// first byte for byte.
    pub fn add_result(
        &mut self,
        site_id: SiteId,
        key: MapKey,
        table: ResultTable,
    ) -> Result<(), FatalError> {
        if let Some(existing) = self.results.get(&key) {
            if !existing.same_contents(&table) {
                return Err(FatalError::NonDeterministicResult {
                    txn_id: self.txn_id,
                    dependency_id: self.dependency_id,
                    key,
                    first: existing.digest_hex(),
                    second: table.digest_hex(),
                });
            }
        } else {
            self.results.insert(key, table);
        }
        self.mark_arrived(site_id);
        Ok(())
    }

    /// Count a recovering site's placeholder as its arrival.
    pub fn add_dummy(&mut self, site_id: SiteId) {
        self.mark_arrived(site_id);
    }

    /// Count a failed fragment as its arrival and remember why it failed.
    pub fn add_failure(&mut self, site_id: SiteId, message: String) {
        self.failure.get_or_insert(message);
        self.mark_arrived(site_id);
    }

    fn mark_arrived(&mut self, site_id: SiteId) {
        match &mut self.expected {
            Expectation::Point { arrived } => *arrived = true,
            Expectation::Sites(sites) => {
                if !sites.remove(&site_id) {
                    tracing::debug!(
                        txn_id = %self.txn_id,
                        dependency_id = %self.dependency_id,
                        site_id,
                        "result from site that is no longer expected"
                    );
                }
            }
        }
    }

    /// Stop waiting for a failed site. Point dependencies are left alone.
    pub fn remove_site(&mut self, site_id: SiteId) -> bool {
        match &mut self.expected {
            Expectation::Sites(sites) => sites.remove(&site_id),
            Expectation::Point { .. } => false,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        match &self.expected {
            Expectation::Point { arrived } => *arrived,
            Expectation::Sites(sites) => sites.is_empty(),
        }
    }

    pub fn results(&self) -> Vec<ResultTable> {
        self.results.values().cloned().collect()
    }
}

/// Inputs handed to the engine when a unit runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyResults {
    pub tables: BTreeMap<DependencyId, Vec<ResultTable>>,
    /// First fragment failure reported for any of the inputs.
    pub failure: Option<String>,
}

impl DependencyResults {
    pub fn from_attached(attached: &BTreeMap<DependencyId, Vec<ResultTable>>) -> Self {
        Self {
            tables: attached.clone(),
            failure: None,
        }
    }

    pub fn get(&self, dependency_id: DependencyId) -> &[ResultTable] {
        self.tables
            .get(&dependency_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn merge(&mut self, other: DependencyResults) {
        for (dep, tables) in other.tables {
            self.tables.entry(dep).or_default().extend(tables);
        }
        if self.failure.is_none() {
            self.failure = other.failure;
        }
    }
}

/// What a work unit does once it is ready.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkPayload {
    Initiate(InitiateTask),
    Fragment(FragmentTask),
    Complete(CompleteTransaction),
    /// Hand collected dependencies back to the suspended procedure.
    Resume { is_final: bool },
}

/// Coordinator work waiting on dependencies.
#[derive(Clone, Debug)]
pub struct WorkUnit {
    id: u64,
    txn_id: TxnId,
    payload: WorkPayload,
    dependencies: BTreeMap<DependencyId, DependencyTracker>,
    /// Number of newer procedure continuations that must resume first.
    pub(super) stack_count: usize,
}

impl WorkUnit {
    pub fn new(
        id: u64,
        txn_id: TxnId,
        payload: WorkPayload,
        dependency_ids: &[DependencyId],
        expected_sites: &[SiteId],
    ) -> Self {
        let dependencies = dependency_ids
            .iter()
            .map(|dep| {
                (
                    *dep,
                    DependencyTracker::new(txn_id, *dep, expected_sites.iter().copied()),
                )
            })
            .collect();
        Self {
            id,
            txn_id,
            payload,
            dependencies,
            stack_count: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload(&self) -> &WorkPayload {
        &self.payload
    }

    pub fn into_payload(self) -> WorkPayload {
        self.payload
    }

    pub fn should_resume_procedure(&self) -> bool {
        matches!(self.payload, WorkPayload::Resume { .. })
    }

    pub fn dependency_ids(&self) -> Vec<DependencyId> {
        self.dependencies.keys().copied().collect()
    }

    pub fn waits_on(&self, dependency_id: DependencyId) -> bool {
        self.dependencies.contains_key(&dependency_id)
    }

    pub fn put_dependency(
        &mut self,
        dependency_id: DependencyId,
        site_id: SiteId,
        partition_id: PartitionId,
        table: ResultTable,
    ) -> Result<(), FatalError> {
        let Some(tracker) = self.dependencies.get_mut(&dependency_id) else {
            tracing::debug!(txn_id = %self.txn_id, %dependency_id, "result for unknown dependency");
            return Ok(());
        };
        tracker.add_result(site_id, dependency_id.map_key(site_id, partition_id), table)
    }

    pub fn put_dummy_dependency(&mut self, dependency_id: DependencyId, site_id: SiteId) {
        if let Some(tracker) = self.dependencies.get_mut(&dependency_id) {
            tracker.add_dummy(site_id);
        }
    }

    pub fn put_failure(&mut self, dependency_id: DependencyId, site_id: SiteId, message: String) {
        if let Some(tracker) = self.dependencies.get_mut(&dependency_id) {
            tracker.add_failure(site_id, message);
        }
    }

    /// Repair multipartition dependencies after `site_id` failed.
    pub fn remove_site(&mut self, site_id: SiteId) {
        for tracker in self.dependencies.values_mut() {
            tracker.remove_site(site_id);
        }
    }

    pub fn all_dependencies_satisfied(&self) -> bool {
        self.stack_count == 0 && self.dependencies.values().all(DependencyTracker::is_satisfied)
    }

    pub fn results(&self) -> DependencyResults {
        let mut results = DependencyResults::default();
        for (dep, tracker) in &self.dependencies {
            results.tables.insert(*dep, tracker.results());
            if results.failure.is_none() {
                results.failure = tracker.failure.clone();
            }
        }
        results
    }
}
