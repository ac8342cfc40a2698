//! In-memory store.

use std::collections::BTreeMap;

use super::{CapabilityProvider, QualSource, SnapshotSource, StoreError};
use crate::advisor::CapabilitySet;
use crate::model::{CounterSnapshot, EntityId, MetricSource, TimeRange, Timestamp};
use crate::qual::{QualUsageRow, Scope};

/// Store backed by vectors, used by tests and by [`super::FileStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    snapshots: Vec<CounterSnapshot>,
    qual_rows: Vec<QualUsageRow>,
    capabilities: BTreeMap<i32, CapabilitySet>,
    offline: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshots(snapshots: Vec<CounterSnapshot>) -> Self {
        let mut store = Self::new();
        store.extend_snapshots(snapshots);
        store
    }

    pub fn push_snapshot(&mut self, snapshot: CounterSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn extend_snapshots(&mut self, snapshots: impl IntoIterator<Item = CounterSnapshot>) {
        self.snapshots.extend(snapshots);
    }

    pub fn extend_qual_rows(&mut self, rows: impl IntoIterator<Item = QualUsageRow>) {
        self.qual_rows.extend(rows);
    }

    pub fn set_capabilities(&mut self, srvid: i32, capabilities: CapabilitySet) {
        self.capabilities.insert(srvid, capabilities);
    }

    /// Simulates an unreachable backend: every fetch fails with
    /// [`StoreError::Unavailable`].
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

impl SnapshotSource for MemoryStore {
    fn fetch_snapshots(
        &self,
        entity: &EntityId,
        range: TimeRange,
    ) -> Result<Vec<CounterSnapshot>, StoreError> {
        self.ensure_online()?;
        let mut out: Vec<CounterSnapshot> = self
            .snapshots
            .iter()
            .filter(|s| &s.entity == entity && range.contains(s.captured_at))
            .cloned()
            .collect();
        // Stable: insertion order is kept for equal timestamps.
        out.sort_by_key(|s| s.captured_at);
        Ok(out)
    }

    fn fetch_preceding(
        &self,
        entity: &EntityId,
        source: MetricSource,
        before: Timestamp,
    ) -> Result<Option<CounterSnapshot>, StoreError> {
        self.ensure_online()?;
        Ok(self
            .snapshots
            .iter()
            .filter(|s| &s.entity == entity && s.source() == source && s.captured_at < before)
            .max_by_key(|s| s.captured_at)
            .cloned())
    }
}

impl QualSource for MemoryStore {
    fn fetch_qual_rows(&self, scope: &Scope) -> Result<Vec<QualUsageRow>, StoreError> {
        self.ensure_online()?;
        Ok(self
            .qual_rows
            .iter()
            .filter(|r| scope.contains(r))
            .cloned()
            .collect())
    }
}

impl CapabilityProvider for MemoryStore {
    fn supported_access_methods(&self, srvid: i32) -> Result<CapabilitySet, StoreError> {
        self.ensure_online()?;
        Ok(self
            .capabilities
            .get(&srvid)
            .cloned()
            .unwrap_or_else(CapabilitySet::builtin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::AccessMethod;
    use crate::model::{CounterSet, WaitSamplingCounters};

    fn snap(entity: &EntityId, ts: i64, count: i64) -> CounterSnapshot {
        CounterSnapshot::new(
            entity.clone(),
            Timestamp::from_secs(ts),
            CounterSet::WaitSampling(WaitSamplingCounters { count }),
        )
    }

    #[test]
    fn fetch_filters_and_orders() {
        let a = EntityId::server(1);
        let b = EntityId::server(2);
        let store = MemoryStore::with_snapshots(vec![
            snap(&a, 30, 3),
            snap(&b, 15, 9),
            snap(&a, 10, 1),
            snap(&a, 20, 2),
            snap(&a, 50, 5),
        ]);
        let range = TimeRange::new(Timestamp::from_secs(10), Timestamp::from_secs(30)).unwrap();
        let got = store.fetch_snapshots(&a, range).unwrap();
        let ts: Vec<i64> = got.iter().map(|s| s.captured_at.as_micros() / 1_000_000).collect();
        assert_eq!(ts, vec![10, 20, 30]);
    }

    #[test]
    fn preceding_is_strictly_before() {
        let a = EntityId::server(1);
        let store = MemoryStore::with_snapshots(vec![snap(&a, 10, 1), snap(&a, 20, 2)]);
        let prev = store
            .fetch_preceding(&a, MetricSource::WaitSampling, Timestamp::from_secs(20))
            .unwrap()
            .unwrap();
        assert_eq!(prev.captured_at, Timestamp::from_secs(10));
        assert!(
            store
                .fetch_preceding(&a, MetricSource::Statements, Timestamp::from_secs(20))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn offline_store_is_unavailable() {
        let mut store = MemoryStore::new();
        store.set_offline(true);
        let range = TimeRange::new(Timestamp::from_secs(0), Timestamp::from_secs(1)).unwrap();
        assert!(matches!(
            store.fetch_snapshots(&EntityId::server(1), range),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.supported_access_methods(1),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn capabilities_default_to_builtin() {
        let mut store = MemoryStore::new();
        store.set_capabilities(2, CapabilitySet::new([AccessMethod::Btree]));
        assert_eq!(store.supported_access_methods(1).unwrap(), CapabilitySet::builtin());
        assert_eq!(store.supported_access_methods(2).unwrap().len(), 1);
    }
}
