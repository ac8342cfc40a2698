//! JSON file store.
//!
//! Document layout:
//!
//! ```json
//! {
//!   "snapshots": [ { "entity": {...}, "captured_at": 1700000000000000,
//!                    "source": "statements", "counters": {...} } ],
//!   "qual_rows": [ { "srvid": 1, "datname": "app", "queryid": 42, ... } ],
//!   "capabilities": { "1": ["btree", "gin"] }
//! }
//! ```
//!
//! Every section is optional.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CapabilityProvider, MemoryStore, QualSource, SnapshotSource, StoreError};
use crate::advisor::{AccessMethod, CapabilitySet};
use crate::model::{CounterSnapshot, EntityId, MetricSource, TimeRange, Timestamp};
use crate::qual::{QualUsageRow, Scope};

/// On-disk representation read by [`FileStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreDocument {
    pub snapshots: Vec<CounterSnapshot>,
    pub qual_rows: Vec<QualUsageRow>,
    pub capabilities: BTreeMap<i32, Vec<AccessMethod>>,
}

/// Store loaded once from a JSON document.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    /// Reads and decodes `path`. A missing or unreadable file is
    /// [`StoreError::Unavailable`], malformed content is [`StoreError::Parse`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path).map_err(|e| {
            StoreError::Unavailable(format!("failed to read {}: {}", path.display(), e))
        })?;
        let doc: StoreDocument = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Parse(format!("{}: {}", path.display(), e)))?;

        debug!(
            path = %path.display(),
            snapshots = doc.snapshots.len(),
            qual_rows = doc.qual_rows.len(),
            "loaded store document"
        );

        Ok(Self {
            path,
            inner: Self::build(doc),
        })
    }

    fn build(doc: StoreDocument) -> MemoryStore {
        let mut inner = MemoryStore::with_snapshots(doc.snapshots);
        inner.extend_qual_rows(doc.qual_rows);
        for (srvid, methods) in doc.capabilities {
            inner.set_capabilities(srvid, CapabilitySet::new(methods));
        }
        inner
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotSource for FileStore {
    fn fetch_snapshots(
        &self,
        entity: &EntityId,
        range: TimeRange,
    ) -> Result<Vec<CounterSnapshot>, StoreError> {
        self.inner.fetch_snapshots(entity, range)
    }

    fn fetch_preceding(
        &self,
        entity: &EntityId,
        source: MetricSource,
        before: Timestamp,
    ) -> Result<Option<CounterSnapshot>, StoreError> {
        self.inner.fetch_preceding(entity, source, before)
    }
}

impl QualSource for FileStore {
    fn fetch_qual_rows(&self, scope: &Scope) -> Result<Vec<QualUsageRow>, StoreError> {
        self.inner.fetch_qual_rows(scope)
    }
}

impl CapabilityProvider for FileStore {
    fn supported_access_methods(&self, srvid: i32) -> Result<CapabilitySet, StoreError> {
        self.inner.supported_access_methods(srvid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CounterSet, WaitSamplingCounters};
    use std::io::Write;

    fn write_doc(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn document_round_trip() {
        let entity = EntityId::server(1);
        let mut doc = StoreDocument::default();
        for (ts, count) in [(10, 1), (20, 4)] {
            doc.snapshots.push(CounterSnapshot::new(
                entity.clone(),
                Timestamp::from_secs(ts),
                CounterSet::WaitSampling(WaitSamplingCounters { count }),
            ));
        }
        doc.capabilities.insert(1, vec![AccessMethod::Btree, AccessMethod::Gin]);
        let file = write_doc(&serde_json::to_string(&doc).unwrap());

        let store = FileStore::open(file.path()).unwrap();
        let range = TimeRange::new(Timestamp::from_secs(0), Timestamp::from_secs(30)).unwrap();
        assert_eq!(store.fetch_snapshots(&entity, range).unwrap(), doc.snapshots);
        let caps = store.supported_access_methods(1).unwrap();
        assert!(caps.contains(&AccessMethod::Gin));
        assert!(!caps.contains(&AccessMethod::Hash));
        assert_eq!(store.supported_access_methods(2).unwrap(), CapabilitySet::builtin());
    }

    #[test]
    fn empty_document_is_valid() {
        let file = write_doc("{}");
        let store = FileStore::open(file.path()).unwrap();
        assert!(
            store
                .fetch_qual_rows(&Scope::Server { srvid: 1 })
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        let file = write_doc("{\"snapshots\": 12}");
        assert!(matches!(FileStore::open(file.path()), Err(StoreError::Parse(_))));
    }

    #[test]
    fn missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileStore::open(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
