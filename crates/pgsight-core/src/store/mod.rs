//! Collaborator interfaces the engine reads its input from.
//!
//! The engine never owns snapshot storage. Implementations hand out owned,
//! immutable values; [`MemoryStore`] and [`FileStore`] are provided for tests,
//! replays and the CLI.

mod file;
mod memory;

pub use file::{FileStore, StoreDocument};
pub use memory::MemoryStore;

use crate::advisor::CapabilitySet;
use crate::model::{CounterSnapshot, EntityId, MetricSource, TimeRange, Timestamp};
use crate::qual::{QualUsageRow, Scope};

/// Error type for snapshot store access.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The backing store could not be reached.
    Unavailable(String),
    /// Data was read but could not be decoded.
    Parse(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
            StoreError::Parse(msg) => write!(f, "store parse error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Source of cumulative counter snapshots.
pub trait SnapshotSource {
    /// Snapshots of `entity` captured within `range`, ordered by capture time.
    fn fetch_snapshots(
        &self,
        entity: &EntityId,
        range: TimeRange,
    ) -> Result<Vec<CounterSnapshot>, StoreError>;

    /// Latest snapshot of `entity` from `source` captured strictly before `before`.
    fn fetch_preceding(
        &self,
        entity: &EntityId,
        source: MetricSource,
        before: Timestamp,
    ) -> Result<Option<CounterSnapshot>, StoreError>;
}

/// Source of raw predicate usage rows.
pub trait QualSource {
    fn fetch_qual_rows(&self, scope: &Scope) -> Result<Vec<QualUsageRow>, StoreError>;
}

/// Installed index access methods per server.
pub trait CapabilityProvider {
    fn supported_access_methods(&self, srvid: i32) -> Result<CapabilitySet, StoreError>;
}
