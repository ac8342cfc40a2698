//! pgsight-core, a workload analysis engine for PostgreSQL statistics extensions.
//!
//! Provides:
//! - `model`: snapshot, counter, metric and timestamp types
//! - `delta`: counter delta normalization between two snapshots
//! - `series`: metric time series built from stored snapshots
//! - `store`: snapshot / qual source abstraction (memory, JSON file)
//! - `qual`: qual usage model and aggregation into predicate groups
//! - `advisor`: workload-wide index advisor (hypothetical index simulation)
//! - `util`: helper utilities
//!
//! With `pg` feature (default):
//! - `pg`: PostgreSQL adapters (hypopg simulator, access methods, pg_qualstats)

pub mod advisor;
pub mod delta;
pub mod model;
pub mod qual;
pub mod series;
pub mod store;
pub mod util;

#[cfg(feature = "pg")]
pub mod pg;
