//! Data model shared by the engine components.

mod metric;
mod point;
mod snapshot;
mod time;

pub use metric::{CounterValue, Metric, MetricKind, MetricSource, Unit};
pub use point::{DerivedMetric, MetricPoint, SeriesKey};
pub use snapshot::{
    CounterSet, CounterSnapshot, DatabaseCounters, EntityId, EntityObject, KcacheCounters,
    RestartMarker, StatementCounters, WaitSamplingCounters,
};
pub use time::{MICROS_PER_SEC, TimeRange, Timestamp};
