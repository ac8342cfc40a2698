//! Metric series builder.
//!
//! Pairs consecutive snapshots of each counter source and runs them through
//! [`Interval`]. Unavailable intervals become gaps; nothing is interpolated or
//! resampled, so sources with different collection cadence keep their own
//! timestamps.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::delta::{Interval, NormalizeError, Normalized, UnavailableReason};
use crate::model::{
    CounterSnapshot, DerivedMetric, EntityId, Metric, MetricPoint, MetricSource, SeriesKey,
    TimeRange, Timestamp,
};
use crate::store::{SnapshotSource, StoreError};

/// Error type for series construction.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesError {
    /// The snapshot source failed; no series can be produced.
    Store(StoreError),
    /// `end` precedes `start`.
    InvalidRange { start: Timestamp, end: Timestamp },
}

impl std::fmt::Display for SeriesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeriesError::Store(e) => write!(f, "{}", e),
            SeriesError::InvalidRange { start, end } => {
                write!(f, "invalid time range: {} is after {}", start, end)
            }
        }
    }
}

impl std::error::Error for SeriesError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SeriesError::Store(e) => Some(e),
            SeriesError::InvalidRange { .. } => None,
        }
    }
}

impl From<StoreError> for SeriesError {
    fn from(e: StoreError) -> Self {
        SeriesError::Store(e)
    }
}

/// Ordered points per requested series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSet {
    pub entity: EntityId,
    pub range: TimeRange,
    pub series: BTreeMap<SeriesKey, Vec<MetricPoint>>,
}

/// Values of every series sharing one snapshot timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineRow {
    pub timestamp: Timestamp,
    pub values: BTreeMap<SeriesKey, f64>,
}

impl SeriesSet {
    /// Points of `key`; empty when not requested or fully unavailable.
    pub fn get(&self, key: impl Into<SeriesKey>) -> &[MetricPoint] {
        self.series
            .get(&key.into())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = SeriesKey> + '_ {
        self.series.keys().copied()
    }

    pub fn point_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    /// All series aligned on their snapshot timestamps.
    ///
    /// A row only holds the series that produced a point at that instant.
    pub fn timeline(&self) -> Vec<TimelineRow> {
        let mut rows: BTreeMap<Timestamp, BTreeMap<SeriesKey, f64>> = BTreeMap::new();
        for (key, points) in &self.series {
            for p in points {
                rows.entry(p.timestamp).or_default().insert(*key, p.value);
            }
        }
        rows.into_iter()
            .map(|(timestamp, values)| TimelineRow { timestamp, values })
            .collect()
    }
}

/// Builds the requested series of `entity` over `range`.
///
/// One snapshot preceding `range.start` is fetched per source so the first
/// interval inside the range has a baseline. Calling this again against an
/// unchanged store returns an identical set.
pub fn build_series<S: SnapshotSource + ?Sized>(
    store: &S,
    entity: &EntityId,
    keys: &BTreeSet<SeriesKey>,
    range: TimeRange,
) -> Result<SeriesSet, SeriesError> {
    if range.end < range.start {
        return Err(SeriesError::InvalidRange {
            start: range.start,
            end: range.end,
        });
    }

    let mut series: BTreeMap<SeriesKey, Vec<MetricPoint>> =
        keys.iter().map(|k| (*k, Vec::new())).collect();
    if keys.is_empty() {
        return Ok(SeriesSet {
            entity: entity.clone(),
            range,
            series,
        });
    }

    let snapshots = store.fetch_snapshots(entity, range)?;
    let sources: BTreeSet<MetricSource> = keys.iter().map(|k| k.source()).collect();

    for source in sources {
        let in_range: Vec<&CounterSnapshot> =
            snapshots.iter().filter(|s| s.source() == source).collect();
        if in_range.is_empty() {
            debug!(entity = %entity, source = source.extension(), "no snapshots in range");
            continue;
        }
        let baseline = store.fetch_preceding(entity, source, range.start)?;
        let source_keys: Vec<SeriesKey> =
            keys.iter().copied().filter(|k| k.source() == source).collect();

        let mut prev = baseline.as_ref();
        for curr in in_range {
            let Some(p) = prev else {
                prev = Some(curr);
                continue;
            };
            let interval = match Interval::new(p, curr) {
                Ok(interval) => interval,
                Err(NormalizeError::OutOfOrderSnapshots { previous, current }) => {
                    warn!(
                        entity = %entity,
                        source = source.extension(),
                        %previous,
                        %current,
                        "skipping out of order snapshot"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(entity = %entity, error = %e, "skipping snapshot");
                    continue;
                }
            };

            for key in &source_keys {
                match evaluate(&interval, *key) {
                    Normalized::Point(point) => {
                        if let Some(points) = series.get_mut(key) {
                            points.push(point);
                        }
                    }
                    Normalized::Unavailable(reason) => {
                        debug!(
                            entity = %entity,
                            metric = key.name(),
                            at = %interval.timestamp(),
                            ?reason,
                            "gap"
                        );
                    }
                }
            }
            prev = Some(curr);
        }
    }

    let set = SeriesSet {
        entity: entity.clone(),
        range,
        series,
    };
    debug!(
        entity = %entity,
        series = set.series.len(),
        points = set.point_count(),
        "series built"
    );
    Ok(set)
}

/// Value of `key` over one interval.
pub fn evaluate(interval: &Interval<'_>, key: SeriesKey) -> Normalized {
    match key {
        SeriesKey::Raw(metric) => interval.normalize(metric),
        SeriesKey::Derived(derived) => interval.point(key, derive(interval, derived)),
    }
}

fn derive(iv: &Interval<'_>, metric: DerivedMetric) -> Result<f64, UnavailableReason> {
    match metric {
        DerivedMetric::HitRatio => ratio(iv, Metric::SharedBlksHit, Metric::SharedBlksRead),
        DerivedMetric::DatabaseHitRatio => ratio(iv, Metric::BlksHit, Metric::BlksRead),
        DerivedMetric::MeanExecTime => {
            let calls = iv.delta(Metric::Calls)?;
            if calls == 0.0 {
                return Err(UnavailableReason::NoActivity);
            }
            Ok(iv.delta(Metric::TotalExecTime)? / calls)
        }
        DerivedMetric::TempBlocksPerSec => {
            per_sec(iv, &[Metric::TempBlksRead, Metric::TempBlksWritten])
        }
        DerivedMetric::CpuTimePerSec => per_sec(iv, &[Metric::UserTime, Metric::SystemTime]),
        DerivedMetric::DiskBytesPerSec => {
            per_sec(iv, &[Metric::KcacheReads, Metric::KcacheWrites])
        }
        DerivedMetric::TransactionsPerSec => {
            per_sec(iv, &[Metric::XactCommit, Metric::XactRollback])
        }
    }
}

/// `hit / (hit + read)` as a percentage.
fn ratio(iv: &Interval<'_>, hit: Metric, read: Metric) -> Result<f64, UnavailableReason> {
    let hit = iv.delta(hit)?;
    let total = hit + iv.delta(read)?;
    if total == 0.0 {
        return Err(UnavailableReason::NoActivity);
    }
    Ok(hit * 100.0 / total)
}

fn per_sec(iv: &Interval<'_>, metrics: &[Metric]) -> Result<f64, UnavailableReason> {
    // delta_sum() rejects zero-duration intervals
    Ok(iv.delta_sum(metrics)? / iv.duration_secs())
}
