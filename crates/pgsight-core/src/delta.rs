//! Counter delta normalization between two snapshots of the same entity.
//!
//! This module is the **single source of truth** for interval and rate
//! computation. The series builder and every derived metric go through
//! [`Interval`], so duration is computed exactly once per snapshot pair.
//!
//! Rules:
//! - `current` strictly earlier than `previous` is a caller error.
//! - A restart marker on `current` makes every metric of the interval unavailable.
//! - Equal timestamps (zero duration) make every metric unavailable.
//! - A cumulative counter that went backwards is a reset: unavailable, never negative.

use crate::model::{
    CounterSnapshot, CounterValue, Metric, MetricKind, MetricPoint, MetricSource, RestartMarker,
    SeriesKey, Timestamp,
};

// ---------------------------------------------------------------------------
// Delta helpers
// ---------------------------------------------------------------------------

/// Compute i64 delta, returning `None` on counter regression (stats reset).
pub fn di64(curr: i64, prev: i64) -> Option<i64> {
    (curr >= prev).then_some(curr - prev)
}

/// Compute f64 delta, returning `None` on counter regression (stats reset).
pub fn df64(curr: f64, prev: f64) -> Option<f64> {
    (curr >= prev).then_some(curr - prev)
}

/// Delta between two raw counter values, `None` on regression.
pub fn counter_delta(curr: CounterValue, prev: CounterValue) -> Option<f64> {
    match (curr, prev) {
        (CounterValue::Int(c), CounterValue::Int(p)) => di64(c, p).map(|d| d as f64),
        (c, p) => df64(c.as_f64(), p.as_f64()),
    }
}

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Why no value exists for a metric over an interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnavailableReason {
    /// Counter went backwards (extension reload, restart, stats reset).
    CounterReset,
    /// The later snapshot carries a restart marker.
    Restart(RestartMarker),
    /// Both snapshots share a timestamp.
    ZeroDuration,
    /// The metric is not exported by the snapshot's source.
    NotCollected,
    /// A ratio whose denominator did not move during the interval.
    NoActivity,
}

/// Outcome of normalizing one metric over one interval.
#[derive(Clone, Debug, PartialEq)]
pub enum Normalized {
    Point(MetricPoint),
    Unavailable(UnavailableReason),
}

impl Normalized {
    pub fn point(self) -> Option<MetricPoint> {
        match self {
            Normalized::Point(p) => Some(p),
            Normalized::Unavailable(_) => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Normalized::Unavailable(_))
    }
}

/// Error type for snapshot pairs that violate the input contract.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeError {
    /// `current` was captured before `previous`.
    OutOfOrderSnapshots {
        previous: Timestamp,
        current: Timestamp,
    },
    /// The two snapshots describe different entities or sources.
    EntityMismatch(String),
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizeError::OutOfOrderSnapshots { previous, current } => write!(
                f,
                "out of order snapshots: previous at {}, current at {}",
                previous, current
            ),
            NormalizeError::EntityMismatch(msg) => write!(f, "snapshot mismatch: {}", msg),
        }
    }
}

impl std::error::Error for NormalizeError {}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// Two consecutive snapshots of the same entity and source.
#[derive(Debug, Clone, Copy)]
pub struct Interval<'a> {
    pub from: &'a CounterSnapshot,
    pub to: &'a CounterSnapshot,
    duration_us: i64,
}

impl<'a> Interval<'a> {
    pub fn new(from: &'a CounterSnapshot, to: &'a CounterSnapshot) -> Result<Self, NormalizeError> {
        if from.entity != to.entity {
            return Err(NormalizeError::EntityMismatch(format!(
                "{} vs {}",
                from.entity, to.entity
            )));
        }
        if from.source() != to.source() {
            return Err(NormalizeError::EntityMismatch(format!(
                "{} vs {}",
                from.source().extension(),
                to.source().extension()
            )));
        }

        let duration_us = to.captured_at.micros_since(from.captured_at);
        if duration_us < 0 {
            return Err(NormalizeError::OutOfOrderSnapshots {
                previous: from.captured_at,
                current: to.captured_at,
            });
        }

        Ok(Self {
            from,
            to,
            duration_us,
        })
    }

    pub fn duration_micros(&self) -> i64 {
        self.duration_us
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_us as f64 / 1_000_000.0
    }

    pub fn timestamp(&self) -> Timestamp {
        self.to.captured_at
    }

    pub fn source(&self) -> MetricSource {
        self.to.source()
    }

    /// `Ok` when rates can be computed over this interval.
    pub fn check(&self) -> Result<(), UnavailableReason> {
        if let Some(marker) = self.to.restart {
            return Err(UnavailableReason::Restart(marker));
        }
        if self.duration_us == 0 {
            return Err(UnavailableReason::ZeroDuration);
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    /// Raw counter increase over the interval.
    pub fn delta(&self, metric: Metric) -> Result<f64, UnavailableReason> {
        self.check()?;
        let (Some(curr), Some(prev)) = (self.to.counters.get(metric), self.from.counters.get(metric))
        else {
            return Err(UnavailableReason::NotCollected);
        };
        counter_delta(curr, prev).ok_or(UnavailableReason::CounterReset)
    }

    /// Sum of the increases of several counters; unavailable if any one is.
    pub fn delta_sum(&self, metrics: &[Metric]) -> Result<f64, UnavailableReason> {
        metrics.iter().try_fold(0.0, |acc, &m| Ok(acc + self.delta(m)?))
    }

    /// Per-second value of `metric`: delta / duration for cumulative counters,
    /// the later absolute value for gauges.
    pub fn rate(&self, metric: Metric) -> Result<f64, UnavailableReason> {
        match metric.kind() {
            MetricKind::Cumulative => Ok(self.delta(metric)? / self.duration_secs()),
            MetricKind::Gauge => {
                self.check()?;
                self.to
                    .counters
                    .get(metric)
                    .map(CounterValue::as_f64)
                    .ok_or(UnavailableReason::NotCollected)
            }
        }
    }

    /// Wraps a computed value as a point of series `key` at the interval end.
    pub fn point(&self, key: SeriesKey, value: Result<f64, UnavailableReason>) -> Normalized {
        match value {
            Ok(value) => Normalized::Point(MetricPoint {
                timestamp: self.timestamp(),
                metric: key,
                value,
                source: self.source(),
            }),
            Err(reason) => Normalized::Unavailable(reason),
        }
    }

    pub fn normalize(&self, metric: Metric) -> Normalized {
        self.point(SeriesKey::Raw(metric), self.rate(metric))
    }
}

/// Normalizes `metric` between two snapshots of the same entity.
pub fn normalize(
    previous: &CounterSnapshot,
    current: &CounterSnapshot,
    metric: Metric,
) -> Result<Normalized, NormalizeError> {
    Ok(Interval::new(previous, current)?.normalize(metric))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CounterSet, DatabaseCounters, EntityId, KcacheCounters, StatementCounters,
    };

    fn stmt_snap(ts_us: i64, calls: i64, exec_ms: f64) -> CounterSnapshot {
        CounterSnapshot::new(
            EntityId::query(1, "app", 42),
            Timestamp::from_micros(ts_us),
            CounterSet::Statements(StatementCounters {
                calls,
                total_exec_time: exec_ms,
                ..Default::default()
            }),
        )
    }

    fn kcache_snap(ts_us: i64, user_time: f64) -> CounterSnapshot {
        CounterSnapshot::new(
            EntityId::query(1, "app", 42),
            Timestamp::from_micros(ts_us),
            CounterSet::Kcache(KcacheCounters {
                user_time,
                ..Default::default()
            }),
        )
    }

    #[test]
    fn di64_regression_is_none() {
        assert_eq!(di64(10, 5), Some(5));
        assert_eq!(di64(5, 5), Some(0));
        assert_eq!(di64(4, 5), None);
    }

    #[test]
    fn df64_regression_is_none() {
        assert_eq!(df64(2.5, 1.0), Some(1.5));
        assert_eq!(df64(0.5, 1.0), None);
    }

    #[test]
    fn rate_is_delta_over_duration() {
        let prev = stmt_snap(100_000_000, 10, 100.0);
        let curr = stmt_snap(110_000_000, 30, 300.0);
        let p = normalize(&prev, &curr, Metric::Calls).unwrap().point().unwrap();
        assert!((p.value - 2.0).abs() < 1e-9);
        assert_eq!(p.timestamp, curr.captured_at);
        assert_eq!(p.source, MetricSource::Statements);
        assert_eq!(p.metric_name(), "calls");

        let p = normalize(&prev, &curr, Metric::TotalExecTime)
            .unwrap()
            .point()
            .unwrap();
        assert!((p.value - 20.0).abs() < 1e-9);
    }

    #[test]
    fn sub_second_values_keep_precision() {
        // 10.999500s of CPU at t=0, 12.000500s at t=1.000000s
        let prev = kcache_snap(0, 10.999_500);
        let curr = kcache_snap(1_000_000, 12.000_500);
        let p = normalize(&prev, &curr, Metric::UserTime)
            .unwrap()
            .point()
            .unwrap();
        assert!((p.value - 1.001).abs() < 1e-9);
    }

    #[test]
    fn duration_spanning_second_boundary_stays_positive() {
        // t=10.999500s -> t=12.000500s is 1.001s, not (2s, -999000us)
        let prev = stmt_snap(10_999_500, 0, 0.0);
        let curr = stmt_snap(12_000_500, 1001, 0.0);
        let interval = Interval::new(&prev, &curr).unwrap();
        assert_eq!(interval.duration_micros(), 1_001_000);
        let rate = interval.rate(Metric::Calls).unwrap();
        assert!((rate - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn counter_regression_is_unavailable() {
        let prev = stmt_snap(100_000_000, 50, 500.0);
        let curr = stmt_snap(110_000_000, 5, 600.0);
        assert_eq!(
            normalize(&prev, &curr, Metric::Calls).unwrap(),
            Normalized::Unavailable(UnavailableReason::CounterReset)
        );
        // Other counters of the same interval are unaffected.
        assert!(
            normalize(&prev, &curr, Metric::TotalExecTime)
                .unwrap()
                .point()
                .is_some()
        );
    }

    #[test]
    fn restart_marker_forces_unavailable() {
        let prev = stmt_snap(100_000_000, 10, 100.0);
        let curr = stmt_snap(110_000_000, 20, 200.0).with_restart(RestartMarker::ServerRestart);
        for m in [Metric::Calls, Metric::TotalExecTime, Metric::Rows] {
            assert_eq!(
                normalize(&prev, &curr, m).unwrap(),
                Normalized::Unavailable(UnavailableReason::Restart(RestartMarker::ServerRestart))
            );
        }
    }

    #[test]
    fn zero_duration_is_unavailable() {
        let prev = stmt_snap(100_000_000, 10, 100.0);
        let curr = stmt_snap(100_000_000, 20, 200.0);
        assert_eq!(
            normalize(&prev, &curr, Metric::Calls).unwrap(),
            Normalized::Unavailable(UnavailableReason::ZeroDuration)
        );
    }

    #[test]
    fn out_of_order_is_error() {
        let prev = stmt_snap(110_000_000, 10, 100.0);
        let curr = stmt_snap(100_000_000, 20, 200.0);
        let err = normalize(&prev, &curr, Metric::Calls).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::OutOfOrderSnapshots {
                previous: prev.captured_at,
                current: curr.captured_at,
            }
        );
    }

    #[test]
    fn different_entities_are_rejected() {
        let prev = stmt_snap(100_000_000, 10, 100.0);
        let mut curr = stmt_snap(110_000_000, 20, 200.0);
        curr.entity = EntityId::query(1, "app", 43);
        assert!(matches!(
            normalize(&prev, &curr, Metric::Calls),
            Err(NormalizeError::EntityMismatch(_))
        ));
    }

    #[test]
    fn metric_from_other_source_is_not_collected() {
        let prev = stmt_snap(100_000_000, 10, 100.0);
        let curr = stmt_snap(110_000_000, 20, 200.0);
        assert_eq!(
            normalize(&prev, &curr, Metric::UserTime).unwrap(),
            Normalized::Unavailable(UnavailableReason::NotCollected)
        );
    }

    #[test]
    fn gauge_reports_absolute_value() {
        let snap = |ts: i64, backends: i64| {
            CounterSnapshot::new(
                EntityId::database(1, "app"),
                Timestamp::from_secs(ts),
                CounterSet::Database(DatabaseCounters {
                    numbackends: backends,
                    ..Default::default()
                }),
            )
        };
        // Fewer backends is not a reset for a gauge.
        let p = normalize(&snap(100, 40), &snap(110, 12), Metric::NumBackends)
            .unwrap()
            .point()
            .unwrap();
        assert!((p.value - 12.0).abs() < 1e-9);
    }

    #[test]
    fn delta_sum_fails_if_any_counter_reset() {
        let prev = stmt_snap(100_000_000, 10, 100.0);
        let curr = stmt_snap(110_000_000, 20, 50.0);
        let interval = Interval::new(&prev, &curr).unwrap();
        assert_eq!(
            interval.delta_sum(&[Metric::Calls, Metric::TotalExecTime]),
            Err(UnavailableReason::CounterReset)
        );
        assert!((interval.delta_sum(&[Metric::Calls]).unwrap() - 10.0).abs() < 1e-9);
    }
}
