//! Series identifiers and computed points.

use serde::{Deserialize, Serialize};

use super::metric::{Metric, MetricSource, Unit};
use super::time::Timestamp;

/// Series computed from several counters of the same source over one interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedMetric {
    /// Shared buffer hit % for statements: hit / (hit + read).
    HitRatio,
    /// Milliseconds of execution per call.
    MeanExecTime,
    /// Temp blocks read + written per second.
    TempBlocksPerSec,
    /// CPU seconds (user + system) per second of wall time.
    CpuTimePerSec,
    /// Physical bytes read + written per second.
    DiskBytesPerSec,
    /// Commits + rollbacks per second.
    TransactionsPerSec,
    /// Database-wide buffer hit %: blks_hit / (blks_hit + blks_read).
    DatabaseHitRatio,
}

impl DerivedMetric {
    pub const ALL: [DerivedMetric; 7] = [
        DerivedMetric::HitRatio,
        DerivedMetric::MeanExecTime,
        DerivedMetric::TempBlocksPerSec,
        DerivedMetric::CpuTimePerSec,
        DerivedMetric::DiskBytesPerSec,
        DerivedMetric::TransactionsPerSec,
        DerivedMetric::DatabaseHitRatio,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DerivedMetric::HitRatio => "hit_ratio",
            DerivedMetric::MeanExecTime => "mean_exec_time",
            DerivedMetric::TempBlocksPerSec => "temp_blocks_per_sec",
            DerivedMetric::CpuTimePerSec => "cpu_time_per_sec",
            DerivedMetric::DiskBytesPerSec => "disk_bytes_per_sec",
            DerivedMetric::TransactionsPerSec => "transactions_per_sec",
            DerivedMetric::DatabaseHitRatio => "database_hit_ratio",
        }
    }

    pub fn source(self) -> MetricSource {
        match self {
            DerivedMetric::HitRatio
            | DerivedMetric::MeanExecTime
            | DerivedMetric::TempBlocksPerSec => MetricSource::Statements,
            DerivedMetric::CpuTimePerSec | DerivedMetric::DiskBytesPerSec => MetricSource::Kcache,
            DerivedMetric::TransactionsPerSec | DerivedMetric::DatabaseHitRatio => {
                MetricSource::Database
            }
        }
    }

    pub fn unit(self) -> Unit {
        match self {
            DerivedMetric::HitRatio | DerivedMetric::DatabaseHitRatio => Unit::Percent,
            DerivedMetric::MeanExecTime => Unit::Milliseconds,
            DerivedMetric::TempBlocksPerSec => Unit::Blocks,
            DerivedMetric::CpuTimePerSec => Unit::Seconds,
            DerivedMetric::DiskBytesPerSec => Unit::Bytes,
            DerivedMetric::TransactionsPerSec => Unit::Count,
        }
    }
}

/// A requested series: either a raw counter or a derived metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeriesKey {
    Raw(Metric),
    Derived(DerivedMetric),
}

impl SeriesKey {
    pub fn name(self) -> &'static str {
        match self {
            SeriesKey::Raw(m) => m.name(),
            SeriesKey::Derived(d) => d.name(),
        }
    }

    pub fn source(self) -> MetricSource {
        match self {
            SeriesKey::Raw(m) => m.source(),
            SeriesKey::Derived(d) => d.source(),
        }
    }

    pub fn unit(self) -> Unit {
        match self {
            SeriesKey::Raw(m) => m.unit(),
            SeriesKey::Derived(d) => d.unit(),
        }
    }
}

impl From<Metric> for SeriesKey {
    fn from(m: Metric) -> Self {
        SeriesKey::Raw(m)
    }
}

impl From<DerivedMetric> for SeriesKey {
    fn from(d: DerivedMetric) -> Self {
        SeriesKey::Derived(d)
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SeriesKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(m) = s.parse::<Metric>() {
            return Ok(SeriesKey::Raw(m));
        }
        DerivedMetric::ALL
            .iter()
            .copied()
            .find(|d| d.name() == s)
            .map(SeriesKey::Derived)
            .ok_or_else(|| format!("unknown metric '{}'", s))
    }
}

/// One value of a series, produced only for valid intervals.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricPoint {
    /// Timestamp of the later snapshot of the interval.
    pub timestamp: Timestamp,
    pub metric: SeriesKey,
    pub value: f64,
    pub source: MetricSource,
}

impl MetricPoint {
    pub fn metric_name(&self) -> &'static str {
        self.metric.name()
    }
}
