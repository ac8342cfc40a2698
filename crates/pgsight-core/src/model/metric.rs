//! Counter sources and the metrics they export.
//!
//! Each statistics extension is one [`MetricSource`]; every [`Metric`] belongs to
//! exactly one source and has a fixed kind (cumulative counter or gauge) and unit.

use serde::{Deserialize, Serialize};

/// Statistics extension (or core view) a counter snapshot was taken from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    /// `pg_stat_statements`: execution time, rows, shared/local/temp blocks.
    Statements,
    /// `pg_stat_kcache`: OS-level CPU time, physical reads/writes, faults.
    Kcache,
    /// `pg_wait_sampling`: sampled wait events.
    WaitSampling,
    /// `pg_stat_database`: per-database transaction and block counters.
    Database,
}

impl MetricSource {
    pub fn extension(self) -> &'static str {
        match self {
            MetricSource::Statements => "pg_stat_statements",
            MetricSource::Kcache => "pg_stat_kcache",
            MetricSource::WaitSampling => "pg_wait_sampling",
            MetricSource::Database => "pg_stat_database",
        }
    }
}

/// How a counter evolves between snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic until reset; reported as delta / second.
    Cumulative,
    /// Point-in-time value; reported as is.
    Gauge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Count,
    Milliseconds,
    Seconds,
    Blocks,
    Bytes,
    Percent,
}

/// A single raw counter exported by one of the sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    // pg_stat_statements
    Calls,
    Rows,
    TotalExecTime,
    TotalPlanTime,
    SharedBlksHit,
    SharedBlksRead,
    SharedBlksDirtied,
    SharedBlksWritten,
    LocalBlksHit,
    LocalBlksRead,
    LocalBlksWritten,
    TempBlksRead,
    TempBlksWritten,
    BlkReadTime,
    BlkWriteTime,
    // pg_stat_kcache
    KcacheReads,
    KcacheWrites,
    UserTime,
    SystemTime,
    Minflts,
    Majflts,
    Nvcsws,
    Nivcsws,
    // pg_wait_sampling
    WaitSamples,
    // pg_stat_database
    XactCommit,
    XactRollback,
    BlksRead,
    BlksHit,
    TupReturned,
    TupFetched,
    TupInserted,
    TupUpdated,
    TupDeleted,
    Deadlocks,
    #[serde(rename = "numbackends")]
    NumBackends,
}

impl Metric {
    pub const ALL: [Metric; 35] = [
        Metric::Calls,
        Metric::Rows,
        Metric::TotalExecTime,
        Metric::TotalPlanTime,
        Metric::SharedBlksHit,
        Metric::SharedBlksRead,
        Metric::SharedBlksDirtied,
        Metric::SharedBlksWritten,
        Metric::LocalBlksHit,
        Metric::LocalBlksRead,
        Metric::LocalBlksWritten,
        Metric::TempBlksRead,
        Metric::TempBlksWritten,
        Metric::BlkReadTime,
        Metric::BlkWriteTime,
        Metric::KcacheReads,
        Metric::KcacheWrites,
        Metric::UserTime,
        Metric::SystemTime,
        Metric::Minflts,
        Metric::Majflts,
        Metric::Nvcsws,
        Metric::Nivcsws,
        Metric::WaitSamples,
        Metric::XactCommit,
        Metric::XactRollback,
        Metric::BlksRead,
        Metric::BlksHit,
        Metric::TupReturned,
        Metric::TupFetched,
        Metric::TupInserted,
        Metric::TupUpdated,
        Metric::TupDeleted,
        Metric::Deadlocks,
        Metric::NumBackends,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Calls => "calls",
            Metric::Rows => "rows",
            Metric::TotalExecTime => "total_exec_time",
            Metric::TotalPlanTime => "total_plan_time",
            Metric::SharedBlksHit => "shared_blks_hit",
            Metric::SharedBlksRead => "shared_blks_read",
            Metric::SharedBlksDirtied => "shared_blks_dirtied",
            Metric::SharedBlksWritten => "shared_blks_written",
            Metric::LocalBlksHit => "local_blks_hit",
            Metric::LocalBlksRead => "local_blks_read",
            Metric::LocalBlksWritten => "local_blks_written",
            Metric::TempBlksRead => "temp_blks_read",
            Metric::TempBlksWritten => "temp_blks_written",
            Metric::BlkReadTime => "blk_read_time",
            Metric::BlkWriteTime => "blk_write_time",
            Metric::KcacheReads => "kcache_reads",
            Metric::KcacheWrites => "kcache_writes",
            Metric::UserTime => "user_time",
            Metric::SystemTime => "system_time",
            Metric::Minflts => "minflts",
            Metric::Majflts => "majflts",
            Metric::Nvcsws => "nvcsws",
            Metric::Nivcsws => "nivcsws",
            Metric::WaitSamples => "wait_samples",
            Metric::XactCommit => "xact_commit",
            Metric::XactRollback => "xact_rollback",
            Metric::BlksRead => "blks_read",
            Metric::BlksHit => "blks_hit",
            Metric::TupReturned => "tup_returned",
            Metric::TupFetched => "tup_fetched",
            Metric::TupInserted => "tup_inserted",
            Metric::TupUpdated => "tup_updated",
            Metric::TupDeleted => "tup_deleted",
            Metric::Deadlocks => "deadlocks",
            Metric::NumBackends => "numbackends",
        }
    }

    pub fn source(self) -> MetricSource {
        use Metric::*;
        match self {
            Calls | Rows | TotalExecTime | TotalPlanTime | SharedBlksHit | SharedBlksRead
            | SharedBlksDirtied | SharedBlksWritten | LocalBlksHit | LocalBlksRead
            | LocalBlksWritten | TempBlksRead | TempBlksWritten | BlkReadTime | BlkWriteTime => {
                MetricSource::Statements
            }
            KcacheReads | KcacheWrites | UserTime | SystemTime | Minflts | Majflts | Nvcsws
            | Nivcsws => MetricSource::Kcache,
            WaitSamples => MetricSource::WaitSampling,
            XactCommit | XactRollback | BlksRead | BlksHit | TupReturned | TupFetched
            | TupInserted | TupUpdated | TupDeleted | Deadlocks | NumBackends => {
                MetricSource::Database
            }
        }
    }

    pub fn kind(self) -> MetricKind {
        match self {
            Metric::NumBackends => MetricKind::Gauge,
            _ => MetricKind::Cumulative,
        }
    }

    pub fn unit(self) -> Unit {
        use Metric::*;
        match self {
            TotalExecTime | TotalPlanTime | BlkReadTime | BlkWriteTime => Unit::Milliseconds,
            UserTime | SystemTime => Unit::Seconds,
            SharedBlksHit | SharedBlksRead | SharedBlksDirtied | SharedBlksWritten
            | LocalBlksHit | LocalBlksRead | LocalBlksWritten | TempBlksRead | TempBlksWritten
            | BlksRead | BlksHit => Unit::Blocks,
            KcacheReads | KcacheWrites => Unit::Bytes,
            _ => Unit::Count,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .iter()
            .copied()
            .find(|m| m.name() == s)
            .ok_or_else(|| format!("unknown metric '{}'", s))
    }
}

/// Raw cumulative (or gauge) value as exported by the source.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CounterValue {
    Int(i64),
    Float(f64),
}

impl CounterValue {
    pub fn as_f64(self) -> f64 {
        match self {
            CounterValue::Int(v) => v as f64,
            CounterValue::Float(v) => v,
        }
    }
}
