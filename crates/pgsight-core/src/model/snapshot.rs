//! Counter snapshots as supplied by the snapshot store.
//!
//! A snapshot is one row of cumulative counters for one entity, taken from one
//! source at one instant. The counters are a closed set of tagged per-source
//! structs, so a metric can only be read from the source that exports it.

use serde::{Deserialize, Serialize};

use super::metric::{CounterValue, Metric, MetricSource};
use super::time::Timestamp;

/// What a snapshot (or a series) is about.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityObject {
    /// Whole server.
    Server,
    /// One database (requires `EntityId::datname`).
    Database,
    /// One normalized statement.
    Query { queryid: i64 },
    /// One wait event, optionally restricted to a statement.
    WaitEvent {
        #[serde(default)]
        queryid: Option<i64>,
        event_type: String,
        event: String,
    },
}

/// Identifies a (server, database, object) scope.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub srvid: i32,
    #[serde(default)]
    pub datname: Option<String>,
    pub object: EntityObject,
}

impl EntityId {
    pub fn server(srvid: i32) -> Self {
        Self {
            srvid,
            datname: None,
            object: EntityObject::Server,
        }
    }

    pub fn database(srvid: i32, datname: impl Into<String>) -> Self {
        Self {
            srvid,
            datname: Some(datname.into()),
            object: EntityObject::Database,
        }
    }

    pub fn query(srvid: i32, datname: impl Into<String>, queryid: i64) -> Self {
        Self {
            srvid,
            datname: Some(datname.into()),
            object: EntityObject::Query { queryid },
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "srv{}", self.srvid)?;
        if let Some(db) = &self.datname {
            write!(f, "/{}", db)?;
        }
        match &self.object {
            EntityObject::Server | EntityObject::Database => Ok(()),
            EntityObject::Query { queryid } => write!(f, "/query:{}", queryid),
            EntityObject::WaitEvent {
                queryid,
                event_type,
                event,
            } => {
                if let Some(q) = queryid {
                    write!(f, "/query:{}", q)?;
                }
                write!(f, "/wait:{}:{}", event_type, event)
            }
        }
    }
}

/// Why the counters of a snapshot are not comparable with the previous one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMarker {
    /// Postmaster restarted since the previous snapshot.
    ServerRestart,
    /// Extension (shared library) reloaded.
    ExtensionReload,
    /// Explicit statistics reset call (e.g. `pg_stat_statements_reset()`).
    StatsReset,
}

/// `pg_stat_statements` counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatementCounters {
    pub calls: i64,
    pub rows: i64,
    /// Milliseconds.
    pub total_exec_time: f64,
    /// Milliseconds.
    pub total_plan_time: f64,
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
    pub shared_blks_dirtied: i64,
    pub shared_blks_written: i64,
    pub local_blks_hit: i64,
    pub local_blks_read: i64,
    pub local_blks_written: i64,
    pub temp_blks_read: i64,
    pub temp_blks_written: i64,
    /// Milliseconds.
    pub blk_read_time: f64,
    /// Milliseconds.
    pub blk_write_time: f64,
}

/// `pg_stat_kcache` counters (OS level, from getrusage).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KcacheCounters {
    /// Bytes physically read.
    pub reads: i64,
    /// Bytes physically written.
    pub writes: i64,
    /// Seconds.
    pub user_time: f64,
    /// Seconds.
    pub system_time: f64,
    pub minflts: i64,
    pub majflts: i64,
    pub nvcsws: i64,
    pub nivcsws: i64,
}

/// `pg_wait_sampling` profile counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitSamplingCounters {
    pub count: i64,
}

/// `pg_stat_database` counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseCounters {
    pub xact_commit: i64,
    pub xact_rollback: i64,
    pub blks_read: i64,
    pub blks_hit: i64,
    pub tup_returned: i64,
    pub tup_fetched: i64,
    pub tup_inserted: i64,
    pub tup_updated: i64,
    pub tup_deleted: i64,
    pub deadlocks: i64,
    /// Gauge: backends connected when the snapshot was taken.
    pub numbackends: i64,
}

/// Counters of a snapshot, tagged by the source that produced them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "counters", rename_all = "snake_case")]
pub enum CounterSet {
    Statements(StatementCounters),
    Kcache(KcacheCounters),
    WaitSampling(WaitSamplingCounters),
    Database(DatabaseCounters),
}

impl CounterSet {
    pub fn source(&self) -> MetricSource {
        match self {
            CounterSet::Statements(_) => MetricSource::Statements,
            CounterSet::Kcache(_) => MetricSource::Kcache,
            CounterSet::WaitSampling(_) => MetricSource::WaitSampling,
            CounterSet::Database(_) => MetricSource::Database,
        }
    }

    /// Value of `metric`, or `None` when the metric belongs to another source.
    pub fn get(&self, metric: Metric) -> Option<CounterValue> {
        use CounterValue::{Float, Int};
        let v = match (self, metric) {
            (CounterSet::Statements(s), Metric::Calls) => Int(s.calls),
            (CounterSet::Statements(s), Metric::Rows) => Int(s.rows),
            (CounterSet::Statements(s), Metric::TotalExecTime) => Float(s.total_exec_time),
            (CounterSet::Statements(s), Metric::TotalPlanTime) => Float(s.total_plan_time),
            (CounterSet::Statements(s), Metric::SharedBlksHit) => Int(s.shared_blks_hit),
            (CounterSet::Statements(s), Metric::SharedBlksRead) => Int(s.shared_blks_read),
            (CounterSet::Statements(s), Metric::SharedBlksDirtied) => Int(s.shared_blks_dirtied),
            (CounterSet::Statements(s), Metric::SharedBlksWritten) => Int(s.shared_blks_written),
            (CounterSet::Statements(s), Metric::LocalBlksHit) => Int(s.local_blks_hit),
            (CounterSet::Statements(s), Metric::LocalBlksRead) => Int(s.local_blks_read),
            (CounterSet::Statements(s), Metric::LocalBlksWritten) => Int(s.local_blks_written),
            (CounterSet::Statements(s), Metric::TempBlksRead) => Int(s.temp_blks_read),
            (CounterSet::Statements(s), Metric::TempBlksWritten) => Int(s.temp_blks_written),
            (CounterSet::Statements(s), Metric::BlkReadTime) => Float(s.blk_read_time),
            (CounterSet::Statements(s), Metric::BlkWriteTime) => Float(s.blk_write_time),
            (CounterSet::Kcache(k), Metric::KcacheReads) => Int(k.reads),
            (CounterSet::Kcache(k), Metric::KcacheWrites) => Int(k.writes),
            (CounterSet::Kcache(k), Metric::UserTime) => Float(k.user_time),
            (CounterSet::Kcache(k), Metric::SystemTime) => Float(k.system_time),
            (CounterSet::Kcache(k), Metric::Minflts) => Int(k.minflts),
            (CounterSet::Kcache(k), Metric::Majflts) => Int(k.majflts),
            (CounterSet::Kcache(k), Metric::Nvcsws) => Int(k.nvcsws),
            (CounterSet::Kcache(k), Metric::Nivcsws) => Int(k.nivcsws),
            (CounterSet::WaitSampling(w), Metric::WaitSamples) => Int(w.count),
            (CounterSet::Database(d), Metric::XactCommit) => Int(d.xact_commit),
            (CounterSet::Database(d), Metric::XactRollback) => Int(d.xact_rollback),
            (CounterSet::Database(d), Metric::BlksRead) => Int(d.blks_read),
            (CounterSet::Database(d), Metric::BlksHit) => Int(d.blks_hit),
            (CounterSet::Database(d), Metric::TupReturned) => Int(d.tup_returned),
            (CounterSet::Database(d), Metric::TupFetched) => Int(d.tup_fetched),
            (CounterSet::Database(d), Metric::TupInserted) => Int(d.tup_inserted),
            (CounterSet::Database(d), Metric::TupUpdated) => Int(d.tup_updated),
            (CounterSet::Database(d), Metric::TupDeleted) => Int(d.tup_deleted),
            (CounterSet::Database(d), Metric::Deadlocks) => Int(d.deadlocks),
            (CounterSet::Database(d), Metric::NumBackends) => Int(d.numbackends),
            _ => return None,
        };
        Some(v)
    }
}

/// Cumulative counters of one entity at one instant. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub entity: EntityId,
    pub captured_at: Timestamp,
    #[serde(flatten)]
    pub counters: CounterSet,
    /// Set when the counters were reset before this snapshot was taken.
    #[serde(default)]
    pub restart: Option<RestartMarker>,
}

impl CounterSnapshot {
    pub fn new(entity: EntityId, captured_at: Timestamp, counters: CounterSet) -> Self {
        Self {
            entity,
            captured_at,
            counters,
            restart: None,
        }
    }

    pub fn with_restart(mut self, marker: RestartMarker) -> Self {
        self.restart = Some(marker);
        self
    }

    pub fn source(&self) -> MetricSource {
        self.counters.source()
    }
}
