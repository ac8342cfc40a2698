//! Hypothetical index simulation with `hypopg`.
//!
//! For each candidate, every sample query is explained twice in the candidate's
//! database: with `hypopg.enabled` off (base plan) and on, after creating the
//! hypothetical index. Costs are the top-level total costs summed over the
//! samples. The index counts as used when its generated name shows up in any
//! plan. Hypothetical indexes are reset before and after each candidate.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use postgres::{Client, SimpleQueryMessage};
use tracing::debug;

use super::queries::{HYPOPG_CREATE, HYPOPG_INSTALLED, HYPOPG_RESET, explain_prefix};
use super::{PgError, PgSettings, format_postgres_error, server_version_num};
use crate::advisor::{HypoSimulator, IndexCandidate, SimulationError, SimulationResult};
use crate::qual::Unfilled;

/// `EXPLAIN (GENERIC_PLAN)` first appeared in PostgreSQL 16.
const GENERIC_PLAN_MIN_VERSION: i32 = 160000;

struct DatabaseClient {
    client: Client,
    server_version_num: Option<i32>,
    has_hypopg: bool,
}

type SharedClient = Arc<Mutex<DatabaseClient>>;

/// [`HypoSimulator`] backed by the `hypopg` extension.
///
/// Keeps one connection per database, opened on first use. Each connection
/// is locked on its own. A connection still held by a simulation that ran
/// past its deadline is reported as unavailable instead of waited for.
pub struct HypoPgSimulator {
    settings: PgSettings,
    statement_timeout: Duration,
    clients: Mutex<BTreeMap<String, SharedClient>>,
}

impl HypoPgSimulator {
    /// `statement_timeout` bounds every EXPLAIN on the server side, and
    /// caps the connect timeout.
    pub fn new(settings: PgSettings, statement_timeout: Duration) -> Self {
        Self {
            settings: settings.with_connect_timeout_at_most(statement_timeout),
            statement_timeout,
            clients: Mutex::new(BTreeMap::new()),
        }
    }

    fn pool(&self) -> Result<MutexGuard<'_, BTreeMap<String, SharedClient>>, SimulationError> {
        self.clients
            .lock()
            .map_err(|_| SimulationError::Backend("connection pool poisoned".to_string()))
    }

    /// The connection to `datname`, opened without holding the pool lock.
    fn client_for(&self, datname: &str) -> Result<SharedClient, SimulationError> {
        if let Some(db) = self.pool()?.get(datname) {
            return Ok(Arc::clone(db));
        }
        let opened = Arc::new(Mutex::new(self.open(datname)?));
        let mut pool = self.pool()?;
        let db = pool.entry(datname.to_string()).or_insert(opened);
        Ok(Arc::clone(db))
    }

    /// Drops `db` from the pool unless it was already replaced.
    fn forget(&self, datname: &str, db: &SharedClient) {
        if let Ok(mut pool) = self.clients.lock()
            && pool.get(datname).is_some_and(|current| Arc::ptr_eq(current, db))
        {
            pool.remove(datname);
        }
    }

    fn open(&self, datname: &str) -> Result<DatabaseClient, SimulationError> {
        let mut client = self.settings.connect_to(datname)?;

        let server_version_num = server_version_num(&mut client);
        let has_hypopg = client
            .query_one(HYPOPG_INSTALLED, &[])
            .map(|row| row.get::<_, i64>(0) > 0)
            .map_err(|e| PgError::query(datname, &e))?;

        let timeout_ms = self.statement_timeout.as_millis().max(1);
        client
            .batch_execute(&format!("SET statement_timeout = {}", timeout_ms))
            .map_err(|e| PgError::query(datname, &e))?;

        debug!(
            database = %datname,
            ?server_version_num,
            has_hypopg,
            "simulation connection established"
        );
        Ok(DatabaseClient {
            client,
            server_version_num,
            has_hypopg,
        })
    }
}

impl HypoSimulator for HypoPgSimulator {
    fn simulate(&self, candidate: &IndexCandidate) -> Result<SimulationResult, SimulationError> {
        let datname = &candidate.table.datname;
        let shared = self.client_for(datname)?;
        let mut db = match shared.try_lock() {
            Ok(db) => db,
            Err(TryLockError::WouldBlock) => {
                return Err(SimulationError::Unavailable(format!(
                    "connection to database {} is busy with an earlier simulation",
                    datname
                )));
            }
            Err(TryLockError::Poisoned(_)) => {
                self.forget(datname, &shared);
                return Err(SimulationError::Backend(format!(
                    "connection to database {} poisoned",
                    datname
                )));
            }
        };
        if !db.has_hypopg {
            return Err(SimulationError::Unavailable(format!(
                "hypopg is not installed in database {}",
                datname
            )));
        }

        let generic_ok = db.server_version_num.unwrap_or(0) >= GENERIC_PLAN_MIN_VERSION;
        let statements = explainable_statements(candidate, generic_ok);
        if statements.is_empty() {
            return Err(SimulationError::NoSampleQuery);
        }

        let result = compare_plans(&mut db.client, &candidate.ddl(), &statements);
        // Reopen on next use.
        if matches!(result, Err(SimulationError::Backend(_))) && db.client.is_closed() {
            drop(db);
            self.forget(datname, &shared);
        }
        result
    }
}

/// EXPLAIN statements for the candidate's sample queries. Unfilled `$n`
/// parameters need a generic plan; unfilled `?` marks are never sent.
fn explainable_statements(candidate: &IndexCandidate, generic_ok: bool) -> Vec<String> {
    candidate
        .sample_queries
        .iter()
        .filter_map(|q| {
            let (sql, unfilled) = q.render();
            let generic = match unfilled {
                Unfilled::Nothing => false,
                Unfilled::Parameters if generic_ok => true,
                Unfilled::Parameters | Unfilled::Jumbled => return None,
            };
            Some(format!("{}{}", explain_prefix(generic), sql))
        })
        .collect()
}

fn compare_plans(
    client: &mut Client,
    ddl: &str,
    statements: &[String],
) -> Result<SimulationResult, SimulationError> {
    client
        .batch_execute(HYPOPG_RESET)
        .map_err(|e| SimulationError::Backend(format_postgres_error(&e)))?;
    let outcome = explain_with_and_without(client, ddl, statements);
    // Best effort: the session may already be gone.
    let _ = client.batch_execute(HYPOPG_RESET);
    outcome
}

fn explain_with_and_without(
    client: &mut Client,
    ddl: &str,
    statements: &[String],
) -> Result<SimulationResult, SimulationError> {
    let backend = |e: postgres::Error| SimulationError::Backend(format_postgres_error(&e));

    client
        .batch_execute("SET hypopg.enabled = off")
        .map_err(backend)?;
    let mut base_cost = 0.0;
    for stmt in statements {
        base_cost += plan_cost(&explain(client, stmt)?)?;
    }

    let indexname: String = client
        .query_one(HYPOPG_CREATE, &[&ddl])
        .map_err(backend)?
        .get(0);
    client
        .batch_execute("SET hypopg.enabled = on")
        .map_err(backend)?;

    let mut hypo_cost = 0.0;
    let mut index_used = false;
    for stmt in statements {
        let plan = explain(client, stmt)?;
        index_used |= plan_uses_index(&plan, &indexname);
        hypo_cost += plan_cost(&plan)?;
    }

    Ok(SimulationResult {
        index_used,
        base_cost,
        hypo_cost,
    })
}

fn explain(client: &mut Client, statement: &str) -> Result<Vec<String>, SimulationError> {
    let messages = client
        .simple_query(statement)
        .map_err(|e| SimulationError::Backend(format_postgres_error(&e)))?;
    Ok(messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
            _ => None,
        })
        .collect())
}

fn plan_cost(plan: &[String]) -> Result<f64, SimulationError> {
    plan.first()
        .and_then(|line| total_cost(line))
        .ok_or_else(|| SimulationError::Backend("no cost in plan".to_string()))
}

/// Total cost of a plan line: `b` in `(cost=a..b rows=...)`.
fn total_cost(line: &str) -> Option<f64> {
    let after = &line[line.find("cost=")? + "cost=".len()..];
    let total = &after[after.find("..")? + 2..];
    let end = total
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(total.len());
    total[..end].parse().ok()
}

fn plan_uses_index(plan: &[String], indexname: &str) -> bool {
    plan.iter().any(|line| line.contains(indexname))
}
