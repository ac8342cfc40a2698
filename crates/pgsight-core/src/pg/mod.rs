//! PostgreSQL adapters.
//!
//! - [`HypoPgSimulator`]: hypothetical index simulation through `hypopg`
//! - [`PgCapabilities`]: index access methods installed on the server (`pg_am`)
//! - [`PgQualSource`]: predicate usage from `pg_qualstats()`, resolved against
//!   each database's catalog
//!
//! Connections use the synchronous `postgres` client. Settings come from the
//! standard libpq environment variables.

mod capabilities;
mod hypo;
mod qualstats;
mod queries;

pub use capabilities::PgCapabilities;
pub use hypo::HypoPgSimulator;
pub use qualstats::PgQualSource;

use std::time::Duration;

use postgres::{Client, NoTls};

use crate::advisor::SimulationError;
use crate::store::StoreError;

/// Error type for PostgreSQL access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgError {
    /// Neither PGUSER nor USER is set.
    EnvNotSet(String),
    /// Could not connect to the named database.
    Connection { database: String, message: String },
    /// A statement failed on an open connection.
    Query { database: String, message: String },
}

impl PgError {
    pub(crate) fn query(database: &str, e: &postgres::Error) -> Self {
        PgError::Query {
            database: database.to_string(),
            message: format_postgres_error(e),
        }
    }
}

impl std::fmt::Display for PgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PgError::EnvNotSet(var) => write!(f, "PostgreSQL: {} not set", var),
            PgError::Connection { database, message } => {
                write!(f, "PostgreSQL ({}): {}", database, message)
            }
            PgError::Query { database, message } => {
                write!(f, "PostgreSQL ({}): query failed: {}", database, message)
            }
        }
    }
}

impl std::error::Error for PgError {}

impl From<PgError> for StoreError {
    fn from(e: PgError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Connection problems make the backend unavailable; failed statements are
/// backend errors.
impl From<PgError> for SimulationError {
    fn from(e: PgError) -> Self {
        match e {
            PgError::Query { .. } => SimulationError::Backend(e.to_string()),
            PgError::EnvNotSet(_) | PgError::Connection { .. } => {
                SimulationError::Unavailable(e.to_string())
            }
        }
    }
}

/// Where and as whom to connect. One value serves every database of the
/// server: the database name is chosen per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Database for server-level queries (database list, `pg_am`).
    pub maintenance_db: String,
    /// Bound on establishing the TCP connection; none waits for the OS.
    pub connect_timeout: Option<Duration>,
}

impl PgSettings {
    /// Reads the libpq variables `PGHOST` (localhost), `PGPORT` (5432),
    /// `PGUSER` (falls back to `USER`), `PGPASSWORD`, `PGDATABASE`
    /// (defaults to the user name) and `PGCONNECT_TIMEOUT` (seconds).
    pub fn from_env() -> Result<Self, PgError> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let user = var("PGUSER")
            .or_else(|| var("USER"))
            .ok_or_else(|| PgError::EnvNotSet("PGUSER or USER".to_string()))?;
        let port = var("PGPORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432);

        Ok(Self {
            host: var("PGHOST").unwrap_or_else(|| "localhost".to_string()),
            port,
            maintenance_db: var("PGDATABASE").unwrap_or_else(|| user.clone()),
            password: var("PGPASSWORD"),
            connect_timeout: var("PGCONNECT_TIMEOUT")
                .and_then(|t| t.parse().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            user,
        })
    }

    /// Connects to the maintenance database.
    pub fn connect(&self) -> Result<Client, PgError> {
        self.connect_to(&self.maintenance_db)
    }

    /// Connects to `datname` on the same server.
    pub fn connect_to(&self, datname: &str) -> Result<Client, PgError> {
        Client::connect(&self.conninfo(datname), NoTls).map_err(|e| PgError::Connection {
            database: datname.to_string(),
            message: format_postgres_error(&e),
        })
    }

    /// libpq keyword/value connection string for `datname`.
    fn conninfo(&self, datname: &str) -> String {
        let mut parts = vec![
            format!("host={}", conninfo_value(&self.host)),
            format!("port={}", self.port),
            format!("user={}", conninfo_value(&self.user)),
            format!("dbname={}", conninfo_value(datname)),
        ];
        if let Some(password) = &self.password {
            parts.push(format!("password={}", conninfo_value(password)));
        }
        if let Some(timeout) = self.connect_timeout {
            parts.push(format!("connect_timeout={}", timeout_secs(timeout)));
        }
        parts.join(" ")
    }

    /// Same settings with `connect_timeout` lowered to `bound` when it is
    /// unset or longer.
    pub fn with_connect_timeout_at_most(mut self, bound: Duration) -> Self {
        self.connect_timeout = Some(match self.connect_timeout {
            Some(current) if current <= bound => current,
            _ => bound,
        });
        self
    }
}

/// libpq takes whole seconds, and 0 means no limit.
fn timeout_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

/// Quotes a conninfo value when it is empty or holds spaces, quotes or
/// backslashes.
fn conninfo_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// `server_version_num` of the connected server, e.g. 160002.
pub(crate) fn server_version_num(client: &mut Client) -> Option<i32> {
    let row = client.query_one("SHOW server_version_num", &[]).ok()?;
    row.try_get::<_, String>(0).ok()?.parse().ok()
}

/// Short message for a `postgres` error: the server's severity and message
/// when there is one, the transport error otherwise.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!("{}: {}", db.severity(), db.message()),
        None => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PgSettings {
        PgSettings {
            host: "db1".into(),
            port: 5433,
            user: "app".into(),
            password: None,
            maintenance_db: "postgres".into(),
            connect_timeout: None,
        }
    }

    #[test]
    fn conninfo_targets_requested_database() {
        assert_eq!(
            settings().conninfo("orders"),
            "host=db1 port=5433 user=app dbname=orders"
        );
    }

    #[test]
    fn conninfo_quotes_special_values() {
        let mut s = settings();
        s.password = Some("it's a secret".into());
        assert_eq!(
            s.conninfo("my db"),
            "host=db1 port=5433 user=app dbname='my db' password='it\\'s a secret'"
        );
        assert_eq!(conninfo_value(""), "''");
        assert_eq!(conninfo_value("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn connect_timeout_is_whole_seconds() {
        let s = settings().with_connect_timeout_at_most(Duration::from_millis(300));
        assert_eq!(s.connect_timeout, Some(Duration::from_millis(300)));
        assert_eq!(
            s.conninfo("orders"),
            "host=db1 port=5433 user=app dbname=orders connect_timeout=1"
        );

        let mut s = settings();
        s.connect_timeout = Some(Duration::from_secs(2));
        let s = s.with_connect_timeout_at_most(Duration::from_secs(10));
        assert_eq!(s.connect_timeout, Some(Duration::from_secs(2)));
        assert_eq!(timeout_secs(Duration::from_millis(2500)), 3);
    }

    #[test]
    fn query_errors_are_backend_failures() {
        let query = PgError::Query {
            database: "orders".into(),
            message: "ERROR: relation \"t\" does not exist".into(),
        };
        assert_eq!(
            query.to_string(),
            "PostgreSQL (orders): query failed: ERROR: relation \"t\" does not exist"
        );
        assert!(matches!(
            SimulationError::from(query.clone()),
            SimulationError::Backend(_)
        ));
        assert_eq!(
            StoreError::from(query),
            StoreError::Unavailable(
                "PostgreSQL (orders): query failed: ERROR: relation \"t\" does not exist".into()
            )
        );

        let conn = PgError::Connection {
            database: "orders".into(),
            message: "connection refused".into(),
        };
        assert!(matches!(
            SimulationError::from(conn),
            SimulationError::Unavailable(_)
        ));
    }
}
