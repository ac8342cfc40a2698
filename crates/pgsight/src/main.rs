//! pgsight - PostgreSQL workload analysis.
//!
//! `series` turns stored counter snapshots into per-interval metric series.
//! `advise` aggregates pg_qualstats predicates and ranks index candidates
//! validated with hypopg.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgsight_core::advisor::{
    AdvisorConfig, AdvisorReport, CancelToken, IndexAdvisor, SelectivityPolicy,
};
use pgsight_core::model::{EntityId, SeriesKey};
use pgsight_core::pg::{HypoPgSimulator, PgCapabilities, PgQualSource, PgSettings};
use pgsight_core::qual::Scope;
use pgsight_core::series::{SeriesSet, build_series};
use pgsight_core::store::{CapabilityProvider, FileStore, QualSource};
use pgsight_core::util::{parse_range, print_pg_warning};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// PostgreSQL workload analysis.
#[derive(Parser)]
#[command(name = "pgsight", about = "PostgreSQL workload analysis", version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output format.
    #[arg(long, value_enum, default_value = "text", env = "PGSIGHT_FORMAT", global = true)]
    format: OutputFormat,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Build metric series from stored counter snapshots.
    Series(SeriesArgs),
    /// Recommend indexes for the recorded predicate workload.
    Advise(AdviseArgs),
}

/// Which server, database or statement to look at.
#[derive(clap::Args)]
struct Target {
    /// Server identifier.
    #[arg(long, default_value = "1", env = "PGSIGHT_SRVID")]
    srvid: i32,

    /// Restrict to one database.
    #[arg(short, long)]
    database: Option<String>,

    /// Restrict to one normalized statement (requires --database).
    #[arg(long, requires = "database", allow_hyphen_values = true)]
    queryid: Option<i64>,
}

#[derive(clap::Args)]
struct SeriesArgs {
    #[command(flatten)]
    target: Target,

    /// JSON store document holding the snapshots.
    #[arg(short, long, env = "PGSIGHT_STORE")]
    file: PathBuf,

    /// Metrics to build (e.g. calls,total_exec_time,hit_ratio).
    #[arg(short, long, required = true, value_delimiter = ',')]
    metric: Vec<SeriesKey>,

    /// Range start (e.g. -1h, 2026-02-07T17:00, 1738944000).
    #[arg(long, default_value = "-1h", allow_hyphen_values = true)]
    from: String,

    /// Range end.
    #[arg(long, default_value = "now", allow_hyphen_values = true)]
    to: String,
}

#[derive(clap::Args)]
struct AdviseArgs {
    #[command(flatten)]
    target: Target,

    /// Read qual rows and capabilities from a JSON store document instead of
    /// pg_qualstats. Simulation still runs against the live server.
    #[arg(short, long, env = "PGSIGHT_STORE")]
    file: Option<PathBuf>,

    /// Timeout of a single hypothetical index simulation, in seconds.
    #[arg(long, default_value = "5", env = "PGSIGHT_SIMULATION_TIMEOUT")]
    timeout: u64,

    /// Maximum number of columns of a composite candidate.
    #[arg(long, default_value = "4", env = "PGSIGHT_MAX_INDEX_COLUMNS")]
    max_columns: usize,

    /// Column ordering statistic for composite candidates.
    #[arg(long, value_enum, default_value = "filter-ratio", env = "PGSIGHT_SELECTIVITY")]
    selectivity: Selectivity,

    /// Sample queries simulated per candidate.
    #[arg(long, default_value = "3")]
    max_samples: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum Selectivity {
    FilterRatio,
    DistinctValues,
}

impl From<Selectivity> for SelectivityPolicy {
    fn from(s: Selectivity) -> Self {
        match s {
            Selectivity::FilterRatio => SelectivityPolicy::FilterRatio,
            Selectivity::DistinctValues => SelectivityPolicy::DistinctValues,
        }
    }
}

impl Target {
    fn entity(&self) -> EntityId {
        match (&self.database, self.queryid) {
            (Some(db), Some(queryid)) => EntityId::query(self.srvid, db.clone(), queryid),
            (Some(db), None) => EntityId::database(self.srvid, db.clone()),
            _ => EntityId::server(self.srvid),
        }
    }

    fn scope(&self) -> Scope {
        match (&self.database, self.queryid) {
            (Some(db), Some(queryid)) => Scope::Query {
                srvid: self.srvid,
                datname: db.clone(),
                queryid,
            },
            (Some(db), None) => Scope::Database {
                srvid: self.srvid,
                datname: db.clone(),
            },
            _ => Scope::Server { srvid: self.srvid },
        }
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Logs go to stderr; stdout carries the report.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgsight", "pgsight_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    debug!("pgsight {} starting", env!("CARGO_PKG_VERSION"));

    let result = match &args.command {
        Command::Series(series) => run_series(series, args.format),
        Command::Advise(advise) => run_advise(advise, args.format),
    };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run_series(args: &SeriesArgs, format: OutputFormat) -> CliResult<()> {
    let range = parse_range(&args.from, &args.to)?;
    let store = FileStore::open(&args.file)?;
    let entity = args.target.entity();
    let keys: BTreeSet<SeriesKey> = args.metric.iter().copied().collect();

    info!(entity = %entity, from = %range.start, to = %range.end, "building series");
    let set = build_series(&store, &entity, &keys, range)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&set)?),
        OutputFormat::Text => print!("{}", render_series(&set)),
    }
    Ok(())
}

fn run_advise(args: &AdviseArgs, format: OutputFormat) -> CliResult<()> {
    let settings = match PgSettings::from_env() {
        Ok(s) => s,
        Err(e) => {
            print_pg_warning(&e.to_string());
            return Err(e.into());
        }
    };

    let timeout = Duration::from_secs(args.timeout.max(1));
    let config = AdvisorConfig {
        simulation_timeout: timeout,
        max_index_columns: args.max_columns.max(1),
        selectivity: args.selectivity.into(),
        max_sample_queries: args.max_samples,
    };
    let simulator = Arc::new(HypoPgSimulator::new(settings.clone(), timeout));
    let advisor = IndexAdvisor::new(simulator, config);

    // Setup graceful shutdown
    let cancel = CancelToken::new();
    let c = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal, cancelling");
        c.cancel();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let scope = args.target.scope();
    info!(scope = %scope, "running index advisor");
    let report = match &args.file {
        Some(path) => {
            let store = FileStore::open(path)?;
            advisor.advise_from(&store, &scope, &cancel)?
        }
        None => {
            let quals = PgQualSource::new(settings.clone(), scope.srvid());
            let capabilities = PgCapabilities::new(settings, scope.srvid());
            let rows = quals.fetch_qual_rows(&scope).inspect_err(|e| {
                print_pg_warning(&e.to_string());
            })?;
            let capabilities = capabilities.supported_access_methods(scope.srvid())?;
            advisor.advise(&scope, &rows, &capabilities, &cancel)?
        }
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_report(&report)),
    }
    Ok(())
}

/// One line per timestamp, one column per series. `-` marks a gap.
fn render_series(set: &SeriesSet) -> String {
    let keys: Vec<SeriesKey> = set.keys().collect();
    let mut out = String::new();

    let _ = write!(out, "{:<27}", "timestamp");
    for key in &keys {
        let _ = write!(out, " {:>20}", key.name());
    }
    out.push('\n');

    for row in set.timeline() {
        let _ = write!(out, "{:<27}", row.timestamp.to_string());
        for key in &keys {
            match row.values.get(key) {
                Some(v) => {
                    let _ = write!(out, " {:>20.3}", v);
                }
                None => {
                    let _ = write!(out, " {:>20}", "-");
                }
            }
        }
        out.push('\n');
    }
    out
}

fn render_report(report: &AdvisorReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Index advice for {}", report.scope);

    if report.recommendations.is_empty() {
        out.push_str("\nNo index recommended.\n");
    } else {
        out.push('\n');
        for (i, rec) in report.recommendations.iter().enumerate() {
            let c = &rec.candidate;
            let _ = writeln!(out, "{:>3}. {};", i + 1, c.ddl());
            let gain = c.simulation.map(|s| s.gain_percent()).unwrap_or(0.0);
            let _ = writeln!(
                out,
                "     database {}, score {:.2}, gain {:.2}%, {} executions",
                c.table.datname, rec.benefit_score, gain, c.execution_count
            );
            for group in &rec.supporting_groups {
                let _ = writeln!(out, "     {} {}", group.table, group.where_clause());
            }
        }
    }

    let failed: Vec<_> = report
        .candidates
        .iter()
        .filter(|c| c.failure.is_some())
        .collect();
    if !failed.is_empty() {
        out.push_str("\nSimulation failures:\n");
        for c in failed {
            let _ = writeln!(
                out,
                "  {}: {}",
                c.ddl(),
                c.failure.as_deref().unwrap_or_default()
            );
        }
    }

    if !report.non_optimizable.is_empty() {
        out.push_str("\nNot optimizable with an index:\n");
        for q in &report.non_optimizable {
            let _ = writeln!(
                out,
                "  {} (query {} in {}, {:?})",
                q.description, q.queryid, q.datname, q.reason
            );
        }
    }

    let s = &report.stats;
    let _ = writeln!(
        out,
        "\n{} groups, {} already indexed, {} candidates proposed, {} unsupported, \
         {} simulated: {} accepted, {} rejected, {} failed",
        s.groups,
        s.already_indexed,
        s.proposed,
        s.dropped_unsupported,
        s.simulated,
        s.accepted,
        s.rejected,
        s.failed
    );
    out
}
