//! Utility modules for pgsight.

mod time_parser;

pub use time_parser::{TimeParseError, parse_range, parse_time, parse_time_at};

/// libpq variables the PostgreSQL adapters read.
const PG_ENV_VARS: [&str; 5] = ["PGHOST", "PGPORT", "PGUSER", "PGPASSWORD", "PGDATABASE"];

/// Prints a PostgreSQL connection problem to stderr (red), followed by the
/// state of the connection variables (yellow).
pub fn print_pg_warning(error: &str) {
    const RED: &str = "\x1b[1;31m";
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{RED}PostgreSQL: {error}{RESET}");
    eprintln!("{YELLOW}  pg_qualstats and hypopg are reached through:");
    for line in pg_env_summary(|name| std::env::var(name).ok()) {
        eprintln!("    {line}");
    }
    eprint!("{RESET}");
}

/// One line per connection variable; passwords are never echoed.
fn pg_env_summary(lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
    PG_ENV_VARS
        .iter()
        .map(|name| match lookup(name) {
            None => format!("{name} (not set)"),
            Some(_) if *name == "PGPASSWORD" => format!("{name}=********"),
            Some(value) => format!("{name}={value}"),
        })
        .collect()
}
