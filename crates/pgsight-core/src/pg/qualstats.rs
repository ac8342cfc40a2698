//! Predicate usage from `pg_qualstats`.
//!
//! `pg_qualstats()` is instance-wide, but relation, column and operator oids
//! only resolve in their own database, so each database in scope is queried
//! over its own connection.
//!
//! Besides the summed counters, the constants each conjunction was run with
//! are read. Per conjunction the most filtering, least filtering and most
//! executed constant sets are kept, to explain a normalized statement text
//! with.

use std::collections::BTreeMap;

use postgres::{Client, Row};
use tracing::{debug, warn};

use super::queries::{
    CONSTANT_SETS, DATABASES, HAS_EXAMPLE_QUERY, HAS_STATEMENTS, build_qualstats_query,
};
use super::{PgError, PgSettings, format_postgres_error};
use crate::advisor::AccessMethod;
use crate::qual::{ColumnRef, EvalType, OperatorRef, QualUsageRow, Scope};
use crate::store::{QualSource, StoreError};

/// [`QualSource`] reading a live server known as `srvid`.
pub struct PgQualSource {
    settings: PgSettings,
    srvid: i32,
}

impl PgQualSource {
    pub fn new(settings: PgSettings, srvid: i32) -> Self {
        Self { settings, srvid }
    }

    fn databases(&self, scope: &Scope) -> Result<Vec<String>, StoreError> {
        match scope {
            Scope::Database { datname, .. } | Scope::Query { datname, .. } => {
                Ok(vec![datname.clone()])
            }
            Scope::Server { .. } => {
                let mut client = self.settings.connect()?;
                let rows = client
                    .query(DATABASES, &[])
                    .map_err(|e| PgError::query(&self.settings.maintenance_db, &e))?;
                Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
            }
        }
    }

    fn fetch_database(&self, datname: &str) -> Result<Vec<QualUsageRow>, StoreError> {
        let mut client = self.settings.connect_to(datname)?;

        let has_example_query = installed(&mut client, HAS_EXAMPLE_QUERY);
        let has_statements = installed(&mut client, HAS_STATEMENTS);
        let rows = client
            .query(&build_qualstats_query(has_example_query, has_statements), &[])
            .map_err(|e| PgError::query(datname, &e))?;
        let constant_sets = fetch_constant_sets(&mut client, datname);

        rows.iter()
            .map(|row| qual_row(self.srvid, datname, row, &constant_sets))
            .collect()
    }
}

/// Runs a `count(*)` catalog lookup; false when it fails.
fn installed(client: &mut Client, sql: &str) -> bool {
    client
        .query_one(sql, &[])
        .map(|row| row.get::<_, i64>(0) > 0)
        .unwrap_or(false)
}

/// Constants one conjunction was executed with, and how they fared.
#[derive(Clone, Debug, PartialEq)]
struct ConstantSet {
    constants: Vec<String>,
    execution_count: i64,
    filtered_rows: i64,
}

impl ConstantSet {
    fn filter_ratio(&self) -> f64 {
        if self.execution_count <= 0 {
            0.0
        } else {
            self.filtered_rows as f64 / self.execution_count as f64
        }
    }
}

type ConstantSets = BTreeMap<(i64, i64), Vec<ConstantSet>>;

/// Constant sets by (queryid, qualid). Empty when constants are not tracked
/// or the installed pg_qualstats cannot report them.
fn fetch_constant_sets(client: &mut Client, datname: &str) -> ConstantSets {
    let rows = match client.query(CONSTANT_SETS, &[]) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(database = %datname, error = %format_postgres_error(&e), "no qual constants");
            return ConstantSets::new();
        }
    };

    let mut sets = ConstantSets::new();
    for row in &rows {
        match constant_set(row) {
            Ok((key, set)) => sets.entry(key).or_default().push(set),
            Err(e) => debug!(error = %format_postgres_error(&e), "skipping constant set"),
        }
    }
    sets
}

fn constant_set(row: &Row) -> Result<((i64, i64), ConstantSet), postgres::Error> {
    let key = (row.try_get("queryid")?, row.try_get("qualid")?);
    let set = ConstantSet {
        constants: row.try_get("constants")?,
        execution_count: row.try_get("execution_count")?,
        filtered_rows: row.try_get("nbfiltered")?,
    };
    Ok((key, set))
}

/// The most filtering, least filtering and most executed constant sets, in
/// that order and without repeats. Sets with equal constants, e.g. recorded
/// for different users, are merged first; ties go to the smaller constants.
fn pick_constant_sets(sets: &[ConstantSet]) -> Vec<Vec<String>> {
    let mut merged: BTreeMap<&[String], (i64, i64)> = BTreeMap::new();
    for set in sets {
        let counters = merged.entry(set.constants.as_slice()).or_default();
        counters.0 += set.execution_count;
        counters.1 += set.filtered_rows;
    }
    let merged: Vec<ConstantSet> = merged
        .into_iter()
        .map(|(constants, (execution_count, filtered_rows))| ConstantSet {
            constants: constants.to_vec(),
            execution_count,
            filtered_rows,
        })
        .collect();

    let mut picks: Vec<Vec<String>> = Vec::new();
    for pick in [
        first_max_by(&merged, ConstantSet::filter_ratio),
        first_max_by(&merged, |s| -s.filter_ratio()),
        first_max_by(&merged, |s| s.execution_count as f64),
    ]
    .into_iter()
    .flatten()
    {
        if !picks.contains(&pick.constants) {
            picks.push(pick.constants.clone());
        }
    }
    picks
}

fn first_max_by(sets: &[ConstantSet], key: impl Fn(&ConstantSet) -> f64) -> Option<&ConstantSet> {
    sets.iter().fold(None, |best, set| match best {
        Some(b) if key(b) >= key(set) => Some(b),
        _ => Some(set),
    })
}

impl QualSource for PgQualSource {
    fn fetch_qual_rows(&self, scope: &Scope) -> Result<Vec<QualUsageRow>, StoreError> {
        if scope.srvid() != self.srvid {
            return Err(StoreError::Unavailable(format!(
                "no connection settings for server {}",
                scope.srvid()
            )));
        }

        let explicit = !matches!(scope, Scope::Server { .. });
        let mut out = Vec::new();
        for datname in self.databases(scope)? {
            match self.fetch_database(&datname) {
                Ok(rows) => {
                    debug!(database = %datname, rows = rows.len(), "qual rows fetched");
                    out.extend(rows.into_iter().filter(|r| scope.contains(r)));
                }
                // Server-wide runs skip databases without pg_qualstats access.
                Err(e) if !explicit => {
                    warn!(database = %datname, error = %e, "skipping database");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

fn qual_row(
    srvid: i32,
    datname: &str,
    row: &Row,
    constant_sets: &ConstantSets,
) -> Result<QualUsageRow, StoreError> {
    let parse = |e: postgres::Error| StoreError::Parse(format_postgres_error(&e));

    let queryid: i64 = row.try_get("queryid").map_err(parse)?;
    let qualid: Option<i64> = row.try_get("qualid").map_err(parse)?;
    let eval_type: String = row.try_get("eval_type").map_err(parse)?;
    let oprname: Option<String> = row.try_get("oprname").map_err(parse)?;
    let access_methods: Vec<String> = row.try_get("access_methods").map_err(parse)?;
    let example: Option<String> = row.try_get("example_query").map_err(parse)?;
    let normalized: Option<String> = row.try_get("normalized_query").map_err(parse)?;

    let picks = qualid
        .and_then(|qualid| constant_sets.get(&(queryid, qualid)))
        .map(|sets| pick_constant_sets(sets))
        .unwrap_or_default();
    let (sample_query, picks) = sample_text(example, normalized, picks);
    let mut picks = picks.into_iter();

    Ok(QualUsageRow {
        srvid,
        datname: datname.to_string(),
        queryid,
        qualid,
        left: column(row, "l").map_err(parse)?,
        right: column(row, "r").map_err(parse)?,
        operator: operator(oprname, access_methods),
        execution_count: row.try_get("execution_count").map_err(parse)?,
        filtered_rows: row.try_get("nbfiltered").map_err(parse)?,
        eval_type: eval_type_from_code(&eval_type),
        sample_query,
        constants: picks.next().unwrap_or_default(),
        other_constants: picks.collect(),
    })
}

/// The normalized text when there are constants to fill it with, the
/// example statement otherwise. Constants are dropped for a text that has
/// its own.
fn sample_text(
    example: Option<String>,
    normalized: Option<String>,
    picks: Vec<Vec<String>>,
) -> (Option<String>, Vec<Vec<String>>) {
    match (example, normalized) {
        (_, Some(text)) if !picks.is_empty() => (Some(text), picks),
        (Some(text), _) => (Some(text), Vec::new()),
        (None, normalized) => (normalized, picks),
    }
}

/// One side of a qual. A zero relation oid means a constant; an oid that no
/// longer resolves yields an empty reference the aggregator drops.
fn column(row: &Row, side: &str) -> Result<Option<ColumnRef>, postgres::Error> {
    let relid: i64 = row.try_get(format!("{}relid", side).as_str())?;
    if relid == 0 {
        return Ok(None);
    }
    let schema: Option<String> = row.try_get(format!("{}schema", side).as_str())?;
    let relname: Option<String> = row.try_get(format!("{}relname", side).as_str())?;
    let attname: Option<String> = row.try_get(format!("{}attname", side).as_str())?;

    let mut col = ColumnRef::new(
        schema.unwrap_or_default(),
        relname.unwrap_or_default(),
        attname.unwrap_or_default(),
    );
    col.n_distinct = row.try_get(format!("{}_n_distinct", side).as_str())?;
    col.null_frac = row.try_get(format!("{}_null_frac", side).as_str())?;
    Ok(Some(col))
}

/// Operator with the access methods resolved from `pg_amop`; none when the
/// operator oid did not resolve.
fn operator(oprname: Option<String>, access_methods: Vec<String>) -> Option<OperatorRef> {
    oprname.map(|name| {
        OperatorRef::new(
            name,
            access_methods.into_iter().map(AccessMethod::from).collect(),
        )
    })
}

/// `pg_qualstats.eval_type`: `i` for index quals, `f` for filters.
fn eval_type_from_code(code: &str) -> EvalType {
    match code {
        "i" => EvalType::Index,
        _ => EvalType::Filter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_keeps_catalog_access_methods() {
        let op = operator(Some("~~".into()), vec!["gin".into(), "gist".into()]);
        assert_eq!(
            op,
            Some(OperatorRef::new(
                "~~",
                vec![AccessMethod::Gin, AccessMethod::Gist]
            ))
        );
        assert_eq!(operator(None, vec!["btree".into()]), None);
    }

    fn set(constant: &str, execution_count: i64, filtered_rows: i64) -> ConstantSet {
        ConstantSet {
            constants: vec![constant.to_string()],
            execution_count,
            filtered_rows,
        }
    }

    #[test]
    fn picks_filtering_extremes_and_busiest_constants() {
        let sets = vec![
            set("'z'", 5000, 2500),
            set("'x'", 100, 99),
            set("'y'", 300, 3),
        ];
        assert_eq!(
            pick_constant_sets(&sets),
            vec![vec!["'x'"], vec!["'y'"], vec!["'z'"]]
        );
    }

    #[test]
    fn repeated_constants_are_merged_and_picked_once() {
        // 'a' recorded for two users: 2000 executions in total.
        let sets = vec![set("'a'", 1000, 900), set("'b'", 1500, 0), set("'a'", 1000, 900)];
        assert_eq!(pick_constant_sets(&sets), vec![vec!["'a'"], vec!["'b'"]]);

        assert_eq!(pick_constant_sets(&[set("1", 10, 5)]), vec![vec!["1"]]);
        assert!(pick_constant_sets(&[]).is_empty());
    }

    #[test]
    fn normalized_text_needs_constants() {
        let example = Some("SELECT * FROM t WHERE a = 5".to_string());
        let normalized = Some("SELECT * FROM t WHERE a = $1".to_string());
        let picks = vec![vec!["1".to_string()], vec!["2".to_string()]];

        assert_eq!(
            sample_text(example.clone(), normalized.clone(), picks.clone()),
            (normalized.clone(), picks.clone())
        );
        assert_eq!(
            sample_text(example.clone(), normalized.clone(), Vec::new()),
            (example.clone(), Vec::new())
        );
        assert_eq!(
            sample_text(example.clone(), None, picks.clone()),
            (example, Vec::new())
        );
        assert_eq!(
            sample_text(None, normalized.clone(), Vec::new()),
            (normalized, Vec::new())
        );
    }

    #[test]
    fn eval_type_codes() {
        assert_eq!(eval_type_from_code("i"), EvalType::Index);
        assert_eq!(eval_type_from_code("f"), EvalType::Filter);
        assert_eq!(eval_type_from_code(""), EvalType::Filter);
    }
}
