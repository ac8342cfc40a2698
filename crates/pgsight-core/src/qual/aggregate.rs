//! Qual usage aggregation.
//!
//! 1. Rows outside the scope are ignored.
//! 2. Each row is classified: usable, non-optimizable, already indexed, or
//!    dropped with a diagnostic (missing / inconsistent metadata).
//! 3. Usable predicates of the same statement conjunction on the same table are
//!    collected into one signature set (they co-occur).
//! 4. Identical (table, signature set) pairs from different statements merge into
//!    one [`QualGroup`]. A conjunction counts once per statement, with the
//!    largest counters among its predicates; these are summed across
//!    statements. Per-predicate counters are summed as they are.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use super::{
    ColumnRef, EvalType, PredicateSignature, PredicateStats, QualGroup,
    QualGroupId, QualUsageRow, SampleQuery, Scope, TableId,
};

/// Why a predicate can never be served by an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NonOptimizableReason {
    /// No index access method supports the operator (e.g. `<>`).
    NoIndexableOperator,
    /// Both sides are columns of different relations (join clause).
    CrossTableJoin,
    /// Both sides are columns of the same relation.
    ColumnComparison,
}

/// A predicate excluded from grouping, reported next to the usable groups.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NonOptimizableQual {
    pub srvid: i32,
    pub datname: String,
    pub queryid: i64,
    pub qualid: Option<i64>,
    pub reason: NonOptimizableReason,
    pub description: String,
    pub execution_count: i64,
}

/// A row dropped because its metadata is missing or inconsistent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QualDiagnostic {
    pub srvid: i32,
    pub datname: String,
    pub queryid: i64,
    pub qualid: Option<i64>,
    pub message: String,
}

/// Output of [`aggregate`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregationReport {
    /// Sorted by table, then signatures.
    pub groups: Vec<QualGroup>,
    pub non_optimizable: Vec<NonOptimizableQual>,
    pub diagnostics: Vec<QualDiagnostic>,
    /// Usable predicates already evaluated through an index scan.
    pub already_indexed: usize,
}

enum Classified<'a> {
    Usable(TableId, PredicateStats),
    AlreadyIndexed,
    NonOptimizable(NonOptimizableReason, String),
    Dropped(&'a str),
}

/// Groups the qual usage rows of `scope` by table and predicate signature.
pub fn aggregate(rows: &[QualUsageRow], scope: &Scope) -> AggregationReport {
    let mut report = AggregationReport::default();

    // (srvid, datname, queryid, qualid, table) -> co-occurring predicates
    type CoKey = (i32, String, i64, Option<i64>, TableId);
    let mut co_occurring: BTreeMap<CoKey, (BTreeMap<PredicateSignature, PredicateStats>, BTreeSet<SampleQuery>)> =
        BTreeMap::new();

    for row in rows.iter().filter(|r| scope.contains(r)) {
        match classify(row) {
            Classified::Usable(table, stats) => {
                let key = (
                    row.srvid,
                    row.datname.clone(),
                    row.queryid,
                    row.qualid,
                    table,
                );
                let (preds, samples) = co_occurring.entry(key).or_default();
                match preds.get_mut(&stats.signature) {
                    Some(existing) => existing.merge(&stats),
                    None => {
                        preds.insert(stats.signature.clone(), stats);
                    }
                }
                samples.extend(row.sample_queries());
            }
            Classified::AlreadyIndexed => report.already_indexed += 1,
            Classified::NonOptimizable(reason, description) => {
                debug!(
                    queryid = row.queryid,
                    reason = ?reason,
                    qual = %description,
                    "non-optimizable qual"
                );
                report.non_optimizable.push(NonOptimizableQual {
                    srvid: row.srvid,
                    datname: row.datname.clone(),
                    queryid: row.queryid,
                    qualid: row.qualid,
                    reason,
                    description,
                    execution_count: row.execution_count,
                });
            }
            Classified::Dropped(message) => {
                debug!(queryid = row.queryid, message, "dropping qual row");
                report.diagnostics.push(QualDiagnostic {
                    srvid: row.srvid,
                    datname: row.datname.clone(),
                    queryid: row.queryid,
                    qualid: row.qualid,
                    message: message.to_string(),
                });
            }
        }
    }

    // (table, signatures) -> group
    let mut groups: BTreeMap<(TableId, Vec<PredicateSignature>), QualGroup> = BTreeMap::new();
    for ((_, _, queryid, _, table), (preds, samples)) in co_occurring {
        let signatures: Vec<PredicateSignature> = preds.keys().cloned().collect();
        let group = groups
            .entry((table.clone(), signatures.clone()))
            .or_insert_with(|| QualGroup {
                id: QualGroupId::compute(&table, &signatures),
                table,
                predicates: Vec::new(),
                execution_count: 0,
                filtered_rows: 0,
                queryids: BTreeSet::new(),
                sample_queries: Vec::new(),
            });

        // Every predicate of a conjunction runs with it: count the
        // conjunction once, at its busiest predicate.
        group.execution_count += preds.values().map(|p| p.execution_count).max().unwrap_or(0);
        group.filtered_rows += preds.values().map(|p| p.filtered_rows).max().unwrap_or(0);
        for stats in preds.into_values() {
            match group
                .predicates
                .iter_mut()
                .find(|p| p.signature == stats.signature)
            {
                Some(existing) => existing.merge(&stats),
                None => group.predicates.push(stats),
            }
        }
        group.queryids.insert(queryid);
        for sample in samples {
            if !group.sample_queries.contains(&sample) {
                group.sample_queries.push(sample);
            }
        }
    }

    report.groups = groups.into_values().collect();
    for g in &mut report.groups {
        g.predicates.sort_by(|a, b| a.signature.cmp(&b.signature));
    }

    debug!(
        groups = report.groups.len(),
        non_optimizable = report.non_optimizable.len(),
        dropped = report.diagnostics.len(),
        already_indexed = report.already_indexed,
        "qual aggregation done"
    );

    report
}

fn classify(row: &QualUsageRow) -> Classified<'_> {
    let Some(op) = &row.operator else {
        return Classified::Dropped("missing operator metadata");
    };
    if row.execution_count < 0 || row.filtered_rows < 0 {
        return Classified::Dropped("negative usage counters");
    }

    let column = match (&row.left, &row.right) {
        (None, None) => return Classified::Dropped("no column reference"),
        (Some(l), Some(r)) => {
            let description = format!(
                "{}.{}.{} {} {}.{}.{}",
                l.schema, l.relname, l.attname, op.name, r.schema, r.relname, r.attname
            );
            let reason = if l.same_relation(r) {
                NonOptimizableReason::ColumnComparison
            } else {
                NonOptimizableReason::CrossTableJoin
            };
            return Classified::NonOptimizable(reason, description);
        }
        (Some(c), None) | (None, Some(c)) => c,
    };

    if !is_complete(column) || op.name.trim().is_empty() {
        return Classified::Dropped("incomplete column metadata");
    }

    let class = op.class();
    let access_methods: BTreeSet<_> = op.access_methods.iter().cloned().collect();
    if !access_methods.iter().any(|am| am.supports(class)) {
        let description = format!(
            "{}.{}.{} {} ?",
            column.schema, column.relname, column.attname, op.name
        );
        return Classified::NonOptimizable(NonOptimizableReason::NoIndexableOperator, description);
    }

    if row.eval_type == EvalType::Index {
        return Classified::AlreadyIndexed;
    }

    let table = TableId {
        srvid: row.srvid,
        datname: row.datname.clone(),
        schema: column.schema.clone(),
        relname: column.relname.clone(),
    };
    let stats = PredicateStats {
        signature: PredicateSignature {
            column: column.attname.clone(),
            operator: op.name.trim().to_string(),
            class,
        },
        access_methods,
        execution_count: row.execution_count,
        filtered_rows: row.filtered_rows,
        n_distinct: column.n_distinct,
        null_frac: column.null_frac,
    };
    Classified::Usable(table, stats)
}

fn is_complete(c: &ColumnRef) -> bool {
    !c.schema.is_empty() && !c.relname.is_empty() && !c.attname.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::AccessMethod;
    use crate::qual::{ColumnRef, OperatorRef};

    fn row(queryid: i64, col: &str, op: &str, exec: i64, filtered: i64) -> QualUsageRow {
        QualUsageRow::simple(
            1,
            "app",
            queryid,
            ColumnRef::new("public", "orders", col),
            OperatorRef::inferred(op),
            exec,
            filtered,
        )
    }

    fn server() -> Scope {
        Scope::Server { srvid: 1 }
    }

    #[test]
    fn co_occurring_predicates_form_one_group() {
        let rows = vec![row(7, "a", "=", 1000, 900), row(7, "b", "=", 1000, 500)];
        let report = aggregate(&rows, &server());
        assert_eq!(report.groups.len(), 1);
        let g = &report.groups[0];
        assert_eq!(g.table.relname, "orders");
        assert_eq!(g.predicates.len(), 2);
        assert_eq!(g.execution_count, 1000);
        assert_eq!(g.filtered_rows, 900);
        assert_eq!(g.predicates[1].filtered_rows, 500);
        assert_eq!(g.where_clause(), "WHERE a = ? AND b = ?");
    }

    #[test]
    fn same_signature_merges_across_queries() {
        let rows = vec![row(1, "a", "=", 100, 10), row(2, "a", "=", 300, 30)];
        let report = aggregate(&rows, &server());
        assert_eq!(report.groups.len(), 1);
        let g = &report.groups[0];
        assert_eq!(g.execution_count, 400);
        assert_eq!(g.filtered_rows, 40);
        assert_eq!(g.queryids, BTreeSet::from([1, 2]));
        assert_eq!(g.predicates[0].execution_count, 400);
    }

    #[test]
    fn conjunction_counts_once_per_statement() {
        let rows = vec![
            row(1, "a", "=", 1000, 900),
            row(1, "b", "=", 1000, 500),
            row(2, "a", "=", 300, 100),
            row(2, "b", "=", 250, 200),
        ];
        let report = aggregate(&rows, &server());
        assert_eq!(report.groups.len(), 1);
        let g = &report.groups[0];
        assert_eq!(g.execution_count, 1300);
        assert_eq!(g.filtered_rows, 1100);
        let per_predicate: Vec<i64> = g.predicates.iter().map(|p| p.execution_count).collect();
        assert_eq!(per_predicate, vec![1300, 1250]);
    }

    #[test]
    fn different_signature_sets_stay_apart() {
        let rows = vec![
            row(1, "a", "=", 100, 10),
            row(2, "a", "=", 100, 10),
            row(2, "b", "<", 100, 10),
        ];
        let report = aggregate(&rows, &server());
        assert_eq!(report.groups.len(), 2);
        let sizes: Vec<usize> = report.groups.iter().map(|g| g.predicates.len()).collect();
        assert!(sizes.contains(&1) && sizes.contains(&2));
    }

    #[test]
    fn non_optimizable_quals_are_reported_not_grouped() {
        let mut join = row(3, "customer_id", "=", 50, 0);
        join.right = Some(ColumnRef::new("public", "customers", "id"));
        let rows = vec![row(3, "status", "<>", 80, 70), join, row(3, "a", "=", 10, 1)];

        let report = aggregate(&rows, &server());
        assert_eq!(report.groups.len(), 1);
        assert!(report.groups[0].signatures().all(|s| s.column == "a"));
        let reasons: Vec<_> = report.non_optimizable.iter().map(|n| n.reason).collect();
        assert_eq!(
            reasons,
            vec![
                NonOptimizableReason::NoIndexableOperator,
                NonOptimizableReason::CrossTableJoin
            ]
        );
    }

    #[test]
    fn operator_without_supporting_method_is_non_optimizable() {
        // Catalog claims only hash for a range operator.
        let mut r = row(4, "created_at", "<", 10, 5);
        r.operator = Some(OperatorRef::new("<", vec![AccessMethod::Hash]));
        let report = aggregate(&[r], &server());
        assert!(report.groups.is_empty());
        assert_eq!(
            report.non_optimizable[0].reason,
            NonOptimizableReason::NoIndexableOperator
        );
    }

    #[test]
    fn incomplete_rows_are_dropped_with_diagnostic() {
        let mut no_op = row(5, "a", "=", 10, 1);
        no_op.operator = None;
        let mut no_col = row(5, "a", "=", 10, 1);
        no_col.left = None;
        let mut empty_name = row(5, "", "=", 10, 1);
        empty_name.qualid = Some(3);
        let mut negative = row(5, "a", "=", -1, 1);
        negative.qualid = Some(4);

        let report = aggregate(&[no_op, no_col, empty_name, negative, row(6, "a", "=", 10, 1)], &server());
        assert_eq!(report.diagnostics.len(), 4);
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].queryids, BTreeSet::from([6]));
    }

    #[test]
    fn index_evaluated_quals_are_counted_only() {
        let mut r = row(8, "a", "=", 10, 1);
        r.eval_type = EvalType::Index;
        let report = aggregate(&[r], &server());
        assert!(report.groups.is_empty());
        assert_eq!(report.already_indexed, 1);
    }

    #[test]
    fn rows_outside_scope_are_ignored() {
        let mut other_db = row(9, "a", "=", 10, 1);
        other_db.datname = "other".to_string();
        let scope = Scope::Database {
            srvid: 1,
            datname: "app".to_string(),
        };
        let report = aggregate(&[other_db, row(9, "b", "=", 10, 1)], &scope);
        assert_eq!(report.groups.len(), 1);
        assert!(report.groups[0].signatures().all(|s| s.column == "b"));
        assert!(report.diagnostics.is_empty());
    }

    #[test]
    fn separate_conjunctions_of_one_query_stay_apart() {
        let mut a = row(10, "a", "=", 10, 1);
        a.qualid = Some(1);
        let mut b = row(10, "b", "=", 10, 1);
        b.qualid = Some(2);
        let report = aggregate(&[a, b], &server());
        assert_eq!(report.groups.len(), 2);
    }

    #[test]
    fn aggregation_is_deterministic() {
        let rows = vec![
            row(2, "b", "=", 10, 1),
            row(1, "a", "=", 10, 1),
            row(2, "c", ">", 10, 1),
        ];
        let first = aggregate(&rows, &server());
        let mut reversed = rows.clone();
        reversed.reverse();
        let second = aggregate(&reversed, &server());
        assert_eq!(first.groups, second.groups);
    }

    #[test]
    fn sample_queries_are_collected() {
        let mut r = row(11, "a", "=", 10, 1);
        r.sample_query = Some("SELECT * FROM orders WHERE a = $1".to_string());
        r.constants = vec!["42".to_string()];
        let report = aggregate(&[r], &server());
        assert_eq!(report.groups[0].sample_queries.len(), 1);
        assert_eq!(report.groups[0].sample_queries[0].constants, vec!["42"]);
    }

    #[test]
    fn every_constant_set_becomes_a_sample() {
        let text = "SELECT * FROM orders WHERE a = $1";
        let mut a = row(12, "a", "=", 10, 1);
        a.sample_query = Some(text.to_string());
        a.constants = vec!["1".to_string()];
        a.other_constants = vec![vec!["2".to_string()], vec!["3".to_string()]];
        // Same conjunction, same constant sets.
        let mut b = a.clone();
        b.left = Some(ColumnRef::new("public", "orders", "b"));

        let report = aggregate(&[a, b], &server());
        let constants: Vec<Vec<String>> = report.groups[0]
            .sample_queries
            .iter()
            .map(|q| q.constants.clone())
            .collect();
        assert_eq!(constants, vec![vec!["1"], vec!["2"], vec!["3"]]);
    }
}
