//! Candidate index proposal.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::Serialize;

use super::{AccessMethod, SelectivityPolicy, SimulationResult};
use crate::qual::{OperatorClass, PredicateStats, QualGroup, QualGroupId, SampleQuery, TableId};

/// Lifecycle of a candidate within one advisor run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStatus {
    #[default]
    Untested,
    /// The planner would use the index and it lowers the plan cost.
    Accepted,
    /// The planner ignores the index or it brings no cost reduction.
    Rejected,
    SimulationFailed,
}

/// Identity of a candidate: two proposals with the same key are one index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(super) struct CandidateKey {
    pub table: TableId,
    pub columns: Vec<String>,
    pub access_method: AccessMethod,
}

/// A proposed index definition.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexCandidate {
    pub table: TableId,
    /// Index key order.
    pub columns: Vec<String>,
    pub access_method: AccessMethod,
    /// Estimated plan cost saved per execution, once accepted.
    pub estimated_benefit: Option<f64>,
    pub status: SimulationStatus,
    pub supporting_groups: Vec<QualGroupId>,
    /// Summed execution count of the supporting groups.
    pub execution_count: i64,
    pub sample_queries: Vec<SampleQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation: Option<SimulationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl IndexCandidate {
    pub fn new(table: TableId, columns: Vec<String>, access_method: AccessMethod) -> Self {
        Self {
            table,
            columns,
            access_method,
            estimated_benefit: None,
            status: SimulationStatus::Untested,
            supporting_groups: Vec::new(),
            execution_count: 0,
            sample_queries: Vec::new(),
            simulation: None,
            failure: None,
        }
    }

    pub(super) fn key(&self) -> CandidateKey {
        CandidateKey {
            table: self.table.clone(),
            columns: self.columns.clone(),
            access_method: self.access_method.clone(),
        }
    }

    /// `CREATE INDEX` statement for the candidate (no index name: hypopg and
    /// PostgreSQL generate one).
    pub fn ddl(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE INDEX ON {}.{} USING {} ({})",
            quote_ident(&self.table.schema),
            quote_ident(&self.table.relname),
            self.access_method,
            columns.join(", ")
        )
    }

    /// Accumulates another proposal of the same index.
    pub(super) fn absorb(&mut self, other: IndexCandidate, max_sample_queries: usize) {
        for id in other.supporting_groups {
            if !self.supporting_groups.contains(&id) {
                self.supporting_groups.push(id);
            }
        }
        self.execution_count += other.execution_count;
        for q in other.sample_queries {
            if self.sample_queries.len() >= max_sample_queries {
                break;
            }
            if !self.sample_queries.contains(&q) {
                self.sample_queries.push(q);
            }
        }
    }
}

/// Double-quoted SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Proposes single-column and composite candidates for one group.
///
/// A method is only proposed for predicates whose operator class it can serve.
/// Composite candidates exist for every multi-column method serving at least two
/// distinct columns of the group, most selective column first.
pub(super) fn propose(
    group: &QualGroup,
    policy: SelectivityPolicy,
    max_index_columns: usize,
    max_sample_queries: usize,
) -> Vec<IndexCandidate> {
    let mut keys: BTreeSet<(Vec<String>, AccessMethod)> = BTreeSet::new();

    for p in &group.predicates {
        for am in usable_methods(p) {
            keys.insert((vec![p.signature.column.clone()], am));
        }
    }

    if max_index_columns >= 2 {
        let methods: BTreeSet<AccessMethod> = group
            .predicates
            .iter()
            .flat_map(usable_methods)
            .filter(AccessMethod::supports_multicolumn)
            .collect();

        for am in methods {
            let mut served: Vec<&PredicateStats> = group
                .predicates
                .iter()
                .filter(|p| p.access_methods.contains(&am) && am.supports(p.signature.class))
                .collect();
            served.sort_by(|a, b| compare_for_key_order(&am, policy, a, b));

            let mut columns: Vec<String> = Vec::new();
            for p in served {
                if !columns.contains(&p.signature.column) {
                    columns.push(p.signature.column.clone());
                }
            }
            columns.truncate(max_index_columns);
            if columns.len() >= 2 {
                keys.insert((columns, am));
            }
        }
    }

    keys.into_iter()
        .map(|(columns, am)| {
            let mut c = IndexCandidate::new(group.table.clone(), columns, am);
            c.supporting_groups.push(group.id);
            c.execution_count = group.execution_count;
            c.sample_queries = group
                .sample_queries
                .iter()
                .take(max_sample_queries)
                .cloned()
                .collect();
            c
        })
        .collect()
}

fn usable_methods(p: &PredicateStats) -> impl Iterator<Item = AccessMethod> + '_ {
    p.access_methods
        .iter()
        .filter(|am| am.supports(p.signature.class))
        .cloned()
}

/// Key order inside a composite index. For btree, equality columns come before
/// range columns; otherwise the more selective predicate comes first.
fn compare_for_key_order(
    am: &AccessMethod,
    policy: SelectivityPolicy,
    a: &PredicateStats,
    b: &PredicateStats,
) -> Ordering {
    let equality_first = if *am == AccessMethod::Btree {
        let rank = |p: &PredicateStats| (p.signature.class != OperatorClass::Equality) as u8;
        rank(a).cmp(&rank(b))
    } else {
        Ordering::Equal
    };
    equality_first
        .then_with(|| policy.compare(a, b))
        .then_with(|| a.signature.cmp(&b.signature))
}

impl SelectivityPolicy {
    /// `Less` when `a` is more selective than `b`.
    pub fn compare(self, a: &PredicateStats, b: &PredicateStats) -> Ordering {
        match self {
            SelectivityPolicy::FilterRatio => b.filter_ratio().total_cmp(&a.filter_ratio()),
            SelectivityPolicy::DistinctValues => distinct_rank(b).cmp(&distinct_rank(a)).then_with(
                || {
                    let value = |p: &PredicateStats| p.n_distinct.map(f64::abs).unwrap_or(0.0);
                    value(b).total_cmp(&value(a))
                },
            ),
        }
    }
}

/// Negative `n_distinct` (a fraction of the row count) grows with the table and
/// outranks any absolute estimate; unknown statistics rank last.
fn distinct_rank(p: &PredicateStats) -> u8 {
    match p.n_distinct {
        Some(n) if n < 0.0 => 2,
        Some(n) if n > 0.0 => 1,
        _ => 0,
    }
}
