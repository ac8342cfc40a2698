//! Predicate ("qual") usage model.
//!
//! Rows come from `pg_qualstats`: one row per predicate of a normalized
//! statement, resolved against the catalog (relation, column, operator and the
//! index access methods having that operator in an operator family).
//! [`aggregate`] turns them into [`QualGroup`]s for the index advisor.

mod aggregate;

pub use aggregate::{
    AggregationReport, NonOptimizableQual, NonOptimizableReason, QualDiagnostic, aggregate,
};

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::advisor::AccessMethod;

// ============================================================
// Raw rows
// ============================================================

/// Fully qualified relation, including where it lives.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub srvid: i32,
    pub datname: String,
    pub schema: String,
    pub relname: String,
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}.{}", self.datname, self.schema, self.relname)
    }
}

/// One side of a predicate referencing a column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub schema: String,
    pub relname: String,
    pub attname: String,
    /// `pg_stats.n_distinct`: positive = distinct count, negative = fraction of rows.
    #[serde(default)]
    pub n_distinct: Option<f64>,
    #[serde(default)]
    pub null_frac: Option<f64>,
}

impl ColumnRef {
    pub fn new(
        schema: impl Into<String>,
        relname: impl Into<String>,
        attname: impl Into<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            relname: relname.into(),
            attname: attname.into(),
            n_distinct: None,
            null_frac: None,
        }
    }

    fn same_relation(&self, other: &ColumnRef) -> bool {
        self.schema == other.schema && self.relname == other.relname
    }
}

/// Operator of a predicate, with the access methods able to index it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRef {
    pub name: String,
    #[serde(default)]
    pub access_methods: Vec<AccessMethod>,
}

impl OperatorRef {
    pub fn new(name: impl Into<String>, access_methods: Vec<AccessMethod>) -> Self {
        Self {
            name: name.into(),
            access_methods,
        }
    }

    /// Operator whose access methods are inferred from its class.
    pub fn inferred(name: impl Into<String>) -> Self {
        let name = name.into();
        let access_methods = AccessMethod::defaults_for(OperatorClass::from_operator(&name));
        Self {
            name,
            access_methods,
        }
    }

    pub fn class(&self) -> OperatorClass {
        OperatorClass::from_operator(&self.name)
    }
}

/// How the predicate was evaluated in the plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalType {
    /// Evaluated as a filter on fetched rows.
    #[default]
    #[serde(alias = "f")]
    Filter,
    /// Already evaluated by an index scan.
    #[serde(alias = "i")]
    Index,
}

/// One predicate usage record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualUsageRow {
    pub srvid: i32,
    pub datname: String,
    pub queryid: i64,
    /// Identifier of the AND-ed conjunction the predicate belongs to.
    #[serde(default)]
    pub qualid: Option<i64>,
    #[serde(default)]
    pub left: Option<ColumnRef>,
    #[serde(default)]
    pub right: Option<ColumnRef>,
    #[serde(default)]
    pub operator: Option<OperatorRef>,
    pub execution_count: i64,
    #[serde(alias = "nbfiltered")]
    pub filtered_rows: i64,
    #[serde(default)]
    pub eval_type: EvalType,
    /// Example statement text, possibly with `$n` / `?` placeholders.
    #[serde(default)]
    pub sample_query: Option<String>,
    /// Constants recorded for the placeholders of `sample_query`.
    #[serde(default)]
    pub constants: Vec<String>,
    /// Further constant sets worth explaining `sample_query` with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_constants: Vec<Vec<String>>,
}

impl QualUsageRow {
    /// `column op constant` predicate.
    pub fn simple(
        srvid: i32,
        datname: impl Into<String>,
        queryid: i64,
        column: ColumnRef,
        operator: OperatorRef,
        execution_count: i64,
        filtered_rows: i64,
    ) -> Self {
        Self {
            srvid,
            datname: datname.into(),
            queryid,
            qualid: None,
            left: Some(column),
            right: None,
            operator: Some(operator),
            execution_count,
            filtered_rows,
            eval_type: EvalType::Filter,
            sample_query: None,
            constants: Vec::new(),
            other_constants: Vec::new(),
        }
    }

    /// `sample_query` once per recorded constant set.
    pub fn sample_queries(&self) -> Vec<SampleQuery> {
        let Some(text) = &self.sample_query else {
            return Vec::new();
        };
        std::iter::once(&self.constants)
            .chain(&self.other_constants)
            .map(|constants| SampleQuery {
                text: text.clone(),
                constants: constants.clone(),
            })
            .collect()
    }
}

// ============================================================
// Classification
// ============================================================

/// Normalized operator family, independent of data type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorClass {
    /// `=`
    Equality,
    /// `<`, `<=`, `>`, `>=`
    Range,
    /// `~~` (LIKE), `~~*` (ILIKE), `~`, `~*`, `^@`
    Pattern,
    /// `@>`, `<@`, `&&`, `?`, `?|`, `?&`, `@@`
    Containment,
    /// `<>`, `!=`
    Inequality,
    Unsupported,
}

impl OperatorClass {
    pub fn from_operator(name: &str) -> Self {
        match name.trim() {
            "=" => OperatorClass::Equality,
            "<" | "<=" | ">" | ">=" => OperatorClass::Range,
            "~~" | "~~*" | "~" | "~*" | "^@" => OperatorClass::Pattern,
            "@>" | "<@" | "&&" | "?" | "?|" | "?&" | "@@" => OperatorClass::Containment,
            "<>" | "!=" => OperatorClass::Inequality,
            _ => OperatorClass::Unsupported,
        }
    }
}

/// Column + operator: the identity of a predicate inside a group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PredicateSignature {
    pub column: String,
    pub operator: String,
    pub class: OperatorClass,
}

impl std::fmt::Display for PredicateSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ?", self.column, self.operator)
    }
}

/// Usage statistics of one predicate, summed over the rows merged into it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PredicateStats {
    pub signature: PredicateSignature,
    pub access_methods: BTreeSet<AccessMethod>,
    pub execution_count: i64,
    pub filtered_rows: i64,
    pub n_distinct: Option<f64>,
    pub null_frac: Option<f64>,
}

impl PredicateStats {
    /// Rows removed per execution; 0 when never executed.
    pub fn filter_ratio(&self) -> f64 {
        if self.execution_count <= 0 {
            0.0
        } else {
            self.filtered_rows as f64 / self.execution_count as f64
        }
    }

    fn merge(&mut self, other: &PredicateStats) {
        self.execution_count += other.execution_count;
        self.filtered_rows += other.filtered_rows;
        self.access_methods
            .extend(other.access_methods.iter().cloned());
        self.n_distinct = self.n_distinct.or(other.n_distinct);
        self.null_frac = self.null_frac.or(other.null_frac);
    }
}

/// Example statement for hypothetical plan comparison.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SampleQuery {
    pub text: String,
    #[serde(default)]
    pub constants: Vec<String>,
}

impl SampleQuery {
    /// Query text with placeholders replaced by the recorded constants, and
    /// what kind of placeholder is left unfilled.
    ///
    /// `$n` takes the n-th constant. Texts without `$n` placeholders are treated
    /// as jumbled with `?`, filled in order. Quoted literals are left alone.
    pub fn render(&self) -> (String, Unfilled) {
        let has_numbered = placeholder_spans(&self.text, Placeholder::Numbered).next().is_some();
        let kind = if has_numbered {
            Placeholder::Numbered
        } else {
            Placeholder::Positional
        };

        let mut out = String::with_capacity(self.text.len());
        let mut complete = true;
        let mut last = 0;
        for (i, (start, end, number)) in placeholder_spans(&self.text, kind).enumerate() {
            out.push_str(&self.text[last..start]);
            let index = number.map(|n| n.saturating_sub(1)).unwrap_or(i);
            match self.constants.get(index) {
                Some(value) => out.push_str(value),
                None => {
                    complete = false;
                    out.push_str(&self.text[start..end]);
                }
            }
            last = end;
        }
        out.push_str(&self.text[last..]);

        let unfilled = match (complete, kind) {
            (true, _) => Unfilled::Nothing,
            (false, Placeholder::Numbered) => Unfilled::Parameters,
            (false, Placeholder::Positional) => Unfilled::Jumbled,
        };
        (out, unfilled)
    }
}

/// Placeholders a rendered [`SampleQuery`] still holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unfilled {
    Nothing,
    /// `$n` parameters; only a generic plan can be explained.
    Parameters,
    /// `?` marks, which the server does not accept as parameters.
    Jumbled,
}

#[derive(Clone, Copy, PartialEq)]
enum Placeholder {
    /// `$1`, `$2`, ...
    Numbered,
    /// `?`
    Positional,
}

/// Byte spans of placeholders outside single-quoted literals.
fn placeholder_spans(
    text: &str,
    kind: Placeholder,
) -> impl Iterator<Item = (usize, usize, Option<usize>)> + '_ {
    let bytes = text.as_bytes();
    let mut i = 0;
    let mut in_quote = false;
    std::iter::from_fn(move || {
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'\'' {
                in_quote = !in_quote;
                i += 1;
                continue;
            }
            if in_quote {
                i += 1;
                continue;
            }
            match (kind, b) {
                (Placeholder::Numbered, b'$') => {
                    let start = i;
                    let mut end = i + 1;
                    while end < bytes.len() && bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                    i = end;
                    if end > start + 1 {
                        let number = text[start + 1..end].parse().ok();
                        return Some((start, end, number));
                    }
                }
                (Placeholder::Positional, b'?') => {
                    i += 1;
                    return Some((i - 1, i, None));
                }
                _ => i += 1,
            }
        }
        None
    })
}

/// Stable identifier of a qual group (hash of table + signatures).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualGroupId(pub u64);

impl QualGroupId {
    fn compute(table: &TableId, signatures: &[PredicateSignature]) -> Self {
        let mut key = format!("{}|{}", table.srvid, table);
        for s in signatures {
            key.push('|');
            key.push_str(&s.to_string());
        }
        QualGroupId(xxh3_64(key.as_bytes()))
    }
}

impl std::fmt::Display for QualGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Predicates observed together on one table, merged across statements.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QualGroup {
    pub id: QualGroupId,
    pub table: TableId,
    /// Sorted by signature; one entry per distinct predicate.
    pub predicates: Vec<PredicateStats>,
    pub execution_count: i64,
    pub filtered_rows: i64,
    pub queryids: BTreeSet<i64>,
    pub sample_queries: Vec<SampleQuery>,
}

impl QualGroup {
    pub fn signatures(&self) -> impl Iterator<Item = &PredicateSignature> {
        self.predicates.iter().map(|p| &p.signature)
    }

    /// `WHERE a = ? AND b < ?` rendering of the group.
    pub fn where_clause(&self) -> String {
        let parts: Vec<String> = self.signatures().map(|s| s.to_string()).collect();
        format!("WHERE {}", parts.join(" AND "))
    }
}

// ============================================================
// Scope
// ============================================================

/// What part of the workload an aggregation / advisor run covers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    /// Every database of a server (workload-wide).
    Server { srvid: i32 },
    Database { srvid: i32, datname: String },
    Query {
        srvid: i32,
        datname: String,
        queryid: i64,
    },
}

impl Scope {
    pub fn srvid(&self) -> i32 {
        match self {
            Scope::Server { srvid } | Scope::Database { srvid, .. } | Scope::Query { srvid, .. } => {
                *srvid
            }
        }
    }

    pub fn contains(&self, row: &QualUsageRow) -> bool {
        match self {
            Scope::Server { srvid } => row.srvid == *srvid,
            Scope::Database { srvid, datname } => row.srvid == *srvid && row.datname == *datname,
            Scope::Query {
                srvid,
                datname,
                queryid,
            } => row.srvid == *srvid && row.datname == *datname && row.queryid == *queryid,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Server { srvid } => write!(f, "server {}", srvid),
            Scope::Database { srvid, datname } => write!(f, "database {} on server {}", datname, srvid),
            Scope::Query {
                srvid,
                datname,
                queryid,
            } => write!(f, "query {} in {} on server {}", queryid, datname, srvid),
        }
    }
}
