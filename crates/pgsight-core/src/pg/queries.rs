//! SQL used by the PostgreSQL adapters.

/// Installed index access methods.
pub(super) const ACCESS_METHODS: &str =
    "SELECT amname::text FROM pg_am WHERE amtype = 'i' ORDER BY amname";

/// Databases predicates may be collected from.
pub(super) const DATABASES: &str = "SELECT datname FROM pg_database \
     WHERE NOT datistemplate AND datallowconn \
     ORDER BY datname";

pub(super) const HYPOPG_INSTALLED: &str =
    "SELECT count(*) FROM pg_extension WHERE extname = 'hypopg'";

pub(super) const HYPOPG_RESET: &str = "SELECT hypopg_reset()";

/// Returns the generated name of the hypothetical index.
pub(super) const HYPOPG_CREATE: &str = "SELECT indexname::text FROM hypopg_create_index($1)";

/// Predicate usage of the current database, one row per qual part.
///
/// Operators are resolved to the index access methods having them in an
/// operator family, hash excluded. Statement texts come from
/// `pg_qualstats_example_query()` (pg_qualstats 2.0+, constants included) and
/// from `pg_stat_statements` (normalized), when available.
pub(super) fn build_qualstats_query(has_example_query: bool, has_statements: bool) -> String {
    let example_expr = if has_example_query {
        "pg_qualstats_example_query(q.queryid)"
    } else {
        "NULL::text"
    };
    let normalized_expr = if has_statements {
        "(SELECT s.query FROM pg_stat_statements s \
         WHERE s.queryid = q.queryid AND s.dbid = q.dbid LIMIT 1)"
    } else {
        "NULL::text"
    };

    format!(
        r#"
            SELECT
                q.queryid,
                q.qualid::bigint AS qualid,
                COALESCE(q.lrelid, 0)::bigint AS lrelid,
                ln.nspname::text AS lschema,
                lc.relname::text AS lrelname,
                la.attname::text AS lattname,
                ls.stadistinct::float8 AS l_n_distinct,
                ls.stanullfrac::float8 AS l_null_frac,
                COALESCE(q.rrelid, 0)::bigint AS rrelid,
                rn.nspname::text AS rschema,
                rc.relname::text AS rrelname,
                ra.attname::text AS rattname,
                rs.stadistinct::float8 AS r_n_distinct,
                rs.stanullfrac::float8 AS r_null_frac,
                o.oprname::text AS oprname,
                ARRAY(
                    SELECT DISTINCT am.amname::text
                    FROM pg_amop amop
                    JOIN pg_am am ON am.oid = amop.amopmethod
                    WHERE amop.amopopr = q.opno AND am.amname <> 'hash'
                    ORDER BY 1
                ) AS access_methods,
                sum(q.execution_count)::bigint AS execution_count,
                sum(q.nbfiltered)::bigint AS nbfiltered,
                COALESCE(q.eval_type::text, 'f') AS eval_type,
                {example_expr} AS example_query,
                {normalized_expr} AS normalized_query
            FROM pg_qualstats() q
            LEFT JOIN pg_class lc ON lc.oid = q.lrelid
            LEFT JOIN pg_namespace ln ON ln.oid = lc.relnamespace
            LEFT JOIN pg_attribute la ON la.attrelid = q.lrelid AND la.attnum = q.lattnum
            LEFT JOIN pg_statistic ls ON ls.starelid = q.lrelid
                AND ls.staattnum = q.lattnum AND NOT ls.stainherit
            LEFT JOIN pg_class rc ON rc.oid = q.rrelid
            LEFT JOIN pg_namespace rn ON rn.oid = rc.relnamespace
            LEFT JOIN pg_attribute ra ON ra.attrelid = q.rrelid AND ra.attnum = q.rattnum
            LEFT JOIN pg_statistic rs ON rs.starelid = q.rrelid
                AND rs.staattnum = q.rattnum AND NOT rs.stainherit
            LEFT JOIN pg_operator o ON o.oid = q.opno
            WHERE q.dbid = (SELECT oid FROM pg_database WHERE datname = current_database())
              AND q.queryid IS NOT NULL
            GROUP BY q.dbid, q.opno, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 19
        "#
    )
}

/// Whether `pg_qualstats_example_query()` exists (pg_qualstats 2.0+).
pub(super) const HAS_EXAMPLE_QUERY: &str =
    "SELECT count(*) FROM pg_proc WHERE proname = 'pg_qualstats_example_query'";

pub(super) const HAS_STATEMENTS: &str =
    "SELECT count(*) FROM pg_extension WHERE extname = 'pg_stat_statements'";

/// Constant sets of the current database: the constants of one
/// `uniquequalid`, in query text order, with its counters.
pub(super) const CONSTANT_SETS: &str = r#"
    SELECT
        q.queryid,
        q.qualid::bigint AS qualid,
        array_agg(q.constvalue::text ORDER BY q.constant_position) AS constants,
        max(q.execution_count)::bigint AS execution_count,
        max(q.nbfiltered)::bigint AS nbfiltered
    FROM pg_qualstats() q
    WHERE q.dbid = (SELECT oid FROM pg_database WHERE datname = current_database())
      AND q.queryid IS NOT NULL
      AND q.constvalue IS NOT NULL
    GROUP BY q.userid, q.queryid, q.qualid, q.uniquequalid
"#;

/// `EXPLAIN` prefix for a sample query. Placeholders can only be explained
/// generically, which needs PostgreSQL 16.
pub(super) fn explain_prefix(generic: bool) -> &'static str {
    if generic {
        "EXPLAIN (GENERIC_PLAN) "
    } else {
        "EXPLAIN "
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualstats_query_sample_expression() {
        let both = build_qualstats_query(true, true);
        assert!(both.contains("pg_qualstats_example_query(q.queryid) AS example_query"));
        assert!(both.contains("FROM pg_stat_statements s WHERE s.queryid = q.queryid"));

        let neither = build_qualstats_query(false, false);
        assert!(neither.contains("NULL::text AS example_query"));
        assert!(neither.contains("NULL::text AS normalized_query"));
    }
}
