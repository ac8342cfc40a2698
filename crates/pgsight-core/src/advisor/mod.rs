//! Workload-wide index advisor.
//!
//! Per run:
//! 1. Qual rows are aggregated into predicate groups (see [`crate::qual`]).
//! 2. Each group proposes single-column and composite candidates.
//! 3. Identical candidates are merged; their supporting groups accumulate.
//! 4. Candidates using an access method the server lacks are dropped.
//! 5. Every remaining candidate is simulated on its own bounded thread.
//!    Failures only mark that candidate.
//! 6. Accepted candidates are scored and ranked.
//!
//! The advisor holds no state between runs.

mod access_method;
mod candidates;
mod rank;
mod simulator;

pub use access_method::{AccessMethod, CapabilitySet};
pub use candidates::{IndexCandidate, SimulationStatus, quote_ident};
pub use simulator::{HypoSimulator, SimulationError, SimulationResult};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::qual::{
    AggregationReport, NonOptimizableQual, QualDiagnostic, QualGroup, QualUsageRow, Scope,
    aggregate,
};
use crate::store::{CapabilityProvider, QualSource, StoreError};
use candidates::{CandidateKey, propose};
use simulator::simulate_bounded;

/// Default bound on a single candidate simulation.
pub const DEFAULT_SIMULATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Statistic used to order the key columns of composite candidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectivityPolicy {
    /// Rows filtered per execution, highest first.
    #[default]
    FilterRatio,
    /// `pg_stats.n_distinct`, highest first.
    DistinctValues,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AdvisorConfig {
    pub simulation_timeout: Duration,
    /// Composite candidates never exceed this many columns.
    pub max_index_columns: usize,
    pub selectivity: SelectivityPolicy,
    /// Sample queries handed to the simulator per candidate.
    pub max_sample_queries: usize,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            simulation_timeout: DEFAULT_SIMULATION_TIMEOUT,
            max_index_columns: 4,
            selectivity: SelectivityPolicy::FilterRatio,
            max_sample_queries: 3,
        }
    }
}

/// Cooperative cancellation flag, checked between candidates.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Error type for an advisor run.
#[derive(Debug, Clone, PartialEq)]
pub enum AdviseError {
    /// Qual rows or capabilities could not be fetched.
    Store(StoreError),
    /// The run was cancelled; partial results were discarded.
    Cancelled,
}

impl std::fmt::Display for AdviseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdviseError::Store(e) => write!(f, "{}", e),
            AdviseError::Cancelled => write!(f, "advisor run cancelled"),
        }
    }
}

impl std::error::Error for AdviseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdviseError::Store(e) => Some(e),
            AdviseError::Cancelled => None,
        }
    }
}

impl From<StoreError> for AdviseError {
    fn from(e: StoreError) -> Self {
        AdviseError::Store(e)
    }
}

/// An accepted candidate with its score and the groups it serves.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recommendation {
    pub candidate: IndexCandidate,
    pub benefit_score: f64,
    pub supporting_groups: Vec<QualGroup>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AdvisorStats {
    pub groups: usize,
    pub already_indexed: usize,
    pub proposed: usize,
    pub dropped_unsupported: usize,
    pub simulated: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// Everything an advisor run produced.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AdvisorReport {
    pub scope: Scope,
    /// Best first.
    pub recommendations: Vec<Recommendation>,
    /// Every simulated candidate with its final status.
    pub candidates: Vec<IndexCandidate>,
    pub non_optimizable: Vec<NonOptimizableQual>,
    pub diagnostics: Vec<QualDiagnostic>,
    pub stats: AdvisorStats,
}

/// Index advisor bound to a simulator.
pub struct IndexAdvisor {
    simulator: Arc<dyn HypoSimulator>,
    config: AdvisorConfig,
}

impl IndexAdvisor {
    pub fn new(simulator: Arc<dyn HypoSimulator>, config: AdvisorConfig) -> Self {
        Self { simulator, config }
    }

    pub fn config(&self) -> &AdvisorConfig {
        &self.config
    }

    /// Fetches qual rows and capabilities once, then runs [`Self::advise`].
    pub fn advise_from<S>(
        &self,
        store: &S,
        scope: &Scope,
        cancel: &CancelToken,
    ) -> Result<AdvisorReport, AdviseError>
    where
        S: QualSource + CapabilityProvider + ?Sized,
    {
        let rows = store.fetch_qual_rows(scope)?;
        let capabilities = store.supported_access_methods(scope.srvid())?;
        self.advise(scope, &rows, &capabilities, cancel)
    }

    /// Ranked recommendations for the qual rows of `scope`.
    ///
    /// Simulation failures never fail the run. The result is empty, not an
    /// error, when no group exists or no candidate is accepted.
    pub fn advise(
        &self,
        scope: &Scope,
        rows: &[QualUsageRow],
        capabilities: &CapabilitySet,
        cancel: &CancelToken,
    ) -> Result<AdvisorReport, AdviseError> {
        let AggregationReport {
            groups,
            non_optimizable,
            diagnostics,
            already_indexed,
        } = aggregate(rows, scope);

        let mut report = self.advise_groups(scope, &groups, capabilities, cancel)?;
        report.non_optimizable = non_optimizable;
        report.diagnostics = diagnostics;
        report.stats.already_indexed = already_indexed;
        Ok(report)
    }

    /// Ranked recommendations for already aggregated groups. Groups outside
    /// `scope` are ignored.
    pub fn advise_groups(
        &self,
        scope: &Scope,
        groups: &[QualGroup],
        capabilities: &CapabilitySet,
        cancel: &CancelToken,
    ) -> Result<AdvisorReport, AdviseError> {
        let groups: Vec<QualGroup> = groups
            .iter()
            .filter(|g| group_in_scope(scope, g))
            .cloned()
            .collect();
        let mut stats = AdvisorStats {
            groups: groups.len(),
            ..Default::default()
        };

        // Propose + deduplicate.
        let mut merged: BTreeMap<CandidateKey, IndexCandidate> = BTreeMap::new();
        for group in &groups {
            for candidate in propose(
                group,
                self.config.selectivity,
                self.config.max_index_columns,
                self.config.max_sample_queries,
            ) {
                stats.proposed += 1;
                match merged.get_mut(&candidate.key()) {
                    Some(existing) => existing.absorb(candidate, self.config.max_sample_queries),
                    None => {
                        merged.insert(candidate.key(), candidate);
                    }
                }
            }
        }

        // Capability filter, before any simulation.
        let mut candidates: Vec<IndexCandidate> = Vec::with_capacity(merged.len());
        for candidate in merged.into_values() {
            if capabilities.contains(&candidate.access_method) {
                candidates.push(candidate);
            } else {
                debug!(
                    ddl = %candidate.ddl(),
                    access_method = %candidate.access_method,
                    "access method not installed, dropping candidate"
                );
                stats.dropped_unsupported += 1;
            }
        }

        // Simulate.
        for candidate in &mut candidates {
            if cancel.is_cancelled() {
                info!(scope = %scope, "advisor run cancelled");
                return Err(AdviseError::Cancelled);
            }
            stats.simulated += 1;
            match simulate_bounded(&self.simulator, candidate, self.config.simulation_timeout) {
                Ok(result) => {
                    candidate.status = rank::judge(&result);
                    if candidate.status == SimulationStatus::Accepted {
                        candidate.estimated_benefit = Some(result.cost_reduction());
                        stats.accepted += 1;
                    } else {
                        stats.rejected += 1;
                    }
                    candidate.simulation = Some(result);
                    debug!(
                        ddl = %candidate.ddl(),
                        status = ?candidate.status,
                        gain_percent = result.gain_percent(),
                        "candidate simulated"
                    );
                }
                Err(e) => {
                    warn!(ddl = %candidate.ddl(), error = %e, "index simulation failed");
                    candidate.status = SimulationStatus::SimulationFailed;
                    candidate.failure = Some(e.to_string());
                    stats.failed += 1;
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(AdviseError::Cancelled);
        }

        let recommendations = rank::rank(&candidates, &groups);
        info!(
            scope = %scope,
            groups = stats.groups,
            candidates = candidates.len(),
            accepted = stats.accepted,
            failed = stats.failed,
            "index advisor run finished"
        );

        Ok(AdvisorReport {
            scope: scope.clone(),
            recommendations,
            candidates,
            non_optimizable: Vec::new(),
            diagnostics: Vec::new(),
            stats,
        })
    }
}

fn group_in_scope(scope: &Scope, group: &QualGroup) -> bool {
    match scope {
        Scope::Server { srvid } => group.table.srvid == *srvid,
        Scope::Database { srvid, datname } => {
            group.table.srvid == *srvid && group.table.datname == *datname
        }
        Scope::Query {
            srvid,
            datname,
            queryid,
        } => {
            group.table.srvid == *srvid
                && group.table.datname == *datname
                && group.queryids.contains(queryid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qual::{ColumnRef, OperatorRef};
    use crate::store::MemoryStore;

    /// Simulator answering from a table keyed by `ddl()`.
    struct Scripted {
        answers: BTreeMap<String, Result<SimulationResult, SimulationError>>,
    }

    impl Scripted {
        fn new(answers: Vec<(&str, Result<SimulationResult, SimulationError>)>) -> Arc<Self> {
            Arc::new(Self {
                answers: answers
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            })
        }
    }

    impl HypoSimulator for Scripted {
        fn simulate(&self, c: &IndexCandidate) -> Result<SimulationResult, SimulationError> {
            self.answers
                .get(&c.ddl())
                .cloned()
                .unwrap_or(Ok(SimulationResult {
                    index_used: false,
                    base_cost: 100.0,
                    hypo_cost: 100.0,
                }))
        }
    }

    fn used(base: f64, hypo: f64) -> Result<SimulationResult, SimulationError> {
        Ok(SimulationResult {
            index_used: true,
            base_cost: base,
            hypo_cost: hypo,
        })
    }

    fn row(queryid: i64, col: &str, op: &str) -> QualUsageRow {
        QualUsageRow::simple(
            1,
            "app",
            queryid,
            ColumnRef::new("public", "t", col),
            OperatorRef::inferred(op),
            1000,
            500,
        )
    }

    const A: &str = "CREATE INDEX ON \"public\".\"t\" USING btree (\"a\")";
    const B: &str = "CREATE INDEX ON \"public\".\"t\" USING btree (\"b\")";
    const AB: &str = "CREATE INDEX ON \"public\".\"t\" USING btree (\"a\", \"b\")";

    fn scope() -> Scope {
        Scope::Server { srvid: 1 }
    }

    #[test]
    fn failure_only_marks_its_candidate() {
        let sim = Scripted::new(vec![
            (A, Err(SimulationError::Backend("boom".into()))),
            (B, used(100.0, 40.0)),
            (AB, Err(SimulationError::Unavailable("no hypopg".into()))),
        ]);
        let advisor = IndexAdvisor::new(sim, AdvisorConfig::default());
        let report = advisor
            .advise(
                &scope(),
                &[row(1, "a", "="), row(1, "b", "=")],
                &CapabilitySet::builtin(),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(report.recommendations.len(), 1);
        assert_eq!(report.recommendations[0].candidate.ddl(), B);
        assert_eq!(report.stats.failed, 2);
        assert_eq!(report.stats.simulated, 3);
        let failed: Vec<_> = report
            .candidates
            .iter()
            .filter(|c| c.status == SimulationStatus::SimulationFailed)
            .collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|c| c.failure.is_some()));
    }

    #[test]
    fn unsupported_methods_are_dropped_before_simulation() {
        let sim = Scripted::new(vec![(A, used(100.0, 10.0))]);
        let advisor = IndexAdvisor::new(sim, AdvisorConfig::default());
        let report = advisor
            .advise(
                &scope(),
                &[row(1, "a", "=")],
                &CapabilitySet::new([AccessMethod::Gin]),
                &CancelToken::new(),
            )
            .unwrap();
        assert!(report.recommendations.is_empty());
        assert_eq!(report.stats.dropped_unsupported, 1);
        assert_eq!(report.stats.simulated, 0);
    }

    #[test]
    fn duplicate_candidates_accumulate_groups() {
        let sim = Scripted::new(vec![(A, used(10.0, 5.0))]);
        let advisor = IndexAdvisor::new(sim, AdvisorConfig::default());
        // {a} and {a, b} are different groups, both proposing btree(a)
        let rows = vec![row(1, "a", "="), row(2, "a", "="), row(2, "b", "=")];
        let report = advisor
            .advise(&scope(), &rows, &CapabilitySet::builtin(), &CancelToken::new())
            .unwrap();
        let rec = &report.recommendations[0];
        assert_eq!(rec.candidate.ddl(), A);
        assert_eq!(rec.supporting_groups.len(), 2);
        // 1000 + 1000 executions, 5.0 saved each
        assert!((rec.benefit_score - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn cancelled_run_returns_nothing() {
        let sim = Scripted::new(vec![]);
        let advisor = IndexAdvisor::new(sim, AdvisorConfig::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = advisor
            .advise(&scope(), &[row(1, "a", "=")], &CapabilitySet::builtin(), &cancel)
            .unwrap_err();
        assert_eq!(err, AdviseError::Cancelled);
    }

    #[test]
    fn no_groups_is_an_empty_report() {
        let sim = Scripted::new(vec![]);
        let advisor = IndexAdvisor::new(sim, AdvisorConfig::default());
        let report = advisor
            .advise(&scope(), &[row(1, "a", "<>")], &CapabilitySet::builtin(), &CancelToken::new())
            .unwrap();
        assert!(report.recommendations.is_empty());
        assert!(report.candidates.is_empty());
        assert_eq!(report.non_optimizable.len(), 1);
    }

    #[test]
    fn query_scope_limits_groups() {
        let sim = Scripted::new(vec![(A, used(10.0, 1.0)), (B, used(10.0, 1.0))]);
        let advisor = IndexAdvisor::new(sim, AdvisorConfig::default());
        let scope = Scope::Query {
            srvid: 1,
            datname: "app".into(),
            queryid: 2,
        };
        let report = advisor
            .advise(
                &scope,
                &[row(1, "a", "="), row(2, "b", "=")],
                &CapabilitySet::builtin(),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(report.recommendations.len(), 1);
        assert_eq!(report.recommendations[0].candidate.ddl(), B);
    }

    #[test]
    fn composite_outranks_singles_when_cheaper() {
        let sim = Scripted::new(vec![
            (A, used(100.0, 60.0)),
            (B, used(100.0, 70.0)),
            (AB, used(100.0, 10.0)),
        ]);
        let advisor = IndexAdvisor::new(sim, AdvisorConfig::default());
        let report = advisor
            .advise(
                &scope(),
                &[row(1, "a", "="), row(1, "b", "=")],
                &CapabilitySet::builtin(),
                &CancelToken::new(),
            )
            .unwrap();
        let ddls: Vec<String> = report
            .recommendations
            .iter()
            .map(|r| r.candidate.ddl())
            .collect();
        assert_eq!(ddls, vec![AB, A, B]);
        let top = &report.recommendations[0];
        assert_eq!(top.candidate.columns, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(top.candidate.estimated_benefit, Some(90.0));
    }

    #[test]
    fn advise_from_reads_the_store() {
        let mut store = MemoryStore::new();
        store.extend_qual_rows(vec![row(1, "a", "=")]);
        let sim = Scripted::new(vec![(A, used(100.0, 20.0))]);
        let advisor = IndexAdvisor::new(sim, AdvisorConfig::default());
        let report = advisor
            .advise_from(&store, &scope(), &CancelToken::new())
            .unwrap();
        assert_eq!(report.recommendations.len(), 1);
        assert_eq!(report.recommendations[0].candidate.ddl(), A);
    }

    #[test]
    fn advise_from_propagates_store_failure() {
        let mut store = MemoryStore::new();
        store.extend_qual_rows(vec![row(1, "a", "=")]);
        store.set_offline(true);
        let advisor = IndexAdvisor::new(Scripted::new(vec![]), AdvisorConfig::default());
        let err = advisor
            .advise_from(&store, &scope(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, AdviseError::Store(StoreError::Unavailable(_))));
    }

    struct Slow;

    impl HypoSimulator for Slow {
        fn simulate(&self, _c: &IndexCandidate) -> Result<SimulationResult, SimulationError> {
            std::thread::sleep(Duration::from_millis(500));
            used(10.0, 1.0)
        }
    }

    #[test]
    fn slow_simulation_times_out() {
        let config = AdvisorConfig {
            simulation_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let advisor = IndexAdvisor::new(Arc::new(Slow), config);
        let report = advisor
            .advise(&scope(), &[row(1, "a", "=")], &CapabilitySet::builtin(), &CancelToken::new())
            .unwrap();
        assert!(report.recommendations.is_empty());
        assert_eq!(report.candidates[0].status, SimulationStatus::SimulationFailed);
        assert!(report.candidates[0].failure.as_deref().unwrap().contains("timed out"));
    }

    #[test]
    fn default_config() {
        let config = AdvisorConfig::default();
        assert_eq!(config.simulation_timeout, Duration::from_secs(5));
        assert_eq!(config.max_index_columns, 4);
        assert_eq!(config.selectivity, SelectivityPolicy::FilterRatio);
    }
}
