//! Scoring and ranking of simulated candidates.

use std::cmp::Ordering;

use super::{IndexCandidate, Recommendation, SimulationResult, SimulationStatus};
use crate::qual::QualGroup;

/// Final status of a simulated candidate.
pub(super) fn judge(result: &SimulationResult) -> SimulationStatus {
    if result.index_used && result.cost_reduction() > 0.0 {
        SimulationStatus::Accepted
    } else {
        SimulationStatus::Rejected
    }
}

/// Cost reduction weighted by how often the supporting predicates execute.
pub(super) fn benefit_score(candidate: &IndexCandidate) -> Option<f64> {
    if candidate.status != SimulationStatus::Accepted {
        return None;
    }
    let reduction = candidate.estimated_benefit?;
    Some(reduction * candidate.execution_count.max(0) as f64)
}

/// Recommendations for the accepted candidates, best first.
///
/// Ties on score prefer fewer columns, then order by table, columns and
/// access method so repeated runs agree.
pub(super) fn rank(candidates: &[IndexCandidate], groups: &[QualGroup]) -> Vec<Recommendation> {
    let mut out: Vec<Recommendation> = candidates
        .iter()
        .filter_map(|c| {
            let benefit_score = benefit_score(c)?;
            let supporting_groups = groups
                .iter()
                .filter(|g| c.supporting_groups.contains(&g.id))
                .cloned()
                .collect();
            Some(Recommendation {
                candidate: c.clone(),
                benefit_score,
                supporting_groups,
            })
        })
        .collect();
    out.sort_by(compare);
    out
}

fn compare(a: &Recommendation, b: &Recommendation) -> Ordering {
    b.benefit_score
        .total_cmp(&a.benefit_score)
        .then_with(|| a.candidate.columns.len().cmp(&b.candidate.columns.len()))
        .then_with(|| a.candidate.table.cmp(&b.candidate.table))
        .then_with(|| a.candidate.columns.cmp(&b.candidate.columns))
        .then_with(|| a.candidate.access_method.cmp(&b.candidate.access_method))
}
