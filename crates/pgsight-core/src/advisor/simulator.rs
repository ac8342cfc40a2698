//! Hypothetical index simulator interface.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use super::IndexCandidate;

/// Planner estimate for one candidate, over its sample queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimulationResult {
    /// Whether the planner picked the hypothetical index in at least one plan.
    pub index_used: bool,
    /// Total plan cost without the hypothetical index.
    pub base_cost: f64,
    /// Total plan cost with the hypothetical index.
    pub hypo_cost: f64,
}

impl SimulationResult {
    /// Absolute cost saved per execution; never negative.
    pub fn cost_reduction(&self) -> f64 {
        (self.base_cost - self.hypo_cost).max(0.0)
    }

    /// Percentage of the base cost saved, rounded to two decimals.
    pub fn gain_percent(&self) -> f64 {
        if self.base_cost <= 0.0 {
            return 0.0;
        }
        let gain = 100.0 - self.hypo_cost * 100.0 / self.base_cost;
        (gain * 100.0).round() / 100.0
    }
}

/// Error type for a single candidate simulation. Never fatal to a run.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationError {
    /// The simulation backend is not available for this table / database.
    Unavailable(String),
    /// The backend returned an error.
    Backend(String),
    /// No explainable sample query supports the candidate.
    NoSampleQuery,
    /// The simulation did not answer within the configured bound.
    Timeout(Duration),
    /// The simulation thread died without answering.
    Panicked,
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulationError::Unavailable(msg) => write!(f, "simulation unavailable: {}", msg),
            SimulationError::Backend(msg) => write!(f, "simulation backend error: {}", msg),
            SimulationError::NoSampleQuery => write!(f, "no usable sample query"),
            SimulationError::Timeout(d) => write!(f, "simulation timed out after {:?}", d),
            SimulationError::Panicked => write!(f, "simulation thread panicked"),
        }
    }
}

impl std::error::Error for SimulationError {}

/// Estimates whether the planner would use a candidate index and at what cost.
pub trait HypoSimulator: Send + Sync {
    fn simulate(&self, candidate: &IndexCandidate) -> Result<SimulationResult, SimulationError>;
}

/// Runs one simulation on its own thread, waiting at most `timeout`.
///
/// A simulation that outlives the timeout is left to finish in the background;
/// its answer is discarded.
pub(super) fn simulate_bounded(
    simulator: &Arc<dyn HypoSimulator>,
    candidate: &IndexCandidate,
    timeout: Duration,
) -> Result<SimulationResult, SimulationError> {
    let (tx, rx) = mpsc::channel();
    let simulator = Arc::clone(simulator);
    let candidate = candidate.clone();

    thread::Builder::new()
        .name("hypo-sim".to_string())
        .spawn(move || {
            let result = simulator.simulate(&candidate);
            // Receiver is gone after a timeout.
            let _ = tx.send(result);
        })
        .map_err(|e| SimulationError::Backend(format!("failed to spawn simulation: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(SimulationError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(SimulationError::Panicked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_percent_is_rounded() {
        let r = SimulationResult {
            index_used: true,
            base_cost: 300.0,
            hypo_cost: 100.0,
        };
        assert!((r.gain_percent() - 66.67).abs() < 1e-9);
        assert!((r.cost_reduction() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn worse_plan_has_no_reduction() {
        let r = SimulationResult {
            index_used: true,
            base_cost: 10.0,
            hypo_cost: 12.0,
        };
        assert_eq!(r.cost_reduction(), 0.0);
        assert!(r.gain_percent() < 0.0);
    }

    #[test]
    fn zero_base_cost_has_no_gain() {
        let r = SimulationResult {
            index_used: false,
            base_cost: 0.0,
            hypo_cost: 0.0,
        };
        assert_eq!(r.gain_percent(), 0.0);
    }
}
