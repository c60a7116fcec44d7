//! The propose/observe protocol shared by every search strategy.

use serde::{Deserialize, Serialize};

use arbor_types::ParameterVector;

/// A parameter vector proposed for evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Zero-based, unique within a strategy.
    pub trial_number: usize,
    pub params: ParameterVector,
}

/// The result of evaluating a candidate, reported back to its strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observation {
    /// Mean loss over all repeats.
    Completed(f64),
    /// The simulation failed; carries the configured failure loss.
    Failed(f64),
    /// Stopped early after `stage` repeats with the partial mean `loss`.
    Pruned { stage: usize, loss: f64 },
}

impl Observation {
    pub fn loss(&self) -> f64 {
        match self {
            Observation::Completed(loss) | Observation::Failed(loss) => *loss,
            Observation::Pruned { loss, .. } => *loss,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Observation::Completed(_))
    }
}

/// Where a strategy is in its propose/observe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPhase {
    /// Nothing proposed yet.
    Initialized,
    /// Ready to hand out candidates.
    Proposing,
    /// Waiting for observations of outstanding candidates.
    Observing,
    Stopped,
}

/// Why a strategy stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxTrials,
    MaxGenerations,
    /// Step size times the largest coordinate deviation fell below tolerance.
    TolX,
    /// Best-of-generation losses stagnated.
    TolFun,
    /// Covariance became too ill-conditioned to continue.
    ConditionCov,
}

/// Common trait for all search strategies.
///
/// A caller repeatedly asks for candidates with [`SearchStrategy::propose`],
/// evaluates them and reports each result with [`SearchStrategy::observe`],
/// until [`SearchStrategy::should_stop`] is true. `propose` returns an empty
/// batch while earlier candidates are still unobserved.
pub trait SearchStrategy: Send {
    /// Human-readable strategy name.
    fn name(&self) -> &str;

    fn phase(&self) -> SearchPhase;

    /// Next batch of candidates to evaluate.
    fn propose(&mut self) -> Vec<Candidate>;

    /// Report the outcome of a proposed candidate.
    fn observe(&mut self, candidate: &Candidate, observation: Observation);

    fn should_stop(&self) -> bool;

    /// Called after `stage` of a candidate's repeats have run, with the mean
    /// loss so far. Returning `true` abandons the candidate.
    fn should_prune(&mut self, _candidate: &Candidate, _stage: usize, _partial_loss: f64) -> bool {
        false
    }

    fn stop_reason(&self) -> Option<StopReason>;
}

/// Trial bookkeeping for strategies that hand out one candidate at a time
/// under a fixed trial budget.
#[derive(Debug, Clone)]
pub(crate) struct TrialBudget {
    pub max_trials: usize,
    pub proposed: usize,
    pub observed: usize,
}

impl TrialBudget {
    pub fn new(max_trials: usize) -> Self {
        Self {
            max_trials,
            proposed: 0,
            observed: 0,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.observed >= self.max_trials
    }

    pub fn outstanding(&self) -> usize {
        self.proposed.saturating_sub(self.observed)
    }

    /// Reserve the next trial number, if the budget and the outstanding
    /// candidate allow one.
    pub fn next_trial(&mut self) -> Option<usize> {
        if self.exhausted() || self.outstanding() > 0 || self.proposed >= self.max_trials {
            return None;
        }
        let trial = self.proposed;
        self.proposed += 1;
        Some(trial)
    }

    pub fn record(&mut self) {
        self.observed += 1;
    }

    pub fn phase(&self) -> SearchPhase {
        if self.exhausted() {
            SearchPhase::Stopped
        } else if self.proposed == 0 {
            SearchPhase::Initialized
        } else if self.outstanding() > 0 {
            SearchPhase::Observing
        } else {
            SearchPhase::Proposing
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.exhausted().then_some(StopReason::MaxTrials)
    }
}
