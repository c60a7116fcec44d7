//! Trial tracking and calibration run status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use arbor_types::{FeatureSet, ParameterVector};

use crate::strategy::{Observation, StopReason};

/// Unique calibration run identifier.
pub type CalibrationId = Uuid;

/// Lifecycle state for a calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialOutcome {
    Completed,
    Failed,
    Pruned,
}

/// What a single simulator call produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationOutcome {
    Simulated(FeatureSet),
    Failed { error: String },
}

/// One simulator call made while evaluating a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRecord {
    pub repeat: usize,
    pub seed: u64,
    pub outcome: SimulationOutcome,
    /// Score of the features, or the failure loss.
    pub loss: f64,
}

impl SimulationRecord {
    pub fn simulated(repeat: usize, seed: u64, features: FeatureSet, loss: f64) -> Self {
        Self {
            repeat,
            seed,
            outcome: SimulationOutcome::Simulated(features),
            loss,
        }
    }

    pub fn failed(repeat: usize, seed: u64, error: String, loss: f64) -> Self {
        Self {
            repeat,
            seed,
            outcome: SimulationOutcome::Failed { error },
            loss,
        }
    }

    pub fn features(&self) -> Option<&FeatureSet> {
        match &self.outcome {
            SimulationOutcome::Simulated(features) => Some(features),
            SimulationOutcome::Failed { .. } => None,
        }
    }
}

/// One evaluated candidate: the simulator calls made for it and their
/// aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_number: usize,
    pub params: ParameterVector,
    pub outcome: TrialOutcome,
    /// Mean loss over the repeats that ran, or the failure loss. For a
    /// pruned trial this is the partial mean at the pruning stage.
    pub loss: f64,
    pub repeats_run: usize,
    pub error: Option<String>,
    pub simulations: Vec<SimulationRecord>,
    pub finished_at: DateTime<Utc>,
}

fn mean_loss(simulations: &[SimulationRecord]) -> f64 {
    if simulations.is_empty() {
        return f64::NAN;
    }
    simulations.iter().map(|s| s.loss).sum::<f64>() / simulations.len() as f64
}

impl TrialRecord {
    pub fn completed(
        trial_number: usize,
        params: ParameterVector,
        simulations: Vec<SimulationRecord>,
    ) -> Self {
        Self {
            trial_number,
            params,
            outcome: TrialOutcome::Completed,
            loss: mean_loss(&simulations),
            repeats_run: simulations.len(),
            error: None,
            simulations,
            finished_at: Utc::now(),
        }
    }

    /// A candidate whose last simulator call failed. `simulations` includes
    /// that failed call.
    pub fn failed(
        trial_number: usize,
        params: ParameterVector,
        loss: f64,
        error: String,
        simulations: Vec<SimulationRecord>,
    ) -> Self {
        Self {
            trial_number,
            params,
            outcome: TrialOutcome::Failed,
            loss,
            repeats_run: simulations.len(),
            error: Some(error),
            simulations,
            finished_at: Utc::now(),
        }
    }

    /// A candidate stopped after `simulations.len()` repeats.
    pub fn pruned(
        trial_number: usize,
        params: ParameterVector,
        simulations: Vec<SimulationRecord>,
    ) -> Self {
        Self {
            trial_number,
            params,
            outcome: TrialOutcome::Pruned,
            loss: mean_loss(&simulations),
            repeats_run: simulations.len(),
            error: None,
            simulations,
            finished_at: Utc::now(),
        }
    }

    /// Features of the first successful simulator call.
    pub fn first_features(&self) -> Option<&FeatureSet> {
        self.simulations.iter().find_map(SimulationRecord::features)
    }

    /// The observation reported to the search strategy for this trial.
    pub fn observation(&self) -> Observation {
        match self.outcome {
            TrialOutcome::Completed => Observation::Completed(self.loss),
            TrialOutcome::Failed => Observation::Failed(self.loss),
            TrialOutcome::Pruned => Observation::Pruned {
                stage: self.repeats_run,
                loss: self.loss,
            },
        }
    }
}

/// Aggregate status of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStatus {
    pub id: CalibrationId,
    pub strategy: String,
    pub state: CalibrationState,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub trials_pruned: usize,
    pub best_trial: Option<TrialRecord>,
    /// Best loss after each trial that followed the first completed one.
    pub best_loss_history: Vec<f64>,
    pub stop_reason: Option<StopReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl CalibrationStatus {
    pub fn new(id: CalibrationId, strategy: impl Into<String>) -> Self {
        Self {
            id,
            strategy: strategy.into(),
            state: CalibrationState::Pending,
            trials_completed: 0,
            trials_failed: 0,
            trials_pruned: 0,
            best_trial: None,
            best_loss_history: Vec::new(),
            stop_reason: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = CalibrationState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, stop_reason: Option<StopReason>) {
        self.state = CalibrationState::Completed;
        self.stop_reason = stop_reason;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = CalibrationState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn trials_total(&self) -> usize {
        self.trials_completed + self.trials_failed + self.trials_pruned
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_trial.as_ref().map(|t| t.loss)
    }

    /// Count `record` and update the best trial. Returns `true` if it became
    /// the new best.
    pub fn record(&mut self, record: &TrialRecord) -> bool {
        match record.outcome {
            TrialOutcome::Completed => self.trials_completed += 1,
            TrialOutcome::Failed => self.trials_failed += 1,
            TrialOutcome::Pruned => self.trials_pruned += 1,
        }
        let improved = self.update_best(record);
        if let Some(best) = self.best_loss() {
            self.best_loss_history.push(best);
        }
        improved
    }

    /// Replace the best trial if `record` completed with a strictly lower
    /// loss.
    pub fn update_best(&mut self, record: &TrialRecord) -> bool {
        if record.outcome != TrialOutcome::Completed || !record.loss.is_finite() {
            return false;
        }
        let better = match &self.best_trial {
            None => true,
            Some(best) => record.loss < best.loss,
        };
        if better {
            self.best_trial = Some(record.clone());
        }
        better
    }
}
