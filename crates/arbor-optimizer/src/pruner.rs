//! Median stopping rule for multi-repeat trials.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Prunes a trial whose partial mean loss at stage `k` is worse than the
/// median of completed trials' stage-`k` values.
///
/// Intermediate values are buffered per trial and only join the stage
/// history once that trial completes; failed and pruned trials never
/// contribute to the medians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedianPruner {
    /// Completed trials required before anything is pruned.
    pub n_startup_trials: usize,
    /// Stages below this are never pruned.
    pub n_warmup_stages: usize,
    #[serde(skip)]
    pending: HashMap<usize, Vec<(usize, f64)>>,
    #[serde(skip)]
    history: BTreeMap<usize, Vec<f64>>,
    #[serde(skip)]
    completed: usize,
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self::new(5, 0)
    }
}

impl MedianPruner {
    pub fn new(n_startup_trials: usize, n_warmup_stages: usize) -> Self {
        Self {
            n_startup_trials,
            n_warmup_stages,
            pending: HashMap::new(),
            history: BTreeMap::new(),
            completed: 0,
        }
    }

    pub fn completed_trials(&self) -> usize {
        self.completed
    }

    /// Record `value` for `trial` at `stage` and decide whether to prune it.
    pub fn report(&mut self, trial: usize, stage: usize, value: f64) -> bool {
        self.pending.entry(trial).or_default().push((stage, value));

        if self.completed < self.n_startup_trials || stage < self.n_warmup_stages {
            return false;
        }
        match self.history.get(&stage).and_then(|values| median(values)) {
            Some(m) => value > m,
            None => false,
        }
    }

    /// Move the trial's buffered values into the stage history.
    pub fn complete(&mut self, trial: usize) {
        if let Some(values) = self.pending.remove(&trial) {
            for (stage, value) in values {
                self.history.entry(stage).or_default().push(value);
            }
        }
        self.completed += 1;
    }

    /// Drop the trial's buffered values.
    pub fn discard(&mut self, trial: usize) {
        self.pending.remove(&trial);
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}
