//! Sequential model-based search with a tree-structured Parzen estimator.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

use crate::pruner::MedianPruner;
use crate::space::ParameterSpace;
use crate::strategy::{Candidate, Observation, SearchPhase, SearchStrategy, StopReason, TrialBudget};

/// Tunables for [`SequentialModelBased`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBasedSettings {
    pub max_trials: usize,
    /// Random trials before the density models take over.
    pub n_startup: usize,
    /// Draws from the good-set model scored per proposal.
    pub n_candidates: usize,
    /// Fraction of the history treated as good.
    pub gamma: f64,
    /// Upper bound on the good-set size.
    pub max_good: usize,
    pub pruner: Option<MedianPruner>,
}

impl Default for ModelBasedSettings {
    fn default() -> Self {
        Self {
            max_trials: 200,
            n_startup: 10,
            n_candidates: 24,
            gamma: 0.1,
            max_good: 25,
            pruner: None,
        }
    }
}

impl ModelBasedSettings {
    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = n;
        self
    }

    pub fn with_startup(mut self, n: usize) -> Self {
        self.n_startup = n;
        self
    }

    pub fn with_pruner(mut self, pruner: MedianPruner) -> Self {
        self.pruner = Some(pruner);
        self
    }
}

const PRIOR_MEAN: f64 = 0.5;
const PRIOR_SIGMA: f64 = 1.0;
const MIN_BANDWIDTH: f64 = 0.03;
const MAX_BANDWIDTH: f64 = 1.0;
const MAX_REJECTIONS: usize = 16;

/// One-dimensional Gaussian mixture over `[0, 1]`: a broad prior component
/// plus one kernel per observed coordinate, equally weighted.
#[derive(Debug, Clone)]
struct Parzen {
    components: Vec<(f64, f64)>,
}

impl Parzen {
    fn fit(values: &[f64]) -> Self {
        let n = values.len();
        let bandwidth = if n == 0 {
            MAX_BANDWIDTH
        } else {
            let std = if n > 1 {
                let mean = values.iter().sum::<f64>() / n as f64;
                (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt()
            } else {
                0.5
            };
            (1.06 * std * (n as f64).powf(-0.2)).clamp(MIN_BANDWIDTH, MAX_BANDWIDTH)
        };

        let mut components = Vec::with_capacity(n + 1);
        components.push((PRIOR_MEAN, PRIOR_SIGMA));
        components.extend(values.iter().map(|v| (*v, bandwidth)));
        Self { components }
    }

    fn log_pdf(&self, x: f64) -> f64 {
        let density: f64 = self
            .components
            .iter()
            .map(|(mu, sigma)| {
                let z = (x - mu) / sigma;
                (-0.5 * z * z).exp() / (sigma * (2.0 * PI).sqrt())
            })
            .sum();
        (density / self.components.len() as f64).ln()
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let (mu, sigma) = self.components[rng.gen_range(0..self.components.len())];
        let mut x = mu;
        for _ in 0..MAX_REJECTIONS {
            let z: f64 = rng.sample(StandardNormal);
            x = mu + sigma * z;
            if (0.0..=1.0).contains(&x) {
                return x;
            }
        }
        x.clamp(0.0, 1.0)
    }
}

/// Tree-structured Parzen estimator search, one candidate per proposal.
///
/// After `n_startup` random trials, the history is split into a good set
/// (the best `gamma` fraction, capped at `max_good`) and a bad set. Each
/// proposal draws `n_candidates` points from the good-set density and keeps
/// the one maximizing `log l(x) - log g(x)`.
#[derive(Debug, Clone)]
struct Observed {
    unit: Vec<f64>,
    loss: f64,
    /// Sorted after every finished trial.
    pruned: bool,
}

#[derive(Debug, Clone)]
pub struct SequentialModelBased {
    space: ParameterSpace,
    settings: ModelBasedSettings,
    rng: ChaCha8Rng,
    budget: TrialBudget,
    history: Vec<Observed>,
    pruner: Option<MedianPruner>,
}

impl SequentialModelBased {
    pub fn new(space: ParameterSpace, mut settings: ModelBasedSettings, seed: u64) -> Self {
        let pruner = settings.pruner.take();
        Self {
            budget: TrialBudget::new(settings.max_trials),
            rng: ChaCha8Rng::seed_from_u64(seed),
            history: Vec::new(),
            pruner,
            space,
            settings,
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn good_set_size(&self) -> usize {
        let n = self.history.len();
        ((self.settings.gamma * n as f64).ceil() as usize)
            .min(self.settings.max_good)
            .max(1)
    }

    /// History sorted by loss and split into good and bad sets. Pruned
    /// trials only ever land in the bad set.
    fn split_history(&self) -> (Vec<&Observed>, Vec<&Observed>) {
        let mut sorted: Vec<&Observed> = self.history.iter().collect();
        sorted.sort_by(|a, b| a.pruned.cmp(&b.pruned).then(a.loss.total_cmp(&b.loss)));
        let finished = sorted.iter().filter(|o| !o.pruned).count();
        let bad = sorted.split_off(self.good_set_size().min(finished));
        (sorted, bad)
    }

    /// Best candidate under the current density ratio, in unit coordinates.
    fn suggest_unit(&mut self) -> Vec<f64> {
        let dims = self.space.len();
        let (l, g) = {
            let (good, bad) = self.split_history();
            let column = |set: &[&Observed], d: usize| -> Vec<f64> {
                set.iter().map(|o| o.unit[d]).collect()
            };
            let l: Vec<Parzen> = (0..dims).map(|d| Parzen::fit(&column(&good, d))).collect();
            let g: Vec<Parzen> = (0..dims).map(|d| Parzen::fit(&column(&bad, d))).collect();
            (l, g)
        };

        let mut best: Option<(f64, Vec<f64>)> = None;
        for _ in 0..self.settings.n_candidates.max(1) {
            let point: Vec<f64> = l.iter().map(|p| p.sample(&mut self.rng)).collect();
            let score: f64 = point
                .iter()
                .zip(l.iter().zip(&g))
                .map(|(x, (good_model, bad_model))| good_model.log_pdf(*x) - bad_model.log_pdf(*x))
                .sum();
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, point));
            }
        }
        best.map(|(_, point)| point).unwrap_or_else(|| vec![0.5; dims])
    }
}

impl SearchStrategy for SequentialModelBased {
    fn name(&self) -> &str {
        "model-based"
    }

    fn phase(&self) -> SearchPhase {
        self.budget.phase()
    }

    fn propose(&mut self) -> Vec<Candidate> {
        let Some(trial_number) = self.budget.next_trial() else {
            return Vec::new();
        };
        let params = if self.history.len() < self.settings.n_startup {
            self.space.sample(&mut self.rng)
        } else {
            let unit = self.suggest_unit();
            self.space.from_unit(&unit)
        };
        vec![Candidate {
            trial_number,
            params,
        }]
    }

    fn observe(&mut self, candidate: &Candidate, observation: Observation) {
        if let Some(pruner) = self.pruner.as_mut() {
            if observation.is_completed() {
                pruner.complete(candidate.trial_number);
            } else {
                pruner.discard(candidate.trial_number);
            }
        }
        self.history.push(Observed {
            unit: self.space.to_unit(&candidate.params),
            loss: observation.loss(),
            pruned: matches!(observation, Observation::Pruned { .. }),
        });
        self.budget.record();
        debug!(
            trial = candidate.trial_number,
            loss = observation.loss(),
            history = self.history.len(),
            "model-based observation"
        );
    }

    fn should_stop(&self) -> bool {
        self.budget.exhausted()
    }

    fn should_prune(&mut self, candidate: &Candidate, stage: usize, partial_loss: f64) -> bool {
        match self.pruner.as_mut() {
            Some(pruner) => pruner.report(candidate.trial_number, stage, partial_loss),
            None => false,
        }
    }

    fn stop_reason(&self) -> Option<StopReason> {
        self.budget.stop_reason()
    }
}
