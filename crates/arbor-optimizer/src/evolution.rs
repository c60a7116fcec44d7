//! Covariance matrix adaptation evolution strategy (CMA-ES).
//!
//! The search runs in the unit cube of the parameter space. Each generation
//! samples `population` points from `N(mean, sigma^2 C)`, resampling points
//! that fall outside the cube, and once every point is observed performs the
//! rank-based update of mean, evolution paths, covariance and step size.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

use arbor_types::{config_error, ArborResult, ParameterVector};

use crate::space::ParameterSpace;
use crate::strategy::{Candidate, Observation, SearchPhase, SearchStrategy, StopReason};

const MAX_CONDITION: f64 = 1e14;

/// Draws per offspring before an out-of-cube point is clipped instead.
const MAX_RESAMPLES: usize = 100;

/// Tunables for [`EvolutionStrategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionSettings {
    /// Offspring per generation; `4 + floor(3 ln n)` when unset.
    pub population: Option<usize>,
    /// Initial step size in unit-cube coordinates.
    pub sigma0: f64,
    pub max_generations: usize,
    pub tol_x: f64,
    pub tol_fun: f64,
    /// Starting mean; the space center when unset.
    pub initial: Option<ParameterVector>,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            population: None,
            sigma0: 0.3,
            max_generations: 100,
            tol_x: 1e-6,
            tol_fun: 1e-9,
            initial: None,
        }
    }
}

impl EvolutionSettings {
    pub fn with_population(mut self, population: usize) -> Self {
        self.population = Some(population);
        self
    }

    pub fn with_max_generations(mut self, generations: usize) -> Self {
        self.max_generations = generations;
        self
    }

    pub fn with_sigma0(mut self, sigma0: f64) -> Self {
        self.sigma0 = sigma0;
        self
    }

    pub fn with_initial(mut self, initial: ParameterVector) -> Self {
        self.initial = Some(initial);
        self
    }
}

/// Strategy constants derived from dimension and population size.
#[derive(Debug, Clone)]
struct Constants {
    lambda: usize,
    weights: Vec<f64>,
    mueff: f64,
    cs: f64,
    ds: f64,
    cc: f64,
    c1: f64,
    cmu: f64,
    chi_n: f64,
}

impl Constants {
    fn new(n: usize, lambda: usize) -> Self {
        let nf = n as f64;
        let mu = (lambda / 2).max(1);
        let raw: Vec<f64> = (1..=mu)
            .map(|i| (mu as f64 + 0.5).ln() - (i as f64).ln())
            .collect();
        let total: f64 = raw.iter().sum();
        let weights: Vec<f64> = raw.iter().map(|w| w / total).collect();
        let mueff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let cs = (mueff + 2.0) / (nf + mueff + 5.0);
        let ds = 1.0 + 2.0 * (((mueff - 1.0) / (nf + 1.0)).sqrt() - 1.0).max(0.0) + cs;
        let cc = (4.0 + mueff / nf) / (nf + 4.0 + 2.0 * mueff / nf);
        let c1 = 2.0 / ((nf + 1.3).powi(2) + mueff);
        let cmu = (1.0 - c1).min(2.0 * (mueff - 2.0 + 1.0 / mueff) / ((nf + 2.0).powi(2) + mueff));
        let chi_n = nf.sqrt() * (1.0 - 1.0 / (4.0 * nf) + 1.0 / (21.0 * nf * nf));

        Self {
            lambda,
            weights,
            mueff,
            cs,
            ds,
            cc,
            c1,
            cmu,
            chi_n,
        }
    }
}

/// One offspring of the current generation.
#[derive(Debug, Clone)]
struct Offspring {
    trial_number: usize,
    /// Sampling direction `A z`, so the raw point is `mean + sigma * y`.
    y: Vec<f64>,
    loss: Option<f64>,
}

/// CMA-ES over the unit cube of a [`ParameterSpace`].
#[derive(Debug, Clone)]
pub struct EvolutionStrategy {
    space: ParameterSpace,
    settings: EvolutionSettings,
    consts: Constants,
    rng: ChaCha8Rng,
    n: usize,
    mean: Vec<f64>,
    sigma: f64,
    /// Row-major `n x n` covariance.
    cov: Vec<f64>,
    /// Lower Cholesky factor of `cov`.
    chol: Vec<f64>,
    ps: Vec<f64>,
    pc: Vec<f64>,
    generation: usize,
    next_trial: usize,
    batch: Vec<Offspring>,
    best_of_generation: VecDeque<f64>,
    stop: Option<StopReason>,
}

impl EvolutionStrategy {
    pub fn new(space: ParameterSpace, settings: EvolutionSettings, seed: u64) -> ArborResult<Self> {
        space.validate()?;
        if !(settings.sigma0.is_finite() && settings.sigma0 > 0.0) {
            return Err(config_error!("sigma0 must be positive, got {}", settings.sigma0));
        }
        let n = space.len();
        let lambda = settings
            .population
            .unwrap_or_else(|| 4 + (3.0 * (n as f64).ln()).floor() as usize);
        if lambda < 2 {
            return Err(config_error!("population must be at least 2, got {lambda}"));
        }

        let mean = match &settings.initial {
            Some(initial) => {
                space.check(initial)?;
                space.to_unit(initial)
            }
            None => vec![0.5; n],
        };

        info!(
            dimensions = n,
            population = lambda,
            sigma0 = settings.sigma0,
            "initialized evolution strategy"
        );

        Ok(Self {
            consts: Constants::new(n, lambda),
            rng: ChaCha8Rng::seed_from_u64(seed),
            n,
            mean,
            sigma: settings.sigma0,
            cov: identity(n),
            chol: identity(n),
            ps: vec![0.0; n],
            pc: vec![0.0; n],
            generation: 0,
            next_trial: 0,
            batch: Vec::new(),
            best_of_generation: VecDeque::new(),
            stop: (settings.max_generations == 0).then_some(StopReason::MaxGenerations),
            space,
            settings,
        })
    }

    pub fn population(&self) -> usize {
        self.consts.lambda
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Current distribution mean, decoded.
    pub fn mean(&self) -> ParameterVector {
        self.space.from_unit(&self.mean)
    }

    fn sample_direction(&mut self) -> Vec<f64> {
        let n = self.n;
        let z: Vec<f64> = (0..n).map(|_| self.rng.sample(StandardNormal)).collect();
        (0..n)
            .map(|i| (0..=i).map(|k| self.chol[i * n + k] * z[k]).sum())
            .collect()
    }

    /// Direction and raw point of one offspring, preferring points inside
    /// the unit cube.
    fn sample_offspring(&mut self) -> (Vec<f64>, Vec<f64>) {
        let mut attempt = 0;
        loop {
            let y = self.sample_direction();
            let point: Vec<f64> = self
                .mean
                .iter()
                .zip(&y)
                .map(|(m, yi)| m + self.sigma * yi)
                .collect();
            attempt += 1;
            if attempt >= MAX_RESAMPLES || point.iter().all(|u| (0.0..=1.0).contains(u)) {
                return (y, point);
            }
        }
    }

    fn update(&mut self) {
        let n = self.n;
        let c = &self.consts;
        let mu = c.weights.len();

        let mut ranked: Vec<&Offspring> = self.batch.iter().collect();
        ranked.sort_by(|a, b| {
            let la = a.loss.unwrap_or(f64::INFINITY);
            let lb = b.loss.unwrap_or(f64::INFINITY);
            la.total_cmp(&lb)
        });
        let elite: Vec<&[f64]> = ranked.iter().take(mu).map(|o| o.y.as_slice()).collect();
        let best = ranked.first().and_then(|o| o.loss).unwrap_or(f64::INFINITY);

        let yw: Vec<f64> = (0..n)
            .map(|d| c.weights.iter().zip(&elite).map(|(w, y)| w * y[d]).sum())
            .collect();
        for (m, y) in self.mean.iter_mut().zip(&yw) {
            *m += self.sigma * y;
        }

        let zw = forward_solve(&self.chol, n, &yw);
        let ps_gain = (c.cs * (2.0 - c.cs) * c.mueff).sqrt();
        for (p, z) in self.ps.iter_mut().zip(&zw) {
            *p = (1.0 - c.cs) * *p + ps_gain * z;
        }
        let ps_norm = norm(&self.ps);

        let decay = 1.0 - (1.0 - c.cs).powi(2 * (self.generation as i32 + 1));
        let hsig = ps_norm / decay.sqrt() < (1.4 + 2.0 / (n as f64 + 1.0)) * c.chi_n;
        let hsig = if hsig { 1.0 } else { 0.0 };

        let pc_gain = (c.cc * (2.0 - c.cc) * c.mueff).sqrt();
        for (p, y) in self.pc.iter_mut().zip(&yw) {
            *p = (1.0 - c.cc) * *p + hsig * pc_gain * y;
        }

        let dh = (1.0 - hsig) * c.cc * (2.0 - c.cc);
        for i in 0..n {
            for j in 0..n {
                let rank_mu: f64 = c
                    .weights
                    .iter()
                    .zip(&elite)
                    .map(|(w, y)| w * y[i] * y[j])
                    .sum();
                let old = self.cov[i * n + j];
                self.cov[i * n + j] = (1.0 - c.c1 - c.cmu) * old
                    + c.c1 * (self.pc[i] * self.pc[j] + dh * old)
                    + c.cmu * rank_mu;
            }
        }

        self.sigma *= ((c.cs / c.ds) * (ps_norm / c.chi_n - 1.0)).exp();

        self.chol = match cholesky(&self.cov, n) {
            Some(factor) => factor,
            None => {
                debug!(generation = self.generation, "covariance lost definiteness, resetting");
                self.cov = identity(n);
                identity(n)
            }
        };

        self.generation += 1;
        self.best_of_generation.push_back(best);
        let window = self.stagnation_window();
        while self.best_of_generation.len() > window {
            self.best_of_generation.pop_front();
        }
        self.batch.clear();
        self.stop = self.check_stop();

        debug!(
            generation = self.generation,
            sigma = self.sigma,
            best_of_generation = best,
            "evolution strategy update"
        );
        if let Some(reason) = self.stop {
            info!(generation = self.generation, ?reason, "evolution strategy stopped");
        }
    }

    fn stagnation_window(&self) -> usize {
        10 + (30 * self.n).div_ceil(self.consts.lambda)
    }

    fn check_stop(&self) -> Option<StopReason> {
        let n = self.n;
        if self.generation >= self.settings.max_generations {
            return Some(StopReason::MaxGenerations);
        }

        let diag: Vec<f64> = (0..n).map(|i| self.cov[i * n + i]).collect();
        let max_diag = diag.iter().copied().fold(f64::MIN, f64::max);
        let min_diag = diag.iter().copied().fold(f64::MAX, f64::min);
        if self.sigma * max_diag.sqrt() < self.settings.tol_x {
            return Some(StopReason::TolX);
        }

        if self.best_of_generation.len() >= self.stagnation_window() {
            let hi = self.best_of_generation.iter().copied().fold(f64::MIN, f64::max);
            let lo = self.best_of_generation.iter().copied().fold(f64::MAX, f64::min);
            if hi - lo < self.settings.tol_fun {
                return Some(StopReason::TolFun);
            }
        }

        if min_diag <= 0.0 || max_diag / min_diag > MAX_CONDITION {
            return Some(StopReason::ConditionCov);
        }
        None
    }
}

impl SearchStrategy for EvolutionStrategy {
    fn name(&self) -> &str {
        "evolution"
    }

    fn phase(&self) -> SearchPhase {
        if self.stop.is_some() {
            SearchPhase::Stopped
        } else if !self.batch.is_empty() {
            SearchPhase::Observing
        } else if self.next_trial == 0 {
            SearchPhase::Initialized
        } else {
            SearchPhase::Proposing
        }
    }

    fn propose(&mut self) -> Vec<Candidate> {
        if self.stop.is_some() || !self.batch.is_empty() {
            return Vec::new();
        }

        let mut candidates = Vec::with_capacity(self.consts.lambda);
        for _ in 0..self.consts.lambda {
            let (y, point) = self.sample_offspring();
            let trial_number = self.next_trial;
            self.next_trial += 1;

            candidates.push(Candidate {
                trial_number,
                params: self.space.from_unit(&point),
            });
            self.batch.push(Offspring {
                trial_number,
                y,
                loss: None,
            });
        }
        candidates
    }

    fn observe(&mut self, candidate: &Candidate, observation: Observation) {
        let Some(offspring) = self
            .batch
            .iter_mut()
            .find(|o| o.trial_number == candidate.trial_number)
        else {
            debug!(
                trial = candidate.trial_number,
                "ignoring observation outside the current generation"
            );
            return;
        };
        offspring.loss = Some(observation.loss());

        if self.batch.iter().all(|o| o.loss.is_some()) {
            self.update();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop.is_some()
    }

    fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }
}

fn identity(n: usize) -> Vec<f64> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Lower Cholesky factor of a symmetric row-major matrix, or `None` if it is
/// not positive definite.
fn cholesky(m: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let s = m[i * n + j] - (0..j).map(|k| l[i * n + k] * l[j * n + k]).sum::<f64>();
            if i == j {
                if !(s > 0.0) || !s.is_finite() {
                    return None;
                }
                l[i * n + i] = s.sqrt();
            } else {
                l[i * n + j] = s / l[j * n + j];
            }
        }
    }
    Some(l)
}

/// Solve `L x = b` for lower-triangular `L`.
fn forward_solve(l: &[f64], n: usize, b: &[f64]) -> Vec<f64> {
    let mut x = vec![0.0; n];
    for i in 0..n {
        let s: f64 = (0..i).map(|k| l[i * n + k] * x[k]).sum();
        x[i] = (b[i] - s) / l[i * n + i];
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(n: usize) -> ParameterSpace {
        (0..n).fold(ParameterSpace::new(), |s, i| {
            s.add_linear(format!("x{i}"), -1.0, 1.0)
        })
    }

    /// Drive the strategy to completion on `f`, returning the best loss seen.
    fn minimize<F: Fn(&[f64]) -> f64>(es: &mut EvolutionStrategy, f: F) -> f64 {
        let mut best = f64::INFINITY;
        while !es.should_stop() {
            let batch = es.propose();
            assert_eq!(batch.len(), es.population());
            for candidate in &batch {
                let loss = f(candidate.params.values());
                best = best.min(loss);
                es.observe(candidate, Observation::Completed(loss));
            }
        }
        best
    }

    #[test]
    fn constants_match_reference_formulas() {
        let c = Constants::new(6, 20);
        assert_eq!(c.weights.len(), 10);
        assert!((c.weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(c.weights.windows(2).all(|w| w[0] > w[1]));
        assert!(c.mueff > 5.0 && c.mueff < 6.0);
        assert!(c.c1 + c.cmu <= 1.0);
        assert!((c.chi_n - 6f64.sqrt() * (1.0 - 1.0 / 24.0 + 1.0 / 756.0)).abs() < 1e-12);
    }

    #[test]
    fn default_population_follows_dimension() {
        let es = EvolutionStrategy::new(space(6), EvolutionSettings::default(), 0).unwrap();
        assert_eq!(es.population(), 4 + (3.0 * 6f64.ln()).floor() as usize);
        assert_eq!(es.phase(), SearchPhase::Initialized);
    }

    #[test]
    fn cholesky_and_solve() {
        let m = vec![4.0, 2.0, 2.0, 3.0];
        let l = cholesky(&m, 2).unwrap();
        assert_eq!(l, vec![2.0, 0.0, 1.0, 2f64.sqrt()]);
        let x = forward_solve(&l, 2, &[2.0, 1.0 + 2f64.sqrt()]);
        assert!((x[0] - 1.0).abs() < 1e-12 && (x[1] - 1.0).abs() < 1e-12);

        assert!(cholesky(&[1.0, 2.0, 2.0, 1.0], 2).is_none());
    }

    #[test]
    fn batch_is_held_until_fully_observed() {
        let settings = EvolutionSettings::default().with_population(4);
        let mut es = EvolutionStrategy::new(space(2), settings, 5).unwrap();
        let batch = es.propose();
        assert_eq!(batch.len(), 4);
        assert!(es.propose().is_empty());

        for candidate in &batch[..3] {
            es.observe(candidate, Observation::Completed(1.0));
        }
        assert_eq!(es.phase(), SearchPhase::Observing);
        assert_eq!(es.generation(), 0);

        es.observe(&batch[3], Observation::Failed(1e6));
        assert_eq!(es.generation(), 1);
        assert_eq!(es.phase(), SearchPhase::Proposing);
        let next = es.propose();
        assert_eq!(next[0].trial_number, 4);
    }

    #[test]
    fn proposals_stay_in_bounds() {
        let settings = EvolutionSettings::default().with_sigma0(2.0).with_population(30);
        let s = space(3);
        let mut es = EvolutionStrategy::new(s.clone(), settings, 1).unwrap();
        for candidate in es.propose() {
            s.check(&candidate.params).unwrap();
        }
    }

    #[test]
    fn converges_on_shifted_sphere() {
        let target = [0.3, -0.4, 0.1, 0.6];
        let sphere = |x: &[f64]| -> f64 {
            x.iter().zip(&target).map(|(a, b)| (a - b).powi(2)).sum()
        };
        let settings = EvolutionSettings::default().with_max_generations(300);
        let mut es = EvolutionStrategy::new(space(4), settings, 11).unwrap();
        let best = minimize(&mut es, sphere);

        assert!(best < 1e-8, "best {best}");
        assert!(matches!(
            es.stop_reason(),
            Some(StopReason::TolX) | Some(StopReason::TolFun)
        ));
        for (m, t) in es.mean().values().iter().zip(&target) {
            assert!((m - t).abs() < 1e-3);
        }
    }

    #[test]
    fn stops_at_max_generations() {
        let settings = EvolutionSettings::default().with_max_generations(3);
        let mut es = EvolutionStrategy::new(space(2), settings, 2).unwrap();
        minimize(&mut es, |x| x.iter().map(|v| v.abs()).sum());
        assert_eq!(es.generation(), 3);
        assert_eq!(es.stop_reason(), Some(StopReason::MaxGenerations));
    }

    #[test]
    fn flat_landscape_stops_on_tolfun() {
        let mut es = EvolutionStrategy::new(space(2), EvolutionSettings::default(), 4).unwrap();
        minimize(&mut es, |_| 1.0);
        assert_eq!(es.stop_reason(), Some(StopReason::TolFun));
    }

    #[test]
    fn initial_vector_sets_mean() {
        let s = space(2);
        let start = s.vector(vec![0.5, -0.5]).unwrap();
        let settings = EvolutionSettings::default().with_initial(start.clone());
        let es = EvolutionStrategy::new(s, settings, 0).unwrap();
        assert_eq!(es.mean(), start);
    }

    #[test]
    fn rejects_bad_settings() {
        for settings in [
            EvolutionSettings::default().with_sigma0(0.0),
            EvolutionSettings::default().with_population(1),
        ] {
            assert!(EvolutionStrategy::new(space(2), settings, 0).is_err());
        }
    }
}
