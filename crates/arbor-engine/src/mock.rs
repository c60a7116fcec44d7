//! Closed-form stand-in for the growth simulator.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use arbor_optimizer::ParameterSpace;
use arbor_types::{invalid_params, ArborResult, FeatureSet, ParameterVector, ShollCurve};

use crate::port::SimulationPort;

const SHOLL_STEP_UM: f64 = 10.0;

/// Growth parameters in declared order with their reference values.
const REFERENCE: [(&str, f64); 6] = [
    ("speed", 1.2),
    ("persistence", 0.6),
    ("branch_prob", 0.01),
    ("branch_angle_mean_deg", 40.0),
    ("branch_angle_std_deg", 20.0),
    ("prune_prob", 0.004),
];

/// The six growth parameters with their calibration bounds.
pub fn growth_parameter_space() -> ParameterSpace {
    ParameterSpace::new()
        .add_linear("speed", 0.2, 2.5)
        .add_linear("persistence", 0.2, 0.95)
        .add_log("branch_prob", 5e-4, 3e-2)
        .add_linear("branch_angle_mean_deg", 10.0, 70.0)
        .add_linear("branch_angle_std_deg", 5.0, 40.0)
        .add_log("prune_prob", 1e-5, 2e-2)
}

/// The vector at which the mock's loss landscape has its basin.
pub fn reference_parameters() -> ParameterVector {
    ParameterVector::from_pairs(REFERENCE)
}

/// Deterministic closed-form simulator.
///
/// Every feature is a smooth function of the growth parameters, so the loss
/// against the mock's own output at [`reference_parameters`] has a single
/// broad basin there. With `noise > 0` the total length and radial extent
/// are perturbed by seeded multiplicative Gaussian noise.
#[derive(Debug, Clone, Default)]
pub struct MockSimulator {
    noise: f64,
}

impl MockSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.max(0.0);
        self
    }

    /// Features for `params`; missing parameters take their reference value.
    pub fn features(&self, params: &ParameterVector, seed: u64) -> ArborResult<FeatureSet> {
        let get = |name: &str, fallback: f64| params.get(name).unwrap_or(fallback);
        let [speed, persistence, branch_prob, angle_mean, angle_std, prune_prob] =
            REFERENCE.map(|(name, fallback)| get(name, fallback));

        if !(branch_prob > 0.0) || !(prune_prob > 0.0) {
            return Err(invalid_params!(
                "branch_prob and prune_prob must be positive, got {branch_prob} and {prune_prob}"
            ));
        }
        if let Some((name, value)) = params.iter().find(|(_, v)| !v.is_finite()) {
            return Err(invalid_params!("{name} is not finite: {value}"));
        }

        let ln_branch = (branch_prob / 0.01).ln();
        let ln_prune = (prune_prob / 0.004).ln();

        let (length_factor, radius_factor) = if self.noise > 0.0 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut factor = || {
                let z: f64 = rng.sample(StandardNormal);
                (1.0 + self.noise * z).max(0.0)
            };
            (factor(), factor())
        } else {
            (1.0, 1.0)
        };

        let total_length =
            1500.0 * (0.6 + 0.25 * speed) * (0.85 + 0.25 * persistence) * length_factor;
        let branching =
            (12.0 * (1.0 + 0.28 * ln_branch) * (1.0 + 0.005 * (angle_std - 20.0))).max(1.0);
        let n_bifurcations = branching.round() as u32;
        let n_tips = (branching + 10.0 - 1.6 * ln_prune).round().max(1.0) as u32;
        let depth = (3.0 + 5.0 * persistence - 0.08 * (angle_std - 20.0))
            .round()
            .max(1.0) as u32;
        let radial_extent =
            ((100.0 + 50.0 * persistence + (angle_mean - 40.0)) * radius_factor).max(0.0);

        let shells = ((radial_extent + SHOLL_STEP_UM) / SHOLL_STEP_UM).ceil().max(1.0) as usize;
        let peak_r = radial_extent / 3.0;
        let width = 8.0 + 0.4 * angle_std;
        let peak_h = 0.02 * total_length + 0.5 * branching;
        let counts = (1..=shells)
            .map(|k| {
                let x = (SHOLL_STEP_UM * k as f64 - peak_r) / width;
                (peak_h * (-0.5 * x * x).exp()).round().max(0.0) as u32
            })
            .collect();

        Ok(FeatureSet::new(
            total_length,
            n_bifurcations,
            n_tips,
            depth,
            radial_extent,
            ShollCurve::uniform(SHOLL_STEP_UM, counts),
        ))
    }
}

#[async_trait]
impl SimulationPort for MockSimulator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn evaluate(&self, params: &ParameterVector, seed: u64) -> ArborResult<FeatureSet> {
        self.features(params, seed)
    }
}
