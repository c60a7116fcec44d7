//! Feature-distance loss against a fixed target.
//!
//! Every scalar contributes its squared, scale-normalized difference; the
//! Sholl curve contributes the squared, normalized RMS difference after the
//! candidate curve is resampled onto the target radii.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use arbor_types::{malformed_features, ArborResult, FeatureKey, FeatureSet};

/// Per-feature normalization constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScales {
    pub total_length_um: f64,
    pub n_bifurcations: f64,
    pub n_tips: f64,
    pub max_tree_depth: f64,
    pub max_radial_extent_um: f64,
    pub sholl_l2: f64,
}

impl Default for LossScales {
    fn default() -> Self {
        Self {
            total_length_um: 2000.0,
            n_bifurcations: 30.0,
            n_tips: 34.0,
            max_tree_depth: 7.0,
            max_radial_extent_um: 150.0,
            sholl_l2: 50.0,
        }
    }
}

impl LossScales {
    pub fn get(&self, key: FeatureKey) -> f64 {
        match key {
            FeatureKey::TotalLength => self.total_length_um,
            FeatureKey::Bifurcations => self.n_bifurcations,
            FeatureKey::Tips => self.n_tips,
            FeatureKey::MaxTreeDepth => self.max_tree_depth,
            FeatureKey::MaxRadialExtent => self.max_radial_extent_um,
            FeatureKey::Sholl => self.sholl_l2,
        }
    }

    fn validate(&self) -> ArborResult<()> {
        for key in FeatureKey::SCALARS.iter().chain(&[FeatureKey::Sholl]) {
            let scale = self.get(*key);
            if !(scale.is_finite() && scale > 0.0) {
                return Err(malformed_features!(
                    "loss scale for {key} must be positive, got {scale}"
                ));
            }
        }
        Ok(())
    }
}

/// One feature's contribution to the loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossTerm {
    pub feature: FeatureKey,
    /// Candidate value; for the Sholl term, the RMS curve difference.
    pub candidate: Option<f64>,
    /// Target value; 0 for the Sholl term.
    pub target: f64,
    pub contribution: f64,
}

impl LossTerm {
    pub fn difference(&self) -> Option<f64> {
        self.candidate.map(|c| c - self.target)
    }
}

/// Per-feature decomposition of a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub terms: Vec<LossTerm>,
    pub total: f64,
}

impl LossBreakdown {
    pub fn term(&self, feature: FeatureKey) -> Option<&LossTerm> {
        self.terms.iter().find(|t| t.feature == feature)
    }
}

/// Scores candidate feature sets against a fixed target.
///
/// The target is held behind an `Arc` so concurrent evaluations share it
/// read-only.
#[derive(Debug, Clone)]
pub struct LossEvaluator {
    target: Arc<FeatureSet>,
    scales: LossScales,
}

impl LossEvaluator {
    /// Fails with `MalformedFeatureSet` when the target is incomplete, its
    /// curve is invalid, or a scale is not strictly positive.
    pub fn new(target: Arc<FeatureSet>, scales: LossScales) -> ArborResult<Self> {
        target.ensure_complete()?;
        if let Some(curve) = &target.sholl {
            curve.validate()?;
            if curve.is_empty() {
                return Err(malformed_features!("target sholl curve has no radii"));
            }
        }
        scales.validate()?;
        Ok(Self { target, scales })
    }

    pub fn target(&self) -> &Arc<FeatureSet> {
        &self.target
    }

    pub fn scales(&self) -> &LossScales {
        &self.scales
    }

    /// Total loss of `candidate`. Scalars absent from the candidate are
    /// skipped, as is the curve term when the candidate has no curve.
    pub fn score(&self, candidate: &FeatureSet) -> ArborResult<f64> {
        Ok(self.breakdown(candidate)?.total)
    }

    pub fn breakdown(&self, candidate: &FeatureSet) -> ArborResult<LossBreakdown> {
        let mut terms = Vec::with_capacity(FeatureKey::SCALARS.len() + 1);

        for key in FeatureKey::SCALARS {
            let target = self
                .target
                .scalar(key)
                .ok_or_else(|| malformed_features!("target is missing {key}"))?;
            let value = candidate.scalar(key);
            let contribution = match value {
                Some(v) => ((v - target) / self.scales.get(key)).powi(2),
                None => 0.0,
            };
            terms.push(LossTerm {
                feature: key,
                candidate: value,
                target,
                contribution,
            });
        }

        let rms = match &candidate.sholl {
            Some(curve) => Some(self.sholl_rms(curve)?),
            None => None,
        };
        terms.push(LossTerm {
            feature: FeatureKey::Sholl,
            candidate: rms,
            target: 0.0,
            contribution: rms.map_or(0.0, |d| (d / self.scales.sholl_l2).powi(2)),
        });

        let total = terms.iter().map(|t| t.contribution).sum();
        Ok(LossBreakdown { terms, total })
    }

    /// RMS difference between the target counts and the candidate curve
    /// resampled onto the target radii.
    fn sholl_rms(&self, curve: &arbor_types::ShollCurve) -> ArborResult<f64> {
        curve.validate()?;
        let target = self
            .target
            .sholl
            .as_ref()
            .ok_or_else(|| malformed_features!("target is missing sholl"))?;

        let resampled = curve.resample(target.radii());
        let sum_sq: f64 = resampled
            .iter()
            .zip(target.counts())
            .map(|(sim, tgt)| (sim - f64::from(*tgt)).powi(2))
            .sum();
        Ok((sum_sq / target.len() as f64).sqrt())
    }
}
