//! Morphological feature sets: scalar summary statistics plus a Sholl curve.
//!
//! The JSON layout of [`FeatureSet`] is shared by target descriptors, the
//! external simulator's output file and the run reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::errors::{ArborError, ArborResult};

/// Identifies one compared feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKey {
    TotalLength,
    Bifurcations,
    Tips,
    MaxTreeDepth,
    MaxRadialExtent,
    Sholl,
}

impl FeatureKey {
    /// The scalar features, in report order.
    pub const SCALARS: [FeatureKey; 5] = [
        FeatureKey::TotalLength,
        FeatureKey::Bifurcations,
        FeatureKey::Tips,
        FeatureKey::MaxTreeDepth,
        FeatureKey::MaxRadialExtent,
    ];

    /// Field name used in the JSON descriptor.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKey::TotalLength => "total_length_um",
            FeatureKey::Bifurcations => "n_bifurcations",
            FeatureKey::Tips => "n_tips",
            FeatureKey::MaxTreeDepth => "max_tree_depth",
            FeatureKey::MaxRadialExtent => "max_radial_extent_um",
            FeatureKey::Sholl => "sholl",
        }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Radial-intersection profile: crossing counts at increasing radii.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShollCurve {
    radii_um: Vec<f64>,
    counts: Vec<u32>,
}

impl ShollCurve {
    /// Build a curve, rejecting mismatched lengths and non-increasing radii.
    pub fn new(radii_um: Vec<f64>, counts: Vec<u32>) -> ArborResult<Self> {
        let curve = Self { radii_um, counts };
        curve.validate()?;
        Ok(curve)
    }

    /// Curve on the regular grid `step, 2·step, …` with one radius per count.
    pub fn uniform(step: f64, counts: Vec<u32>) -> Self {
        let radii_um = (1..=counts.len()).map(|k| step * k as f64).collect();
        Self { radii_um, counts }
    }

    /// Check the structural invariants. Curves read from disk are not
    /// validated on load, so consumers call this before using one.
    pub fn validate(&self) -> ArborResult<()> {
        if self.radii_um.len() != self.counts.len() {
            return Err(ArborError::MalformedFeatureSet {
                message: format!(
                    "sholl radii ({}) and counts ({}) differ in length",
                    self.radii_um.len(),
                    self.counts.len()
                ),
            });
        }
        if let Some(r) = self.radii_um.iter().find(|r| !r.is_finite()) {
            return Err(ArborError::MalformedFeatureSet {
                message: format!("sholl radius {r} is not finite"),
            });
        }
        if self.radii_um.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ArborError::MalformedFeatureSet {
                message: "sholl radii must be strictly increasing".to_string(),
            });
        }
        Ok(())
    }

    pub fn radii(&self) -> &[f64] {
        &self.radii_um
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.radii_um.len()
    }

    pub fn is_empty(&self) -> bool {
        self.radii_um.is_empty()
    }

    /// Iterate `(radius, count)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (f64, u32)> + '_ {
        self.radii_um.iter().copied().zip(self.counts.iter().copied())
    }

    /// Linearly interpolated count at `radius`; zero outside the sampled
    /// domain (no extrapolation).
    pub fn value_at(&self, radius: f64) -> f64 {
        let (first, last) = match (self.radii_um.first(), self.radii_um.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return 0.0,
        };
        if !(first..=last).contains(&radius) {
            return 0.0;
        }

        // index of the first radius strictly greater than `radius`
        let upper = self.radii_um.partition_point(|r| *r <= radius);
        if upper == 0 {
            return f64::from(self.counts[0]);
        }
        if upper >= self.radii_um.len() {
            return f64::from(self.counts[self.counts.len() - 1]);
        }

        let (r0, r1) = (self.radii_um[upper - 1], self.radii_um[upper]);
        let (c0, c1) = (f64::from(self.counts[upper - 1]), f64::from(self.counts[upper]));
        let t = (radius - r0) / (r1 - r0);
        c0 + t * (c1 - c0)
    }

    /// Resample onto another radius grid.
    pub fn resample(&self, radii: &[f64]) -> Vec<f64> {
        radii.iter().map(|r| self.value_at(*r)).collect()
    }

    /// Sum of all crossing counts.
    pub fn total_intersections(&self) -> u64 {
        self.counts.iter().map(|c| u64::from(*c)).sum()
    }

    /// Radius and count of the maximum (first occurrence on ties).
    pub fn peak(&self) -> Option<(f64, u32)> {
        self.iter()
            .fold(None, |best: Option<(f64, u32)>, (r, c)| match best {
                Some((_, bc)) if bc >= c => best,
                _ => Some((r, c)),
            })
    }
}

/// Fixed-schema morphological fingerprint.
///
/// Every field is optional so partial simulator output can be represented;
/// [`FeatureSet::ensure_complete`] checks presence explicitly.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_length_um: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_bifurcations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_tips: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tree_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_radial_extent_um: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sholl: Option<ShollCurve>,
}

impl FeatureSet {
    /// A feature set with every field present.
    pub fn new(
        total_length_um: f64,
        n_bifurcations: u32,
        n_tips: u32,
        max_tree_depth: u32,
        max_radial_extent_um: f64,
        sholl: ShollCurve,
    ) -> Self {
        Self {
            total_length_um: Some(total_length_um),
            n_bifurcations: Some(n_bifurcations),
            n_tips: Some(n_tips),
            max_tree_depth: Some(max_tree_depth),
            max_radial_extent_um: Some(max_radial_extent_um),
            sholl: Some(sholl),
        }
    }

    /// Value of a scalar feature as `f64`. Always `None` for
    /// [`FeatureKey::Sholl`].
    pub fn scalar(&self, key: FeatureKey) -> Option<f64> {
        match key {
            FeatureKey::TotalLength => self.total_length_um,
            FeatureKey::Bifurcations => self.n_bifurcations.map(f64::from),
            FeatureKey::Tips => self.n_tips.map(f64::from),
            FeatureKey::MaxTreeDepth => self.max_tree_depth.map(f64::from),
            FeatureKey::MaxRadialExtent => self.max_radial_extent_um,
            FeatureKey::Sholl => None,
        }
    }

    /// Keys of the fields that are absent.
    pub fn missing(&self) -> Vec<FeatureKey> {
        let mut missing: Vec<FeatureKey> = FeatureKey::SCALARS
            .iter()
            .copied()
            .filter(|key| self.scalar(*key).is_none())
            .collect();
        if self.sholl.is_none() {
            missing.push(FeatureKey::Sholl);
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    /// Fail with [`ArborError::MalformedFeatureSet`] naming every missing field.
    pub fn ensure_complete(&self) -> ArborResult<()> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = missing.iter().map(|k| k.as_str()).collect();
        Err(ArborError::MalformedFeatureSet {
            message: format!("missing required fields: {}", names.join(", ")),
        })
    }

    pub fn from_json_str(json: &str) -> ArborResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> ArborResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a feature descriptor from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> ArborResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Write this feature set as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ArborResult<()> {
        std::fs::write(path.as_ref(), self.to_json_pretty()?)?;
        Ok(())
    }
}
