//! Sholl analysis: crossings of concentric spheres around a center point.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use arbor_types::{config_error, ArborResult, ShollCurve};

use crate::tree::{distance, Point3};

/// Default shell spacing in micrometres.
pub const DEFAULT_STEP_UM: f64 = 10.0;

/// Absolute distance tolerance for points lying on a shell.
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Computes Sholl curves for sets of polylines.
///
/// A point within `tolerance` of a shell counts as inside it, so a segment
/// crosses shell `r` iff exactly one endpoint lies strictly beyond
/// `r + tolerance`. Touching a shell without leaving it counts zero, and a
/// polyline passing through a vertex on the shell counts once.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShollAnalyzer {
    step: f64,
    tolerance: f64,
}

impl Default for ShollAnalyzer {
    fn default() -> Self {
        Self {
            step: DEFAULT_STEP_UM,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl ShollAnalyzer {
    pub fn new(step: f64) -> ArborResult<Self> {
        if !(step.is_finite() && step > 0.0) {
            return Err(config_error!("sholl step must be positive, got {step}"));
        }
        Ok(Self {
            step,
            tolerance: DEFAULT_TOLERANCE,
        })
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance.abs();
        self
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    /// Largest distance from `center` to any point; 0 when there are none.
    pub fn max_radius<S>(sections: &[S], center: &Point3) -> f64
    where
        S: AsRef<[Point3]>,
    {
        sections
            .iter()
            .flat_map(|s| s.as_ref().iter())
            .map(|p| distance(p, center))
            .fold(0.0, f64::max)
    }

    /// Shell radii `step, 2·step, …` reaching at least one step past `max_r`.
    pub fn radii_for(&self, max_r: f64) -> Vec<f64> {
        let shells = if max_r > 0.0 {
            ((max_r + self.step) / self.step).ceil().max(1.0) as usize
        } else {
            1
        };
        (1..=shells).map(|k| self.step * k as f64).collect()
    }

    /// Compute the Sholl curve of `sections` around `center`.
    pub fn compute<S>(&self, sections: &[S], center: &Point3) -> ShollCurve
    where
        S: AsRef<[Point3]> + Sync,
    {
        let max_r = Self::max_radius(sections, center);
        let radii = self.radii_for(max_r);
        let shells = radii.len();

        let counts = sections
            .par_iter()
            .map(|s| s.as_ref())
            .filter(|points| points.len() >= 2)
            .fold(
                || vec![0u32; shells],
                |mut acc, points| {
                    self.accumulate(points, center, &radii, &mut acc);
                    acc
                },
            )
            .reduce(
                || vec![0u32; shells],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    a
                },
            );

        ShollCurve::uniform(self.step, counts)
    }

    fn accumulate(&self, points: &[Point3], center: &Point3, radii: &[f64], counts: &mut [u32]) {
        let dists: Vec<f64> = points.iter().map(|p| distance(p, center)).collect();
        for pair in dists.windows(2) {
            let (d1, d2) = (pair[0], pair[1]);
            for (r, count) in radii.iter().zip(counts.iter_mut()) {
                let limit = r + self.tolerance;
                if (d1 > limit) != (d2 > limit) {
                    *count += 1;
                }
            }
        }
    }
}
