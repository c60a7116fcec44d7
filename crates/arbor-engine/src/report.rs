//! Run artifacts written to the output directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use arbor_morphology::{LossBreakdown, LossEvaluator};
use arbor_optimizer::CalibrationStatus;
use arbor_types::{ArborResult, ParameterVector, ShollCurve};

use crate::runner::{CalibrationOutcome, RunnerSettings};

pub const BEST_PARAMS_FILE: &str = "best_params.json";
pub const BEST_FEATURES_FILE: &str = "best_features.json";
pub const SUMMARY_FILE: &str = "calibration_summary.json";

/// Contents of `calibration_summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub simulator: String,
    pub settings: RunnerSettings,
    pub best_loss: f64,
    pub best_params: ParameterVector,
    /// Breakdown of the re-simulated best features against the target.
    pub breakdown: LossBreakdown,
    pub best_sholl: Option<ShollSummary>,
    pub target_sholl: Option<ShollSummary>,
    pub status: CalibrationStatus,
}

/// Where a Sholl profile peaks and how many crossings it has in total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShollSummary {
    pub peak_radius_um: f64,
    pub peak_count: u32,
    pub total_intersections: u64,
}

impl ShollSummary {
    /// `None` for an empty curve.
    pub fn from_curve(curve: &ShollCurve) -> Option<Self> {
        let (peak_radius_um, peak_count) = curve.peak()?;
        Some(Self {
            peak_radius_um,
            peak_count,
            total_intersections: curve.total_intersections(),
        })
    }
}

/// Paths of the files written by [`write_outputs`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    pub best_params: PathBuf,
    pub best_features: PathBuf,
    pub summary: PathBuf,
}

impl CalibrationSummary {
    pub fn new(
        simulator: impl Into<String>,
        settings: RunnerSettings,
        outcome: &CalibrationOutcome,
        evaluator: &LossEvaluator,
    ) -> ArborResult<Self> {
        Ok(Self {
            simulator: simulator.into(),
            settings,
            best_loss: outcome.best_loss,
            best_params: outcome.best_params.clone(),
            breakdown: evaluator.breakdown(&outcome.best_features)?,
            best_sholl: outcome
                .best_features
                .sholl
                .as_ref()
                .and_then(ShollSummary::from_curve),
            target_sholl: evaluator
                .target()
                .sholl
                .as_ref()
                .and_then(ShollSummary::from_curve),
            status: outcome.status.clone(),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ArborResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Write the best parameters, the best features and the summary into
/// `dir`, creating it if needed.
pub fn write_outputs(
    dir: &Path,
    outcome: &CalibrationOutcome,
    summary: &CalibrationSummary,
) -> ArborResult<OutputPaths> {
    std::fs::create_dir_all(dir)?;
    let paths = OutputPaths {
        best_params: dir.join(BEST_PARAMS_FILE),
        best_features: dir.join(BEST_FEATURES_FILE),
        summary: dir.join(SUMMARY_FILE),
    };

    std::fs::write(
        &paths.best_params,
        serde_json::to_string_pretty(&outcome.best_params)?,
    )?;
    outcome.best_features.save(&paths.best_features)?;
    std::fs::write(&paths.summary, serde_json::to_string_pretty(summary)?)?;

    info!("Wrote calibration results to {}", dir.display());
    Ok(paths)
}
