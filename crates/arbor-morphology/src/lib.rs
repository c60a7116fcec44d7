//! # arbor-morphology
//!
//! Feature comparison for Arbor.
//!
//! Provides an in-memory rooted [`Morphology`] tree, the [`ShollAnalyzer`]
//! radial-intersection profile, [`FeatureExtractor`] summary statistics and
//! the [`LossEvaluator`] that scores a simulated feature set against a fixed
//! target.

mod extract;
mod loss;
mod sholl;
mod tree;

pub use extract::FeatureExtractor;
pub use loss::{LossBreakdown, LossEvaluator, LossScales, LossTerm};
pub use sholl::{ShollAnalyzer, DEFAULT_STEP_UM, DEFAULT_TOLERANCE};
pub use tree::{distance, Morphology, Point3, Section, SectionId, SectionKind};
