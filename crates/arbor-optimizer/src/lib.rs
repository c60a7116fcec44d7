//! # arbor-optimizer
//!
//! Parameter spaces and black-box search strategies for Arbor calibration.
//!
//! Provides bounded parameter space definitions, the propose/observe
//! [`SearchStrategy`] protocol with random, evolution-strategy and
//! model-based implementations, median pruning, and run status tracking.

mod config;
mod evolution;
mod pruner;
mod random;
mod smbo;
mod space;
mod strategy;
mod trial;

pub use config::{CalibrationConfig, StrategyConfig};
pub use evolution::{EvolutionSettings, EvolutionStrategy};
pub use pruner::MedianPruner;
pub use random::RandomSearch;
pub use smbo::{ModelBasedSettings, SequentialModelBased};
pub use space::{ParameterDef, ParameterSpace, Scale};
pub use strategy::{Candidate, Observation, SearchPhase, SearchStrategy, StopReason};
pub use trial::{
    CalibrationId, CalibrationState, CalibrationStatus, SimulationOutcome, SimulationRecord,
    TrialOutcome, TrialRecord,
};
