//! # arbor-engine
//!
//! Simulation backends and the calibration loop for Arbor.
//!
//! A [`SimulationPort`] turns a parameter vector into a feature set, either
//! by running an external growth simulator ([`ExternalSimulator`]) or with
//! the closed-form [`MockSimulator`]. The [`CalibrationRunner`] drives any
//! [`arbor_optimizer::SearchStrategy`] against a port, scores results with a
//! [`arbor_morphology::LossEvaluator`] and reports the best candidate.

pub mod external;
pub mod mock;
pub mod port;
pub mod report;
pub mod runner;

pub use external::ExternalSimulator;
pub use mock::{growth_parameter_space, reference_parameters, MockSimulator};
pub use port::{build_port, SimulationPort, SimulatorConfig, DEFAULT_SIMULATOR};
pub use report::{write_outputs, CalibrationSummary, OutputPaths, ShollSummary};
pub use runner::{
    CalibrationEvent, CalibrationOutcome, CalibrationRunner, RunnerSettings, DEFAULT_FAILURE_LOSS,
};
