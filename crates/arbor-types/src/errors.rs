use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the Arbor system
#[derive(Error, Debug)]
pub enum ArborError {
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    #[error("Invalid parameter vector: {message}")]
    InvalidParameterVector { message: String },

    #[error("Malformed feature set: {message}")]
    MalformedFeatureSet { message: String },

    #[error("Invalid morphology: {message}")]
    InvalidMorphology { message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArborError {
    /// Whether the calibration loop can absorb this error as a failed trial
    /// instead of aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ArborError::Simulation(e) if e.is_recoverable())
    }
}

/// Errors surfaced by a simulation backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("Simulator not available at {path}")]
    Unavailable { path: PathBuf },

    #[error("Simulator timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: f64 },

    #[error("Simulator failed: {message}")]
    Failure { message: String },
}

impl SimulationError {
    /// Timeouts and non-zero exits are scored as a failed trial; a missing
    /// backend is fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SimulationError::Timeout { .. } | SimulationError::Failure { .. }
        )
    }
}

/// Result type alias for Arbor operations
pub type ArborResult<T> = Result<T, ArborError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ArborError::Config(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::ArborError::Internal(format!($($arg)*))
    };
}

/// Macro for creating malformed feature set errors
#[macro_export]
macro_rules! malformed_features {
    ($($arg:tt)*) => {
        $crate::ArborError::MalformedFeatureSet { message: format!($($arg)*) }
    };
}

/// Macro for creating invalid parameter vector errors
#[macro_export]
macro_rules! invalid_params {
    ($($arg:tt)*) => {
        $crate::ArborError::InvalidParameterVector { message: format!($($arg)*) }
    };
}
