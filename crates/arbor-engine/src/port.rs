//! Simulation backends behind a common async interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use arbor_types::{ArborResult, FeatureSet, ParameterVector, SimulationError};

use crate::external::ExternalSimulator;
use crate::mock::MockSimulator;

/// Default location of the external growth simulator.
pub const DEFAULT_SIMULATOR: &str = "./cpp/neuron_growth";

/// Maps a parameter vector and a seed to a feature set.
///
/// Simulation failures surface as [`arbor_types::ArborError::Simulation`];
/// unreadable simulator output as `MalformedFeatureSet`.
#[async_trait]
pub trait SimulationPort: Send + Sync {
    /// Short backend name for logs and reports.
    fn name(&self) -> &str;

    async fn evaluate(&self, params: &ParameterVector, seed: u64) -> ArborResult<FeatureSet>;
}

/// How to obtain a simulation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub binary: PathBuf,
    pub timeout_secs: f64,
    /// Use the mock when the binary cannot be found.
    pub allow_mock_fallback: bool,
    /// Relative noise of the mock's outputs.
    pub mock_noise: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_SIMULATOR),
            timeout_secs: 180.0,
            allow_mock_fallback: false,
            mock_noise: 0.0,
        }
    }
}

impl SimulatorConfig {
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: f64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_mock_fallback(mut self, allow: bool) -> Self {
        self.allow_mock_fallback = allow;
        self
    }

    pub fn with_mock_noise(mut self, noise: f64) -> Self {
        self.mock_noise = noise;
        self
    }
}

/// Select the backend: the external binary when it can be found, otherwise
/// the mock if fallback is allowed, otherwise `Unavailable`.
pub fn build_port(config: &SimulatorConfig) -> ArborResult<Arc<dyn SimulationPort>> {
    if let Some(binary) = resolve_binary(&config.binary) {
        info!(
            binary = %binary.display(),
            timeout_secs = config.timeout_secs,
            "using external simulator"
        );
        return Ok(Arc::new(ExternalSimulator::new(binary, config.timeout_secs)?));
    }
    if config.allow_mock_fallback {
        warn!(
            binary = %config.binary.display(),
            "simulator binary not found, falling back to the mock simulator"
        );
        return Ok(Arc::new(MockSimulator::new().with_noise(config.mock_noise)));
    }
    Err(SimulationError::Unavailable {
        path: config.binary.clone(),
    }
    .into())
}

/// The binary itself if it exists, or its first match on `PATH` when given
/// as a bare name.
fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.as_os_str().is_empty() {
        return None;
    }
    if binary.is_file() {
        return Some(binary.to_path_buf());
    }
    if binary.components().count() != 1 {
        return None;
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::ArborError;

    #[test]
    fn missing_binary_without_fallback_is_unavailable() {
        let config = SimulatorConfig::default().with_binary("/nonexistent/arbor/simulator");
        let err = build_port(&config).err().unwrap();
        assert!(matches!(
            err,
            ArborError::Simulation(SimulationError::Unavailable { .. })
        ));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn missing_binary_with_fallback_uses_mock() {
        let config = SimulatorConfig::default()
            .with_binary("/nonexistent/arbor/simulator")
            .with_mock_fallback(true);
        let port = build_port(&config).unwrap();
        assert_eq!(port.name(), "mock");
    }

    #[test]
    fn existing_binary_is_external() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("sim");
        std::fs::write(&binary, "#!/bin/sh\n").unwrap();

        let config = SimulatorConfig::default().with_binary(&binary);
        let port = build_port(&config).unwrap();
        assert_eq!(port.name(), "external");
    }

    #[test]
    fn bare_names_are_looked_up_on_path() {
        assert!(resolve_binary(Path::new("sh")).is_some() || cfg!(windows));
        assert!(resolve_binary(Path::new("definitely-not-an-arbor-binary")).is_none());
        assert!(resolve_binary(Path::new("")).is_none());
    }
}
