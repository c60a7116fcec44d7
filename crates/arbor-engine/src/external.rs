//! Subprocess-backed simulation port.

use async_trait::async_trait;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use arbor_types::{
    config_error, malformed_features, ArborResult, FeatureSet, ParameterVector, SimulationError,
};

use crate::port::SimulationPort;

const PARAMS_FILE: &str = "params.json";
const FEATURES_FILE: &str = "features.json";
const STDERR_FILE: &str = "stderr.log";
const STDERR_TAIL_BYTES: usize = 2048;

/// Parameters in declared order followed by the `seed` key.
struct SimulatorInput<'a> {
    params: &'a ParameterVector,
    seed: u64,
}

impl Serialize for SimulatorInput<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.params.len() + 1))?;
        for (name, value) in self.params.iter() {
            map.serialize_entry(name, &value)?;
        }
        map.serialize_entry("seed", &self.seed)?;
        map.end()
    }
}

/// Runs `<binary> <params_path> <features_path>` once per evaluation.
///
/// Every call gets its own temporary directory holding the parameter file,
/// the simulator's output and its captured stderr. The directory is removed
/// when the call returns, whatever the outcome. A child that outlives the
/// timeout is killed.
#[derive(Debug, Clone)]
pub struct ExternalSimulator {
    binary: PathBuf,
    timeout: Duration,
}

impl ExternalSimulator {
    pub fn new(binary: impl Into<PathBuf>, timeout_secs: f64) -> ArborResult<Self> {
        if !timeout_secs.is_finite() || timeout_secs <= 0.0 {
            return Err(config_error!(
                "simulator timeout must be positive, got {timeout_secs}"
            ));
        }
        Ok(Self {
            binary: binary.into(),
            timeout: Duration::from_secs_f64(timeout_secs),
        })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn unavailable(&self) -> SimulationError {
        SimulationError::Unavailable {
            path: self.binary.clone(),
        }
    }
}

#[async_trait]
impl SimulationPort for ExternalSimulator {
    fn name(&self) -> &str {
        "external"
    }

    async fn evaluate(&self, params: &ParameterVector, seed: u64) -> ArborResult<FeatureSet> {
        let workdir = tempfile::Builder::new().prefix("arbor-sim-").tempdir()?;
        let params_path = workdir.path().join(PARAMS_FILE);
        let features_path = workdir.path().join(FEATURES_FILE);
        let stderr_path = workdir.path().join(STDERR_FILE);

        let input = serde_json::to_vec_pretty(&SimulatorInput { params, seed })?;
        tokio::fs::write(&params_path, input).await?;
        let stderr = File::create(&stderr_path)?;

        let mut child = Command::new(&self.binary)
            .arg(&params_path)
            .arg(&features_path)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => self.unavailable(),
                _ => SimulationError::Failure {
                    message: format!("failed to spawn {}: {e}", self.binary.display()),
                },
            })?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                warn!(
                    binary = %self.binary.display(),
                    seed,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "simulator timed out, process killed"
                );
                return Err(SimulationError::Timeout {
                    timeout_secs: self.timeout.as_secs_f64(),
                }
                .into());
            }
        };

        if !status.success() {
            let tail = stderr_tail(&stderr_path).await;
            return Err(SimulationError::Failure {
                message: if tail.is_empty() {
                    format!("simulator exited with {status}")
                } else {
                    format!("simulator exited with {status}: {tail}")
                },
            }
            .into());
        }

        let text = match tokio::fs::read_to_string(&features_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SimulationError::Failure {
                    message: "simulator exited successfully but wrote no features".to_string(),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };
        let features: FeatureSet = serde_json::from_str(&text)
            .map_err(|e| malformed_features!("simulator output is not a feature set: {e}"))?;
        if let Some(sholl) = &features.sholl {
            sholl.validate()?;
        }

        debug!(seed, missing = ?features.missing(), "simulator finished");
        Ok(features)
    }
}

/// Last bytes of the captured stderr, trimmed to whole characters.
async fn stderr_tail(path: &Path) -> String {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return String::new();
    };
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use arbor_types::ArborError;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const FEATURES_JSON: &str = r#"{
        "total_length_um": 1350.0,
        "n_bifurcations": 12,
        "n_tips": 22,
        "max_tree_depth": 6,
        "max_radial_extent_um": 130.0,
        "sholl": {"radii_um": [10.0, 20.0], "counts": [4, 11]}
    }"#;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("sim.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn params() -> ParameterVector {
        ParameterVector::from_pairs([("speed", 1.2), ("persistence", 0.6)])
    }

    #[tokio::test]
    async fn reads_features_written_by_simulator() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, &format!("cat > \"$2\" <<'EOF'\n{FEATURES_JSON}\nEOF"));
        let sim = ExternalSimulator::new(binary, 10.0).unwrap();

        let features = sim.evaluate(&params(), 1).await.unwrap();
        assert_eq!(features.n_tips, Some(22));
        assert_eq!(features.sholl.unwrap().counts(), &[4, 11]);
    }

    #[tokio::test]
    async fn params_file_carries_declared_order_and_seed() {
        let dir = TempDir::new().unwrap();
        let capture = dir.path().join("captured.json");
        let binary = script(
            &dir,
            &format!(
                "cp \"$1\" '{}'\ncat > \"$2\" <<'EOF'\n{FEATURES_JSON}\nEOF",
                capture.display()
            ),
        );
        let sim = ExternalSimulator::new(binary, 10.0).unwrap();
        sim.evaluate(&params(), 42).await.unwrap();

        let text = std::fs::read_to_string(&capture).unwrap();
        let speed = text.find("\"speed\"").unwrap();
        let persistence = text.find("\"persistence\"").unwrap();
        let seed = text.find("\"seed\"").unwrap();
        assert!(speed < persistence && persistence < seed);

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["seed"], 42);
        assert_eq!(value["speed"], 1.2);
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure_with_stderr() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "echo 'growth diverged' >&2\nexit 3");
        let sim = ExternalSimulator::new(binary, 10.0).unwrap();

        let err = sim.evaluate(&params(), 0).await.unwrap_err();
        assert!(err.is_recoverable());
        match err {
            ArborError::Simulation(SimulationError::Failure { message }) => {
                assert!(message.contains("growth diverged"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_output_is_failure() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "exit 0");
        let sim = ExternalSimulator::new(binary, 10.0).unwrap();

        let err = sim.evaluate(&params(), 0).await.unwrap_err();
        assert!(matches!(
            err,
            ArborError::Simulation(SimulationError::Failure { .. })
        ));
    }

    #[tokio::test]
    async fn slow_simulator_times_out() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "sleep 5");
        let sim = ExternalSimulator::new(binary, 0.2).unwrap();

        let started = std::time::Instant::now();
        let err = sim.evaluate(&params(), 0).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(matches!(
            err,
            ArborError::Simulation(SimulationError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn workdir_is_removed_on_every_exit() {
        let dir = TempDir::new().unwrap();
        let capture = dir.path().join("workdir.txt");
        let record = format!("dirname \"$1\" > '{}'", capture.display());
        let cases = [
            (format!("{record}\ncat > \"$2\" <<'EOF'\n{FEATURES_JSON}\nEOF"), 10.0),
            (format!("{record}\nexit 3"), 10.0),
            (format!("{record}\nexec sleep 5"), 0.5),
        ];

        for (body, timeout_secs) in cases {
            let _ = std::fs::remove_file(&capture);
            let sim = ExternalSimulator::new(script(&dir, &body), timeout_secs).unwrap();
            let result = sim.evaluate(&params(), 0).await;

            let workdir = PathBuf::from(std::fs::read_to_string(&capture).unwrap().trim());
            assert!(
                workdir
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("arbor-sim-"),
                "{}",
                workdir.display()
            );
            assert!(!workdir.exists(), "{} left behind ({result:?})", workdir.display());
        }
    }

    #[tokio::test]
    async fn invalid_json_is_malformed() {
        let dir = TempDir::new().unwrap();
        let binary = script(&dir, "echo 'not json' > \"$2\"");
        let sim = ExternalSimulator::new(binary, 10.0).unwrap();

        let err = sim.evaluate(&params(), 0).await.unwrap_err();
        assert!(matches!(err, ArborError::MalformedFeatureSet { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let sim = ExternalSimulator::new("/nonexistent/arbor/simulator", 10.0).unwrap();
        let err = sim.evaluate(&params(), 0).await.unwrap_err();
        assert!(matches!(
            err,
            ArborError::Simulation(SimulationError::Unavailable { .. })
        ));
    }

    #[test]
    fn rejects_non_positive_timeout() {
        assert!(ExternalSimulator::new("sim", 0.0).is_err());
        assert!(ExternalSimulator::new("sim", f64::NAN).is_err());
        assert_eq!(
            ExternalSimulator::new("sim", 1.5).unwrap().timeout(),
            Duration::from_millis(1500)
        );
    }
}
