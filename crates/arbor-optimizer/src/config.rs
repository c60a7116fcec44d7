//! Calibration run configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use arbor_types::ArborResult;

use crate::evolution::{EvolutionSettings, EvolutionStrategy};
use crate::pruner::MedianPruner;
use crate::random::RandomSearch;
use crate::smbo::{ModelBasedSettings, SequentialModelBased};
use crate::space::ParameterSpace;
use crate::strategy::SearchStrategy;
use crate::trial::CalibrationId;

/// Which search strategy drives the run, with its tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    Random { max_trials: usize },
    Evolution(EvolutionSettings),
    ModelBased(ModelBasedSettings),
}

impl StrategyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyConfig::Random { .. } => "random",
            StrategyConfig::Evolution(_) => "evolution",
            StrategyConfig::ModelBased(_) => "model-based",
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::Random { max_trials: 200 }
    }
}

/// Top-level configuration for a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub id: CalibrationId,
    pub name: String,
    pub space: ParameterSpace,
    pub strategy: StrategyConfig,
    /// Seeds the strategy's random number generator.
    pub seed: u64,
    pub created_at: DateTime<Utc>,
}

impl CalibrationConfig {
    pub fn new(name: impl Into<String>, space: ParameterSpace) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            space,
            strategy: StrategyConfig::default(),
            seed: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Attach a median pruner. Only the model-based strategy prunes; for the
    /// others the pruner is dropped with a warning.
    pub fn with_pruner(mut self, pruner: MedianPruner) -> Self {
        match &mut self.strategy {
            StrategyConfig::ModelBased(settings) => settings.pruner = Some(pruner),
            other => warn!(
                strategy = ?other,
                "only model-based search prunes trials; ignoring pruner"
            ),
        }
        self
    }

    /// Validate the space and instantiate the configured strategy.
    pub fn build_strategy(&self) -> ArborResult<Box<dyn SearchStrategy>> {
        self.space.validate()?;
        let space = self.space.clone();
        Ok(match &self.strategy {
            StrategyConfig::Random { max_trials } => {
                Box::new(RandomSearch::new(space, *max_trials, self.seed))
            }
            StrategyConfig::Evolution(settings) => {
                Box::new(EvolutionStrategy::new(space, settings.clone(), self.seed)?)
            }
            StrategyConfig::ModelBased(settings) => {
                Box::new(SequentialModelBased::new(space, settings.clone(), self.seed))
            }
        })
    }
}
