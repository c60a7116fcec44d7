use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use arbor_engine::{
    build_port, growth_parameter_space, reference_parameters, write_outputs, CalibrationRunner,
    CalibrationSummary, MockSimulator, RunnerSettings, SimulatorConfig, DEFAULT_SIMULATOR,
};
use arbor_morphology::{FeatureExtractor, LossEvaluator, LossScales, Morphology, ShollAnalyzer};
use arbor_optimizer::{
    CalibrationConfig, EvolutionSettings, MedianPruner, ModelBasedSettings, ParameterSpace,
    StrategyConfig,
};
use arbor_types::FeatureSet;

#[derive(Parser, Debug)]
#[command(name = "arbor-calibrate")]
#[command(about = "Calibrate neuron growth simulator parameters against a target morphology")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search growth parameters that reproduce a target feature set
    Calibrate(CalibrateArgs),
    /// Write the mock simulator's features at the reference parameters
    MockTarget {
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 0.0)]
        noise: f64,
    },
    /// Compute the feature set of a reconstructed morphology
    Extract {
        #[arg(long)]
        morphology: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Sholl shell spacing in micrometres
        #[arg(long, default_value_t = arbor_morphology::DEFAULT_STEP_UM)]
        step: f64,
        /// Include axons in the radial extent and Sholl profile
        #[arg(long)]
        include_axon: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CliStrategy {
    Random,
    Evolution,
    ModelBased,
}

#[derive(clap::Args, Debug)]
struct CalibrateArgs {
    #[arg(long)]
    target: PathBuf,
    #[arg(long, value_enum, default_value_t = CliStrategy::Random)]
    strategy: CliStrategy,
    /// Trial budget for random and model-based search
    #[arg(long, default_value_t = 200)]
    trials: usize,
    /// Generation budget for the evolution strategy
    #[arg(long, default_value_t = 100)]
    generations: usize,
    #[arg(long)]
    population: Option<usize>,
    #[arg(long, default_value_t = 3)]
    repeats: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
    #[arg(long, default_value = DEFAULT_SIMULATOR)]
    simulator: PathBuf,
    #[arg(long, default_value_t = 180.0)]
    timeout_secs: f64,
    /// Fall back to the mock simulator when the binary is missing
    #[arg(long)]
    allow_mock: bool,
    /// Relative noise of the mock simulator
    #[arg(long, default_value_t = 0.0)]
    mock_noise: f64,
    /// Median pruning of unpromising repeats (model-based only)
    #[arg(long)]
    prune: bool,
    /// Parameter space JSON; defaults to the six growth parameters
    #[arg(long)]
    space: Option<PathBuf>,
    #[arg(long, default_value = "calibration_output")]
    output: PathBuf,
}

impl CalibrateArgs {
    fn validate(&self) -> Result<()> {
        if self.prune && self.strategy != CliStrategy::ModelBased {
            bail!("--prune requires --strategy model-based");
        }
        Ok(())
    }

    fn strategy_config(&self) -> StrategyConfig {
        match self.strategy {
            CliStrategy::Random => StrategyConfig::Random {
                max_trials: self.trials,
            },
            CliStrategy::Evolution => {
                let mut settings =
                    EvolutionSettings::default().with_max_generations(self.generations);
                if let Some(population) = self.population {
                    settings = settings.with_population(population);
                }
                StrategyConfig::Evolution(settings)
            }
            CliStrategy::ModelBased => StrategyConfig::ModelBased(
                ModelBasedSettings::default().with_max_trials(self.trials),
            ),
        }
    }
}

async fn calibrate(args: CalibrateArgs) -> Result<()> {
    args.validate()?;
    let target = FeatureSet::load(&args.target)
        .with_context(|| format!("failed to read target: {}", args.target.display()))?;
    let evaluator = Arc::new(
        LossEvaluator::new(Arc::new(target), LossScales::default())
            .context("target feature set is not usable")?,
    );

    let space = match &args.space {
        Some(path) => ParameterSpace::load(path)
            .with_context(|| format!("failed to read parameter space: {}", path.display()))?,
        None => growth_parameter_space(),
    };

    let mut config = CalibrationConfig::new("arbor", space.clone())
        .with_strategy(args.strategy_config())
        .with_seed(args.seed);
    if args.prune {
        config = config.with_pruner(MedianPruner::default());
    }
    let strategy = config.build_strategy()?;

    let simulator = SimulatorConfig::default()
        .with_binary(&args.simulator)
        .with_timeout_secs(args.timeout_secs)
        .with_mock_fallback(args.allow_mock)
        .with_mock_noise(args.mock_noise);
    let port = build_port(&simulator)?;
    let port_name = port.name().to_string();

    let settings = RunnerSettings::default()
        .with_repeats(args.repeats)
        .with_base_seed(args.seed)
        .with_concurrency(args.concurrency);
    let runner = CalibrationRunner::new(port, space, Arc::clone(&evaluator))
        .with_id(config.id)
        .with_settings(settings.clone());

    let outcome = runner.run(strategy).await?;
    let summary = CalibrationSummary::new(port_name, settings, &outcome, &evaluator)?;
    let paths = write_outputs(&args.output, &outcome, &summary)
        .with_context(|| format!("failed to write results to {}", args.output.display()))?;

    println!("Calibration {} complete.", outcome.status.id);
    println!("  Strategy:      {}", outcome.status.strategy);
    println!(
        "  Trials:        {} ({} failed, {} pruned)",
        outcome.status.trials_total(),
        outcome.status.trials_failed,
        outcome.status.trials_pruned
    );
    println!("  Best loss:     {:.6}", outcome.best_loss);
    println!("  Best params:   {}", outcome.best_params);
    println!("  Results:       {}", paths.summary.display());
    Ok(())
}

fn mock_target(output: PathBuf, seed: u64, noise: f64) -> Result<()> {
    let features = MockSimulator::new()
        .with_noise(noise)
        .features(&reference_parameters(), seed)?;
    features
        .save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!("Wrote mock target to {}", output.display());
    Ok(())
}

fn extract(morphology: PathBuf, output: PathBuf, step: f64, include_axon: bool) -> Result<()> {
    let tree = Morphology::load(&morphology)
        .with_context(|| format!("failed to read morphology: {}", morphology.display()))?;
    let extractor =
        FeatureExtractor::new(ShollAnalyzer::new(step)?).with_dendrites_only(!include_axon);
    let features = extractor.extract(&tree);
    features
        .save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(
        "Extracted features of {} sections to {}",
        tree.len(),
        output.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Calibrate(args) => calibrate(args).await,
        Commands::MockTarget {
            output,
            seed,
            noise,
        } => mock_target(output, seed, noise),
        Commands::Extract {
            morphology,
            output,
            step,
            include_axon,
        } => extract(morphology, output, step, include_axon),
    }
}
