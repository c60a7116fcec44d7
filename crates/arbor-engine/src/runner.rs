//! The calibration loop: propose, simulate, score, observe.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use arbor_morphology::LossEvaluator;
use arbor_optimizer::{
    CalibrationId, CalibrationStatus, Candidate, ParameterSpace, SearchStrategy,
    SimulationRecord, TrialRecord,
};
use arbor_types::{
    config_error, internal_error, ArborError, ArborResult, FeatureSet, ParameterVector,
};

use crate::port::SimulationPort;

/// Loss observed for a candidate whose simulation failed.
pub const DEFAULT_FAILURE_LOSS: f64 = 1e6;

/// Evaluation settings held by [`CalibrationRunner`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Simulations per candidate; the candidate's loss is their mean.
    pub repeats: usize,
    /// Repeat `k` runs with seed `base_seed + k`.
    pub base_seed: u64,
    /// Simulations in flight at once when a strategy proposes a batch.
    pub concurrency: usize,
    pub failure_loss: f64,
    /// Log a progress line every this many trials; 0 disables it.
    pub report_every: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            repeats: 3,
            base_seed: 0,
            concurrency: 4,
            failure_loss: DEFAULT_FAILURE_LOSS,
            report_every: 10,
        }
    }
}

impl RunnerSettings {
    pub fn with_repeats(mut self, repeats: usize) -> Self {
        self.repeats = repeats;
        self
    }

    pub fn with_base_seed(mut self, seed: u64) -> Self {
        self.base_seed = seed;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_failure_loss(mut self, loss: f64) -> Self {
        self.failure_loss = loss;
        self
    }

    pub fn with_report_every(mut self, every: usize) -> Self {
        self.report_every = every;
        self
    }

    pub fn validate(&self) -> ArborResult<()> {
        if self.repeats == 0 {
            return Err(config_error!("repeats must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(config_error!("concurrency must be at least 1"));
        }
        if !self.failure_loss.is_finite() {
            return Err(config_error!(
                "failure loss must be finite, got {}",
                self.failure_loss
            ));
        }
        Ok(())
    }

    fn seed(&self, repeat: usize) -> u64 {
        self.base_seed.wrapping_add(repeat as u64)
    }
}

/// Progress notifications published while a run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CalibrationEvent {
    TrialFinished { record: TrialRecord },
    NewBest { trial_number: usize, loss: f64 },
    Finished { status: CalibrationStatus },
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutcome {
    pub best_params: ParameterVector,
    /// Features of `best_params` re-simulated with the base seed.
    pub best_features: FeatureSet,
    /// Mean loss of the best trial over its repeats.
    pub best_loss: f64,
    pub status: CalibrationStatus,
}

/// Drives a [`SearchStrategy`] against a [`SimulationPort`] until the
/// strategy stops.
pub struct CalibrationRunner {
    id: CalibrationId,
    port: Arc<dyn SimulationPort>,
    space: ParameterSpace,
    evaluator: Arc<LossEvaluator>,
    settings: RunnerSettings,
    events: Option<Sender<CalibrationEvent>>,
}

impl CalibrationRunner {
    pub fn new(
        port: Arc<dyn SimulationPort>,
        space: ParameterSpace,
        evaluator: Arc<LossEvaluator>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            port,
            space,
            evaluator,
            settings: RunnerSettings::default(),
            events: None,
        }
    }

    pub fn with_id(mut self, id: CalibrationId) -> Self {
        self.id = id;
        self
    }

    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_events(mut self, events: Sender<CalibrationEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> CalibrationId {
        self.id
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn evaluator(&self) -> &Arc<LossEvaluator> {
        &self.evaluator
    }

    /// Run `strategy` to completion and re-simulate its best candidate.
    ///
    /// Recoverable simulation errors are scored with the failure loss and the
    /// run continues. Any other error aborts the run and is returned, as is a
    /// run in which no candidate completed.
    pub async fn run(
        &self,
        mut strategy: Box<dyn SearchStrategy>,
    ) -> ArborResult<CalibrationOutcome> {
        self.settings.validate()?;
        self.space.validate()?;

        let mut status = CalibrationStatus::new(self.id, strategy.name());
        status.mark_running();
        info!(
            "Starting calibration {} with {} strategy on {} port ({} parameters, {} repeats)",
            self.id,
            strategy.name(),
            self.port.name(),
            self.space.len(),
            self.settings.repeats
        );

        match self.finish(strategy.as_mut(), &mut status).await {
            Ok(outcome) => {
                info!(
                    "Calibration {} finished after {} trials, best loss {:.6}",
                    self.id,
                    outcome.status.trials_total(),
                    outcome.best_loss
                );
                self.emit(CalibrationEvent::Finished {
                    status: outcome.status.clone(),
                });
                Ok(outcome)
            }
            Err(e) => {
                error!("Calibration {} aborted: {}", self.id, e);
                status.mark_failed(e.to_string());
                self.emit(CalibrationEvent::Finished { status });
                Err(e)
            }
        }
    }

    async fn finish(
        &self,
        strategy: &mut dyn SearchStrategy,
        status: &mut CalibrationStatus,
    ) -> ArborResult<CalibrationOutcome> {
        self.search(strategy, status).await?;

        let best = status.best_trial.clone().ok_or_else(|| {
            internal_error!(
                "no candidate completed out of {} trials",
                status.trials_total()
            )
        })?;
        let resimulated = self
            .port
            .evaluate(&best.params, self.settings.base_seed)
            .await;
        let best_features = match resimulated {
            Ok(features) => features,
            Err(e) if e.is_recoverable() => {
                let stored = best.first_features().cloned().ok_or_else(|| {
                    internal_error!("best trial {} has no simulated features", best.trial_number)
                })?;
                warn!(
                    "Re-simulating best trial {} failed ({}); reporting its first repeat",
                    best.trial_number, e
                );
                stored
            }
            Err(e) => return Err(e),
        };

        status.mark_completed(strategy.stop_reason());
        Ok(CalibrationOutcome {
            best_params: best.params,
            best_features,
            best_loss: best.loss,
            status: status.clone(),
        })
    }

    async fn search(
        &self,
        strategy: &mut dyn SearchStrategy,
        status: &mut CalibrationStatus,
    ) -> ArborResult<()> {
        while !strategy.should_stop() {
            let candidates = strategy.propose();
            if candidates.is_empty() {
                if strategy.should_stop() {
                    break;
                }
                return Err(internal_error!(
                    "{} strategy proposed no candidates while running",
                    strategy.name()
                ));
            }
            let candidates = candidates
                .into_iter()
                .map(|candidate| {
                    self.space.check_names(&candidate.params)?;
                    let params = self.space.clamp(&candidate.params);
                    self.space.check(&params)?;
                    Ok(Candidate { params, ..candidate })
                })
                .collect::<ArborResult<Vec<_>>>()?;

            if let [candidate] = candidates.as_slice() {
                let record = self.evaluate_sequential(strategy, candidate).await?;
                self.conclude(strategy, candidate, record, status);
            } else {
                let records = self.evaluate_batch(&candidates).await?;
                for (candidate, record) in candidates.iter().zip(records) {
                    self.conclude(strategy, candidate, record, status);
                }
            }
        }
        Ok(())
    }

    /// Repeats in order, offering the strategy a pruning decision after each
    /// one but the last.
    async fn evaluate_sequential(
        &self,
        strategy: &mut dyn SearchStrategy,
        candidate: &Candidate,
    ) -> ArborResult<TrialRecord> {
        evaluate_candidate(
            self.port.as_ref(),
            &self.evaluator,
            candidate,
            &self.settings,
            |stage, partial| strategy.should_prune(candidate, stage, partial),
        )
        .await
    }

    /// Evaluate every candidate concurrently. Results come back in proposal
    /// order; the first unrecoverable error cancels the rest.
    async fn evaluate_batch(&self, candidates: &[Candidate]) -> ArborResult<Vec<TrialRecord>> {
        let permits = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();

        for (idx, candidate) in candidates.iter().enumerate() {
            let port = Arc::clone(&self.port);
            let evaluator = Arc::clone(&self.evaluator);
            let settings = self.settings.clone();
            let permits = Arc::clone(&permits);
            let candidate = candidate.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| internal_error!("evaluation permits closed: {e}"))?;
                let record =
                    evaluate_candidate(port.as_ref(), &evaluator, &candidate, &settings, |_, _| {
                        false
                    })
                    .await?;
                Ok::<_, ArborError>((idx, record))
            });
        }

        let mut records: Vec<Option<TrialRecord>> = vec![None; candidates.len()];
        while let Some(joined) = tasks.join_next().await {
            let (idx, record) =
                joined.map_err(|e| internal_error!("evaluation task failed: {e}"))??;
            records[idx] = Some(record);
        }
        records
            .into_iter()
            .map(|r| r.ok_or_else(|| internal_error!("batch evaluation lost a result")))
            .collect()
    }

    fn conclude(
        &self,
        strategy: &mut dyn SearchStrategy,
        candidate: &Candidate,
        record: TrialRecord,
        status: &mut CalibrationStatus,
    ) {
        strategy.observe(candidate, record.observation());
        let improved = status.record(&record);
        debug!(
            trial = record.trial_number,
            outcome = ?record.outcome,
            loss = record.loss,
            "trial finished"
        );

        let trial_number = record.trial_number;
        let loss = record.loss;
        self.emit(CalibrationEvent::TrialFinished { record });
        if improved {
            info!("New best loss {:.6} at trial {}", loss, trial_number);
            self.emit(CalibrationEvent::NewBest { trial_number, loss });
        }

        let every = self.settings.report_every;
        if every > 0 && status.trials_total() % every == 0 {
            info!(
                completed = status.trials_completed,
                failed = status.trials_failed,
                pruned = status.trials_pruned,
                best_loss = ?status.best_loss(),
                "{} trials evaluated",
                status.trials_total()
            );
        }
    }

    fn emit(&self, event: CalibrationEvent) {
        if let Some(tx) = &self.events {
            // Receiver may be gone; progress is also logged.
            let _ = tx.try_send(event);
        }
    }
}

/// Mean loss of `candidate` over the configured repeats.
///
/// After each non-final repeat `should_prune(repeats_done, partial_mean)` is
/// consulted; `true` ends the trial as pruned.
async fn evaluate_candidate<F>(
    port: &dyn SimulationPort,
    evaluator: &LossEvaluator,
    candidate: &Candidate,
    settings: &RunnerSettings,
    mut should_prune: F,
) -> ArborResult<TrialRecord>
where
    F: FnMut(usize, f64) -> bool,
{
    let trial_number = candidate.trial_number;
    let mut simulations = Vec::with_capacity(settings.repeats);

    for repeat in 0..settings.repeats {
        let seed = settings.seed(repeat);
        let features = match port.evaluate(&candidate.params, seed).await {
            Ok(features) => features,
            Err(e) if e.is_recoverable() => {
                warn!(
                    "Trial {} failed on repeat {} (seed {}): {}",
                    trial_number, repeat, seed, e
                );
                let error = e.to_string();
                simulations.push(SimulationRecord::failed(
                    repeat,
                    seed,
                    error.clone(),
                    settings.failure_loss,
                ));
                return Ok(TrialRecord::failed(
                    trial_number,
                    candidate.params.clone(),
                    settings.failure_loss,
                    error,
                    simulations,
                ));
            }
            Err(e) => return Err(e),
        };
        let loss = evaluator.score(&features)?;
        simulations.push(SimulationRecord::simulated(repeat, seed, features, loss));

        let done = repeat + 1;
        if done < settings.repeats {
            let partial = simulations.iter().map(|s| s.loss).sum::<f64>() / done as f64;
            if should_prune(done, partial) {
                debug!(trial = trial_number, stage = done, partial, "trial pruned");
                return Ok(TrialRecord::pruned(
                    trial_number,
                    candidate.params.clone(),
                    simulations,
                ));
            }
        }
    }

    Ok(TrialRecord::completed(
        trial_number,
        candidate.params.clone(),
        simulations,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{growth_parameter_space, reference_parameters, MockSimulator};
    use arbor_morphology::LossScales;
    use arbor_optimizer::{
        CalibrationState, EvolutionSettings, EvolutionStrategy, MedianPruner, ModelBasedSettings,
        Observation, RandomSearch, SearchPhase, SequentialModelBased, SimulationOutcome,
        StopReason,
    };
    use arbor_types::SimulationError;
    use async_trait::async_trait;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn evaluator() -> Arc<LossEvaluator> {
        let target = MockSimulator::new()
            .features(&reference_parameters(), 0)
            .unwrap();
        Arc::new(LossEvaluator::new(Arc::new(target), LossScales::default()).unwrap())
    }

    fn runner(port: Arc<dyn SimulationPort>, settings: RunnerSettings) -> CalibrationRunner {
        CalibrationRunner::new(port, growth_parameter_space(), evaluator()).with_settings(settings)
    }

    fn mock_runner(settings: RunnerSettings) -> CalibrationRunner {
        runner(Arc::new(MockSimulator::new()), settings)
    }

    fn assert_history_non_increasing(status: &CalibrationStatus) {
        assert!(status
            .best_loss_history
            .windows(2)
            .all(|w| w[1] <= w[0]));
    }

    /// Fails any candidate with `speed` above a threshold, otherwise defers
    /// to the mock.
    struct FlakyPort {
        inner: MockSimulator,
        max_speed: f64,
        error: SimulationError,
    }

    #[async_trait]
    impl SimulationPort for FlakyPort {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn evaluate(&self, params: &ParameterVector, seed: u64) -> ArborResult<FeatureSet> {
            if params.get("speed").unwrap_or(0.0) > self.max_speed {
                return Err(self.error.clone().into());
            }
            self.inner.evaluate(params, seed).await
        }
    }

    /// Mock that records how many evaluations overlap.
    #[derive(Default)]
    struct CountingPort {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SimulationPort for CountingPort {
        fn name(&self) -> &str {
            "counting"
        }

        async fn evaluate(&self, params: &ParameterVector, seed: u64) -> ArborResult<FeatureSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            MockSimulator::new().features(params, seed)
        }
    }

    /// Mock that times out on every call after the first `healthy` ones.
    struct ExhaustedPort {
        calls: AtomicUsize,
        healthy: usize,
    }

    #[async_trait]
    impl SimulationPort for ExhaustedPort {
        fn name(&self) -> &str {
            "exhausted"
        }

        async fn evaluate(&self, params: &ParameterVector, seed: u64) -> ArborResult<FeatureSet> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.healthy {
                return Err(SimulationError::Timeout { timeout_secs: 1.0 }.into());
            }
            MockSimulator::new().features(params, seed)
        }
    }

    /// Proposes one vector that does not belong to the growth space.
    struct ForeignStrategy;

    impl SearchStrategy for ForeignStrategy {
        fn name(&self) -> &str {
            "foreign"
        }

        fn phase(&self) -> SearchPhase {
            SearchPhase::Proposing
        }

        fn propose(&mut self) -> Vec<Candidate> {
            vec![Candidate {
                trial_number: 0,
                params: ParameterVector::from_pairs([("bogus", 1.0)]),
            }]
        }

        fn observe(&mut self, _candidate: &Candidate, _observation: Observation) {}

        fn should_stop(&self) -> bool {
            false
        }

        fn stop_reason(&self) -> Option<StopReason> {
            None
        }
    }

    #[tokio::test]
    async fn random_search_recovers_reference() {
        let space = growth_parameter_space();
        let strategy = Box::new(RandomSearch::new(space.clone(), 200, 11));
        let outcome = mock_runner(RunnerSettings::default().with_repeats(3))
            .run(strategy)
            .await
            .unwrap();

        assert!(outcome.best_loss < 0.05, "best loss {}", outcome.best_loss);
        let best = space.to_unit(&outcome.best_params);
        let reference = space.to_unit(&reference_parameters());
        for (name, (b, r)) in space.names().iter().zip(best.iter().zip(&reference)) {
            assert!((b - r).abs() <= 0.75, "{name}: {b} vs {r}");
        }

        let status = &outcome.status;
        assert_eq!(status.state, CalibrationState::Completed);
        assert_eq!(status.stop_reason, Some(StopReason::MaxTrials));
        assert_eq!(status.trials_completed, 200);
        assert_eq!(status.best_loss_history.len(), 200);
        assert_history_non_increasing(status);
        assert_eq!(status.best_trial.as_ref().unwrap().repeats_run, 3);
        assert!(outcome.best_features.is_complete());
    }

    #[tokio::test]
    async fn evolution_strategy_converges() {
        let settings = EvolutionSettings::default()
            .with_population(20)
            .with_max_generations(100);
        let strategy =
            Box::new(EvolutionStrategy::new(growth_parameter_space(), settings, 5).unwrap());
        let outcome = mock_runner(RunnerSettings::default().with_repeats(1))
            .run(strategy)
            .await
            .unwrap();

        assert!(outcome.best_loss < 0.05, "best loss {}", outcome.best_loss);
        assert_eq!(outcome.status.trials_total() % 20, 0);
        assert_history_non_increasing(&outcome.status);
    }

    #[tokio::test]
    async fn model_based_search_converges() {
        let settings = ModelBasedSettings::default().with_max_trials(200);
        let strategy = Box::new(SequentialModelBased::new(growth_parameter_space(), settings, 3));
        let outcome = mock_runner(RunnerSettings::default().with_repeats(1))
            .run(strategy)
            .await
            .unwrap();

        assert!(outcome.best_loss < 0.05, "best loss {}", outcome.best_loss);
        assert_eq!(outcome.status.trials_total(), 200);
    }

    #[tokio::test]
    async fn random_search_is_deterministic() {
        let run = || async {
            let strategy = Box::new(RandomSearch::new(growth_parameter_space(), 30, 9));
            mock_runner(RunnerSettings::default()).run(strategy).await.unwrap()
        };
        let first = run().await;
        let second = run().await;
        assert_eq!(first.best_params, second.best_params);
        assert_eq!(first.best_loss, second.best_loss);
        assert_eq!(
            first.status.best_loss_history,
            second.status.best_loss_history
        );
    }

    #[tokio::test]
    async fn recoverable_failures_are_scored_and_skipped() {
        for error in [
            SimulationError::Failure {
                message: "exit status 1".into(),
            },
            SimulationError::Timeout { timeout_secs: 1.0 },
        ] {
            let port = Arc::new(FlakyPort {
                inner: MockSimulator::new(),
                max_speed: 1.5,
                error,
            });
            let strategy = Box::new(RandomSearch::new(growth_parameter_space(), 40, 2));
            let outcome = runner(port, RunnerSettings::default()).run(strategy).await.unwrap();

            let status = &outcome.status;
            assert!(status.trials_failed > 0);
            assert!(status.trials_completed > 0);
            assert_eq!(status.trials_total(), 40);
            assert!(outcome.best_params.get("speed").unwrap() <= 1.5);
            assert!(outcome.best_loss < DEFAULT_FAILURE_LOSS);
        }
    }

    #[tokio::test]
    async fn failed_final_resimulation_reports_stored_features() {
        let port = Arc::new(ExhaustedPort {
            calls: AtomicUsize::new(0),
            healthy: 5,
        });
        let strategy = Box::new(RandomSearch::new(growth_parameter_space(), 5, 4));
        let outcome = runner(port.clone(), RunnerSettings::default().with_repeats(1))
            .run(strategy)
            .await
            .unwrap();

        assert_eq!(port.calls.load(Ordering::SeqCst), 6);
        assert_eq!(outcome.status.state, CalibrationState::Completed);
        assert_eq!(outcome.status.trials_completed, 5);
        let best = outcome.status.best_trial.as_ref().unwrap();
        assert_eq!(best.simulations[0].seed, 0);
        assert_eq!(best.first_features(), Some(&outcome.best_features));
        assert_eq!(
            outcome.best_features,
            MockSimulator::new().features(&outcome.best_params, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn trial_records_keep_every_simulator_call() {
        let port = Arc::new(FlakyPort {
            inner: MockSimulator::new(),
            max_speed: 1.5,
            error: SimulationError::Timeout { timeout_secs: 1.0 },
        });
        let (tx, rx) = unbounded();
        let strategy = Box::new(RandomSearch::new(growth_parameter_space(), 40, 2));
        let settings = RunnerSettings::default().with_repeats(3).with_base_seed(100);
        runner(port, settings)
            .with_events(tx)
            .run(strategy)
            .await
            .unwrap();

        let records: Vec<TrialRecord> = rx
            .try_iter()
            .filter_map(|e| match e {
                CalibrationEvent::TrialFinished { record } => Some(record),
                _ => None,
            })
            .collect();
        assert_eq!(records.len(), 40);
        for record in &records {
            match record.error {
                None => {
                    let seeds: Vec<u64> = record.simulations.iter().map(|s| s.seed).collect();
                    assert_eq!(seeds, vec![100, 101, 102]);
                    let mean = record.simulations.iter().map(|s| s.loss).sum::<f64>() / 3.0;
                    assert!((record.loss - mean).abs() < 1e-12);
                }
                Some(_) => {
                    assert_eq!(record.simulations.len(), 1);
                    assert!(matches!(
                        record.simulations[0].outcome,
                        SimulationOutcome::Failed { .. }
                    ));
                    assert_eq!(record.simulations[0].loss, DEFAULT_FAILURE_LOSS);
                }
            }
        }
        assert!(records.iter().any(|r| r.error.is_some()));
    }

    #[tokio::test]
    async fn foreign_parameter_names_abort_before_simulating() {
        let port = Arc::new(CountingPort::default());
        let err = runner(port.clone(), RunnerSettings::default())
            .run(Box::new(ForeignStrategy))
            .await
            .unwrap_err();

        assert!(matches!(err, ArborError::InvalidParameterVector { .. }));
        assert_eq!(port.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unavailable_backend_aborts_run() {
        let port = Arc::new(FlakyPort {
            inner: MockSimulator::new(),
            max_speed: f64::NEG_INFINITY,
            error: SimulationError::Unavailable {
                path: "./cpp/neuron_growth".into(),
            },
        });
        let (tx, rx) = unbounded();
        let strategy = Box::new(RandomSearch::new(growth_parameter_space(), 10, 0));
        let err = runner(port, RunnerSettings::default())
            .with_events(tx)
            .run(strategy)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ArborError::Simulation(SimulationError::Unavailable { .. })
        ));
        let events: Vec<CalibrationEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        match &events[0] {
            CalibrationEvent::Finished { status } => {
                assert_eq!(status.state, CalibrationState::Failed);
                assert!(status.error.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_without_completions_is_internal_error() {
        let port = Arc::new(FlakyPort {
            inner: MockSimulator::new(),
            max_speed: f64::NEG_INFINITY,
            error: SimulationError::Failure {
                message: "segfault".into(),
            },
        });
        let strategy = Box::new(RandomSearch::new(growth_parameter_space(), 5, 0));
        let err = runner(port, RunnerSettings::default())
            .run(strategy)
            .await
            .unwrap_err();
        assert!(matches!(err, ArborError::Internal(_)));
    }

    #[tokio::test]
    async fn median_pruner_cuts_repeats_short() {
        let settings = ModelBasedSettings::default()
            .with_max_trials(40)
            .with_pruner(MedianPruner::new(3, 0));
        let strategy = Box::new(SequentialModelBased::new(growth_parameter_space(), settings, 4));
        let port = Arc::new(CountingPort::default());
        let outcome = runner(port.clone(), RunnerSettings::default().with_repeats(3))
            .run(strategy)
            .await
            .unwrap();

        let status = &outcome.status;
        assert!(status.trials_pruned > 0);
        assert_eq!(status.trials_completed + status.trials_pruned, 40);
        let expected_calls = 3 * status.trials_completed + status.trials_pruned + 1;
        assert_eq!(port.calls.load(Ordering::SeqCst), expected_calls);
    }

    #[tokio::test]
    async fn batches_respect_concurrency() {
        let settings = EvolutionSettings::default()
            .with_population(8)
            .with_max_generations(2);
        let strategy =
            Box::new(EvolutionStrategy::new(growth_parameter_space(), settings, 1).unwrap());
        let port = Arc::new(CountingPort::default());
        let outcome = runner(
            port.clone(),
            RunnerSettings::default().with_repeats(1).with_concurrency(3),
        )
        .run(strategy)
        .await
        .unwrap();

        assert_eq!(outcome.status.trials_total(), 16);
        let peak = port.peak.load(Ordering::SeqCst);
        assert!(peak > 1 && peak <= 3, "peak {peak}");
    }

    #[tokio::test]
    async fn publishes_progress_events() {
        let (tx, rx) = unbounded();
        let strategy = Box::new(RandomSearch::new(growth_parameter_space(), 15, 6));
        let outcome = mock_runner(RunnerSettings::default().with_report_every(5))
            .with_events(tx)
            .run(strategy)
            .await
            .unwrap();

        let events: Vec<CalibrationEvent> = rx.try_iter().collect();
        let finished = events
            .iter()
            .filter(|e| matches!(e, CalibrationEvent::TrialFinished { .. }))
            .count();
        let improvements: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                CalibrationEvent::NewBest { loss, .. } => Some(*loss),
                _ => None,
            })
            .collect();

        assert_eq!(finished, 15);
        assert!(!improvements.is_empty());
        assert!(improvements.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(improvements.last().copied(), Some(outcome.best_loss));
        assert!(matches!(
            events.last(),
            Some(CalibrationEvent::Finished { status })
                if status.state == CalibrationState::Completed
        ));
    }

    #[tokio::test]
    async fn rejects_invalid_settings() {
        let strategy = Box::new(RandomSearch::new(growth_parameter_space(), 5, 0));
        let err = mock_runner(RunnerSettings::default().with_repeats(0))
            .run(strategy)
            .await
            .unwrap_err();
        assert!(matches!(err, ArborError::Config(_)));
    }
}
