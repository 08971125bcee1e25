//! Scheduler: the generate -> deploy -> observe loop.
//!
//! The [`Scheduler`] asks a [`GenerationStrategy`] for new trials, hands each
//! one to a [`Runner`] as its own tokio task, records intermediate and final
//! observations, applies early stopping and trial TTLs, and aborts when too
//! many trials fail. Progress is published as [`SchedulerEvent`]s on an
//! optional channel.

use ar_experiment::{
    ExperimentId, GenerationStrategy, ObservedArm, SharedExperiment, TrialStatus,
};
use ar_types::{ArError, GenerationError, Observation, TrialError};
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::early_stopping::EarlyStoppingStrategy;
use crate::runner::{EvaluationContext, Runner, RunnerError, RunnerResult};

pub const ENV_TOTAL_TRIALS: &str = "ARMORY_TOTAL_TRIALS";
pub const ENV_MAX_PENDING_TRIALS: &str = "ARMORY_MAX_PENDING_TRIALS";
pub const ENV_MAX_FAILURE_RATE: &str = "ARMORY_MAX_FAILURE_RATE";
pub const ENV_SEED: &str = "ARMORY_SEED";

/// Errors that end a scheduler run.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failure rate {rate:.2} exceeds the limit of {max_rate:.2} ({failed} of {finished} finished trials failed)")]
    FailureRateExceeded {
        failed: usize,
        finished: usize,
        rate: f64,
        max_rate: f64,
    },
    #[error("generation stalled: {0}")]
    Generation(GenerationError),
    #[error("experiment error: {0}")]
    Experiment(#[from] ArError),
    #[error("trial error: {0}")]
    Trial(#[from] TrialError),
    #[error("invalid scheduler configuration: {0}")]
    Config(String),
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration for a scheduler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Trials to create before the run ends.
    pub total_trials: usize,
    /// Trials staged or running at the same time.
    pub max_pending_trials: usize,
    /// Arms per trial; more than one creates batch trials.
    pub arms_per_trial: usize,
    /// Failures tolerated before the failure rate is checked at all.
    pub min_failed_trials_for_failure_rate_check: usize,
    /// Fraction of finished trials allowed to fail.
    pub max_failure_rate: f64,
    /// Running trials older than this are marked FAILED.
    pub trial_ttl_seconds: Option<u64>,
    /// Interval for early-stopping and TTL checks while trials run.
    pub poll_interval_ms: u64,
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            total_trials: 20,
            max_pending_trials: 4,
            arms_per_trial: 1,
            min_failed_trials_for_failure_rate_check: 5,
            max_failure_rate: 0.5,
            trial_ttl_seconds: None,
            poll_interval_ms: 50,
            seed: None,
        }
    }
}

fn parse_override<T>(key: &str, value: &str) -> Result<T, SchedulerError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SchedulerError::Config(format!("{key}={value}: {e}")))
}

impl SchedulerConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ARMORY_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, SchedulerError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the environment in production).
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SchedulerError> {
        if let Some(v) = lookup(ENV_TOTAL_TRIALS) {
            self.total_trials = parse_override(ENV_TOTAL_TRIALS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_PENDING_TRIALS) {
            self.max_pending_trials = parse_override(ENV_MAX_PENDING_TRIALS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_FAILURE_RATE) {
            self.max_failure_rate = parse_override(ENV_MAX_FAILURE_RATE, &v)?;
        }
        if let Some(v) = lookup(ENV_SEED) {
            self.seed = Some(parse_override(ENV_SEED, &v)?);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.total_trials == 0 {
            return Err(SchedulerError::Config("total_trials must be positive".into()));
        }
        if self.max_pending_trials == 0 {
            return Err(SchedulerError::Config("max_pending_trials must be positive".into()));
        }
        if self.arms_per_trial == 0 {
            return Err(SchedulerError::Config("arms_per_trial must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.max_failure_rate) {
            return Err(SchedulerError::Config(format!(
                "max_failure_rate must be within [0, 1], got {}",
                self.max_failure_rate
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(SchedulerError::Config("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Progress notifications emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerEvent {
    TrialCreated {
        index: usize,
        generation_method: Option<String>,
    },
    TrialStarted {
        index: usize,
    },
    ProgressReported {
        index: usize,
        metric: String,
        step: Option<u64>,
        value: f64,
    },
    TrialCompleted {
        index: usize,
    },
    TrialFailed {
        index: usize,
        reason: String,
    },
    TrialEarlyStopped {
        index: usize,
        reason: String,
    },
    TrialAbandoned {
        index: usize,
        reason: String,
    },
    Finished {
        trials_completed: usize,
        trials_failed: usize,
    },
}

/// Lifecycle state of a scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Aggregate status of a scheduler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub experiment_id: ExperimentId,
    pub experiment_name: String,
    pub state: RunState,
    pub trials_created: usize,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub trials_early_stopped: usize,
    pub trials_abandoned: usize,
    /// Best arm for a single-objective experiment.
    pub best_arm: Option<ObservedArm>,
    /// Pareto-optimal arms for a multi-objective experiment.
    pub pareto_frontier: Vec<ObservedArm>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunStatus {
    pub fn new(experiment_id: ExperimentId, experiment_name: impl Into<String>) -> Self {
        Self {
            experiment_id,
            experiment_name: experiment_name.into(),
            state: RunState::Pending,
            trials_created: 0,
            trials_completed: 0,
            trials_failed: 0,
            trials_early_stopped: 0,
            trials_abandoned: 0,
            best_arm: None,
            pareto_frontier: Vec::new(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = RunState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = RunState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Trials that reached COMPLETED, FAILED or EARLY_STOPPED.
    pub fn finished_trials(&self) -> usize {
        self.trials_completed + self.trials_failed + self.trials_early_stopped
    }
}

type Outcome = (usize, RunnerResult<Vec<Observation>>);
type InFlight = HashMap<usize, watch::Sender<bool>>;

/// Drives one experiment with bounded parallelism.
pub struct Scheduler {
    experiment: SharedExperiment,
    strategy: GenerationStrategy,
    runner: Arc<dyn Runner>,
    early_stopping: Option<Box<dyn EarlyStoppingStrategy>>,
    config: SchedulerConfig,
    events: Option<Sender<SchedulerEvent>>,
    status: RunStatus,
}

impl Scheduler {
    pub fn new(
        experiment: SharedExperiment,
        strategy: GenerationStrategy,
        runner: impl Runner + 'static,
        config: SchedulerConfig,
    ) -> Self {
        let status = {
            let mut exp = experiment.write();
            if config.trial_ttl_seconds.is_some() {
                exp.set_default_trial_ttl(config.trial_ttl_seconds);
            }
            RunStatus::new(exp.id(), exp.name())
        };
        Self {
            experiment,
            strategy,
            runner: Arc::new(runner),
            early_stopping: None,
            config,
            events: None,
            status,
        }
    }

    pub fn with_early_stopping(mut self, strategy: impl EarlyStoppingStrategy + 'static) -> Self {
        self.early_stopping = Some(Box::new(strategy));
        self
    }

    pub fn with_events(mut self, events: Sender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn experiment(&self) -> &SharedExperiment {
        &self.experiment
    }

    pub fn strategy(&self) -> &GenerationStrategy {
        &self.strategy
    }

    /// Run until `total_trials` trials have been created and finished, the
    /// generation strategy is done, or the failure rate is exceeded.
    pub async fn run(&mut self) -> Result<RunStatus, SchedulerError> {
        info!(
            "Starting scheduler for experiment {} ({} trials, {} in parallel, runner {})",
            self.status.experiment_name,
            self.config.total_trials,
            self.config.max_pending_trials,
            self.runner.name()
        );
        self.status.mark_running();

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Outcome>();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<Observation>();
        let mut in_flight = InFlight::new();
        let mut generation_done = false;
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if !generation_done {
                match self.launch_trials(&done_tx, &progress_tx, &mut in_flight).await {
                    Ok(done) => generation_done = done,
                    Err(e) => return Err(self.abort(&mut in_flight, e)),
                }
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(observation) = progress_rx.recv() => {
                    self.record_progress(observation);
                }
                Some((index, result)) = done_rx.recv() => {
                    // Progress sent before the outcome is already queued.
                    self.drain_progress(&mut progress_rx);
                    in_flight.remove(&index);
                    self.handle_outcome(index, result);
                }
                _ = tokio::time::sleep(poll) => {}
            }

            self.apply_early_stopping(&mut in_flight);
            self.fail_stale_trials(&mut in_flight);
            if let Err(e) = self.check_failure_rate() {
                return Err(self.abort(&mut in_flight, e));
            }
        }

        self.drain_progress(&mut progress_rx);
        self.finalize();
        Ok(self.status.clone())
    }

    fn drain_progress(&mut self, progress_rx: &mut mpsc::UnboundedReceiver<Observation>) {
        while let Ok(observation) = progress_rx.try_recv() {
            self.record_progress(observation);
        }
    }

    /// Create and start trials while capacity and budget allow. Returns
    /// `true` once no further trials will be generated.
    async fn launch_trials(
        &mut self,
        done_tx: &mpsc::UnboundedSender<Outcome>,
        progress_tx: &mpsc::UnboundedSender<Observation>,
        in_flight: &mut InFlight,
    ) -> Result<bool, SchedulerError> {
        while self.status.trials_created < self.config.total_trials
            && in_flight.len() < self.config.max_pending_trials
        {
            let created = {
                let mut experiment = self.experiment.write();
                if self.config.arms_per_trial > 1 {
                    self.strategy
                        .generate_batch_trial(&mut experiment, self.config.arms_per_trial)
                } else {
                    self.strategy.generate_trial(&mut experiment)
                }
            };

            let index = match created {
                Ok(index) => index,
                Err(ArError::Generation(GenerationError::Completed)) => {
                    info!("Generation strategy completed");
                    return Ok(true);
                }
                Err(ArError::Generation(e @ GenerationError::Exhausted { .. })) => {
                    warn!("Stopping generation: {}", e);
                    return Ok(true);
                }
                Err(ArError::Generation(
                    e @ (GenerationError::DataRequired { .. }
                    | GenerationError::MaxParallelismReached { .. }),
                )) => {
                    if in_flight.is_empty() {
                        return Err(SchedulerError::Generation(e));
                    }
                    debug!("Generation paused: {}", e);
                    return Ok(false);
                }
                Err(ArError::Generation(e)) => return Err(SchedulerError::Generation(e)),
                Err(e) => return Err(e.into()),
            };

            self.status.trials_created += 1;
            self.start_trial(index, done_tx, progress_tx, in_flight).await?;
        }
        Ok(self.status.trials_created >= self.config.total_trials)
    }

    async fn start_trial(
        &mut self,
        index: usize,
        done_tx: &mpsc::UnboundedSender<Outcome>,
        progress_tx: &mpsc::UnboundedSender<Observation>,
        in_flight: &mut InFlight,
    ) -> Result<(), SchedulerError> {
        let (arms, generation_method) = {
            let experiment = self.experiment.read();
            let trial = experiment.trial(index)?;
            let arms: Vec<_> = trial.active_arms().into_iter().cloned().collect();
            (arms, trial.generation_method().map(str::to_string))
        };
        self.emit(SchedulerEvent::TrialCreated {
            index,
            generation_method,
        });

        let staged = self.runner.stage(index, &arms).await;
        {
            let shared = Arc::clone(&self.experiment);
            let mut experiment = shared.write();
            let trial = experiment.trial_mut(index)?;
            match staged {
                Ok(Some(metadata)) => {
                    for (key, value) in metadata {
                        trial.update_run_metadata(key, value);
                    }
                    trial.mark_staged()?;
                }
                Ok(None) => {}
                Err(e) => {
                    let reason = format!("staging failed: {e}");
                    trial.mark_abandoned(reason.clone())?;
                    self.status.trials_abandoned += 1;
                    self.emit(SchedulerEvent::TrialAbandoned { index, reason });
                    return Ok(());
                }
            }
            trial.mark_running()?;
        }
        self.emit(SchedulerEvent::TrialStarted { index });

        let (stop_tx, stop_rx) = watch::channel(false);
        in_flight.insert(index, stop_tx);

        let ctx = EvaluationContext::new(index, arms, progress_tx.clone(), stop_rx);
        let runner = Arc::clone(&self.runner);
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let result = runner.evaluate(ctx).await;
            let _ = done_tx.send((index, result));
        });
        Ok(())
    }

    fn handle_outcome(&mut self, index: usize, result: RunnerResult<Vec<Observation>>) {
        let shared = Arc::clone(&self.experiment);
        let mut experiment = shared.write();
        let Ok(trial) = experiment.trial_mut(index) else {
            warn!("Runner reported an unknown trial {}", index);
            return;
        };
        let was_running = trial.status() == TrialStatus::Running;

        let event = match result {
            Ok(observations) => {
                let attached = trial.attach_data(observations);
                if !was_running {
                    debug!("Trial {} returned data after it became {}", index, trial.status());
                    return;
                }
                match attached {
                    Ok(_) => {
                        if trial.mark_completed().is_err() {
                            return;
                        }
                        self.status.trials_completed += 1;
                        SchedulerEvent::TrialCompleted { index }
                    }
                    Err(e) => {
                        let reason = format!("runner returned invalid data: {e}");
                        if trial.mark_failed(reason.clone()).is_err() {
                            return;
                        }
                        self.status.trials_failed += 1;
                        SchedulerEvent::TrialFailed { index, reason }
                    }
                }
            }
            Err(_) if !was_running => return,
            Err(RunnerError::Stopped { .. }) => {
                let reason = "stopped by runner".to_string();
                if trial.mark_early_stopped(reason.clone()).is_err() {
                    return;
                }
                self.status.trials_early_stopped += 1;
                SchedulerEvent::TrialEarlyStopped { index, reason }
            }
            Err(e) => {
                let reason = e.to_string();
                if trial.mark_failed(reason.clone()).is_err() {
                    return;
                }
                self.status.trials_failed += 1;
                SchedulerEvent::TrialFailed { index, reason }
            }
        };
        drop(experiment);
        self.emit(event);
    }

    fn record_progress(&mut self, observation: Observation) {
        let index = observation.trial_index;
        let event = SchedulerEvent::ProgressReported {
            index,
            metric: observation.metric.clone(),
            step: observation.step,
            value: observation.mean,
        };
        match self.experiment.write().attach_data(index, [observation]) {
            Ok(_) => self.emit(event),
            Err(e) => debug!("Dropping progress for trial {}: {}", index, e),
        }
    }

    fn apply_early_stopping(&mut self, in_flight: &mut InFlight) {
        let Some(strategy) = self.early_stopping.as_ref() else {
            return;
        };
        let decisions = {
            let experiment = self.experiment.read();
            let mut candidates: Vec<usize> = in_flight.keys().copied().collect();
            candidates.sort_unstable();
            strategy.should_stop_trials(&experiment, &candidates)
        };

        for (index, reason) in decisions {
            let stopped = match self.experiment.write().trial_mut(index) {
                Ok(trial) => trial.mark_early_stopped(reason.clone()).is_ok(),
                Err(_) => false,
            };
            if !stopped {
                continue;
            }
            info!("Early stopping trial {}: {}", index, reason);
            if let Some(stop) = in_flight.remove(&index) {
                let _ = stop.send(true);
            }
            self.status.trials_early_stopped += 1;
            self.emit(SchedulerEvent::TrialEarlyStopped { index, reason });
        }
    }

    fn fail_stale_trials(&mut self, in_flight: &mut InFlight) {
        let Some(ttl) = self.config.trial_ttl_seconds else {
            return;
        };
        let failed = self.experiment.write().fail_stale_trials(Utc::now());
        for index in failed {
            if let Some(stop) = in_flight.remove(&index) {
                let _ = stop.send(true);
            }
            self.status.trials_failed += 1;
            self.emit(SchedulerEvent::TrialFailed {
                index,
                reason: format!("exceeded TTL of {ttl} seconds"),
            });
        }
    }

    fn check_failure_rate(&self) -> Result<(), SchedulerError> {
        let failed = self.status.trials_failed;
        let finished = self.status.finished_trials();
        if failed < self.config.min_failed_trials_for_failure_rate_check || finished == 0 {
            return Ok(());
        }
        let rate = failed as f64 / finished as f64;
        if rate > self.config.max_failure_rate {
            return Err(SchedulerError::FailureRateExceeded {
                failed,
                finished,
                rate,
                max_rate: self.config.max_failure_rate,
            });
        }
        Ok(())
    }

    /// Stop and abandon every in-flight trial and mark the run failed.
    fn abort(&mut self, in_flight: &mut InFlight, error: SchedulerError) -> SchedulerError {
        warn!("Aborting scheduler: {}", error);
        let reason = format!("scheduler aborted: {error}");
        let mut indices: Vec<usize> = in_flight.keys().copied().collect();
        indices.sort_unstable();
        for index in indices {
            if let Some(stop) = in_flight.remove(&index) {
                let _ = stop.send(true);
            }
            let abandoned = match self.experiment.write().trial_mut(index) {
                Ok(trial) => trial.mark_abandoned(reason.clone()).is_ok(),
                Err(_) => false,
            };
            if abandoned {
                self.status.trials_abandoned += 1;
                self.emit(SchedulerEvent::TrialAbandoned {
                    index,
                    reason: reason.clone(),
                });
            }
        }
        self.status.mark_failed(error.to_string());
        error
    }

    fn finalize(&mut self) {
        {
            let experiment = self.experiment.read();
            if let Some(config) = experiment.optimization_config() {
                if config.is_multi_objective() {
                    match experiment.pareto_frontier() {
                        Ok(front) => self.status.pareto_frontier = front,
                        Err(e) => warn!("Could not compute the Pareto frontier: {}", e),
                    }
                } else {
                    match experiment.best_arm() {
                        Ok(best) => self.status.best_arm = best,
                        Err(e) => warn!("Could not determine the best arm: {}", e),
                    }
                }
            }
        }
        self.status.mark_completed();
        info!(
            "Scheduler finished: {} completed, {} failed, {} early stopped, {} abandoned",
            self.status.trials_completed,
            self.status.trials_failed,
            self.status.trials_early_stopped,
            self.status.trials_abandoned
        );
        self.emit(SchedulerEvent::Finished {
            trials_completed: self.status.trials_completed,
            trials_failed: self.status.trials_failed,
        });
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(events) = &self.events {
            // Listeners are optional; a dropped receiver loses events.
            let _ = events.try_send(event);
        }
    }
}
