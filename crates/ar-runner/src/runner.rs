//! Runner abstraction: how a trial gets evaluated.

use ar_types::{Arm, Observation};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Errors surfaced by runners.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("evaluation of trial {trial_index} failed: {message}")]
    EvaluationFailed { trial_index: usize, message: String },
    #[error("trial {trial_index} was stopped before it finished")]
    Stopped { trial_index: usize },
    #[error("runner internal error: {message}")]
    Internal { message: String },
}

/// Result alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Everything a runner gets for one trial evaluation.
///
/// Intermediate observations go through [`report`](Self::report); the
/// scheduler flips the stop signal when the trial is early-stopped or
/// timed out.
pub struct EvaluationContext {
    pub trial_index: usize,
    pub arms: Vec<Arm>,
    progress: mpsc::UnboundedSender<Observation>,
    stop: watch::Receiver<bool>,
}

impl EvaluationContext {
    pub fn new(
        trial_index: usize,
        arms: Vec<Arm>,
        progress: mpsc::UnboundedSender<Observation>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            trial_index,
            arms,
            progress,
            stop,
        }
    }

    /// Send an intermediate observation. Best effort: returns `false` if
    /// nobody is listening any more.
    pub fn report(&self, observation: Observation) -> bool {
        self.progress.send(observation).is_ok()
    }

    pub fn should_stop(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once a stop has been requested. If the scheduler goes away
    /// without requesting one, this never resolves.
    pub async fn stopped(&mut self) {
        let signalled = self.stop.wait_for(|stop| *stop).await.is_ok();
        if !signalled {
            std::future::pending::<()>().await;
        }
    }

    pub fn stopped_error(&self) -> RunnerError {
        RunnerError::Stopped {
            trial_index: self.trial_index,
        }
    }
}

/// Core runner interface.
///
/// Implementations may dispatch work to a remote system or evaluate
/// locally (see [`FunctionRunner`]).
#[async_trait]
pub trait Runner: Send + Sync {
    /// Prepare a trial for deployment. Returning run metadata moves the
    /// trial through STAGED; `None` skips staging.
    async fn stage(
        &self,
        _trial_index: usize,
        _arms: &[Arm],
    ) -> RunnerResult<Option<HashMap<String, serde_json::Value>>> {
        Ok(None)
    }

    /// Evaluate every arm of the trial and return its final observations.
    async fn evaluate(&self, ctx: EvaluationContext) -> RunnerResult<Vec<Observation>>;

    /// Human-readable runner name.
    fn name(&self) -> &str;
}

type EvalFn = dyn Fn(&Arm, Option<u64>) -> Result<HashMap<String, f64>, String> + Send + Sync;

/// Evaluates a local function per arm.
///
/// The function receives the arm and the progression step (`None` for the
/// final evaluation) and returns metric means. With a progression
/// configured, intermediate values are reported for steps `1..=steps`
/// before the final evaluation, checking the stop signal between steps.
#[derive(Clone)]
pub struct FunctionRunner {
    f: Arc<EvalFn>,
    steps: u64,
    step_delay: Option<Duration>,
    stage: bool,
}

impl FunctionRunner {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Arm, Option<u64>) -> Result<HashMap<String, f64>, String> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            steps: 0,
            step_delay: None,
            stage: false,
        }
    }

    pub fn with_progression(mut self, steps: u64, step_delay: Duration) -> Self {
        self.steps = steps;
        self.step_delay = Some(step_delay);
        self
    }

    /// Move trials through STAGED before running them.
    pub fn with_staging(mut self) -> Self {
        self.stage = true;
        self
    }

    fn observe(
        &self,
        ctx: &EvaluationContext,
        arm: &Arm,
        step: Option<u64>,
    ) -> RunnerResult<Vec<Observation>> {
        let arm_name = arm.name().unwrap_or_default();
        let metrics = (self.f)(arm, step).map_err(|message| RunnerError::EvaluationFailed {
            trial_index: ctx.trial_index,
            message,
        })?;
        Ok(metrics
            .into_iter()
            .map(|(metric, mean)| {
                let observation = Observation::new(ctx.trial_index, arm_name, metric, mean);
                match step {
                    Some(s) => observation.at_step(s),
                    None => observation,
                }
            })
            .collect())
    }
}

impl std::fmt::Debug for FunctionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRunner")
            .field("steps", &self.steps)
            .field("step_delay", &self.step_delay)
            .field("stage", &self.stage)
            .finish()
    }
}

#[async_trait]
impl Runner for FunctionRunner {
    async fn stage(
        &self,
        _trial_index: usize,
        arms: &[Arm],
    ) -> RunnerResult<Option<HashMap<String, serde_json::Value>>> {
        if !self.stage {
            return Ok(None);
        }
        let mut metadata = HashMap::new();
        metadata.insert("runner".to_string(), serde_json::json!(self.name()));
        metadata.insert("num_arms".to_string(), serde_json::json!(arms.len()));
        Ok(Some(metadata))
    }

    async fn evaluate(&self, ctx: EvaluationContext) -> RunnerResult<Vec<Observation>> {
        for step in 1..=self.steps {
            if ctx.should_stop() {
                return Err(ctx.stopped_error());
            }
            for arm in &ctx.arms {
                for observation in self.observe(&ctx, arm, Some(step))? {
                    ctx.report(observation);
                }
            }
            match self.step_delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }
        }

        if ctx.should_stop() {
            return Err(ctx.stopped_error());
        }

        let mut observations = Vec::new();
        for arm in &ctx.arms {
            observations.extend(self.observe(&ctx, arm, None)?);
        }
        Ok(observations)
    }

    fn name(&self) -> &str {
        "function"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(arms: Vec<Arm>) -> (
        EvaluationContext,
        mpsc::UnboundedReceiver<Observation>,
        watch::Sender<bool>,
    ) {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            EvaluationContext::new(0, arms, progress_tx, stop_rx),
            progress_rx,
            stop_tx,
        )
    }

    fn quadratic() -> FunctionRunner {
        FunctionRunner::new(|arm, step| {
            let x = arm.get("x").and_then(|v| v.as_f64()).ok_or("missing x")?;
            let scale = step.map_or(1.0, |s| 1.0 + 1.0 / s as f64);
            Ok(HashMap::from([("loss".to_string(), scale * x * x)]))
        })
    }

    #[tokio::test]
    async fn final_observations_per_arm() {
        let arms = vec![
            Arm::from_pairs([("x", 2.0)]).named("0_0"),
            Arm::from_pairs([("x", 3.0)]).named("0_1"),
        ];
        let (ctx, _progress, _stop) = context(arms);
        let observations = quadratic().evaluate(ctx).await.unwrap();

        assert_eq!(observations.len(), 2);
        assert!(observations.iter().all(|o| o.step.is_none()));
        assert_eq!(observations[1].arm_name, "0_1");
        assert_eq!(observations[1].mean, 9.0);
    }

    #[tokio::test]
    async fn progression_is_reported() {
        let runner = quadratic().with_progression(3, Duration::from_millis(1));
        let (ctx, mut progress, _stop) = context(vec![Arm::from_pairs([("x", 1.0)]).named("0_0")]);
        runner.evaluate(ctx).await.unwrap();

        let mut steps = Vec::new();
        while let Ok(o) = progress.try_recv() {
            steps.push(o.step.unwrap());
        }
        assert_eq!(steps, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stop_signal_interrupts_evaluation() {
        let runner = quadratic().with_progression(5, Duration::from_millis(1));
        let (ctx, _progress, stop) = context(vec![Arm::from_pairs([("x", 1.0)]).named("0_0")]);
        stop.send(true).unwrap();
        assert!(matches!(
            runner.evaluate(ctx).await,
            Err(RunnerError::Stopped { trial_index: 0 })
        ));
    }

    #[tokio::test]
    async fn function_errors_become_evaluation_failures() {
        let (ctx, _progress, _stop) = context(vec![Arm::from_pairs([("y", 1.0)]).named("0_0")]);
        let err = quadratic().evaluate(ctx).await.unwrap_err();
        assert!(err.to_string().contains("missing x"));
    }

    #[tokio::test]
    async fn staging_metadata() {
        let arms = vec![Arm::from_pairs([("x", 1.0)]).named("0_0")];
        assert!(quadratic().stage(0, &arms).await.unwrap().is_none());
        let metadata = quadratic().with_staging().stage(0, &arms).await.unwrap().unwrap();
        assert_eq!(metadata["num_arms"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn stopped_resolves_after_signal() {
        let (mut ctx, _progress, stop) = context(vec![]);
        let waiter = tokio::spawn(async move {
            ctx.stopped().await;
            ctx.should_stop()
        });
        stop.send(true).unwrap();
        assert!(waiter.await.unwrap());
    }
}
