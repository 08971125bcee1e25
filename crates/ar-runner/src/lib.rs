//! # ar-runner
//!
//! Deployment side of Armory: the [`Runner`] trait that evaluates trials,
//! early-stopping strategies that cut poor trials short, and the
//! [`Scheduler`] that ties generation, deployment and data collection into
//! one loop.

pub mod early_stopping;
pub mod runner;
pub mod scheduler;

pub use early_stopping::{EarlyStoppingStrategy, PercentileEarlyStopping, ThresholdEarlyStopping};
pub use runner::{EvaluationContext, FunctionRunner, Runner, RunnerError, RunnerResult};
pub use scheduler::{
    RunState, RunStatus, Scheduler, SchedulerConfig, SchedulerError, SchedulerEvent,
};
