use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ar_experiment::{Experiment, GenerationStrategy};
use ar_runner::{
    FunctionRunner, PercentileEarlyStopping, Scheduler, SchedulerConfig, SchedulerEvent,
};
use ar_store::ExperimentStore;
use ar_types::{
    Arm, ComparisonOp, Objective, OptimizationConfig, OutcomeConstraint, Parameter,
    ParameterType, SearchSpace,
};
use parking_lot::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Synthetic training run: loss decays towards a bowl centred on
/// `lr = 0.01`, `dropout = 0.2`; latency grows with the layer count.
fn train(arm: &Arm, step: Option<u64>) -> Result<HashMap<String, f64>, String> {
    let lr = arm.get("lr").and_then(|v| v.as_f64()).ok_or("lr missing")?;
    let dropout = arm.get("dropout").and_then(|v| v.as_f64()).ok_or("dropout missing")?;
    let layers = arm.get("layers").and_then(|v| v.as_f64()).ok_or("layers missing")?;

    let floor = (lr.log10() + 2.0).powi(2) + 4.0 * (dropout - 0.2).powi(2) + 0.05 * (layers - 4.0).abs();
    let decay = step.map_or(1.0, |s| 1.0 + 2.0 / s as f64);
    Ok(HashMap::from([
        ("loss".to_string(), floor * decay),
        ("latency_ms".to_string(), 3.0 * layers),
    ]))
}

fn build_experiment() -> anyhow::Result<Experiment> {
    let space = SearchSpace::new()
        .with_parameter(Parameter::float("lr", 1e-4, 1e-1)?.with_log_scale()?)?
        .with_parameter(Parameter::float("dropout", 0.0, 0.6)?)?
        .with_parameter(Parameter::int("layers", 1, 8)?)?
        .with_parameter(Parameter::choice(
            "activation",
            ParameterType::String,
            vec!["relu".into(), "gelu".into(), "tanh".into()],
        )?)?
        .with_constraint_str("dropout + 0.05 * layers <= 0.8")?;

    let config = OptimizationConfig::single(Objective::minimize("loss"))
        .with_outcome_constraint(OutcomeConstraint::new("latency_ms", ComparisonOp::Leq, 21.0))?;

    Ok(Experiment::new("armory-demo", space)
        .with_description("Synthetic hyperparameter sweep")
        .with_optimization_config(config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::var("ARMORY_CONFIG") {
        Ok(path) => SchedulerConfig::from_json_file(&path)?,
        Err(_) => SchedulerConfig::default(),
    }
    .with_env_overrides()?;
    let store_dir = std::env::var("ARMORY_STORE_DIR").unwrap_or_else(|_| "armory-store".to_string());

    let experiment = Arc::new(RwLock::new(build_experiment()?));
    let strategy = GenerationStrategy::random_then_perturbation(
        (config.total_trials / 3).max(config.max_pending_trials),
        config.seed,
    )?;
    let runner = FunctionRunner::new(train).with_progression(5, Duration::from_millis(10));

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let printer = std::thread::spawn(move || {
        for event in events_rx {
            match event {
                SchedulerEvent::TrialCompleted { index } => info!("trial {} completed", index),
                SchedulerEvent::TrialEarlyStopped { index, reason } => {
                    info!("trial {} stopped early: {}", index, reason)
                }
                SchedulerEvent::TrialFailed { index, reason } => info!("trial {} failed: {}", index, reason),
                _ => {}
            }
        }
    });

    let mut scheduler = Scheduler::new(experiment.clone(), strategy, runner, config)
        .with_early_stopping(PercentileEarlyStopping::new(Objective::minimize("loss")).with_min_progression(2))
        .with_events(events_tx);
    let status = scheduler.run().await?;
    drop(scheduler);
    let _ = printer.join();

    match &status.best_arm {
        Some(best) => println!(
            "Best arm {} (trial {}): {:?} -> {:?}",
            best.arm.name().unwrap_or("?"),
            best.trial_index,
            best.arm.parameters(),
            best.means
        ),
        None => println!("No feasible arm found"),
    }

    let store = ExperimentStore::new(&store_dir)?;
    let snapshot = experiment.read().clone();
    let dir = store.save_experiment(&snapshot)?;
    store.save_artifact(snapshot.name(), "run_status.json", &status)?;
    println!("Saved experiment to {}", dir.display());

    Ok(())
}
