//! Early-stopping strategies for running trials.
//!
//! A strategy looks at the intermediate observations (those with a `step`)
//! of running trials and names the ones that should stop. The scheduler
//! marks them EARLY_STOPPED and signals their runner.

use ar_experiment::{Experiment, TrialStatus};
use ar_types::Objective;
use std::collections::HashMap;

/// Decides whether running trials should stop early.
pub trait EarlyStoppingStrategy: Send + Sync {
    /// `Some(reason)` if trial `trial_index` should stop now.
    fn should_stop(&self, experiment: &Experiment, trial_index: usize) -> Option<String>;

    /// Decisions for several trials. Only running trials are considered.
    fn should_stop_trials(
        &self,
        experiment: &Experiment,
        trial_indices: &[usize],
    ) -> HashMap<usize, String> {
        trial_indices
            .iter()
            .filter(|i| {
                experiment
                    .trial(**i)
                    .is_ok_and(|t| t.status() == TrialStatus::Running)
            })
            .filter_map(|i| self.should_stop(experiment, *i).map(|reason| (*i, reason)))
            .collect()
    }
}

/// Latest `(step, value)` of `metric` for a trial, over its active arms.
fn latest_progress(experiment: &Experiment, trial_index: usize, metric: &str) -> Option<(u64, f64)> {
    let trial = experiment.trial(trial_index).ok()?;
    trial
        .active_arms()
        .iter()
        .filter_map(|arm| {
            trial
                .data()
                .latest_step_value(trial_index, arm.name()?, metric)
        })
        .max_by_key(|(step, _)| *step)
}

/// Linear-interpolation percentile of `values`, `q` in `[0, 100]`.
fn percentile(values: &mut [f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = q.clamp(0.0, 100.0) / 100.0 * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(values[lo] + (values[hi] - values[lo]) * (rank - lo as f64))
}

/// Stop a trial whose latest intermediate value is worse than the given
/// percentile of all trials' values at the same step.
///
/// With the default `percentile_threshold` of 50 a trial stops when it is
/// below the median (for maximization) or above it (for minimization).
#[derive(Debug, Clone, PartialEq)]
pub struct PercentileEarlyStopping {
    objective: Objective,
    percentile_threshold: f64,
    /// Steps a trial must reach before it can be stopped.
    min_progression: u64,
    /// Trials with data at the same step needed for a comparison.
    min_curves: usize,
}

impl PercentileEarlyStopping {
    pub fn new(objective: Objective) -> Self {
        Self {
            objective,
            percentile_threshold: 50.0,
            min_progression: 1,
            min_curves: 3,
        }
    }

    pub fn with_percentile_threshold(mut self, percentile: f64) -> Self {
        self.percentile_threshold = percentile.clamp(0.0, 100.0);
        self
    }

    pub fn with_min_progression(mut self, step: u64) -> Self {
        self.min_progression = step;
        self
    }

    pub fn with_min_curves(mut self, n: usize) -> Self {
        self.min_curves = n.max(1);
        self
    }
}

impl EarlyStoppingStrategy for PercentileEarlyStopping {
    fn should_stop(&self, experiment: &Experiment, trial_index: usize) -> Option<String> {
        let metric = self.objective.metric.as_str();
        let (step, value) = latest_progress(experiment, trial_index, metric)?;
        if step < self.min_progression {
            return None;
        }

        let data = experiment.fetch_data();
        let mut values: Vec<f64> = data
            .trial_indices()
            .into_iter()
            .filter_map(|i| data.value_at_step(i, metric, step))
            .collect();
        if values.len() < self.min_curves {
            return None;
        }

        let q = if self.objective.minimize {
            100.0 - self.percentile_threshold
        } else {
            self.percentile_threshold
        };
        let cutoff = percentile(&mut values, q)?;
        if !self.objective.is_better(cutoff, value) {
            return None;
        }
        Some(format!(
            "{metric} = {value} at step {step} is worse than the {q}th percentile ({cutoff}) of {} trials",
            values.len()
        ))
    }
}

/// Stop a trial as soon as its latest intermediate value is worse than a
/// fixed threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdEarlyStopping {
    objective: Objective,
    threshold: f64,
    min_progression: u64,
}

impl ThresholdEarlyStopping {
    pub fn new(objective: Objective, threshold: f64) -> Self {
        Self {
            objective,
            threshold,
            min_progression: 1,
        }
    }

    pub fn with_min_progression(mut self, step: u64) -> Self {
        self.min_progression = step;
        self
    }
}

impl EarlyStoppingStrategy for ThresholdEarlyStopping {
    fn should_stop(&self, experiment: &Experiment, trial_index: usize) -> Option<String> {
        let metric = self.objective.metric.as_str();
        let (step, value) = latest_progress(experiment, trial_index, metric)?;
        if step < self.min_progression || !self.objective.is_better(self.threshold, value) {
            return None;
        }
        Some(format!(
            "{metric} = {value} at step {step} is worse than the threshold {}",
            self.threshold
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_types::{Arm, Observation, Parameter, SearchSpace};

    /// One running trial per curve; `curves[i][s]` is the value at step s+1.
    fn experiment_with_curves(curves: &[&[f64]]) -> Experiment {
        let space = SearchSpace::new()
            .with_parameter(Parameter::float("x", 0.0, 100.0).unwrap())
            .unwrap();
        let mut exp = Experiment::new("curves", space);
        for (i, curve) in curves.iter().enumerate() {
            exp.new_trial(Arm::from_pairs([("x", i as f64)])).unwrap();
            let trial = exp.trial_mut(i).unwrap();
            trial.mark_running().unwrap();
            let name = format!("{i}_0");
            trial
                .attach_data(curve.iter().enumerate().map(|(s, v)| {
                    Observation::new(i, name.as_str(), "loss", *v).at_step(s as u64 + 1)
                }))
                .unwrap();
        }
        exp
    }

    #[test]
    fn percentile_interpolates() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(&mut values, 50.0), Some(2.5));
        assert_eq!(percentile(&mut values, 0.0), Some(1.0));
        assert_eq!(percentile(&mut values, 100.0), Some(4.0));
        assert_eq!(percentile(&mut [], 50.0), None);
    }

    #[test]
    fn percentile_stops_the_worst_curve() {
        let exp = experiment_with_curves(&[&[1.0, 0.8], &[1.0, 0.7], &[1.2, 1.5]]);
        let strategy = PercentileEarlyStopping::new(Objective::minimize("loss"));

        let decisions = strategy.should_stop_trials(&exp, &[0, 1, 2]);
        assert_eq!(decisions.len(), 1);
        assert!(decisions[&2].contains("percentile"));
    }

    #[test]
    fn percentile_waits_for_enough_curves() {
        let exp = experiment_with_curves(&[&[1.0], &[5.0]]);
        let strategy = PercentileEarlyStopping::new(Objective::minimize("loss"));
        assert!(strategy.should_stop(&exp, 1).is_none());
        assert!(strategy
            .with_min_curves(2)
            .should_stop(&exp, 1)
            .is_some());
    }

    #[test]
    fn min_progression_delays_decisions() {
        let exp = experiment_with_curves(&[&[1.0], &[1.0], &[9.0]]);
        let strategy =
            PercentileEarlyStopping::new(Objective::minimize("loss")).with_min_progression(2);
        assert!(strategy.should_stop(&exp, 2).is_none());
    }

    #[test]
    fn threshold_respects_direction() {
        let exp = experiment_with_curves(&[&[0.2, 0.4], &[0.9]]);
        let minimize = ThresholdEarlyStopping::new(Objective::minimize("loss"), 0.5);
        assert!(minimize.should_stop(&exp, 0).is_none());
        assert!(minimize.should_stop(&exp, 1).is_some());

        let maximize = ThresholdEarlyStopping::new(Objective::maximize("loss"), 0.5);
        assert!(maximize.should_stop(&exp, 0).is_some());
        assert!(maximize.should_stop(&exp, 1).is_none());
    }

    #[test]
    fn only_running_trials_are_considered() {
        let mut exp = experiment_with_curves(&[&[0.9]]);
        exp.trial_mut(0).unwrap().mark_completed().unwrap();
        let strategy = ThresholdEarlyStopping::new(Objective::minimize("loss"), 0.5);
        assert!(strategy.should_stop_trials(&exp, &[0]).is_empty());
    }
}
