//! Observed metric values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A single metric observation for one arm of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub trial_index: usize,
    pub arm_name: String,
    pub metric: String,
    pub mean: f64,
    /// Standard error of the mean, `None` when unknown.
    pub sem: Option<f64>,
    /// Progression of an intermediate observation (epoch, step, ...).
    /// `None` marks final data.
    pub step: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        trial_index: usize,
        arm_name: impl Into<String>,
        metric: impl Into<String>,
        mean: f64,
    ) -> Self {
        Self {
            trial_index,
            arm_name: arm_name.into(),
            metric: metric.into(),
            mean,
            sem: None,
            step: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_sem(mut self, sem: f64) -> Self {
        self.sem = Some(sem);
        self
    }

    pub fn at_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn is_final(&self) -> bool {
        self.step.is_none()
    }
}

/// An append-only collection of observations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Data {
    observations: Vec<Observation>,
}

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_observations(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn push(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    pub fn combine(&mut self, other: Data) {
        self.observations.extend(other.observations);
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.observations.iter()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    fn filtered(&self, keep: impl Fn(&Observation) -> bool) -> Data {
        Data {
            observations: self.observations.iter().filter(|o| keep(o)).cloned().collect(),
        }
    }

    pub fn for_trial(&self, trial_index: usize) -> Data {
        self.filtered(|o| o.trial_index == trial_index)
    }

    pub fn for_metric(&self, metric: &str) -> Data {
        self.filtered(|o| o.metric == metric)
    }

    pub fn final_only(&self) -> Data {
        self.filtered(Observation::is_final)
    }

    pub fn intermediate(&self) -> Data {
        self.filtered(|o| !o.is_final())
    }

    pub fn trial_indices(&self) -> BTreeSet<usize> {
        self.observations.iter().map(|o| o.trial_index).collect()
    }

    pub fn metric_names(&self) -> BTreeSet<String> {
        self.observations.iter().map(|o| o.metric.clone()).collect()
    }

    /// Mean of the final observations per arm and metric, averaging
    /// repeated entries.
    pub fn final_means(&self) -> HashMap<String, HashMap<String, f64>> {
        let mut sums: HashMap<String, HashMap<String, (f64, usize)>> = HashMap::new();
        for o in self.observations.iter().filter(|o| o.is_final()) {
            let entry = sums
                .entry(o.arm_name.clone())
                .or_default()
                .entry(o.metric.clone())
                .or_insert((0.0, 0));
            entry.0 += o.mean;
            entry.1 += 1;
        }

        sums.into_iter()
            .map(|(arm, metrics)| {
                let means = metrics
                    .into_iter()
                    .map(|(metric, (sum, n))| (metric, sum / n as f64))
                    .collect();
                (arm, means)
            })
            .collect()
    }

    /// Final means for a single arm across every trial it appeared in.
    pub fn arm_means(&self, arm_name: &str) -> HashMap<String, f64> {
        self.filtered(|o| o.arm_name == arm_name)
            .final_means()
            .remove(arm_name)
            .unwrap_or_default()
    }

    /// Most recent intermediate value (highest step) for a trial arm metric.
    pub fn latest_step_value(
        &self,
        trial_index: usize,
        arm_name: &str,
        metric: &str,
    ) -> Option<(u64, f64)> {
        self.observations
            .iter()
            .filter(|o| o.trial_index == trial_index && o.arm_name == arm_name && o.metric == metric)
            .filter_map(|o| o.step.map(|s| (s, o.mean)))
            .max_by_key(|(s, _)| *s)
    }

    /// Value of the metric for a trial at exactly `step`, if reported.
    pub fn value_at_step(&self, trial_index: usize, metric: &str, step: u64) -> Option<f64> {
        self.observations
            .iter()
            .rev()
            .find(|o| o.trial_index == trial_index && o.metric == metric && o.step == Some(step))
            .map(|o| o.mean)
    }
}

impl FromIterator<Observation> for Data {
    fn from_iter<I: IntoIterator<Item = Observation>>(iter: I) -> Self {
        Self {
            observations: iter.into_iter().collect(),
        }
    }
}

impl Extend<Observation> for Data {
    fn extend<I: IntoIterator<Item = Observation>>(&mut self, iter: I) {
        self.observations.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Data {
        Data::from_observations(vec![
            Observation::new(0, "0_0", "loss", 1.0),
            Observation::new(0, "0_0", "loss", 3.0),
            Observation::new(0, "0_0", "acc", 0.5).with_sem(0.1),
            Observation::new(1, "1_0", "loss", 0.9).at_step(1),
            Observation::new(1, "1_0", "loss", 0.7).at_step(3),
            Observation::new(1, "1_0", "loss", 0.8).at_step(2),
        ])
    }

    #[test]
    fn final_means_average_repeats() {
        let means = sample().final_means();
        assert_eq!(means["0_0"]["loss"], 2.0);
        assert_eq!(means["0_0"]["acc"], 0.5);
        assert!(!means.contains_key("1_0"));
    }

    #[test]
    fn filters() {
        let data = sample();
        assert_eq!(data.for_trial(1).len(), 3);
        assert_eq!(data.for_metric("acc").len(), 1);
        assert_eq!(data.final_only().len(), 3);
        assert_eq!(data.intermediate().len(), 3);
        assert_eq!(data.trial_indices().len(), 2);
    }

    #[test]
    fn latest_step_picks_highest_progression() {
        let data = sample();
        assert_eq!(data.latest_step_value(1, "1_0", "loss"), Some((3, 0.7)));
        assert_eq!(data.latest_step_value(0, "0_0", "loss"), None);
        assert_eq!(data.value_at_step(1, "loss", 2), Some(0.8));
    }

    #[test]
    fn same_arm_may_observe_different_values() {
        let data = Data::from_observations(vec![
            Observation::new(0, "0_0", "y", 1.0),
            Observation::new(1, "0_0", "y", 1.4),
        ]);
        assert_ne!(
            data.for_trial(0).final_means()["0_0"]["y"],
            data.for_trial(1).final_means()["0_0"]["y"]
        );
        assert!((data.arm_means("0_0")["y"] - 1.2).abs() < 1e-12);
    }
}
