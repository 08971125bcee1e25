//! The experiment aggregate: search space, optimization config, status quo
//! and the ordered list of trials.

use ar_types::{
    pareto, validation_error, ArResult, Arm, Data, Observation, OptimizationConfig,
    SearchSpace, TrialError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::trial::{Trial, TrialStatus};

/// Unique experiment identifier.
pub type ExperimentId = Uuid;

/// Name given to an unnamed status quo arm.
pub const STATUS_QUO_NAME: &str = "status_quo";

/// An arm together with the final metric means observed for it in one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedArm {
    pub trial_index: usize,
    pub arm: Arm,
    pub means: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    id: ExperimentId,
    name: String,
    description: String,
    search_space: SearchSpace,
    optimization_config: Option<OptimizationConfig>,
    status_quo: Option<Arm>,
    trials: BTreeMap<usize, Trial>,
    /// Arm name -> arm, over every trial.
    arms_by_name: BTreeMap<String, Arm>,
    /// Arm signature -> arm name.
    arm_names_by_signature: BTreeMap<String, String>,
    default_trial_ttl_seconds: Option<u64>,
    created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, search_space: SearchSpace) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            search_space,
            optimization_config: None,
            status_quo: None,
            trials: BTreeMap::new(),
            arms_by_name: BTreeMap::new(),
            arm_names_by_signature: BTreeMap::new(),
            default_trial_ttl_seconds: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_optimization_config(mut self, config: OptimizationConfig) -> Self {
        self.optimization_config = Some(config);
        self
    }

    /// Trials created from now on get this TTL.
    pub fn with_default_trial_ttl(mut self, seconds: u64) -> Self {
        self.default_trial_ttl_seconds = Some(seconds);
        self
    }

    pub fn set_default_trial_ttl(&mut self, seconds: Option<u64>) {
        self.default_trial_ttl_seconds = seconds;
    }

    /// Set the control arm. Its values are cast to the parameter types but
    /// it may lie outside the search space's bounds and constraints.
    pub fn with_status_quo(mut self, arm: Arm) -> ArResult<Self> {
        let parameters = self.search_space.cast_parameterization(arm.parameters())?;
        let name = arm.name().unwrap_or(STATUS_QUO_NAME).to_string();
        let status_quo = arm.with_parameters(parameters).named(&name);

        if !self.search_space.contains(status_quo.parameters()) {
            warn!(
                "Status quo {} of experiment {} lies outside the search space",
                name, self.name
            );
        }

        self.register_arm(&status_quo)?;
        self.status_quo = Some(status_quo);
        Ok(self)
    }

    pub fn id(&self) -> ExperimentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn search_space(&self) -> &SearchSpace {
        &self.search_space
    }

    /// Replace the search space. Existing trials are kept as they are;
    /// see [`invalid_arms`](Self::invalid_arms).
    pub fn set_search_space(&mut self, search_space: SearchSpace) {
        info!("Experiment {}: search space replaced", self.name);
        self.search_space = search_space;
    }

    pub fn optimization_config(&self) -> Option<&OptimizationConfig> {
        self.optimization_config.as_ref()
    }

    pub fn set_optimization_config(&mut self, config: OptimizationConfig) {
        self.optimization_config = Some(config);
    }

    pub fn status_quo(&self) -> Option<&Arm> {
        self.status_quo.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // ------------------------------------------------------------------
    // Trials
    // ------------------------------------------------------------------

    pub fn num_trials(&self) -> usize {
        self.trials.len()
    }

    pub fn trials(&self) -> impl Iterator<Item = &Trial> {
        self.trials.values()
    }

    pub fn trial(&self, index: usize) -> ArResult<&Trial> {
        self.trials
            .get(&index)
            .ok_or_else(|| TrialError::NotFound { index }.into())
    }

    pub fn trial_mut(&mut self, index: usize) -> ArResult<&mut Trial> {
        self.trials
            .get_mut(&index)
            .ok_or_else(|| TrialError::NotFound { index }.into())
    }

    pub fn trials_by_status(&self, status: TrialStatus) -> Vec<&Trial> {
        self.trials.values().filter(|t| t.status() == status).collect()
    }

    pub fn trial_indices_by_status(&self, status: TrialStatus) -> Vec<usize> {
        self.trials
            .values()
            .filter(|t| t.status() == status)
            .map(Trial::index)
            .collect()
    }

    pub fn num_pending_trials(&self) -> usize {
        self.trials.values().filter(|t| t.status().is_pending()).count()
    }

    pub fn arm(&self, name: &str) -> Option<&Arm> {
        self.arms_by_name.get(name)
    }

    pub fn arms(&self) -> impl Iterator<Item = &Arm> {
        self.arms_by_name.values()
    }

    /// Name already given to an arm with these parameter values, if any.
    pub fn arm_name_for(&self, arm: &Arm) -> Option<&str> {
        self.arm_names_by_signature
            .get(&arm.signature())
            .map(String::as_str)
    }

    fn next_trial_index(&self) -> usize {
        self.trials.len()
    }

    fn new_trial_shell(&self, trial: Trial) -> Trial {
        match self.default_trial_ttl_seconds {
            Some(ttl) => trial.with_ttl_seconds(ttl),
            None => trial,
        }
    }

    /// Validate an arm and give it its experiment-wide name.
    ///
    /// Known parameter values keep the name they already have. New arms are
    /// named `"{trial}_{position}"` unless they carry an unused name.
    fn prepare_arm(&self, arm: &Arm, trial_index: usize, position: usize) -> ArResult<Arm> {
        let arm = match self.search_space.validate_arm(arm) {
            Ok(arm) => arm,
            // The status quo is exempt from bounds and constraints.
            Err(err) => self.as_status_quo(arm).ok_or(err)?,
        };

        if let Some(existing) = self.arm_name_for(&arm) {
            if let Some(requested) = arm.name() {
                if requested != existing {
                    return Err(validation_error!(
                        "Arm {} has the same parameters as existing arm {}",
                        requested,
                        existing
                    ));
                }
            }
            return Ok(arm.named(existing));
        }

        let requested = arm.name().map(str::to_string);
        match requested {
            Some(requested) if self.arms_by_name.contains_key(&requested) => Err(validation_error!(
                "Arm name {} is already used by different parameters",
                requested
            )),
            Some(_) => Ok(arm),
            None => Ok(arm.named(format!("{trial_index}_{position}"))),
        }
    }

    /// The cast copy of `arm` if its values are the status quo's.
    fn as_status_quo(&self, arm: &Arm) -> Option<Arm> {
        let status_quo = self.status_quo.as_ref()?;
        let parameters = self.search_space.cast_parameterization(arm.parameters()).ok()?;
        let arm = arm.with_parameters(parameters);
        (arm.signature() == status_quo.signature()).then_some(arm)
    }

    fn register_arm(&mut self, arm: &Arm) -> ArResult<()> {
        let name = arm
            .name()
            .ok_or_else(|| validation_error!("Cannot register an unnamed arm"))?
            .to_string();
        if let Some(existing) = self.arms_by_name.get(&name) {
            if existing.signature() != arm.signature() {
                return Err(validation_error!(
                    "Arm name {} is already used by different parameters",
                    name
                ));
            }
            return Ok(());
        }
        self.arm_names_by_signature.insert(arm.signature(), name.clone());
        self.arms_by_name.insert(name, arm.clone());
        Ok(())
    }

    /// Create a single-arm trial. The arm is cast and validated first; an
    /// invalid arm leaves the experiment unchanged.
    pub fn new_trial(&mut self, arm: Arm) -> ArResult<&mut Trial> {
        let index = self.next_trial_index();
        let arm = self.prepare_arm(&arm, index, 0)?;
        self.register_arm(&arm)?;

        let trial = self.new_trial_shell(Trial::single(index, arm));
        info!("Experiment {}: created trial {}", self.name, index);
        Ok(self.trials.entry(index).or_insert(trial))
    }

    /// Create a batch trial with equal weights.
    pub fn new_batch_trial(&mut self, arms: Vec<Arm>) -> ArResult<&mut Trial> {
        self.new_weighted_batch_trial(arms.into_iter().map(|a| (a, 1.0)).collect())
    }

    /// Create a batch trial. Every arm is validated before anything is
    /// recorded.
    pub fn new_weighted_batch_trial(&mut self, arms: Vec<(Arm, f64)>) -> ArResult<&mut Trial> {
        if arms.is_empty() {
            return Err(TrialError::EmptyBatch.into());
        }
        let index = self.next_trial_index();

        let mut trial = self.new_trial_shell(Trial::batch(index));
        let prepared = self.prepare_batch_arms(&trial, arms)?;
        for (arm, weight) in &prepared {
            trial.add_arm(arm.clone(), *weight)?;
        }
        for (arm, _) in &prepared {
            self.register_arm(arm)?;
        }

        info!(
            "Experiment {}: created batch trial {} with {} arms",
            self.name,
            index,
            prepared.len()
        );
        Ok(self.trials.entry(index).or_insert(trial))
    }

    /// Add arms to a candidate batch trial.
    pub fn add_arms_to_trial(&mut self, index: usize, arms: Vec<(Arm, f64)>) -> ArResult<()> {
        let trial = self.trial(index)?;
        if trial.status() != TrialStatus::Candidate {
            return Err(TrialError::NotCandidate {
                index,
                status: trial.status().to_string(),
            }
            .into());
        }
        if !trial.is_batch() {
            return Err(TrialError::WrongKind {
                message: "arms can only be added to batch trials".to_string(),
            }
            .into());
        }

        let prepared = self.prepare_batch_arms(trial, arms)?;
        for (arm, _) in &prepared {
            self.register_arm(arm)?;
        }
        let trial = self.trial_mut(index)?;
        for (arm, weight) in prepared {
            trial.add_arm(arm, weight)?;
        }
        Ok(())
    }

    fn prepare_batch_arms(&self, trial: &Trial, arms: Vec<(Arm, f64)>) -> ArResult<Vec<(Arm, f64)>> {
        let offset = trial.arms().len();
        let mut prepared: Vec<(Arm, f64)> = Vec::with_capacity(arms.len());
        for (position, (arm, weight)) in arms.into_iter().enumerate() {
            if !(weight.is_finite() && weight > 0.0) {
                return Err(TrialError::InvalidWeight { weight }.into());
            }
            let mut arm = self.prepare_arm(&arm, trial.index(), offset + position)?;

            // Repeats inside the same batch share one name.
            if let Some((earlier, _)) = prepared
                .iter()
                .find(|(a, _)| a.signature() == arm.signature())
            {
                if let Some(name) = earlier.name() {
                    arm = arm.named(name);
                }
            } else if prepared.iter().any(|(a, _)| a.name() == arm.name()) {
                return Err(validation_error!(
                    "Arm name {} is used twice in trial {} for different parameters",
                    arm.name().unwrap_or_default(),
                    trial.index()
                ));
            }
            prepared.push((arm, weight));
        }
        Ok(prepared)
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    pub fn attach_data(
        &mut self,
        index: usize,
        observations: impl IntoIterator<Item = Observation>,
    ) -> ArResult<usize> {
        let count = self.trial_mut(index)?.attach_data(observations)?;
        debug!("Experiment {}: attached {} observations to trial {}", self.name, count, index);
        Ok(count)
    }

    /// All data of every trial.
    pub fn fetch_data(&self) -> Data {
        let mut data = Data::new();
        for trial in self.trials.values() {
            data.combine(trial.data().clone());
        }
        data
    }

    pub fn fetch_trial_data(&self, index: usize) -> ArResult<Data> {
        Ok(self.trial(index)?.data().clone())
    }

    /// Final means of the status quo across all trials it appeared in.
    pub fn status_quo_means(&self) -> Option<HashMap<String, f64>> {
        let name = self.status_quo.as_ref()?.name()?;
        let means = self.fetch_data().arm_means(name);
        (!means.is_empty()).then_some(means)
    }

    /// The optimization config with relative bounds resolved against the
    /// status quo. Configs without relative bounds are returned unchanged.
    pub fn derelativized_config(&self) -> ArResult<OptimizationConfig> {
        let config = self
            .optimization_config
            .as_ref()
            .ok_or_else(|| validation_error!("Experiment {} has no optimization config", self.name))?;
        if !config.has_relative_bounds() {
            return Ok(config.clone());
        }
        let means = self.status_quo_means().unwrap_or_default();
        Ok(config.derelativize(&means)?)
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    /// Final means per arm of every completed trial.
    pub fn observed_arms(&self) -> Vec<ObservedArm> {
        let mut observed = Vec::new();
        for trial in self.trials_by_status(TrialStatus::Completed) {
            let mut means = trial.data().final_means();
            for arm in trial.active_arms() {
                let Some(arm_means) = arm.name().and_then(|n| means.remove(n)) else {
                    continue;
                };
                observed.push(ObservedArm {
                    trial_index: trial.index(),
                    arm: arm.clone(),
                    means: arm_means,
                });
            }
        }
        observed
    }

    fn feasible_arms(&self, config: &OptimizationConfig) -> Vec<ObservedArm> {
        self.observed_arms()
            .into_iter()
            .filter(|o| {
                config
                    .objectives()
                    .iter()
                    .all(|obj| o.means.contains_key(&obj.metric))
            })
            .filter(|o| config.satisfies_outcome_constraints(&o.means))
            .collect()
    }

    /// Best feasible completed arm under a single-objective config.
    pub fn best_arm(&self) -> ArResult<Option<ObservedArm>> {
        let config = self.derelativized_config()?;
        if config.is_multi_objective() {
            return Err(validation_error!(
                "best_arm needs a single objective; use pareto_frontier"
            ));
        }
        let objective = &config.objectives()[0];

        let best = self
            .feasible_arms(&config)
            .into_iter()
            .fold(None::<ObservedArm>, |best, candidate| match best {
                Some(current)
                    if !objective.is_better(
                        candidate.means[&objective.metric],
                        current.means[&objective.metric],
                    ) =>
                {
                    Some(current)
                }
                _ => Some(candidate),
            });
        Ok(best)
    }

    /// Non-dominated feasible completed arms that lie inside every
    /// objective threshold.
    pub fn pareto_frontier(&self) -> ArResult<Vec<ObservedArm>> {
        let config = self.derelativized_config()?;
        let candidates: Vec<ObservedArm> = self
            .feasible_arms(&config)
            .into_iter()
            .filter(|o| config.within_thresholds(&o.means))
            .collect();

        let points: Vec<Vec<f64>> = candidates
            .iter()
            .map(|o| {
                config
                    .objectives()
                    .iter()
                    .map(|obj| o.means[&obj.metric])
                    .collect()
            })
            .collect();

        let front = pareto::pareto_front(&points, config.objectives());
        Ok(front.into_iter().map(|i| candidates[i].clone()).collect())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Fail every running trial that outlived its TTL. Returns their indices.
    pub fn fail_stale_trials(&mut self, now: DateTime<Utc>) -> Vec<usize> {
        self.trials
            .values_mut()
            .filter_map(|t| t.fail_if_stale(now).then_some(t.index()))
            .collect()
    }

    /// Arms of existing trials that the current search space no longer
    /// contains. Their trials are left untouched.
    pub fn invalid_arms(&self) -> Vec<(usize, Arm)> {
        self.trials
            .values()
            .flat_map(|t| t.arms().into_iter().map(move |a| (t.index(), a)))
            .filter(|(_, a)| !self.search_space.contains(a.parameters()))
            .map(|(i, a)| (i, a.clone()))
            .collect()
    }

    /// Counts per status, for summaries.
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for trial in self.trials.values() {
            *counts.entry(trial.status().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_types::{ArError, ArmError, ComparisonOp, Objective, OutcomeConstraint, Parameter};

    fn unit_square() -> SearchSpace {
        SearchSpace::new()
            .with_parameter(Parameter::float("x1", 0.0, 1.0).unwrap())
            .unwrap()
            .with_parameter(Parameter::float("x2", 0.0, 1.0).unwrap())
            .unwrap()
            .with_constraint_str("x1 + x2 <= 1")
            .unwrap()
    }

    fn point(x1: f64, x2: f64) -> Arm {
        Arm::from_pairs([("x1", x1), ("x2", x2)])
    }

    fn complete_with(exp: &mut Experiment, index: usize, metric: &str, value: f64) {
        let arm_name = exp.trial(index).unwrap().arms()[0].name().unwrap().to_string();
        let trial = exp.trial_mut(index).unwrap();
        trial.mark_running().unwrap();
        trial
            .attach_data([Observation::new(index, arm_name, metric, value)])
            .unwrap();
        trial.mark_completed().unwrap();
    }

    #[test]
    fn trials_get_sequential_indices_and_arm_names() {
        let mut exp = Experiment::new("square", unit_square());
        let t0 = exp.new_trial(point(0.1, 0.2)).unwrap().index();
        let t1 = exp.new_trial(point(0.3, 0.2)).unwrap().index();
        assert_eq!((t0, t1), (0, 1));
        assert_eq!(exp.trial(1).unwrap().arm().unwrap().name(), Some("1_0"));

        // Known parameters keep their name in later trials.
        let t2 = exp.new_trial(point(0.1, 0.2)).unwrap();
        assert_eq!(t2.arm().unwrap().name(), Some("0_0"));
        assert_eq!(exp.arms().count(), 2);
    }

    #[test]
    fn invalid_arm_is_rejected_without_side_effects() {
        let mut exp = Experiment::new("square", unit_square());
        let err = exp.new_trial(point(0.6, 0.5)).unwrap_err();
        assert!(matches!(
            err,
            ArError::Arm(ArmError::ConstraintViolation { .. })
        ));
        assert_eq!(exp.num_trials(), 0);

        let trial = exp.new_trial(point(0.6, 0.4)).unwrap();
        assert_eq!(trial.index(), 0);
    }

    #[test]
    fn integer_values_are_rounded_before_validation() {
        let space = SearchSpace::new()
            .with_parameter(Parameter::int("n", 1, 10).unwrap())
            .unwrap();
        let mut exp = Experiment::new("ints", space);
        let trial = exp.new_trial(Arm::from_pairs([("n", 4.6)])).unwrap();
        assert_eq!(
            trial.arm().unwrap().get("n"),
            Some(&ar_types::ParameterValue::Int(5))
        );
    }

    #[test]
    fn batch_trial_names_and_validation() {
        let mut exp = Experiment::new("square", unit_square());
        exp.new_trial(point(0.1, 0.1)).unwrap();

        let batch = exp
            .new_batch_trial(vec![point(0.2, 0.2), point(0.1, 0.1), point(0.2, 0.2)])
            .unwrap();
        let names: Vec<_> = batch.arms().iter().map(|a| a.name().unwrap().to_string()).collect();
        assert_eq!(names, vec!["1_0", "0_0", "1_0"]);

        assert!(exp
            .new_batch_trial(vec![point(0.2, 0.2), point(0.9, 0.9)])
            .is_err());
        assert_eq!(exp.num_trials(), 2);
        assert!(matches!(
            exp.new_batch_trial(vec![]),
            Err(ArError::Trial(TrialError::EmptyBatch))
        ));
    }

    #[test]
    fn arms_can_be_added_to_candidate_batches_only() {
        let mut exp = Experiment::new("square", unit_square());
        exp.new_batch_trial(vec![point(0.1, 0.1)]).unwrap();
        exp.add_arms_to_trial(0, vec![(point(0.2, 0.3), 2.0)]).unwrap();
        assert_eq!(exp.trial(0).unwrap().arms()[1].name(), Some("0_1"));

        exp.trial_mut(0).unwrap().mark_running().unwrap();
        assert!(exp.add_arms_to_trial(0, vec![(point(0.3, 0.3), 1.0)]).is_err());
    }

    #[test]
    fn same_arm_in_two_trials_keeps_separate_data() {
        let mut exp = Experiment::new("square", unit_square());
        exp.new_trial(point(0.5, 0.5)).unwrap();
        exp.new_trial(point(0.5, 0.5)).unwrap();
        complete_with(&mut exp, 0, "y", 1.0);
        complete_with(&mut exp, 1, "y", 1.3);

        let data = exp.fetch_data();
        assert_eq!(data.len(), 2);
        assert_eq!(exp.fetch_trial_data(0).unwrap().final_means()["0_0"]["y"], 1.0);
        assert_eq!(exp.fetch_trial_data(1).unwrap().final_means()["0_0"]["y"], 1.3);
    }

    #[test]
    fn best_arm_respects_outcome_constraints() {
        let config = OptimizationConfig::new(
            vec![Objective::minimize("loss")],
            vec![OutcomeConstraint::new("cost", ComparisonOp::Leq, 10.0)],
        )
        .unwrap();
        let mut exp = Experiment::new("square", unit_square()).with_optimization_config(config);

        for (i, (loss, cost)) in [(0.5, 5.0), (0.1, 20.0), (0.3, 8.0)].iter().enumerate() {
            exp.new_trial(point(0.1 * i as f64, 0.1)).unwrap();
            let name = format!("{i}_0");
            let trial = exp.trial_mut(i).unwrap();
            trial.mark_running().unwrap();
            trial
                .attach_data([
                    Observation::new(i, name.clone(), "loss", *loss),
                    Observation::new(i, name, "cost", *cost),
                ])
                .unwrap();
            trial.mark_completed().unwrap();
        }

        let best = exp.best_arm().unwrap().unwrap();
        assert_eq!(best.trial_index, 2);
        assert_eq!(best.means["loss"], 0.3);
    }

    #[test]
    fn pareto_frontier_applies_thresholds() {
        let config = OptimizationConfig::multi(vec![
            Objective::minimize("latency"),
            Objective::maximize("accuracy"),
        ])
        .unwrap()
        .with_objective_threshold(ar_types::ObjectiveThreshold::new(
            "accuracy",
            ComparisonOp::Geq,
            0.5,
        ))
        .unwrap();
        let mut exp = Experiment::new("square", unit_square()).with_optimization_config(config);

        let results = [(10.0, 0.9), (5.0, 0.7), (12.0, 0.8), (1.0, 0.2)];
        for (i, (latency, accuracy)) in results.iter().enumerate() {
            exp.new_trial(point(0.1 * i as f64, 0.0)).unwrap();
            let name = format!("{i}_0");
            let trial = exp.trial_mut(i).unwrap();
            trial.mark_running().unwrap();
            trial
                .attach_data([
                    Observation::new(i, name.clone(), "latency", *latency),
                    Observation::new(i, name, "accuracy", *accuracy),
                ])
                .unwrap();
            trial.mark_completed().unwrap();
        }

        let mut front: Vec<usize> = exp
            .pareto_frontier()
            .unwrap()
            .iter()
            .map(|o| o.trial_index)
            .collect();
        front.sort();
        // Trial 2 is dominated by trial 0, trial 3 is below the threshold.
        assert_eq!(front, vec![0, 1]);
        assert!(exp.best_arm().is_err());
    }

    #[test]
    fn relative_constraints_resolve_against_status_quo() {
        let config = OptimizationConfig::new(
            vec![Objective::maximize("revenue")],
            vec![OutcomeConstraint::new("cost", ComparisonOp::Leq, 10.0).relative()],
        )
        .unwrap();
        let mut exp = Experiment::new("square", unit_square())
            .with_optimization_config(config)
            .with_status_quo(point(0.5, 0.5))
            .unwrap();

        assert!(exp.derelativized_config().is_err());

        exp.new_batch_trial(vec![point(0.5, 0.5)]).unwrap();
        let trial = exp.trial_mut(0).unwrap();
        assert_eq!(trial.arms()[0].name(), Some(STATUS_QUO_NAME));
        trial.mark_running().unwrap();
        trial
            .attach_data([Observation::new(0, STATUS_QUO_NAME, "cost", 20.0)])
            .unwrap();

        let resolved = exp.derelativized_config().unwrap();
        let bound = resolved.outcome_constraints()[0].bound;
        assert!((bound - 22.0).abs() < 1e-9);
    }

    #[test]
    fn status_quo_may_be_out_of_design() {
        let exp = Experiment::new("square", unit_square())
            .with_status_quo(point(0.9, 0.9))
            .unwrap();
        assert_eq!(exp.status_quo().unwrap().name(), Some(STATUS_QUO_NAME));
    }

    #[test]
    fn out_of_design_status_quo_can_be_deployed() {
        let config = OptimizationConfig::new(
            vec![Objective::maximize("revenue")],
            vec![OutcomeConstraint::new("cost", ComparisonOp::Leq, 10.0).relative()],
        )
        .unwrap();
        let mut exp = Experiment::new("square", unit_square())
            .with_optimization_config(config)
            .with_status_quo(point(2.0, 0.5))
            .unwrap();

        let trial = exp.new_trial(point(2.0, 0.5)).unwrap();
        assert_eq!(trial.arm().unwrap().name(), Some(STATUS_QUO_NAME));
        exp.new_batch_trial(vec![point(0.1, 0.1), point(2.0, 0.5)]).unwrap();
        assert_eq!(exp.trial(1).unwrap().arms()[1].name(), Some(STATUS_QUO_NAME));

        // Other arms outside the domain are still rejected.
        assert!(matches!(
            exp.new_trial(point(2.0, 0.4)),
            Err(ArError::Arm(ArmError::OutOfDomain { .. }))
        ));

        let trial = exp.trial_mut(0).unwrap();
        trial.mark_running().unwrap();
        trial
            .attach_data([Observation::new(0, STATUS_QUO_NAME, "cost", 20.0)])
            .unwrap();
        let bound = exp.derelativized_config().unwrap().outcome_constraints()[0].bound;
        assert!((bound - 22.0).abs() < 1e-9);
    }

    #[test]
    fn narrowing_the_search_space_reports_invalid_arms() {
        let mut exp = Experiment::new("square", unit_square());
        exp.new_trial(point(0.8, 0.1)).unwrap();
        exp.new_trial(point(0.1, 0.1)).unwrap();

        let narrow = SearchSpace::new()
            .with_parameter(Parameter::float("x1", 0.0, 0.5).unwrap())
            .unwrap()
            .with_parameter(Parameter::float("x2", 0.0, 1.0).unwrap())
            .unwrap();
        exp.set_search_space(narrow);

        let invalid = exp.invalid_arms();
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].0, 0);
        assert_eq!(exp.trial(0).unwrap().status(), TrialStatus::Candidate);
    }

    #[test]
    fn experiment_serializes() {
        let mut exp = Experiment::new("square", unit_square());
        exp.new_trial(point(0.2, 0.3)).unwrap();
        let json = serde_json::to_string(&exp).unwrap();
        let back: Experiment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, exp);
    }
}
