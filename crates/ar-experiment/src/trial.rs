//! Trials and their lifecycle.

use ar_types::{Arm, Data, Observation, TrialError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle state of a trial.
///
/// ```text
/// CANDIDATE -> STAGED -> RUNNING -> COMPLETED | FAILED | EARLY_STOPPED
///     \_________________/    any non-terminal state -> ABANDONED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialStatus {
    Candidate,
    Staged,
    Running,
    Completed,
    Failed,
    EarlyStopped,
    Abandoned,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::EarlyStopped | Self::Abandoned
        )
    }

    /// Deployed trials have left the candidate state and may carry data.
    pub fn is_deployed(self) -> bool {
        self != Self::Candidate
    }

    /// Staged or running.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Staged | Self::Running)
    }

    pub fn can_transition_to(self, next: TrialStatus) -> bool {
        use TrialStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Abandoned) => true,
            (Candidate, Staged) | (Candidate, Running) => true,
            (Staged, Running) | (Staged, Failed) => true,
            (Running, Completed) | (Running, Failed) | (Running, EarlyStopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Candidate => "CANDIDATE",
            Self::Staged => "STAGED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::EarlyStopped => "EARLY_STOPPED",
            Self::Abandoned => "ABANDONED",
        };
        f.write_str(s)
    }
}

/// An arm inside a batch trial together with its relative weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedArm {
    pub arm: Arm,
    pub weight: f64,
}

/// What a trial evaluates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrialKind {
    /// Exactly one arm.
    Single { arm: Arm },
    /// Several weighted arms deployed together.
    Batch {
        arms: Vec<WeightedArm>,
        /// Arm name -> abandonment reason.
        abandoned_arms: BTreeMap<String, String>,
    },
}

/// A single evaluation unit of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    index: usize,
    kind: TrialKind,
    status: TrialStatus,
    status_reason: Option<String>,
    generation_method: Option<String>,
    ttl_seconds: Option<u64>,
    run_metadata: HashMap<String, serde_json::Value>,
    data: Data,
    created_at: DateTime<Utc>,
    staged_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    fn with_kind(index: usize, kind: TrialKind) -> Self {
        Self {
            index,
            kind,
            status: TrialStatus::Candidate,
            status_reason: None,
            generation_method: None,
            ttl_seconds: None,
            run_metadata: HashMap::new(),
            data: Data::new(),
            created_at: Utc::now(),
            staged_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn single(index: usize, arm: Arm) -> Self {
        Self::with_kind(index, TrialKind::Single { arm })
    }

    /// An empty batch; arms are added while it is still a candidate.
    pub fn batch(index: usize) -> Self {
        Self::with_kind(
            index,
            TrialKind::Batch {
                arms: Vec::new(),
                abandoned_arms: BTreeMap::new(),
            },
        )
    }

    pub fn with_ttl_seconds(mut self, ttl: u64) -> Self {
        self.ttl_seconds = Some(ttl);
        self
    }

    pub fn with_generation_method(mut self, method: impl Into<String>) -> Self {
        self.generation_method = Some(method.into());
        self
    }

    pub fn set_generation_method(&mut self, method: impl Into<String>) {
        self.generation_method = Some(method.into());
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> &TrialKind {
        &self.kind
    }

    pub fn is_batch(&self) -> bool {
        matches!(self.kind, TrialKind::Batch { .. })
    }

    pub fn status(&self) -> TrialStatus {
        self.status
    }

    pub fn status_reason(&self) -> Option<&str> {
        self.status_reason.as_deref()
    }

    pub fn generation_method(&self) -> Option<&str> {
        self.generation_method.as_deref()
    }

    pub fn ttl_seconds(&self) -> Option<u64> {
        self.ttl_seconds
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn staged_at(&self) -> Option<DateTime<Utc>> {
        self.staged_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn run_metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.run_metadata
    }

    pub fn update_run_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.run_metadata.insert(key.into(), value);
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    /// The arm of a single-arm trial.
    pub fn arm(&self) -> Option<&Arm> {
        match &self.kind {
            TrialKind::Single { arm } => Some(arm),
            TrialKind::Batch { .. } => None,
        }
    }

    /// Every arm in the trial, abandoned batch arms included.
    pub fn arms(&self) -> Vec<&Arm> {
        match &self.kind {
            TrialKind::Single { arm } => vec![arm],
            TrialKind::Batch { arms, .. } => arms.iter().map(|w| &w.arm).collect(),
        }
    }

    /// Arms that are still part of the evaluation.
    pub fn active_arms(&self) -> Vec<&Arm> {
        match &self.kind {
            TrialKind::Single { arm } => vec![arm],
            TrialKind::Batch {
                arms,
                abandoned_arms,
            } => arms
                .iter()
                .filter(|w| {
                    w.arm
                        .name()
                        .map_or(true, |name| !abandoned_arms.contains_key(name))
                })
                .map(|w| &w.arm)
                .collect(),
        }
    }

    pub fn has_arm(&self, name: &str) -> bool {
        self.arms().iter().any(|a| a.name() == Some(name))
    }

    /// Add an arm to a candidate batch trial.
    pub fn add_arm(&mut self, arm: Arm, weight: f64) -> Result<(), TrialError> {
        if !(weight.is_finite() && weight > 0.0) {
            return Err(TrialError::InvalidWeight { weight });
        }
        if self.status != TrialStatus::Candidate {
            return Err(TrialError::NotCandidate {
                index: self.index,
                status: self.status.to_string(),
            });
        }
        match &mut self.kind {
            TrialKind::Batch { arms, .. } => {
                arms.push(WeightedArm { arm, weight });
                Ok(())
            }
            TrialKind::Single { .. } => Err(TrialError::WrongKind {
                message: "arms can only be added to batch trials".to_string(),
            }),
        }
    }

    /// Arm weights scaled to sum to one. A single trial has weight 1.
    pub fn normalized_weights(&self) -> Vec<(&Arm, f64)> {
        match &self.kind {
            TrialKind::Single { arm } => vec![(arm, 1.0)],
            TrialKind::Batch { arms, .. } => {
                let total: f64 = arms.iter().map(|w| w.weight).sum();
                arms.iter().map(|w| (&w.arm, w.weight / total)).collect()
            }
        }
    }

    /// Abandon one arm of a batch trial without touching the others.
    pub fn abandon_arm(&mut self, name: &str, reason: impl Into<String>) -> Result<(), TrialError> {
        let index = self.index;
        match &mut self.kind {
            TrialKind::Batch {
                arms,
                abandoned_arms,
            } => {
                if !arms.iter().any(|w| w.arm.name() == Some(name)) {
                    return Err(TrialError::UnknownArm {
                        index,
                        arm: name.to_string(),
                    });
                }
                let reason = reason.into();
                info!("Trial {}: abandoning arm {} ({})", index, name, reason);
                abandoned_arms.insert(name.to_string(), reason);
                Ok(())
            }
            TrialKind::Single { .. } => Err(TrialError::WrongKind {
                message: "only batch trials can abandon individual arms; abandon the trial instead"
                    .to_string(),
            }),
        }
    }

    pub fn abandoned_arms(&self) -> Option<&BTreeMap<String, String>> {
        match &self.kind {
            TrialKind::Batch { abandoned_arms, .. } => Some(abandoned_arms),
            TrialKind::Single { .. } => None,
        }
    }

    fn transition(&mut self, next: TrialStatus, reason: Option<String>) -> Result<(), TrialError> {
        if !self.status.can_transition_to(next) {
            return Err(TrialError::InvalidTransition {
                index: self.index,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            TrialStatus::Staged => self.staged_at = Some(now),
            TrialStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }

        debug!("Trial {}: {} -> {}", self.index, self.status, next);
        self.status = next;
        self.status_reason = reason;
        Ok(())
    }

    pub fn mark_staged(&mut self) -> Result<(), TrialError> {
        self.transition(TrialStatus::Staged, None)
    }

    pub fn mark_running(&mut self) -> Result<(), TrialError> {
        self.transition(TrialStatus::Running, None)
    }

    pub fn mark_completed(&mut self) -> Result<(), TrialError> {
        self.transition(TrialStatus::Completed, None)
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), TrialError> {
        let reason = reason.into();
        self.transition(TrialStatus::Failed, Some(reason.clone()))?;
        warn!("Trial {} failed: {}", self.index, reason);
        Ok(())
    }

    pub fn mark_early_stopped(&mut self, reason: impl Into<String>) -> Result<(), TrialError> {
        self.transition(TrialStatus::EarlyStopped, Some(reason.into()))
    }

    pub fn mark_abandoned(&mut self, reason: impl Into<String>) -> Result<(), TrialError> {
        self.transition(TrialStatus::Abandoned, Some(reason.into()))
    }

    /// Attach observations to a deployed trial. Every observation must name
    /// one of the trial's arms and carry finite values; its trial index is
    /// set to this trial. Nothing is attached if any observation is rejected.
    pub fn attach_data(
        &mut self,
        observations: impl IntoIterator<Item = Observation>,
    ) -> Result<usize, TrialError> {
        if !self.status.is_deployed() {
            return Err(TrialError::DataOnCandidate { index: self.index });
        }

        let mut accepted = Vec::new();
        for mut observation in observations {
            if !self.has_arm(&observation.arm_name) {
                return Err(TrialError::UnknownArm {
                    index: self.index,
                    arm: observation.arm_name,
                });
            }
            let non_finite = [("mean", Some(observation.mean)), ("sem", observation.sem)]
                .into_iter()
                .find_map(|(field, v)| v.filter(|v| !v.is_finite()).map(|v| (field, v)));
            if let Some((field, value)) = non_finite {
                return Err(TrialError::NonFiniteValue {
                    index: self.index,
                    arm: observation.arm_name,
                    metric: observation.metric,
                    field: field.to_string(),
                    value,
                });
            }
            observation.trial_index = self.index;
            accepted.push(observation);
        }

        let count = accepted.len();
        self.data.extend(accepted);
        Ok(count)
    }

    /// `true` if the trial is running and has outlived its TTL at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.ttl_seconds, self.started_at) {
            // TTLs beyond chrono's range never expire.
            (TrialStatus::Running, Some(ttl), Some(started)) => i64::try_from(ttl)
                .ok()
                .and_then(Duration::try_seconds)
                .is_some_and(|ttl| now - started > ttl),
            _ => false,
        }
    }

    /// Mark the trial FAILED if it is stale. Returns whether it was.
    pub fn fail_if_stale(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_stale(now) {
            return false;
        }
        let ttl = self.ttl_seconds.unwrap_or_default();
        self.mark_failed(format!("exceeded TTL of {ttl} seconds")).is_ok()
    }

    /// Wall-clock run time, once the trial has started.
    pub fn run_duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        Some(self.finished_at.unwrap_or_else(Utc::now) - started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm(name: &str, x: f64) -> Arm {
        Arm::from_pairs([("x", x)]).named(name)
    }

    #[test]
    fn trial_lifecycle() {
        let mut trial = Trial::single(0, arm("0_0", 0.5));
        assert_eq!(trial.status(), TrialStatus::Candidate);

        trial.mark_staged().unwrap();
        assert!(trial.staged_at().is_some());
        trial.mark_running().unwrap();
        assert!(trial.started_at().is_some());
        trial.mark_completed().unwrap();
        assert_eq!(trial.status(), TrialStatus::Completed);
        assert!(trial.finished_at().is_some());
    }

    #[test]
    fn staging_is_optional() {
        let mut trial = Trial::single(0, arm("0_0", 0.5));
        trial.mark_running().unwrap();
        trial.mark_early_stopped("below median").unwrap();
        assert_eq!(trial.status(), TrialStatus::EarlyStopped);
        assert_eq!(trial.status_reason(), Some("below median"));
    }

    #[test]
    fn terminal_statuses_never_transition() {
        let terminal = [
            TrialStatus::Completed,
            TrialStatus::Failed,
            TrialStatus::EarlyStopped,
            TrialStatus::Abandoned,
        ];
        let all = [
            TrialStatus::Candidate,
            TrialStatus::Staged,
            TrialStatus::Running,
            TrialStatus::Completed,
            TrialStatus::Failed,
            TrialStatus::EarlyStopped,
            TrialStatus::Abandoned,
        ];
        for from in terminal {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }

        let mut trial = Trial::single(3, arm("3_0", 0.1));
        trial.mark_running().unwrap();
        trial.mark_failed("worker crashed").unwrap();
        let err = trial.mark_completed().unwrap_err();
        assert_eq!(
            err,
            TrialError::InvalidTransition {
                index: 3,
                from: "FAILED".into(),
                to: "COMPLETED".into(),
            }
        );
        assert!(trial.mark_abandoned("too late").is_err());
        assert_eq!(trial.status(), TrialStatus::Failed);
    }

    #[test]
    fn invalid_forward_transitions() {
        let mut trial = Trial::single(0, arm("0_0", 0.5));
        assert!(trial.mark_completed().is_err());
        assert!(trial.mark_failed("not started").is_err());
        trial.mark_staged().unwrap();
        assert!(trial.mark_early_stopped("nope").is_err());
        trial.mark_abandoned("cancelled by user").unwrap();
        assert_eq!(trial.status(), TrialStatus::Abandoned);
    }

    #[test]
    fn batch_arms_and_weights() {
        let mut trial = Trial::batch(1);
        trial.add_arm(arm("1_0", 0.1), 1.0).unwrap();
        trial.add_arm(arm("1_1", 0.2), 3.0).unwrap();
        assert!(matches!(
            trial.add_arm(arm("1_2", 0.3), 0.0),
            Err(TrialError::InvalidWeight { .. })
        ));

        let weights: Vec<f64> = trial.normalized_weights().iter().map(|(_, w)| *w).collect();
        assert_eq!(weights, vec![0.25, 0.75]);

        trial.mark_running().unwrap();
        assert!(matches!(
            trial.add_arm(arm("1_2", 0.3), 1.0),
            Err(TrialError::NotCandidate { .. })
        ));

        trial.abandon_arm("1_0", "bad variant").unwrap();
        assert_eq!(trial.active_arms().len(), 1);
        assert_eq!(trial.arms().len(), 2);
        assert!(trial.abandon_arm("9_9", "missing").is_err());
    }

    #[test]
    fn single_trial_rejects_batch_operations() {
        let mut trial = Trial::single(0, arm("0_0", 0.5));
        assert!(matches!(
            trial.add_arm(arm("0_1", 0.2), 1.0),
            Err(TrialError::WrongKind { .. })
        ));
        assert!(trial.abandon_arm("0_0", "x").is_err());
    }

    #[test]
    fn data_requires_deployment() {
        let mut trial = Trial::single(2, arm("2_0", 0.5));
        let obs = Observation::new(99, "2_0", "loss", 0.3);
        assert_eq!(
            trial.attach_data([obs.clone()]),
            Err(TrialError::DataOnCandidate { index: 2 })
        );

        trial.mark_running().unwrap();
        assert_eq!(trial.attach_data([obs]).unwrap(), 1);
        assert_eq!(trial.data().observations()[0].trial_index, 2);

        let stray = Observation::new(2, "7_0", "loss", 0.1);
        assert!(matches!(
            trial.attach_data([stray]),
            Err(TrialError::UnknownArm { .. })
        ));
    }

    #[test]
    fn stale_trials_fail() {
        let mut trial = Trial::single(0, arm("0_0", 0.5)).with_ttl_seconds(60);
        assert!(!trial.fail_if_stale(Utc::now()));

        trial.mark_running().unwrap();
        assert!(!trial.fail_if_stale(Utc::now()));
        assert!(trial.fail_if_stale(Utc::now() + Duration::seconds(61)));
        assert_eq!(trial.status(), TrialStatus::Failed);
        assert!(trial.status_reason().unwrap().contains("TTL"));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let mut trial = Trial::single(1, arm("1_0", 0.5));
        trial.mark_running().unwrap();

        let err = trial
            .attach_data([
                Observation::new(1, "1_0", "loss", 0.2),
                Observation::new(1, "1_0", "loss", f64::NAN),
            ])
            .unwrap_err();
        assert!(matches!(
            err,
            TrialError::NonFiniteValue { ref field, ref metric, .. } if field == "mean" && metric == "loss"
        ));
        assert!(trial.data().is_empty());

        let err = trial
            .attach_data([Observation::new(1, "1_0", "loss", 0.2).with_sem(f64::INFINITY)])
            .unwrap_err();
        assert!(matches!(err, TrialError::NonFiniteValue { ref field, .. } if field == "sem"));
        assert_eq!(trial.attach_data([Observation::new(1, "1_0", "loss", 0.2)]).unwrap(), 1);
    }

    #[test]
    fn huge_ttl_never_expires() {
        for ttl in [10_000_000_000_000_000, u64::MAX] {
            let mut trial = Trial::single(0, arm("0_0", 0.5)).with_ttl_seconds(ttl);
            trial.mark_running().unwrap();
            assert!(!trial.is_stale(Utc::now() + Duration::days(365)));
            assert!(!trial.fail_if_stale(Utc::now()));
            assert_eq!(trial.status(), TrialStatus::Running);
        }
    }

    #[test]
    fn rejected_failure_keeps_terminal_state() {
        let mut trial = Trial::single(0, arm("0_0", 0.5));
        trial.mark_running().unwrap();
        trial.mark_completed().unwrap();
        assert!(matches!(
            trial.mark_failed("late crash"),
            Err(TrialError::InvalidTransition { .. })
        ));
        assert_eq!(trial.status(), TrialStatus::Completed);
        assert!(trial.status_reason().is_none());
    }

    #[test]
    fn serde_round_trip_keeps_kind() {
        let mut trial = Trial::batch(4).with_generation_method("random");
        trial.add_arm(arm("4_0", 0.4), 2.0).unwrap();
        let json = serde_json::to_string(&trial).unwrap();
        assert!(json.contains("\"kind\":\"batch\""));
        let back: Trial = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trial);
    }
}
