//! Objectives, outcome constraints and the optimization config that groups them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::errors::OptimizationConfigError;

/// A metric to minimize or maximize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub metric: String,
    pub minimize: bool,
}

impl Objective {
    pub fn minimize(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            minimize: true,
        }
    }

    pub fn maximize(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            minimize: false,
        }
    }

    /// `true` if `a` is strictly better than `b` under this objective.
    pub fn is_better(&self, a: f64, b: f64) -> bool {
        if self.minimize {
            a < b
        } else {
            a > b
        }
    }

    /// The comparison an objective threshold on this metric must use.
    pub fn threshold_op(&self) -> ComparisonOp {
        if self.minimize {
            ComparisonOp::Leq
        } else {
            ComparisonOp::Geq
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    Leq,
    Geq,
}

impl ComparisonOp {
    pub fn holds(self, value: f64, bound: f64) -> bool {
        match self {
            Self::Leq => value <= bound,
            Self::Geq => value >= bound,
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leq => f.write_str("<="),
            Self::Geq => f.write_str(">="),
        }
    }
}

/// Feasibility restriction on a measured metric.
///
/// When `relative` is set the bound is a percentage change against the
/// status quo arm (e.g. `-5.0` means "at most 5% below the status quo").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeConstraint {
    pub metric: String,
    pub op: ComparisonOp,
    pub bound: f64,
    pub relative: bool,
}

impl OutcomeConstraint {
    pub fn new(metric: impl Into<String>, op: ComparisonOp, bound: f64) -> Self {
        Self {
            metric: metric.into(),
            op,
            bound,
            relative: false,
        }
    }

    pub fn relative(mut self) -> Self {
        self.relative = true;
        self
    }

    pub fn is_satisfied(&self, value: f64) -> bool {
        self.op.holds(value, self.bound)
    }
}

impl fmt::Display for OutcomeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.relative { "%" } else { "" };
        write!(f, "{} {} {}{}", self.metric, self.op, self.bound, suffix)
    }
}

/// Reference-point bound on an objective metric. Only meaningful in a
/// multi-objective config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveThreshold {
    pub metric: String,
    pub op: ComparisonOp,
    pub bound: f64,
    pub relative: bool,
}

impl ObjectiveThreshold {
    pub fn new(metric: impl Into<String>, op: ComparisonOp, bound: f64) -> Self {
        Self {
            metric: metric.into(),
            op,
            bound,
            relative: false,
        }
    }

    pub fn relative(mut self) -> Self {
        self.relative = true;
        self
    }

    pub fn is_satisfied(&self, value: f64) -> bool {
        self.op.holds(value, self.bound)
    }
}

impl From<OutcomeConstraint> for ObjectiveThreshold {
    fn from(c: OutcomeConstraint) -> Self {
        Self {
            metric: c.metric,
            op: c.op,
            bound: c.bound,
            relative: c.relative,
        }
    }
}

/// Objectives plus outcome constraints and objective thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    objectives: Vec<Objective>,
    outcome_constraints: Vec<OutcomeConstraint>,
    objective_thresholds: Vec<ObjectiveThreshold>,
}

impl OptimizationConfig {
    /// Single-objective config without constraints.
    pub fn single(objective: Objective) -> Self {
        Self {
            objectives: vec![objective],
            outcome_constraints: Vec::new(),
            objective_thresholds: Vec::new(),
        }
    }

    /// Build and validate a config.
    ///
    /// In a multi-objective config, a constraint on an objective metric is
    /// turned into an objective threshold. In a single-objective config it
    /// is rejected.
    pub fn new(
        objectives: Vec<Objective>,
        outcome_constraints: Vec<OutcomeConstraint>,
    ) -> Result<Self, OptimizationConfigError> {
        if objectives.is_empty() {
            return Err(OptimizationConfigError::NoObjectives);
        }
        let mut seen = BTreeSet::new();
        for objective in &objectives {
            if !seen.insert(objective.metric.as_str()) {
                return Err(OptimizationConfigError::DuplicateObjective {
                    metric: objective.metric.clone(),
                });
            }
        }

        let mut config = Self {
            objectives,
            outcome_constraints: Vec::new(),
            objective_thresholds: Vec::new(),
        };
        for constraint in outcome_constraints {
            config = config.with_outcome_constraint(constraint)?;
        }
        Ok(config)
    }

    /// Multi-objective config; needs at least two objectives.
    pub fn multi(objectives: Vec<Objective>) -> Result<Self, OptimizationConfigError> {
        if objectives.len() < 2 {
            return Err(OptimizationConfigError::TooFewObjectives {
                count: objectives.len(),
            });
        }
        Self::new(objectives, Vec::new())
    }

    pub fn with_outcome_constraint(
        mut self,
        constraint: OutcomeConstraint,
    ) -> Result<Self, OptimizationConfigError> {
        if !constraint.bound.is_finite() {
            return Err(OptimizationConfigError::NonFiniteBound {
                metric: constraint.metric,
            });
        }
        if self.objective(&constraint.metric).is_some() {
            if self.is_multi_objective() {
                return self.with_objective_threshold(constraint.into());
            }
            return Err(OptimizationConfigError::ConstraintOnObjective {
                metric: constraint.metric,
            });
        }
        self.outcome_constraints.push(constraint);
        Ok(self)
    }

    /// Add a threshold. Fails unless the config has at least two
    /// objectives, the metric is one of them, and the comparison matches
    /// the objective's direction.
    pub fn with_objective_threshold(
        mut self,
        threshold: ObjectiveThreshold,
    ) -> Result<Self, OptimizationConfigError> {
        let invalid = |reason: String| OptimizationConfigError::InvalidThreshold {
            metric: threshold.metric.clone(),
            reason,
        };

        if !self.is_multi_objective() {
            return Err(invalid(
                "objective thresholds require a multi-objective config".to_string(),
            ));
        }
        let objective = self
            .objective(&threshold.metric)
            .ok_or_else(|| invalid("metric is not an objective".to_string()))?;
        if threshold.op != objective.threshold_op() {
            return Err(invalid(format!(
                "objective is {}, threshold must use {}",
                if objective.minimize { "minimized" } else { "maximized" },
                objective.threshold_op()
            )));
        }
        if !threshold.bound.is_finite() {
            return Err(invalid("bound must be finite".to_string()));
        }
        if self
            .objective_thresholds
            .iter()
            .any(|t| t.metric == threshold.metric)
        {
            return Err(invalid("metric already has a threshold".to_string()));
        }

        self.objective_thresholds.push(threshold);
        Ok(self)
    }

    pub fn objectives(&self) -> &[Objective] {
        &self.objectives
    }

    pub fn objective(&self, metric: &str) -> Option<&Objective> {
        self.objectives.iter().find(|o| o.metric == metric)
    }

    pub fn outcome_constraints(&self) -> &[OutcomeConstraint] {
        &self.outcome_constraints
    }

    pub fn objective_thresholds(&self) -> &[ObjectiveThreshold] {
        &self.objective_thresholds
    }

    pub fn is_multi_objective(&self) -> bool {
        self.objectives.len() > 1
    }

    /// Every metric the config refers to.
    pub fn metric_names(&self) -> BTreeSet<String> {
        self.objectives
            .iter()
            .map(|o| o.metric.clone())
            .chain(self.outcome_constraints.iter().map(|c| c.metric.clone()))
            .collect()
    }

    pub fn has_relative_bounds(&self) -> bool {
        self.outcome_constraints.iter().any(|c| c.relative)
            || self.objective_thresholds.iter().any(|t| t.relative)
    }

    /// `true` if every absolute outcome constraint holds. A missing metric
    /// counts as a violation; relative constraints are skipped and must be
    /// resolved with [`derelativize`](Self::derelativize) first.
    pub fn satisfies_outcome_constraints(&self, means: &HashMap<String, f64>) -> bool {
        self.outcome_constraints
            .iter()
            .filter(|c| !c.relative)
            .all(|c| means.get(&c.metric).is_some_and(|v| c.is_satisfied(*v)))
    }

    /// `true` if the point lies inside every absolute objective threshold.
    pub fn within_thresholds(&self, means: &HashMap<String, f64>) -> bool {
        self.objective_thresholds
            .iter()
            .filter(|t| !t.relative)
            .all(|t| means.get(&t.metric).is_some_and(|v| t.is_satisfied(*v)))
    }

    /// Resolve relative bounds against the status quo's metric means:
    /// `absolute = (1 + sign(sq) * bound / 100) * sq`.
    pub fn derelativize(
        &self,
        status_quo_means: &HashMap<String, f64>,
    ) -> Result<Self, OptimizationConfigError> {
        let resolve = |metric: &str, bound: f64| -> Result<f64, OptimizationConfigError> {
            let sq = *status_quo_means.get(metric).ok_or_else(|| {
                OptimizationConfigError::MissingStatusQuo {
                    metric: metric.to_string(),
                }
            })?;
            if sq == 0.0 {
                return Err(OptimizationConfigError::ZeroStatusQuo {
                    metric: metric.to_string(),
                });
            }
            Ok((1.0 + sq.signum() * bound / 100.0) * sq)
        };

        let mut resolved = self.clone();
        for c in resolved.outcome_constraints.iter_mut().filter(|c| c.relative) {
            c.bound = resolve(&c.metric, c.bound)?;
            c.relative = false;
        }
        for t in resolved.objective_thresholds.iter_mut().filter(|t| t.relative) {
            t.bound = resolve(&t.metric, t.bound)?;
            t.relative = false;
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn means(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn two_objectives() -> OptimizationConfig {
        OptimizationConfig::multi(vec![
            Objective::minimize("latency"),
            Objective::maximize("accuracy"),
        ])
        .unwrap()
    }

    #[test]
    fn threshold_requires_multi_objective() {
        let single = OptimizationConfig::single(Objective::minimize("loss"));
        let err = single
            .with_objective_threshold(ObjectiveThreshold::new("loss", ComparisonOp::Leq, 1.0))
            .unwrap_err();
        assert!(matches!(err, OptimizationConfigError::InvalidThreshold { .. }));

        let multi = two_objectives()
            .with_objective_threshold(ObjectiveThreshold::new("latency", ComparisonOp::Leq, 50.0))
            .unwrap();
        assert_eq!(multi.objective_thresholds().len(), 1);
    }

    #[test]
    fn threshold_direction_and_metric_are_checked() {
        let err = two_objectives()
            .with_objective_threshold(ObjectiveThreshold::new("latency", ComparisonOp::Geq, 50.0))
            .unwrap_err();
        assert!(matches!(err, OptimizationConfigError::InvalidThreshold { .. }));

        let err = two_objectives()
            .with_objective_threshold(ObjectiveThreshold::new("cost", ComparisonOp::Leq, 1.0))
            .unwrap_err();
        assert!(matches!(err, OptimizationConfigError::InvalidThreshold { .. }));

        let err = two_objectives()
            .with_objective_threshold(ObjectiveThreshold::new("accuracy", ComparisonOp::Geq, 0.8))
            .unwrap()
            .with_objective_threshold(ObjectiveThreshold::new("accuracy", ComparisonOp::Geq, 0.9))
            .unwrap_err();
        assert!(matches!(err, OptimizationConfigError::InvalidThreshold { .. }));
    }

    #[test]
    fn objective_constraint_becomes_threshold_in_multi_objective() {
        let config = OptimizationConfig::new(
            vec![Objective::minimize("latency"), Objective::maximize("accuracy")],
            vec![
                OutcomeConstraint::new("accuracy", ComparisonOp::Geq, 0.9),
                OutcomeConstraint::new("memory", ComparisonOp::Leq, 512.0),
            ],
        )
        .unwrap();
        assert_eq!(config.objective_thresholds().len(), 1);
        assert_eq!(config.objective_thresholds()[0].metric, "accuracy");
        assert_eq!(config.outcome_constraints().len(), 1);
        assert_eq!(config.outcome_constraints()[0].metric, "memory");
    }

    #[test]
    fn objective_constraint_rejected_in_single_objective() {
        let err = OptimizationConfig::new(
            vec![Objective::minimize("loss")],
            vec![OutcomeConstraint::new("loss", ComparisonOp::Leq, 1.0)],
        )
        .unwrap_err();
        assert!(matches!(err, OptimizationConfigError::ConstraintOnObjective { .. }));
    }

    #[test]
    fn empty_or_duplicate_objectives_rejected() {
        assert_eq!(
            OptimizationConfig::new(vec![], vec![]).unwrap_err(),
            OptimizationConfigError::NoObjectives
        );
        assert!(matches!(
            OptimizationConfig::new(
                vec![Objective::minimize("a"), Objective::maximize("a")],
                vec![]
            ),
            Err(OptimizationConfigError::DuplicateObjective { .. })
        ));
        assert!(OptimizationConfig::multi(vec![Objective::minimize("a")]).is_err());
    }

    #[test]
    fn outcome_constraint_feasibility() {
        let config = OptimizationConfig::new(
            vec![Objective::minimize("loss")],
            vec![OutcomeConstraint::new("memory", ComparisonOp::Leq, 512.0)],
        )
        .unwrap();
        assert!(config.satisfies_outcome_constraints(&means(&[("loss", 1.0), ("memory", 256.0)])));
        assert!(!config.satisfies_outcome_constraints(&means(&[("loss", 1.0), ("memory", 1024.0)])));
        assert!(!config.satisfies_outcome_constraints(&means(&[("loss", 1.0)])));
    }

    #[test]
    fn derelativize_against_status_quo() {
        let config = OptimizationConfig::new(
            vec![Objective::minimize("c")],
            vec![
                OutcomeConstraint::new("a", ComparisonOp::Leq, 2.0),
                OutcomeConstraint::new("b", ComparisonOp::Leq, -10.0).relative(),
            ],
        )
        .unwrap();
        assert!(config.has_relative_bounds());

        for sq in [5.0, -5.0] {
            let resolved = config.derelativize(&means(&[("b", sq)])).unwrap();
            assert!(!resolved.has_relative_bounds());
            let expected = (1.0 + sq.signum() * -10.0 / 100.0) * sq;
            assert_eq!(resolved.outcome_constraints()[0].bound, 2.0);
            assert!((resolved.outcome_constraints()[1].bound - expected).abs() < 1e-12);
        }

        assert!(matches!(
            config.derelativize(&means(&[])),
            Err(OptimizationConfigError::MissingStatusQuo { .. })
        ));
        assert!(matches!(
            config.derelativize(&means(&[("b", 0.0)])),
            Err(OptimizationConfigError::ZeroStatusQuo { .. })
        ));
    }

    #[test]
    fn thresholds_filter_points() {
        let config = two_objectives()
            .with_objective_threshold(ObjectiveThreshold::new("latency", ComparisonOp::Leq, 50.0))
            .unwrap();
        assert!(config.within_thresholds(&means(&[("latency", 40.0), ("accuracy", 0.1)])));
        assert!(!config.within_thresholds(&means(&[("latency", 60.0), ("accuracy", 0.99)])));
    }
}
