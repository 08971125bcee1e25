//! Search space: an ordered set of parameters plus linear constraints.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::arm::Arm;
use crate::constraint::ParameterConstraint;
use crate::errors::{ArResult, ArmError, SearchSpaceError};
use crate::parameter::{Parameter, ParameterDomain, ParameterType, ParameterValue};

/// A parameter assignment keyed by parameter name.
pub type Parameterization = BTreeMap<String, ParameterValue>;

/// The full search space.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    parameters: Vec<Parameter>,
    parameter_constraints: Vec<ParameterConstraint>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a search space from parts, validating every piece.
    pub fn from_parts(
        parameters: Vec<Parameter>,
        parameter_constraints: Vec<ParameterConstraint>,
    ) -> ArResult<Self> {
        let mut space = Self::new();
        for parameter in parameters {
            space.add_parameter(parameter)?;
        }
        for constraint in parameter_constraints {
            space.add_constraint(constraint)?;
        }
        Ok(space)
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> ArResult<Self> {
        self.add_parameter(parameter)?;
        Ok(self)
    }

    pub fn with_constraint(mut self, constraint: ParameterConstraint) -> ArResult<Self> {
        self.add_constraint(constraint)?;
        Ok(self)
    }

    /// Parse and add a constraint such as `"x1 + x2 <= 1"`.
    pub fn with_constraint_str(self, expression: &str) -> ArResult<Self> {
        let constraint = ParameterConstraint::parse(expression)?;
        self.with_constraint(constraint)
    }

    pub fn add_parameter(&mut self, parameter: Parameter) -> ArResult<()> {
        if self.parameter(parameter.name()).is_some() {
            return Err(SearchSpaceError::DuplicateParameter {
                name: parameter.name().to_string(),
            }
            .into());
        }
        self.parameters.push(parameter);
        Ok(())
    }

    /// Add a constraint. Every referenced parameter must already be in the
    /// space, be numeric, and not be log-scaled.
    pub fn add_constraint(&mut self, constraint: ParameterConstraint) -> ArResult<()> {
        for name in constraint.parameter_names() {
            let parameter = self
                .parameter(name)
                .ok_or_else(|| SearchSpaceError::UnknownParameter {
                    name: name.to_string(),
                })?;
            if !parameter.is_numeric() {
                return Err(SearchSpaceError::NonNumericConstraintParameter {
                    name: name.to_string(),
                }
                .into());
            }
            if parameter.is_log_scale() {
                return Err(SearchSpaceError::UnsupportedConstraint {
                    expression: constraint.to_string(),
                    reason: format!("parameter {name} is log-scaled, the constraint would not be linear"),
                }
                .into());
            }
        }
        debug!("Added parameter constraint {}", constraint);
        self.parameter_constraints.push(constraint);
        Ok(())
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter_constraints(&self) -> &[ParameterConstraint] {
        &self.parameter_constraints
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name() == name)
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(Parameter::name)
    }

    /// Cast every value to its parameter's type (integer rounding happens
    /// here). Values for unknown parameters are an error.
    pub fn cast_parameterization(
        &self,
        parameterization: &Parameterization,
    ) -> Result<Parameterization, ArmError> {
        let mut cast = Parameterization::new();
        for (name, value) in parameterization {
            let parameter = self
                .parameter(name)
                .ok_or_else(|| ArmError::UnexpectedParameter {
                    parameter: name.clone(),
                })?;
            cast.insert(name.clone(), parameter.cast(value)?);
        }
        Ok(cast)
    }

    /// Cast and validate a parameterization against domains and
    /// constraints. Returns the cast values.
    pub fn validate_parameterization(
        &self,
        parameterization: &Parameterization,
    ) -> Result<Parameterization, ArmError> {
        if let Some(extra) = parameterization.keys().find(|k| self.parameter(k).is_none()) {
            return Err(ArmError::UnexpectedParameter {
                parameter: extra.clone(),
            });
        }

        let mut cast = Parameterization::new();
        for parameter in &self.parameters {
            let value = parameterization.get(parameter.name()).ok_or_else(|| {
                ArmError::MissingParameter {
                    parameter: parameter.name().to_string(),
                }
            })?;
            cast.insert(parameter.name().to_string(), parameter.validate(value)?);
        }

        for constraint in &self.parameter_constraints {
            if !constraint.check(&cast) {
                return Err(ArmError::ConstraintViolation {
                    constraint: constraint.to_string(),
                    value: constraint.evaluate(&cast).unwrap_or(f64::NAN),
                });
            }
        }

        Ok(cast)
    }

    /// Validate an arm and return a copy carrying the cast values.
    pub fn validate_arm(&self, arm: &Arm) -> Result<Arm, ArmError> {
        let parameters = self.validate_parameterization(arm.parameters())?;
        Ok(arm.with_parameters(parameters))
    }

    pub fn contains(&self, parameterization: &Parameterization) -> bool {
        self.validate_parameterization(parameterization).is_ok()
    }

    /// `true` if every linear constraint holds. Domains are not checked.
    pub fn satisfies_constraints(&self, parameterization: &Parameterization) -> bool {
        self.parameter_constraints
            .iter()
            .all(|c| c.check(parameterization))
    }

    /// Total number of distinct points (returns `None` if any parameter is
    /// continuous).
    pub fn cardinality(&self) -> Option<u64> {
        let mut total: u64 = 1;
        for param in &self.parameters {
            total = total.checked_mul(param.cardinality()?)?;
        }
        Some(total)
    }

    /// Replace integer ranges with at most `max_choices` values by ordered
    /// choice parameters over the same integers.
    pub fn int_ranges_to_choices(&self, max_choices: u64) -> SearchSpace {
        let parameters = self
            .parameters
            .iter()
            .map(|p| match (p.domain(), p.parameter_type(), p.cardinality()) {
                (ParameterDomain::Range { lower, upper, .. }, ParameterType::Int, Some(n))
                    if n <= max_choices =>
                {
                    let values = (*lower as i64..=*upper as i64)
                        .map(ParameterValue::Int)
                        .collect();
                    debug!("Converting int range {} ({} values) to a choice", p.name(), n);
                    // A range with lower < upper always yields >= 2 values.
                    Parameter::choice(p.name(), ParameterType::Int, values)
                        .map(|c| c.with_ordered(true))
                        .unwrap_or_else(|_| p.clone())
                }
                _ => p.clone(),
            })
            .collect();

        SearchSpace {
            parameters,
            parameter_constraints: self.parameter_constraints.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> SearchSpace {
        SearchSpace::new()
            .with_parameter(Parameter::float("x1", 0.0, 1.0).unwrap())
            .unwrap()
            .with_parameter(Parameter::float("x2", 0.0, 1.0).unwrap())
            .unwrap()
            .with_constraint_str("x1 + x2 <= 1")
            .unwrap()
    }

    fn point(pairs: &[(&str, ParameterValue)]) -> Parameterization {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn linear_constraint_example() {
        let space = unit_square();
        let rejected = point(&[("x1", 0.6.into()), ("x2", 0.5.into())]);
        let accepted = point(&[("x1", 0.6.into()), ("x2", 0.4.into())]);

        assert!(matches!(
            space.validate_parameterization(&rejected),
            Err(ArmError::ConstraintViolation { .. })
        ));
        assert!(space.validate_parameterization(&accepted).is_ok());
    }

    #[test]
    fn integer_values_round_before_checks() {
        let space = SearchSpace::new()
            .with_parameter(Parameter::int("n", 1, 10).unwrap())
            .unwrap();
        let cast = space
            .validate_parameterization(&point(&[("n", 4.6.into())]))
            .unwrap();
        assert_eq!(cast.get("n"), Some(&ParameterValue::Int(5)));
    }

    #[test]
    fn rounding_happens_before_constraint_check() {
        // n + m <= 10 with n = 4.6 -> 5 and m = 5.4 -> 5 holds only after rounding.
        let space = SearchSpace::new()
            .with_parameter(Parameter::int("n", 0, 10).unwrap())
            .unwrap()
            .with_parameter(Parameter::int("m", 0, 10).unwrap())
            .unwrap()
            .with_constraint_str("n + m <= 10")
            .unwrap();
        assert!(space.contains(&point(&[("n", 4.6.into()), ("m", 5.4.into())])));
        assert!(!space.contains(&point(&[("n", 4.6.into()), ("m", 5.6.into())])));
    }

    #[test]
    fn missing_and_unexpected_parameters() {
        let space = unit_square();
        assert!(matches!(
            space.validate_parameterization(&point(&[("x1", 0.1.into())])),
            Err(ArmError::MissingParameter { .. })
        ));
        assert!(matches!(
            space.validate_parameterization(&point(&[
                ("x1", 0.1.into()),
                ("x2", 0.1.into()),
                ("x3", 0.1.into())
            ])),
            Err(ArmError::UnexpectedParameter { .. })
        ));
    }

    #[test]
    fn domain_type_mismatch_is_reported() {
        let space = unit_square();
        let err = space
            .validate_parameterization(&point(&[("x1", "a".into()), ("x2", 0.1.into())]))
            .unwrap_err();
        assert!(matches!(err, ArmError::DomainTypeMismatch { .. }));
    }

    #[test]
    fn duplicate_parameter_rejected() {
        let err = unit_square()
            .with_parameter(Parameter::float("x1", 0.0, 2.0).unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::ArError::SearchSpace(SearchSpaceError::DuplicateParameter { .. })
        ));
    }

    #[test]
    fn constraints_must_reference_known_numeric_parameters() {
        let space = SearchSpace::new()
            .with_parameter(Parameter::float("x", 0.0, 1.0).unwrap())
            .unwrap()
            .with_parameter(
                Parameter::choice("opt", ParameterType::String, vec!["a".into(), "b".into()])
                    .unwrap(),
            )
            .unwrap()
            .with_parameter(Parameter::float("lr", 1e-4, 1.0).unwrap().with_log_scale().unwrap())
            .unwrap();

        assert!(matches!(
            space.clone().with_constraint_str("x + y <= 1"),
            Err(crate::ArError::SearchSpace(SearchSpaceError::UnknownParameter { .. }))
        ));
        assert!(matches!(
            space.clone().with_constraint_str("x + opt <= 1"),
            Err(crate::ArError::SearchSpace(
                SearchSpaceError::NonNumericConstraintParameter { .. }
            ))
        ));
        assert!(matches!(
            space.clone().with_constraint_str("x + lr <= 1"),
            Err(crate::ArError::SearchSpace(SearchSpaceError::UnsupportedConstraint { .. }))
        ));
        assert!(matches!(
            space.with_constraint_str("x == 1"),
            Err(crate::ArError::SearchSpace(SearchSpaceError::UnsupportedConstraint { .. }))
        ));
    }

    #[test]
    fn cardinality_of_discrete_space() {
        let space = SearchSpace::new()
            .with_parameter(Parameter::int("a", 1, 3).unwrap())
            .unwrap()
            .with_parameter(Parameter::int("b", 10, 11).unwrap())
            .unwrap();
        assert_eq!(space.cardinality(), Some(6));
        assert_eq!(unit_square().cardinality(), None);
    }

    #[test]
    fn int_ranges_become_ordered_choices() {
        let space = SearchSpace::new()
            .with_parameter(Parameter::int("small", 1, 4).unwrap())
            .unwrap()
            .with_parameter(Parameter::int("large", 1, 1000).unwrap())
            .unwrap()
            .with_parameter(Parameter::float("x", 0.0, 1.0).unwrap())
            .unwrap();

        let transformed = space.int_ranges_to_choices(10);
        match transformed.parameter("small").unwrap().domain() {
            ParameterDomain::Choice { values, is_ordered } => {
                assert!(*is_ordered);
                assert_eq!(values.len(), 4);
                assert_eq!(values[0], ParameterValue::Int(1));
            }
            other => panic!("expected choice, got {other:?}"),
        }
        assert!(transformed.parameter("large").unwrap().is_range());
        assert!(transformed.parameter("x").unwrap().is_range());
    }

    #[test]
    fn serde_round_trip_preserves_space() {
        let space = unit_square();
        let json = serde_json::to_string(&space).unwrap();
        let back: SearchSpace = serde_json::from_str(&json).unwrap();
        assert_eq!(space, back);
    }
}
