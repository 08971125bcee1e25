//! Arms: concrete points in a search space.

use serde::{Deserialize, Serialize};

use crate::parameter::ParameterValue;
use crate::search_space::Parameterization;

/// One concrete parameterization. Arms are value objects; the experiment
/// assigns names when an arm is first attached to a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    name: Option<String>,
    parameters: Parameterization,
}

impl Arm {
    pub fn new(parameters: Parameterization) -> Self {
        Self {
            name: None,
            parameters,
        }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<ParameterValue>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn has_name(&self) -> bool {
        self.name.is_some()
    }

    pub fn parameters(&self) -> &Parameterization {
        &self.parameters
    }

    pub fn get(&self, parameter: &str) -> Option<&ParameterValue> {
        self.parameters.get(parameter)
    }

    /// Same name, different parameter values.
    pub fn with_parameters(&self, parameters: Parameterization) -> Self {
        Self {
            name: self.name.clone(),
            parameters,
        }
    }

    /// Canonical identity of the parameter values, independent of the name.
    /// `Int(1)` and `Float(1.0)` produce different signatures.
    pub fn signature(&self) -> String {
        self.parameters
            .iter()
            .map(|(k, v)| format!("{k}={v:?}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_ignores_name_and_insertion_order() {
        let a = Arm::from_pairs([("x", 0.5), ("y", 1.0)]).named("0_0");
        let b = Arm::from_pairs([("y", 1.0), ("x", 0.5)]);
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a, b);
    }

    #[test]
    fn signature_distinguishes_value_types() {
        let int = Arm::from_pairs([("n", ParameterValue::Int(1))]);
        let float = Arm::from_pairs([("n", ParameterValue::Float(1.0))]);
        assert_ne!(int.signature(), float.signature());
    }

    #[test]
    fn with_parameters_keeps_name() {
        let arm = Arm::from_pairs([("n", 4.6)]).named("status_quo");
        let cast = arm.with_parameters(Arm::from_pairs([("n", 5i64)]).parameters().clone());
        assert_eq!(cast.name(), Some("status_quo"));
        assert_eq!(cast.get("n"), Some(&ParameterValue::Int(5)));
    }
}
