//! Typed parameters and their domains.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{ArmError, ParameterError};

/// Largest magnitude an integer bound may have; beyond it `f64` skips integers.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// The value type a parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Int,
    Float,
    Bool,
    String,
}

impl ParameterType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::String => "string",
        };
        f.write_str(name)
    }
}

/// A concrete parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ParameterValue {
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            Self::Bool(_) => ParameterType::Bool,
            Self::Int(_) => ParameterType::Int,
            Self::Float(_) => ParameterType::Float,
            Self::String(_) => ParameterType::String,
        }
    }

    /// Numeric view of the value; `None` for bool and string values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// The set of values a parameter may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterDomain {
    /// Closed interval `[lower, upper]`. Only for int and float parameters.
    Range {
        lower: f64,
        upper: f64,
        log_scale: bool,
        /// Decimal places kept for float values.
        digits: Option<u32>,
    },
    /// Finite set of allowed values.
    Choice {
        values: Vec<ParameterValue>,
        is_ordered: bool,
    },
    /// A single constant value.
    Fixed { value: ParameterValue },
}

impl fmt::Display for ParameterDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range { lower, upper, .. } => write!(f, "range [{lower}, {upper}]"),
            Self::Choice { values, .. } => {
                let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "choice {{{}}}", rendered.join(", "))
            }
            Self::Fixed { value } => write!(f, "fixed {value}"),
        }
    }
}

/// A single tunable dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    parameter_type: ParameterType,
    domain: ParameterDomain,
}

impl Parameter {
    /// Range parameter over `[lower, upper]`.
    pub fn range(
        name: impl Into<String>,
        parameter_type: ParameterType,
        lower: f64,
        upper: f64,
    ) -> Result<Self, ParameterError> {
        let name = checked_name(name.into())?;
        if !parameter_type.is_numeric() {
            return Err(ParameterError::NonNumericRange {
                parameter: name,
                parameter_type,
            });
        }
        if !lower.is_finite() || !upper.is_finite() {
            return Err(ParameterError::NonFiniteBounds { parameter: name });
        }
        if lower >= upper {
            return Err(ParameterError::InvalidBounds {
                parameter: name,
                lower,
                upper,
            });
        }
        if parameter_type == ParameterType::Int && (lower.fract() != 0.0 || upper.fract() != 0.0)
        {
            return Err(ParameterError::NonIntegralBounds {
                parameter: name,
                lower,
                upper,
            });
        }
        if parameter_type == ParameterType::Int
            && (lower.abs() > MAX_EXACT_INT || upper.abs() > MAX_EXACT_INT)
        {
            return Err(ParameterError::IntBoundsTooLarge {
                parameter: name,
                lower,
                upper,
            });
        }

        Ok(Self {
            name,
            parameter_type,
            domain: ParameterDomain::Range {
                lower,
                upper,
                log_scale: false,
                digits: None,
            },
        })
    }

    pub fn float(name: impl Into<String>, lower: f64, upper: f64) -> Result<Self, ParameterError> {
        Self::range(name, ParameterType::Float, lower, upper)
    }

    /// Integer range. Both bounds must lie within `±2^53` so every value in
    /// between is exactly representable.
    pub fn int(name: impl Into<String>, lower: i64, upper: i64) -> Result<Self, ParameterError> {
        let exact = |v: i64| v.unsigned_abs() <= MAX_EXACT_INT as u64;
        if !exact(lower) || !exact(upper) {
            return Err(ParameterError::IntBoundsTooLarge {
                parameter: checked_name(name.into())?,
                lower: lower as f64,
                upper: upper as f64,
            });
        }
        Self::range(name, ParameterType::Int, lower as f64, upper as f64)
    }

    /// Choice parameter. Every value must have `parameter_type`.
    pub fn choice(
        name: impl Into<String>,
        parameter_type: ParameterType,
        values: Vec<ParameterValue>,
    ) -> Result<Self, ParameterError> {
        let name = checked_name(name.into())?;
        if values.len() < 2 {
            return Err(ParameterError::TooFewChoices {
                parameter: name,
                count: values.len(),
            });
        }
        for (i, value) in values.iter().enumerate() {
            if value.parameter_type() != parameter_type {
                return Err(ParameterError::DomainTypeMismatch {
                    parameter: name,
                    expected: parameter_type,
                    actual: value.parameter_type(),
                });
            }
            if values[..i].contains(value) {
                return Err(ParameterError::DuplicateChoice {
                    parameter: name,
                    value: value.to_string(),
                });
            }
        }

        // Numeric and bool choices have a natural order; strings do not.
        let is_ordered = parameter_type != ParameterType::String;
        Ok(Self {
            name,
            parameter_type,
            domain: ParameterDomain::Choice { values, is_ordered },
        })
    }

    /// Fixed parameter; the type is taken from the value.
    pub fn fixed(
        name: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Result<Self, ParameterError> {
        let name = checked_name(name.into())?;
        let value = value.into();
        Ok(Self {
            name,
            parameter_type: value.parameter_type(),
            domain: ParameterDomain::Fixed { value },
        })
    }

    /// Mark a range parameter as log-scaled.
    pub fn with_log_scale(mut self) -> Result<Self, ParameterError> {
        if let ParameterDomain::Range {
            lower, log_scale, ..
        } = &mut self.domain
        {
            if *lower <= 0.0 {
                let lower = *lower;
                return Err(ParameterError::InvalidLogBounds {
                    parameter: self.name,
                    lower,
                });
            }
            *log_scale = true;
        }
        Ok(self)
    }

    /// Round float values of this range parameter to `digits` decimals.
    pub fn with_digits(mut self, digits: u32) -> Result<Self, ParameterError> {
        let is_float_range = self.parameter_type == ParameterType::Float && self.is_range();
        if !is_float_range {
            return Err(ParameterError::DigitsOnNonFloat {
                parameter: self.name,
            });
        }
        if let ParameterDomain::Range { digits: d, .. } = &mut self.domain {
            *d = Some(digits);
        }
        Ok(self)
    }

    /// Override the ordering flag of a choice parameter.
    pub fn with_ordered(mut self, ordered: bool) -> Self {
        if let ParameterDomain::Choice { is_ordered, .. } = &mut self.domain {
            *is_ordered = ordered;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter_type(&self) -> ParameterType {
        self.parameter_type
    }

    pub fn domain(&self) -> &ParameterDomain {
        &self.domain
    }

    pub fn is_numeric(&self) -> bool {
        self.parameter_type.is_numeric()
    }

    pub fn is_range(&self) -> bool {
        matches!(self.domain, ParameterDomain::Range { .. })
    }

    pub fn is_log_scale(&self) -> bool {
        matches!(
            self.domain,
            ParameterDomain::Range {
                log_scale: true,
                ..
            }
        )
    }

    /// Number of distinct values, `None` for continuous ranges.
    pub fn cardinality(&self) -> Option<u64> {
        match &self.domain {
            ParameterDomain::Range { lower, upper, .. } => match self.parameter_type {
                ParameterType::Int => (*upper as i64)
                    .checked_sub(*lower as i64)
                    .and_then(|span| u64::try_from(span).ok())
                    .and_then(|span| span.checked_add(1)),
                _ => None,
            },
            ParameterDomain::Choice { values, .. } => Some(values.len() as u64),
            ParameterDomain::Fixed { .. } => Some(1),
        }
    }

    /// Coerce `value` to this parameter's type.
    ///
    /// Integer parameters round floats to the nearest integer, float
    /// parameters widen integers and apply `digits`. Bool and string values
    /// are never coerced.
    pub fn cast(&self, value: &ParameterValue) -> Result<ParameterValue, ArmError> {
        let mismatch = || ArmError::DomainTypeMismatch {
            parameter: self.name.clone(),
            expected: self.parameter_type,
            actual: value.parameter_type(),
        };

        match (self.parameter_type, value) {
            (ParameterType::Int, ParameterValue::Int(v)) => Ok(ParameterValue::Int(*v)),
            (ParameterType::Int, ParameterValue::Float(v)) => {
                if !v.is_finite() {
                    return Err(self.out_of_domain(value));
                }
                Ok(ParameterValue::Int(v.round() as i64))
            }
            (ParameterType::Float, ParameterValue::Float(v)) => {
                Ok(ParameterValue::Float(self.round_digits(*v)))
            }
            (ParameterType::Float, ParameterValue::Int(v)) => {
                Ok(ParameterValue::Float(self.round_digits(*v as f64)))
            }
            (ParameterType::Bool, ParameterValue::Bool(v)) => Ok(ParameterValue::Bool(*v)),
            (ParameterType::String, ParameterValue::String(v)) => {
                Ok(ParameterValue::String(v.clone()))
            }
            _ => Err(mismatch()),
        }
    }

    /// Cast `value` and check it against the domain. Returns the cast value.
    pub fn validate(&self, value: &ParameterValue) -> Result<ParameterValue, ArmError> {
        let cast = self.cast(value)?;
        let inside = match &self.domain {
            ParameterDomain::Range { lower, upper, .. } => cast
                .as_f64()
                .map(|v| v.is_finite() && v >= *lower && v <= *upper)
                .unwrap_or(false),
            ParameterDomain::Choice { values, .. } => values.contains(&cast),
            ParameterDomain::Fixed { value: fixed } => *fixed == cast,
        };

        if inside {
            Ok(cast)
        } else {
            Err(self.out_of_domain(&cast))
        }
    }

    /// `true` if `value` (after casting) lies inside the domain.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        self.validate(value).is_ok()
    }

    fn round_digits(&self, v: f64) -> f64 {
        match self.domain {
            ParameterDomain::Range {
                digits: Some(digits),
                ..
            } => {
                let scale = 10f64.powi(digits as i32);
                (v * scale).round() / scale
            }
            _ => v,
        }
    }

    fn out_of_domain(&self, value: &ParameterValue) -> ArmError {
        ArmError::OutOfDomain {
            parameter: self.name.clone(),
            value: value.to_string(),
            domain: self.domain.to_string(),
        }
    }
}

fn checked_name(name: String) -> Result<String, ParameterError> {
    if name.trim().is_empty() {
        Err(ParameterError::EmptyName)
    } else {
        Ok(name)
    }
}
