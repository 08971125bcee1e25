use thiserror::Error;

use crate::parameter::ParameterType;

/// Main error type for Armory
#[derive(Error, Debug)]
pub enum ArError {
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("Search space error: {0}")]
    SearchSpace(#[from] SearchSpaceError),

    #[error("Arm error: {0}")]
    Arm(#[from] ArmError),

    #[error("Optimization config error: {0}")]
    OptimizationConfig(#[from] OptimizationConfigError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised while constructing a single parameter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Parameter {parameter}: expected a {expected} value, got {actual}")]
    DomainTypeMismatch {
        parameter: String,
        expected: ParameterType,
        actual: ParameterType,
    },

    #[error("Parameter {parameter}: lower bound {lower} must be strictly less than upper bound {upper}")]
    InvalidBounds {
        parameter: String,
        lower: f64,
        upper: f64,
    },

    #[error("Parameter {parameter}: bounds must be finite")]
    NonFiniteBounds { parameter: String },

    #[error("Parameter {parameter}: integer range bounds must be whole numbers, got [{lower}, {upper}]")]
    NonIntegralBounds {
        parameter: String,
        lower: f64,
        upper: f64,
    },

    #[error("Parameter {parameter}: integer bounds [{lower}, {upper}] exceed ±2^53")]
    IntBoundsTooLarge {
        parameter: String,
        lower: f64,
        upper: f64,
    },

    #[error("Parameter {parameter}: log scale requires a positive lower bound, got {lower}")]
    InvalidLogBounds { parameter: String, lower: f64 },

    #[error("Parameter {parameter}: range parameters must be int or float, got {parameter_type}")]
    NonNumericRange {
        parameter: String,
        parameter_type: ParameterType,
    },

    #[error("Parameter {parameter}: digits can only be set on float ranges")]
    DigitsOnNonFloat { parameter: String },

    #[error("Parameter {parameter}: choice parameters need at least two values, got {count}")]
    TooFewChoices { parameter: String, count: usize },

    #[error("Parameter {parameter}: duplicate choice value {value}")]
    DuplicateChoice { parameter: String, value: String },

    #[error("Parameter name must not be empty")]
    EmptyName,
}

/// Errors raised while assembling a search space
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchSpaceError {
    #[error("Duplicate parameter name: {name}")]
    DuplicateParameter { name: String },

    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Constraint references non-numeric parameter {name}")]
    NonNumericConstraintParameter { name: String },

    #[error("Unsupported constraint `{expression}`: {reason}")]
    UnsupportedConstraint { expression: String, reason: String },

    #[error("Malformed constraint `{expression}`: {reason}")]
    MalformedConstraint { expression: String, reason: String },
}

/// Errors raised when a parameterization does not belong to a search space
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArmError {
    #[error("Missing value for parameter {parameter}")]
    MissingParameter { parameter: String },

    #[error("Parameter {parameter} is not part of the search space")]
    UnexpectedParameter { parameter: String },

    #[error("Parameter {parameter}: expected a {expected} value, got {actual}")]
    DomainTypeMismatch {
        parameter: String,
        expected: ParameterType,
        actual: ParameterType,
    },

    #[error("Parameter {parameter}: value {value} is outside {domain}")]
    OutOfDomain {
        parameter: String,
        value: String,
        domain: String,
    },

    #[error("Constraint {constraint} violated: left-hand side is {value}")]
    ConstraintViolation { constraint: String, value: f64 },
}

/// Errors raised while building an optimization config
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationConfigError {
    #[error("An optimization config needs at least one objective")]
    NoObjectives,

    #[error("A multi-objective config needs at least two objectives, got {count}")]
    TooFewObjectives { count: usize },

    #[error("Metric {metric} is used by more than one objective")]
    DuplicateObjective { metric: String },

    #[error("Invalid objective threshold on {metric}: {reason}")]
    InvalidThreshold { metric: String, reason: String },

    #[error("Outcome constraint on objective metric {metric} is not allowed in a single-objective config")]
    ConstraintOnObjective { metric: String },

    #[error("Outcome constraint on {metric}: bound must be finite")]
    NonFiniteBound { metric: String },

    #[error("No status quo value for metric {metric}; relative bounds cannot be resolved")]
    MissingStatusQuo { metric: String },

    #[error("Status quo value for metric {metric} is zero; relative bounds are undefined")]
    ZeroStatusQuo { metric: String },
}

/// Trial lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("Trial {index}: cannot move from {from} to {to}")]
    InvalidTransition {
        index: usize,
        from: String,
        to: String,
    },

    #[error("Trial not found: {index}")]
    NotFound { index: usize },

    #[error("Trial {index} is {status}; only candidate trials can be modified")]
    NotCandidate { index: usize, status: String },

    #[error("Trial {index} is a candidate; data can only be attached once it has been deployed")]
    DataOnCandidate { index: usize },

    #[error("A batch trial needs at least one arm")]
    EmptyBatch,

    #[error("Arm weight must be positive and finite, got {weight}")]
    InvalidWeight { weight: f64 },

    #[error("Trial {index} has no arm named {arm}")]
    UnknownArm { index: usize, arm: String },

    #[error("Operation not supported for this trial kind: {message}")]
    WrongKind { message: String },

    #[error("Trial {index}: {field} of {metric} for arm {arm} must be finite, got {value}")]
    NonFiniteValue {
        index: usize,
        arm: String,
        metric: String,
        field: String,
        value: f64,
    },
}

/// Errors raised by generation strategies
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Generation strategy is complete: all steps have used their trial budget")]
    Completed,

    #[error("Step {step} needs {required} observed trials before moving on, only {observed} are complete")]
    DataRequired {
        step: String,
        required: usize,
        observed: usize,
    },

    #[error("Step {step} already has {running} trials running (max parallelism {max})")]
    MaxParallelismReached {
        step: String,
        running: usize,
        max: usize,
    },

    #[error("Generator {generator} could not find a feasible point after {attempts} draws")]
    Exhausted { generator: String, attempts: usize },

    #[error("Invalid generation strategy: {message}")]
    Misconfigured { message: String },
}

/// Result type alias for Armory operations
pub type ArResult<T> = Result<T, ArError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::ArError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::ArError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ArError::Config(format!($($arg)*))
    };
}
