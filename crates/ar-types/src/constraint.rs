//! Linear parameter constraints of the form `Σ wᵢ·xᵢ ≤ bound`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::SearchSpaceError;
use crate::parameter::ParameterValue;

/// Slack allowed when checking a constraint, absorbs float noise.
pub const CONSTRAINT_TOLERANCE: f64 = 1e-8;

/// A linear inequality over numeric parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConstraint {
    weights: BTreeMap<String, f64>,
    bound: f64,
}

impl ParameterConstraint {
    /// `Σ weights[name]·name ≤ bound`. Zero weights are dropped.
    pub fn linear(
        weights: impl IntoIterator<Item = (String, f64)>,
        bound: f64,
    ) -> Result<Self, SearchSpaceError> {
        let weights: BTreeMap<String, f64> = weights.into_iter().filter(|(_, w)| *w != 0.0).collect();
        let constraint = Self { weights, bound };

        if constraint.weights.is_empty() {
            return Err(SearchSpaceError::MalformedConstraint {
                expression: constraint.to_string(),
                reason: "constraint does not reference any parameter".to_string(),
            });
        }
        if !bound.is_finite() || constraint.weights.values().any(|w| !w.is_finite()) {
            return Err(SearchSpaceError::MalformedConstraint {
                expression: constraint.to_string(),
                reason: "weights and bound must be finite".to_string(),
            });
        }
        Ok(constraint)
    }

    /// `lower ≤ upper`.
    pub fn order(lower: &str, upper: &str) -> Result<Self, SearchSpaceError> {
        if lower == upper {
            return Err(SearchSpaceError::MalformedConstraint {
                expression: format!("{lower} <= {upper}"),
                reason: "an order constraint needs two distinct parameters".to_string(),
            });
        }
        Self::linear([(lower.to_string(), 1.0), (upper.to_string(), -1.0)], 0.0)
    }

    /// `Σ names ≤ bound` when `is_upper_bound`, otherwise `Σ names ≥ bound`.
    pub fn sum(names: &[&str], bound: f64, is_upper_bound: bool) -> Result<Self, SearchSpaceError> {
        let sign = if is_upper_bound { 1.0 } else { -1.0 };
        Self::linear(names.iter().map(|n| (n.to_string(), sign)), sign * bound)
    }

    /// Parse an inequality such as `x1 + 2*x2 <= 1.5` or `a >= b`.
    ///
    /// Equalities, strict inequalities and non-linear terms are rejected.
    pub fn parse(expression: &str) -> Result<Self, SearchSpaceError> {
        let unsupported = |reason: &str| SearchSpaceError::UnsupportedConstraint {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let (lhs, rhs, upper) = split_comparison(expression).map_err(|reason| match reason {
            SplitFailure::Equality => unsupported("equality constraints are not supported"),
            SplitFailure::Strict => unsupported("strict inequalities are not supported, use <= or >="),
            SplitFailure::Missing => SearchSpaceError::MalformedConstraint {
                expression: expression.to_string(),
                reason: "expected exactly one of <= or >=".to_string(),
            },
        })?;

        let left = parse_linear(lhs, expression)?;
        let right = parse_linear(rhs, expression)?;

        // lhs - rhs <= 0  =>  Σ (l - r)·x <= r_c - l_c
        let mut weights = left.weights;
        for (name, w) in right.weights {
            *weights.entry(name).or_insert(0.0) -= w;
        }
        let mut bound = right.constant - left.constant;
        if !upper {
            for w in weights.values_mut() {
                *w = -*w;
            }
            bound = -bound;
        }

        Self::linear(weights, bound)
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn bound(&self) -> f64 {
        self.bound
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    /// Left-hand side under `values`, `None` if a referenced value is
    /// missing or not numeric.
    pub fn evaluate(&self, values: &BTreeMap<String, ParameterValue>) -> Option<f64> {
        self.weights
            .iter()
            .map(|(name, w)| values.get(name).and_then(ParameterValue::as_f64).map(|v| w * v))
            .sum()
    }

    pub fn check(&self, values: &BTreeMap<String, ParameterValue>) -> bool {
        self.evaluate(values)
            .map(|lhs| lhs <= self.bound + CONSTRAINT_TOLERANCE)
            .unwrap_or(false)
    }
}

impl fmt::Display for ParameterConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, w)) in self.weights.iter().enumerate() {
            match (i, w.is_sign_negative()) {
                (0, _) => write!(f, "{w}*{name}")?,
                (_, true) => write!(f, " - {}*{name}", w.abs())?,
                (_, false) => write!(f, " + {w}*{name}")?,
            }
        }
        write!(f, " <= {}", self.bound)
    }
}

enum SplitFailure {
    Equality,
    Strict,
    Missing,
}

fn split_comparison(expression: &str) -> Result<(&str, &str, bool), SplitFailure> {
    let le = expression.matches("<=").count();
    let ge = expression.matches(">=").count();
    let bare_eq = expression.matches('=').count() - le - ge;
    if bare_eq > 0 {
        return Err(SplitFailure::Equality);
    }
    let lt = expression.matches('<').count() - le;
    let gt = expression.matches('>').count() - ge;
    if lt > 0 || gt > 0 {
        return Err(SplitFailure::Strict);
    }

    match (le, ge) {
        (1, 0) => {
            let (l, r) = expression.split_once("<=").ok_or(SplitFailure::Missing)?;
            Ok((l, r, true))
        }
        (0, 1) => {
            let (l, r) = expression.split_once(">=").ok_or(SplitFailure::Missing)?;
            Ok((l, r, false))
        }
        _ => Err(SplitFailure::Missing),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
}

struct LinearExpr {
    weights: BTreeMap<String, f64>,
    constant: f64,
}

fn tokenize(side: &str, expression: &str) -> Result<Vec<Token>, SearchSpaceError> {
    let unsupported = |reason: String| SearchSpaceError::UnsupportedConstraint {
        expression: expression.to_string(),
        reason,
    };
    let malformed = |reason: String| SearchSpaceError::MalformedConstraint {
        expression: expression.to_string(),
        reason,
    };

    let chars: Vec<char> = side.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    return Err(unsupported("powers are not linear".to_string()));
                }
                tokens.push(Token::Star);
                i += 1;
            }
            '^' => return Err(unsupported("powers are not linear".to_string())),
            '/' => return Err(unsupported("division is not supported".to_string())),
            '(' | ')' => {
                return Err(unsupported(
                    "parentheses are not supported, expand the expression".to_string(),
                ))
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| malformed(format!("invalid number `{text}`")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(malformed(format!("unexpected character `{other}`"))),
        }
    }
    Ok(tokens)
}

fn parse_linear(side: &str, expression: &str) -> Result<LinearExpr, SearchSpaceError> {
    let malformed = |reason: &str| SearchSpaceError::MalformedConstraint {
        expression: expression.to_string(),
        reason: reason.to_string(),
    };

    let tokens = tokenize(side, expression)?;
    if tokens.is_empty() {
        return Err(malformed("empty side of inequality"));
    }

    let mut expr = LinearExpr {
        weights: BTreeMap::new(),
        constant: 0.0,
    };
    let mut pos = 0;
    let mut first = true;

    while pos < tokens.len() {
        let mut sign = 1.0;
        match tokens[pos] {
            Token::Plus => pos += 1,
            Token::Minus => {
                sign = -1.0;
                pos += 1;
            }
            _ if first => {}
            _ => return Err(malformed("expected + or - between terms")),
        }
        first = false;

        // term := factor ('*' factor)*
        let mut coefficient = sign;
        let mut ident: Option<String> = None;
        loop {
            match tokens.get(pos) {
                Some(Token::Number(v)) => coefficient *= v,
                Some(Token::Ident(name)) => {
                    if ident.is_some() {
                        return Err(SearchSpaceError::UnsupportedConstraint {
                            expression: expression.to_string(),
                            reason: "products of parameters are not linear".to_string(),
                        });
                    }
                    ident = Some(name.clone());
                }
                _ => return Err(malformed("expected a number or parameter name")),
            }
            pos += 1;
            if tokens.get(pos) == Some(&Token::Star) {
                pos += 1;
            } else {
                break;
            }
        }

        match ident {
            Some(name) => *expr.weights.entry(name).or_insert(0.0) += coefficient,
            None => expr.constant += coefficient,
        }
    }

    Ok(expr)
}
