//! Condition definitions and per-tick condition results

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigurationError;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl Operator {
    /// Operator used when a configured token is not recognised.
    pub const FALLBACK: Operator = Operator::GreaterEqual;

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::GreaterThan => ">",
            Operator::LessThan => "<",
            Operator::GreaterEqual => ">=",
            Operator::LessEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
        }
    }

    /// Parse one of the accepted operator spellings (case-insensitive).
    pub fn parse(token: &str) -> Option<Operator> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gte" | ">=" => Some(Operator::GreaterEqual),
            "lte" | "<=" => Some(Operator::LessEqual),
            "gt" | ">" => Some(Operator::GreaterThan),
            "lt" | "<" => Some(Operator::LessThan),
            "eq" | "=" | "==" => Some(Operator::Equal),
            "neq" | "!=" => Some(Operator::NotEqual),
            _ => None,
        }
    }

    /// Normalize a configured token. Unknown tokens fall back to `>=` and
    /// produce a warning tagged with `field`.
    pub fn normalize(token: &str, field: &str) -> (Operator, Option<ConfigWarning>) {
        match Operator::parse(token) {
            Some(op) => (op, None),
            None => (
                Operator::FALLBACK,
                Some(ConfigWarning {
                    field: field.to_string(),
                    message: format!(
                        "unknown operator '{}', falling back to '{}'",
                        token,
                        Operator::FALLBACK
                    ),
                }),
            ),
        }
    }

    /// Range thresholds are only meaningful for equality operators.
    pub fn accepts_range(&self) -> bool {
        matches!(self, Operator::Equal | Operator::NotEqual)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either a single number or an inclusive `[low, high]` band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Scalar(f64),
    Range(f64, f64),
}

impl Threshold {
    pub fn is_range(&self) -> bool {
        matches!(self, Threshold::Range(_, _))
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Scalar(v) => write!(f, "{}", v),
            Threshold::Range(low, high) => write!(f, "[{}, {}]", low, high),
        }
    }
}

/// Non-fatal configuration problem reported back from an upsert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
}

/// A validated, immutable condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub condition_type: String,
    /// Snapshot key to read; the condition name is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicator: Option<String>,
    pub operator: Operator,
    pub threshold: Threshold,
    pub enabled: bool,
    pub description: Option<String>,
}

impl Condition {
    pub fn new(name: impl Into<String>, operator: Operator, threshold: Threshold) -> Self {
        Self {
            name: name.into(),
            condition_type: DEFAULT_CONDITION_TYPE.to_string(),
            indicator: None,
            operator,
            threshold,
            enabled: true,
            description: None,
        }
    }

    pub fn indicator_key(&self) -> &str {
        self.indicator.as_deref().unwrap_or(&self.name)
    }

    /// Allocation-free form of `validate` used on every tick.
    pub fn is_well_formed(&self) -> bool {
        if self.name.trim().is_empty() {
            return false;
        }
        match self.threshold {
            Threshold::Scalar(v) => v.is_finite(),
            Threshold::Range(low, high) => {
                low.is_finite() && high.is_finite() && self.operator.accepts_range() && low <= high
            }
        }
    }

    /// Structural checks shared by configuration loading and evaluation.
    pub fn validate(&self, field: &str) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::Empty {
                field: format!("{}.name", field),
            });
        }
        match self.threshold {
            Threshold::Scalar(v) if !v.is_finite() => Err(ConfigurationError::NonFiniteThreshold {
                field: format!("{}.threshold", field),
            }),
            Threshold::Scalar(_) => Ok(()),
            Threshold::Range(low, high) => {
                if !low.is_finite() || !high.is_finite() {
                    Err(ConfigurationError::NonFiniteThreshold {
                        field: format!("{}.threshold", field),
                    })
                } else if !self.operator.accepts_range() {
                    Err(ConfigurationError::RangeOperator {
                        field: format!("{}.operator", field),
                        operator: self.operator,
                    })
                } else if low > high {
                    Err(ConfigurationError::InvertedRange {
                        field: format!("{}.threshold", field),
                        low,
                        high,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }
}

const DEFAULT_CONDITION_TYPE: &str = "indicator";

fn default_condition_type() -> String {
    DEFAULT_CONDITION_TYPE.to_string()
}

fn default_enabled() -> bool {
    true
}

/// Condition as it arrives from configuration, before operator normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub name: String,
    #[serde(default = "default_condition_type", alias = "type")]
    pub condition_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicator: Option<String>,
    pub operator: String,
    pub threshold: Threshold,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ConditionSpec {
    pub fn new(name: impl Into<String>, operator: impl Into<String>, threshold: Threshold) -> Self {
        Self {
            name: name.into(),
            condition_type: default_condition_type(),
            indicator: None,
            operator: operator.into(),
            threshold,
            enabled: true,
            description: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_indicator(mut self, indicator: impl Into<String>) -> Self {
        self.indicator = Some(indicator.into());
        self
    }

    /// Normalize and validate. Operator warnings are appended to `warnings`.
    pub fn into_condition(
        self,
        field: &str,
        warnings: &mut Vec<ConfigWarning>,
    ) -> Result<Condition, ConfigurationError> {
        let (operator, warning) = Operator::normalize(&self.operator, &format!("{}.operator", field));
        if let Some(warning) = warning {
            tracing::warn!(field = %warning.field, "{}", warning.message);
            warnings.push(warning);
        }

        let condition = Condition {
            name: self.name,
            condition_type: self.condition_type,
            indicator: self.indicator.filter(|key| !key.trim().is_empty()),
            operator,
            threshold: self.threshold,
            enabled: self.enabled,
            description: self.description,
        };
        condition.validate(field)?;
        Ok(condition)
    }
}

/// Outcome of one condition on one tick; never persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionResult {
    #[serde(flatten)]
    pub condition: Condition,
    pub current_value: Option<f64>,
    pub met: bool,
}

impl ConditionResult {
    /// Result shown for a condition that has not been evaluated yet.
    pub fn pending(condition: &Condition) -> Self {
        Self {
            condition: condition.clone(),
            current_value: None,
            met: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.condition.name
    }
}
