use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Latest indicator values for one symbol, as pushed by the indicator provider.
///
/// A key mapped to `null` is treated the same as a missing key. Non-finite
/// values are stored as `null` so that two snapshots carrying the same data
/// always compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    #[serde(default)]
    pub values: HashMap<String, Option<f64>>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl IndicatorSnapshot {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            values: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), Some(value).filter(|v| v.is_finite()));
        self
    }

    pub fn with_missing(mut self, key: impl Into<String>) -> Self {
        self.values.insert(key.into(), None);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Replace NaN and infinite values with `null`.
    pub fn normalized(mut self) -> Self {
        for value in self.values.values_mut() {
            if value.is_some_and(|v| !v.is_finite()) {
                *value = None;
            }
        }
        self
    }

    pub fn value(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied().flatten()
    }
}
