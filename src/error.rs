//! Error taxonomy for the engine

use thiserror::Error;

use crate::models::condition::Operator;
use crate::models::group::GroupRole;
use crate::models::instance::{InstanceState, TransitionTrigger};

/// Invalid instance configuration, rejected before anything changes.
/// Every variant names the offending field.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("{field}: range threshold requires '==' or '!=', got '{operator}'")]
    RangeOperator { field: String, operator: Operator },

    #[error("{field}: range low {low} is above high {high}")]
    InvertedRange { field: String, low: f64, high: f64 },

    #[error("{field}: threshold must be a finite number")]
    NonFiniteThreshold { field: String },

    #[error("{field}: must not be empty")]
    Empty { field: String },

    #[error("{field}: group {role} is configured more than once")]
    DuplicateRole { field: String, role: GroupRole },

    #[error("{field}: condition '{name}' is configured more than once")]
    DuplicateCondition { field: String, name: String },
}

impl ConfigurationError {
    pub fn field(&self) -> &str {
        match self {
            ConfigurationError::RangeOperator { field, .. }
            | ConfigurationError::InvertedRange { field, .. }
            | ConfigurationError::NonFiniteThreshold { field }
            | ConfigurationError::Empty { field }
            | ConfigurationError::DuplicateRole { field, .. }
            | ConfigurationError::DuplicateCondition { field, .. } => field,
        }
    }
}

/// Structural failure that forces an instance into `ERROR`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionFault {
    #[error("group {role} cannot be evaluated: {source}")]
    InvalidGroup {
        role: GroupRole,
        #[source]
        source: ConfigurationError,
    },

    #[error("instance is already terminal ({state})")]
    Terminal { state: InstanceState },
}

/// Publishing never feeds back into evaluation; callers only log these.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("no subscribers for {event} event")]
    NoSubscribers { event: &'static str },

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("snapshot queue is full")]
    Full,

    #[error("snapshot feed is not running")]
    Closed,
}

#[derive(Error, Debug)]
pub enum DefinitionsError {
    #[error("failed to read strategy definitions: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse strategy definitions: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors returned by the instance registry API
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("instance {strategy_id}/{symbol} not found")]
    NotFound { strategy_id: String, symbol: String },

    #[error("{trigger} is not allowed from {from}")]
    InvalidTransition {
        from: InstanceState,
        trigger: TransitionTrigger,
    },

    #[error(transparent)]
    Fault(#[from] TransitionFault),
}

impl EngineError {
    pub fn not_found(strategy_id: &str, symbol: &str) -> Self {
        EngineError::NotFound {
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
        }
    }
}
