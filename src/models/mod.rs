//! Shared data models spanning the engine layers.

pub mod condition;
pub mod events;
pub mod group;
pub mod instance;
pub mod snapshot;

pub use condition::{Condition, ConditionResult, ConditionSpec, ConfigWarning, Operator, Threshold};
pub use events::{ConditionUpdate, EngineEvent, StateChange, CONDITIONS_CHANNEL};
pub use group::{build_groups, ConditionGroup, GroupEvaluation, GroupProgress, GroupRole, GroupSpec};
pub use instance::{
    GroupView, InstanceKey, InstanceState, InstanceView, ProgressUpdate, SessionConditions,
    StateTransition, StrategyInstance, TransitionTrigger,
};
pub use snapshot::IndicatorSnapshot;
