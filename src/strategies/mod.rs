//! Condition evaluation and the instance state machine.

pub mod evaluator;
pub mod machine;

pub use evaluator::{ConditionEvaluator, GroupEvaluator};
pub use machine::{EvaluationOptions, InstanceStateMachine, TickOutcome};
