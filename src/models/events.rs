//! Messages pushed to subscribers of the `conditions` channel

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::condition::ConditionResult;
use crate::models::instance::{
    GroupView, InstanceState, ProgressUpdate, StateTransition, StrategyInstance, TransitionTrigger,
};

pub const CONDITIONS_CHANNEL: &str = "conditions";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ConditionUpdate(ConditionUpdate),
    StateChange(StateChange),
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::ConditionUpdate(_) => "condition_update",
            EngineEvent::StateChange(_) => "state_change",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            EngineEvent::ConditionUpdate(u) => &u.session_id,
            EngineEvent::StateChange(c) => &c.session_id,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            EngineEvent::ConditionUpdate(u) => &u.symbol,
            EngineEvent::StateChange(c) => &c.symbol,
        }
    }

    pub fn strategy_id(&self) -> &str {
        match self {
            EngineEvent::ConditionUpdate(u) => &u.strategy_id,
            EngineEvent::StateChange(c) => &c.strategy_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionUpdate {
    pub session_id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub state: InstanceState,
    pub groups: Vec<GroupView>,
    pub timestamp: DateTime<Utc>,
}

impl From<ProgressUpdate> for ConditionUpdate {
    fn from(update: ProgressUpdate) -> Self {
        Self {
            session_id: update.session_id,
            symbol: update.symbol,
            strategy_id: update.strategy_id,
            state: update.state,
            groups: update.groups,
            timestamp: update.timestamp,
        }
    }
}

impl From<&StrategyInstance> for ConditionUpdate {
    fn from(instance: &StrategyInstance) -> Self {
        ProgressUpdate::from_instance(instance).into()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub session_id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub from_state: InstanceState,
    pub new_state: InstanceState,
    pub trigger: TransitionTrigger,
    pub emergency: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub conditions: Vec<ConditionResult>,
    pub timestamp: DateTime<Utc>,
}

impl From<StateTransition> for StateChange {
    fn from(transition: StateTransition) -> Self {
        Self {
            session_id: transition.session_id,
            symbol: transition.symbol,
            strategy_id: transition.strategy_id,
            from_state: transition.from_state,
            new_state: transition.to_state,
            trigger: transition.trigger,
            emergency: transition.emergency,
            reason: transition.reason,
            conditions: transition.conditions,
            timestamp: transition.timestamp,
        }
    }
}

impl From<StateTransition> for EngineEvent {
    fn from(transition: StateTransition) -> Self {
        EngineEvent::StateChange(transition.into())
    }
}

impl From<ProgressUpdate> for EngineEvent {
    fn from(update: ProgressUpdate) -> Self {
        EngineEvent::ConditionUpdate(update.into())
    }
}
