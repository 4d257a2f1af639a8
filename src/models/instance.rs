//! Strategy instances, their life-cycle states and emitted transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::models::condition::ConditionResult;
use crate::models::group::{ConditionGroup, GroupEvaluation, GroupProgress, GroupRole};
use crate::models::snapshot::IndicatorSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Inactive,
    Monitoring,
    SignalDetected,
    PositionActive,
    Exited,
    Error,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Inactive => "INACTIVE",
            InstanceState::Monitoring => "MONITORING",
            InstanceState::SignalDetected => "SIGNAL_DETECTED",
            InstanceState::PositionActive => "POSITION_ACTIVE",
            InstanceState::Exited => "EXITED",
            InstanceState::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Exited | InstanceState::Error)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionTrigger {
    Group(GroupRole),
    Arm,
    Reset,
    Fault,
}

impl TransitionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionTrigger::Group(role) => role.code(),
            TransitionTrigger::Arm => "ARM",
            TransitionTrigger::Reset => "RESET",
            TransitionTrigger::Fault => "FAULT",
        }
    }
}

impl fmt::Display for TransitionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TransitionTrigger {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub strategy_id: String,
    pub symbol: String,
}

impl InstanceKey {
    pub fn new(strategy_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.strategy_id, self.symbol)
    }
}

/// One strategy tracked on one symbol
#[derive(Debug, Clone)]
pub struct StrategyInstance {
    pub strategy_id: String,
    pub symbol: String,
    pub session_id: String,
    pub state: InstanceState,
    pub groups: BTreeMap<GroupRole, ConditionGroup>,
    pub state_changed_at: DateTime<Utc>,
    /// Set while the instance sits in `ERROR`.
    pub error_reason: Option<String>,
    pub last_evaluations: BTreeMap<GroupRole, GroupEvaluation>,
    pub last_snapshot: Option<Arc<IndicatorSnapshot>>,
}

impl StrategyInstance {
    pub fn new(
        session_id: impl Into<String>,
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        groups: BTreeMap<GroupRole, ConditionGroup>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            session_id: session_id.into(),
            state: InstanceState::Inactive,
            groups,
            state_changed_at: Utc::now(),
            error_reason: None,
            last_evaluations: BTreeMap::new(),
            last_snapshot: None,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.strategy_id.clone(), self.symbol.clone())
    }

    /// Display payload for every configured group, in life-cycle order.
    pub fn group_views(&self) -> Vec<GroupView> {
        self.groups
            .values()
            .map(|group| {
                let evaluation = self.last_evaluations.get(&group.id);
                let conditions = group
                    .conditions
                    .iter()
                    .map(|condition| {
                        evaluation
                            .and_then(|e| e.result(&condition.name))
                            .cloned()
                            .unwrap_or_else(|| ConditionResult::pending(condition))
                    })
                    .collect();
                let progress = match evaluation {
                    Some(e) => e.progress(),
                    None => GroupProgress {
                        met: 0,
                        total: group.enabled_conditions().count(),
                        percentage: 0.0,
                    },
                };
                GroupView {
                    id: group.id,
                    name: group.name.clone(),
                    is_relevant: group.id.is_relevant(self.state),
                    require_all: group.require_all,
                    progress,
                    conditions,
                }
            })
            .collect()
    }

    pub fn view(&self) -> InstanceView {
        InstanceView {
            strategy_id: self.strategy_id.clone(),
            symbol: self.symbol.clone(),
            session_id: self.session_id.clone(),
            state: self.state,
            state_changed_at: self.state_changed_at,
            error_reason: self.error_reason.clone(),
            groups: self.group_views(),
        }
    }
}

/// A single state change, emitted exactly once per fired rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub strategy_id: String,
    pub symbol: String,
    pub session_id: String,
    pub from_state: InstanceState,
    pub to_state: InstanceState,
    pub trigger: TransitionTrigger,
    pub emergency: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Results of the triggering group, in declared order.
    pub conditions: Vec<ConditionResult>,
    pub timestamp: DateTime<Utc>,
}

impl StateTransition {
    pub fn condition(&self, name: &str) -> Option<&ConditionResult> {
        self.conditions.iter().find(|c| c.name() == name)
    }
}

/// Progress snapshot emitted when group counts move without a transition
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub strategy_id: String,
    pub symbol: String,
    pub session_id: String,
    pub state: InstanceState,
    pub groups: Vec<GroupView>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    pub fn from_instance(instance: &StrategyInstance) -> Self {
        Self {
            strategy_id: instance.strategy_id.clone(),
            symbol: instance.symbol.clone(),
            session_id: instance.session_id.clone(),
            state: instance.state,
            groups: instance.group_views(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupView {
    pub id: GroupRole,
    pub name: String,
    pub is_relevant: bool,
    pub require_all: bool,
    pub progress: GroupProgress,
    pub conditions: Vec<ConditionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceView {
    pub strategy_id: String,
    pub symbol: String,
    pub session_id: String,
    pub state: InstanceState,
    pub state_changed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub groups: Vec<GroupView>,
}

/// Query endpoint payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConditions {
    pub session_id: String,
    pub instances: Vec<InstanceView>,
}
