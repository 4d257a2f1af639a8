//! Condition groups and the closed set of group roles

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::ConfigurationError;
use crate::models::condition::{Condition, ConditionResult, ConditionSpec, ConfigWarning};
use crate::models::instance::InstanceState;

/// Role of a condition group. The role alone decides what a satisfied group
/// does to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupRole {
    #[serde(rename = "S1", alias = "signal_detection")]
    SignalDetection,
    #[serde(rename = "O1", alias = "signal_cancellation")]
    SignalCancellation,
    #[serde(rename = "Z1", alias = "entry_conditions")]
    EntryConditions,
    #[serde(rename = "ZE1", alias = "close_order_detection")]
    CloseOrderDetection,
    #[serde(rename = "E1", alias = "emergency_exit")]
    EmergencyExit,
}

impl GroupRole {
    /// Rule table in firing precedence, highest first.
    pub const BY_PRIORITY: [GroupRole; 5] = [
        GroupRole::EmergencyExit,
        GroupRole::CloseOrderDetection,
        GroupRole::SignalCancellation,
        GroupRole::EntryConditions,
        GroupRole::SignalDetection,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            GroupRole::SignalDetection => "S1",
            GroupRole::SignalCancellation => "O1",
            GroupRole::EntryConditions => "Z1",
            GroupRole::CloseOrderDetection => "ZE1",
            GroupRole::EmergencyExit => "E1",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            GroupRole::SignalDetection => "signal_detection",
            GroupRole::SignalCancellation => "signal_cancellation",
            GroupRole::EntryConditions => "entry_conditions",
            GroupRole::CloseOrderDetection => "close_order_detection",
            GroupRole::EmergencyExit => "emergency_exit",
        }
    }

    /// 1 is checked first.
    pub fn priority(&self) -> u8 {
        match self {
            GroupRole::EmergencyExit => 1,
            GroupRole::CloseOrderDetection => 2,
            GroupRole::SignalCancellation => 3,
            GroupRole::EntryConditions => 4,
            GroupRole::SignalDetection => 5,
        }
    }

    /// State the instance must be in for this group to fire.
    pub fn source_state(&self) -> InstanceState {
        match self {
            GroupRole::SignalDetection => InstanceState::Monitoring,
            GroupRole::SignalCancellation | GroupRole::EntryConditions => {
                InstanceState::SignalDetected
            }
            GroupRole::CloseOrderDetection | GroupRole::EmergencyExit => {
                InstanceState::PositionActive
            }
        }
    }

    pub fn target_state(&self) -> InstanceState {
        match self {
            GroupRole::SignalDetection => InstanceState::SignalDetected,
            GroupRole::SignalCancellation => InstanceState::Monitoring,
            GroupRole::EntryConditions => InstanceState::PositionActive,
            GroupRole::CloseOrderDetection | GroupRole::EmergencyExit => InstanceState::Exited,
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, GroupRole::EmergencyExit)
    }

    /// Whether the group can drive a transition from `state`.
    pub fn is_relevant(&self, state: InstanceState) -> bool {
        self.source_state() == state
    }
}

impl fmt::Display for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A named set of conditions combined with AND (`require_all`) or OR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub id: GroupRole,
    pub name: String,
    pub require_all: bool,
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    pub fn enabled_conditions(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.iter().filter(|c| c.enabled)
    }

    pub fn field_path(&self) -> String {
        format!("groups[{}]", self.id)
    }

    /// True when every condition can be evaluated. Duplicate names are
    /// rejected when the group is built and are not rechecked here.
    pub fn is_evaluable(&self) -> bool {
        !self.name.trim().is_empty() && self.conditions.iter().all(Condition::is_well_formed)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let field = self.field_path();
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::Empty {
                field: format!("{}.name", field),
            });
        }

        let mut seen = HashSet::new();
        for condition in &self.conditions {
            let condition_field = format!("{}.conditions[{}]", field, condition.name);
            condition.validate(&condition_field)?;
            if !seen.insert(condition.name.as_str()) {
                return Err(ConfigurationError::DuplicateCondition {
                    field: condition_field,
                    name: condition.name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn default_require_all() -> bool {
    true
}

/// Group as it arrives from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub id: GroupRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_require_all")]
    pub require_all: bool,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
}

impl GroupSpec {
    pub fn new(id: GroupRole, require_all: bool, conditions: Vec<ConditionSpec>) -> Self {
        Self {
            id,
            name: None,
            require_all,
            conditions,
        }
    }

    pub fn into_group(self, warnings: &mut Vec<ConfigWarning>) -> Result<ConditionGroup, ConfigurationError> {
        let field = format!("groups[{}]", self.id);
        let mut conditions = Vec::with_capacity(self.conditions.len());
        for (index, spec) in self.conditions.into_iter().enumerate() {
            let label = if spec.name.trim().is_empty() {
                index.to_string()
            } else {
                spec.name.clone()
            };
            conditions.push(spec.into_condition(&format!("{}.conditions[{}]", field, label), warnings)?);
        }

        let group = ConditionGroup {
            id: self.id,
            name: self.name.unwrap_or_else(|| self.id.slug().to_string()),
            require_all: self.require_all,
            conditions,
        };
        group.validate()?;
        Ok(group)
    }
}

/// Validate a full group configuration. Nothing is returned unless every
/// group is valid.
pub fn build_groups(
    specs: Vec<GroupSpec>,
) -> Result<(BTreeMap<GroupRole, ConditionGroup>, Vec<ConfigWarning>), ConfigurationError> {
    let mut groups = BTreeMap::new();
    let mut warnings = Vec::new();
    for spec in specs {
        let role = spec.id;
        if groups.contains_key(&role) {
            return Err(ConfigurationError::DuplicateRole {
                field: format!("groups[{}]", role),
                role,
            });
        }
        let group = spec.into_group(&mut warnings)?;
        groups.insert(role, group);
    }
    Ok((groups, warnings))
}

/// Result of evaluating one group against one snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupEvaluation {
    pub group: GroupRole,
    /// Enabled conditions only, in declared order.
    pub results: Vec<ConditionResult>,
    pub met_count: usize,
    pub total_count: usize,
    pub all_met: bool,
}

impl GroupEvaluation {
    pub fn percentage(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.met_count as f64 / self.total_count as f64 * 100.0
        }
    }

    pub fn progress(&self) -> GroupProgress {
        GroupProgress {
            met: self.met_count,
            total: self.total_count,
            percentage: self.percentage(),
        }
    }

    pub fn result(&self, name: &str) -> Option<&ConditionResult> {
        self.results.iter().find(|r| r.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GroupProgress {
    pub met: usize,
    pub total: usize,
    pub percentage: f64,
}
