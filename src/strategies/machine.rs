//! Instance life-cycle: applies group results to an instance and decides
//! which single transition, if any, fires on a tick.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, TransitionFault};
use crate::models::condition::ConditionResult;
use crate::models::group::{GroupEvaluation, GroupRole};
use crate::models::instance::{
    InstanceState, ProgressUpdate, StateTransition, StrategyInstance, TransitionTrigger,
};
use crate::models::snapshot::IndicatorSnapshot;
use crate::strategies::evaluator::GroupEvaluator;

#[derive(Debug, Clone, Copy)]
pub struct EvaluationOptions {
    /// When false, only groups able to fire from the current state are
    /// evaluated; the others keep their previous results.
    pub evaluate_irrelevant_groups: bool,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            evaluate_irrelevant_groups: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub transition: Option<StateTransition>,
    pub progress: Option<ProgressUpdate>,
}

impl TickOutcome {
    pub fn is_empty(&self) -> bool {
        self.transition.is_none() && self.progress.is_none()
    }
}

pub struct InstanceStateMachine;

impl InstanceStateMachine {
    /// Evaluate `snapshot` against the instance and apply at most one rule.
    pub fn apply_tick(
        instance: &mut StrategyInstance,
        snapshot: Arc<IndicatorSnapshot>,
        options: EvaluationOptions,
    ) -> TickOutcome {
        if instance.state.is_terminal() {
            return TickOutcome::default();
        }
        let already_seen = instance
            .last_snapshot
            .as_ref()
            .is_some_and(|last| Arc::ptr_eq(last, &snapshot) || **last == *snapshot);
        if already_seen {
            debug!(
                strategy_id = %instance.strategy_id,
                symbol = %instance.symbol,
                "Snapshot already evaluated, skipping"
            );
            return TickOutcome::default();
        }

        let state = instance.state;
        let mut evaluations = instance.last_evaluations.clone();
        let mut fault = None;
        for (role, group) in &instance.groups {
            if !options.evaluate_irrelevant_groups && !role.is_relevant(state) {
                continue;
            }
            match GroupEvaluator::evaluate(group, &snapshot) {
                Ok(evaluation) => {
                    evaluations.insert(*role, evaluation);
                }
                Err(err) => {
                    fault = Some(err);
                    break;
                }
            }
        }

        if let Some(fault) = fault {
            instance.last_snapshot = Some(snapshot);
            let transition = Self::enter_error(instance, fault.to_string());
            return TickOutcome {
                transition: Some(transition),
                progress: None,
            };
        }
        evaluations.retain(|role, _| instance.groups.contains_key(role));

        let progress_changed = evaluations.iter().any(|(role, evaluation)| {
            instance
                .last_evaluations
                .get(role)
                .map_or(true, |previous| previous.met_count != evaluation.met_count)
        });

        let fired = Self::select_rule(state, &evaluations);
        let conditions = fired
            .and_then(|role| evaluations.get(&role))
            .map(|evaluation| evaluation.results.clone())
            .unwrap_or_default();

        instance.last_evaluations = evaluations;
        instance.last_snapshot = Some(snapshot);

        let transition = fired.map(|role| {
            let transition = Self::transition(
                instance,
                role.target_state(),
                TransitionTrigger::Group(role),
                None,
                conditions,
            );
            if role.is_emergency() {
                warn!(
                    strategy_id = %transition.strategy_id,
                    symbol = %transition.symbol,
                    from = %transition.from_state,
                    "Emergency exit triggered"
                );
            } else {
                info!(
                    strategy_id = %transition.strategy_id,
                    symbol = %transition.symbol,
                    from = %transition.from_state,
                    to = %transition.to_state,
                    trigger = %transition.trigger,
                    "State transition"
                );
            }
            transition
        });

        let progress = if transition.is_some() || progress_changed {
            Some(ProgressUpdate::from_instance(instance))
        } else {
            None
        };

        TickOutcome {
            transition,
            progress,
        }
    }

    /// First rule in precedence order whose group is satisfied from `state`.
    pub fn select_rule(
        state: InstanceState,
        evaluations: &BTreeMap<GroupRole, GroupEvaluation>,
    ) -> Option<GroupRole> {
        GroupRole::BY_PRIORITY.into_iter().find(|role| {
            role.source_state() == state && evaluations.get(role).is_some_and(|e| e.all_met)
        })
    }

    /// Start monitoring an inactive instance.
    pub fn arm(instance: &mut StrategyInstance) -> Result<StateTransition, EngineError> {
        if instance.state != InstanceState::Inactive {
            return Err(EngineError::InvalidTransition {
                from: instance.state,
                trigger: TransitionTrigger::Arm,
            });
        }
        instance.last_snapshot = None;
        let transition = Self::transition(
            instance,
            InstanceState::Monitoring,
            TransitionTrigger::Arm,
            None,
            Vec::new(),
        );
        info!(
            strategy_id = %transition.strategy_id,
            symbol = %transition.symbol,
            "Instance armed"
        );
        Ok(transition)
    }

    /// Return to `INACTIVE` from any state, discarding evaluation history.
    pub fn reset(instance: &mut StrategyInstance) -> StateTransition {
        instance.last_evaluations.clear();
        instance.last_snapshot = None;
        let transition = Self::transition(
            instance,
            InstanceState::Inactive,
            TransitionTrigger::Reset,
            None,
            Vec::new(),
        );
        info!(
            strategy_id = %transition.strategy_id,
            symbol = %transition.symbol,
            from = %transition.from_state,
            "Instance reset"
        );
        transition
    }

    /// Force a non-terminal instance into `ERROR`.
    pub fn fail(
        instance: &mut StrategyInstance,
        reason: impl Into<String>,
    ) -> Result<StateTransition, TransitionFault> {
        if instance.state.is_terminal() {
            return Err(TransitionFault::Terminal {
                state: instance.state,
            });
        }
        Ok(Self::enter_error(instance, reason.into()))
    }

    fn enter_error(instance: &mut StrategyInstance, reason: String) -> StateTransition {
        error!(
            strategy_id = %instance.strategy_id,
            symbol = %instance.symbol,
            from = %instance.state,
            reason = %reason,
            "Instance entered ERROR, evaluation halted until reset"
        );
        Self::transition(
            instance,
            InstanceState::Error,
            TransitionTrigger::Fault,
            Some(reason),
            Vec::new(),
        )
    }

    fn transition(
        instance: &mut StrategyInstance,
        to_state: InstanceState,
        trigger: TransitionTrigger,
        reason: Option<String>,
        conditions: Vec<ConditionResult>,
    ) -> StateTransition {
        let now = Utc::now();
        let from_state = instance.state;
        instance.state = to_state;
        instance.state_changed_at = now;
        instance.error_reason = if to_state == InstanceState::Error {
            reason.clone()
        } else {
            None
        };

        StateTransition {
            strategy_id: instance.strategy_id.clone(),
            symbol: instance.symbol.clone(),
            session_id: instance.session_id.clone(),
            from_state,
            to_state,
            trigger,
            emergency: matches!(trigger, TransitionTrigger::Group(role) if role.is_emergency()),
            reason,
            conditions,
            timestamp: now,
        }
    }
}
