//! Condition and group evaluation against indicator snapshots

use tracing::debug;

use crate::error::TransitionFault;
use crate::models::condition::{Condition, ConditionResult, Operator, Threshold};
use crate::models::group::{ConditionGroup, GroupEvaluation};
use crate::models::snapshot::IndicatorSnapshot;

pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluate one condition. A missing or non-finite value is never met.
    pub fn evaluate(condition: &Condition, value: Option<f64>) -> ConditionResult {
        let value = value.filter(|v| v.is_finite());
        let met = match value {
            Some(v) => Self::compare_value(v, condition.operator, condition.threshold),
            None => {
                debug!(
                    condition = %condition.name,
                    indicator = %condition.indicator_key(),
                    "Indicator value unavailable, condition not met"
                );
                false
            }
        };

        ConditionResult {
            condition: condition.clone(),
            current_value: value,
            met,
        }
    }

    /// Compare a value using the specified operator. Equality is exact.
    pub fn compare_value(value: f64, operator: Operator, threshold: Threshold) -> bool {
        match threshold {
            Threshold::Scalar(thresh) => match operator {
                Operator::GreaterThan => value > thresh,
                Operator::LessThan => value < thresh,
                Operator::GreaterEqual => value >= thresh,
                Operator::LessEqual => value <= thresh,
                Operator::Equal => value == thresh,
                Operator::NotEqual => value != thresh,
            },
            Threshold::Range(low, high) => {
                let inside = value >= low && value <= high;
                match operator {
                    Operator::Equal => inside,
                    Operator::NotEqual => !inside,
                    _ => false,
                }
            }
        }
    }
}

pub struct GroupEvaluator;

impl GroupEvaluator {
    /// Evaluate the enabled conditions of a group, in declared order.
    pub fn evaluate(
        group: &ConditionGroup,
        snapshot: &IndicatorSnapshot,
    ) -> Result<GroupEvaluation, TransitionFault> {
        if !group.is_evaluable() {
            group.validate().map_err(|source| TransitionFault::InvalidGroup {
                role: group.id,
                source,
            })?;
        }

        let results: Vec<ConditionResult> = group
            .enabled_conditions()
            .map(|condition| {
                ConditionEvaluator::evaluate(condition, snapshot.value(condition.indicator_key()))
            })
            .collect();

        let met_count = results.iter().filter(|r| r.met).count();
        let total_count = results.len();
        let all_met = if total_count == 0 {
            false
        } else if group.require_all {
            met_count == total_count
        } else {
            met_count > 0
        };

        Ok(GroupEvaluation {
            group: group.id,
            results,
            met_count,
            total_count,
            all_met,
        })
    }
}
