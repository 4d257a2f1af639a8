//! End-to-end tick scenarios for a single instance

use tripwire::models::{GroupRole, InstanceState, TransitionTrigger};
use tripwire::strategies::{EvaluationOptions, InstanceStateMachine};

use crate::common_fixtures::{all_of, cond, instance_in, snapshot};

#[test]
fn momentum_breakout_detects_signal() {
    let mut instance = instance_in(
        InstanceState::Monitoring,
        vec![all_of(
            GroupRole::SignalDetection,
            vec![cond("volume_change", ">", 2.0), cond("price_momentum", ">", 3.5)],
        )],
    );

    let outcome = InstanceStateMachine::apply_tick(
        &mut instance,
        snapshot(&[("volume_change", 2.8), ("price_momentum", 4.1)]),
        EvaluationOptions::default(),
    );

    let transition = outcome.transition.expect("S1 should fire");
    assert_eq!(transition.from_state, InstanceState::Monitoring);
    assert_eq!(transition.to_state, InstanceState::SignalDetected);
    assert_eq!(transition.trigger, TransitionTrigger::Group(GroupRole::SignalDetection));
    assert!(!transition.emergency);

    let volume = transition.condition("volume_change").unwrap();
    assert!(volume.met);
    assert_eq!(volume.current_value, Some(2.8));
    let momentum = transition.condition("price_momentum").unwrap();
    assert!(momentum.met);
    assert_eq!(momentum.current_value, Some(4.1));

    assert_eq!(instance.state, InstanceState::SignalDetected);
}

#[test]
fn cancellation_beats_entry() {
    let mut instance = instance_in(
        InstanceState::SignalDetected,
        vec![
            all_of(GroupRole::SignalCancellation, vec![cond("rsi", "<", 30.0)]),
            all_of(GroupRole::EntryConditions, vec![cond("volume", ">=", 100.0)]),
        ],
    );

    let outcome = InstanceStateMachine::apply_tick(
        &mut instance,
        snapshot(&[("rsi", 25.0), ("volume", 150.0)]),
        EvaluationOptions::default(),
    );

    let transition = outcome.transition.expect("O1 should fire");
    assert_eq!(transition.to_state, InstanceState::Monitoring);
    assert_eq!(transition.trigger, TransitionTrigger::Group(GroupRole::SignalCancellation));
    assert_eq!(instance.state, InstanceState::Monitoring);
}

#[test]
fn emergency_exit_beats_close_order() {
    let mut instance = instance_in(
        InstanceState::PositionActive,
        vec![
            all_of(GroupRole::EmergencyExit, vec![cond("stop_loss", "<", -5.0)]),
            all_of(GroupRole::CloseOrderDetection, vec![cond("profit_target", ">=", 5.0)]),
        ],
    );

    let outcome = InstanceStateMachine::apply_tick(
        &mut instance,
        snapshot(&[("stop_loss", -8.2), ("profit_target", 5.5)]),
        EvaluationOptions::default(),
    );

    let transition = outcome.transition.expect("E1 should fire");
    assert_eq!(transition.to_state, InstanceState::Exited);
    assert_eq!(transition.trigger, TransitionTrigger::Group(GroupRole::EmergencyExit));
    assert!(transition.emergency);
    assert_eq!(transition.conditions.len(), 1);
    assert_eq!(transition.conditions[0].name(), "stop_loss");
    assert_eq!(instance.state, InstanceState::Exited);
}

#[test]
fn missing_indicator_value_holds_state() {
    let mut instance = instance_in(
        InstanceState::Monitoring,
        vec![all_of(
            GroupRole::SignalDetection,
            vec![cond("market_cap", ">", 10_000_000.0)],
        )],
    );
    let tick = std::sync::Arc::new(
        tripwire::models::IndicatorSnapshot::new("BTC").with_missing("market_cap"),
    );

    let outcome = InstanceStateMachine::apply_tick(&mut instance, tick, EvaluationOptions::default());

    assert!(outcome.transition.is_none());
    assert_eq!(instance.state, InstanceState::Monitoring);
    assert!(instance.error_reason.is_none());

    let evaluation = &instance.last_evaluations[&GroupRole::SignalDetection];
    let result = evaluation.result("market_cap").unwrap();
    assert!(!result.met);
    assert_eq!(result.current_value, None);
}
