use std::sync::Arc;
use std::time::Duration;

use tripwire::core::Dispatcher;
use tripwire::error::{ConfigurationError, EngineError, TransitionFault};
use tripwire::metrics::Metrics;
use tripwire::models::{EngineEvent, GroupRole, InstanceState, TransitionTrigger};
use tripwire::strategies::EvaluationOptions;

use crate::common_fixtures::{
    all_of, cond, dispatcher_with, lifecycle_groups, range_cond, settle, snapshot_for,
    upsert_request, GatedPublisher, RecordingPublisher,
};

#[tokio::test]
async fn upsert_creates_then_reconfigures() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, metrics) = dispatcher_with(publisher.clone(), 4);

    let created = dispatcher
        .upsert(upsert_request("strat-1", "BTC", lifecycle_groups()))
        .await
        .unwrap();
    assert!(created.created);
    assert_eq!(created.state, InstanceState::Inactive);
    assert!(created.warnings.is_empty());
    assert_eq!(metrics.instances_active.get(), 1);

    let updated = dispatcher
        .upsert(upsert_request(
            "strat-1",
            "BTC",
            vec![all_of(GroupRole::SignalDetection, vec![cond("rsi", "gt", 60.0)])],
        ))
        .await
        .unwrap();
    assert!(!updated.created);
    assert_eq!(dispatcher.len().await, 1);
    assert_eq!(metrics.instances_active.get(), 1);

    let instance = dispatcher.get("strat-1", "BTC").await.unwrap();
    assert_eq!(instance.groups.len(), 1);

    // Every upsert pushes the instance's current condition view.
    let updates = publisher
        .events()
        .iter()
        .filter(|e| matches!(e, EngineEvent::ConditionUpdate(_)))
        .count();
    assert_eq!(updates, 2);
}

#[tokio::test]
async fn upsert_with_arm_starts_monitoring() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, _) = dispatcher_with(publisher.clone(), 4);

    let mut request = upsert_request("strat-1", "BTC", lifecycle_groups());
    request.arm = true;
    let outcome = dispatcher.upsert(request).await.unwrap();

    assert_eq!(outcome.state, InstanceState::Monitoring);
    let changes = publisher.state_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].trigger, TransitionTrigger::Arm);
    assert_eq!(changes[0].from_state, InstanceState::Inactive);
    assert_eq!(changes[0].new_state, InstanceState::Monitoring);
}

#[tokio::test]
async fn invalid_configuration_changes_nothing() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, _) = dispatcher_with(publisher.clone(), 4);
    dispatcher
        .upsert(upsert_request("strat-1", "BTC", lifecycle_groups()))
        .await
        .unwrap();
    publisher.clear();

    let err = dispatcher
        .upsert(upsert_request(
            "strat-1",
            "BTC",
            vec![all_of(
                GroupRole::EntryConditions,
                vec![range_cond("spread", ">", 1.0, 2.0)],
            )],
        ))
        .await
        .unwrap_err();

    match err {
        EngineError::Configuration(ConfigurationError::RangeOperator { field, .. }) => {
            assert_eq!(field, "groups[Z1].conditions[spread].operator");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let instance = dispatcher.get("strat-1", "BTC").await.unwrap();
    assert_eq!(instance.groups.len(), 5);
    assert!(publisher.events().is_empty());

    let missing = dispatcher
        .upsert(upsert_request("", "BTC", lifecycle_groups()))
        .await
        .unwrap_err();
    assert!(matches!(
        missing,
        EngineError::Configuration(ConfigurationError::Empty { ref field }) if field == "strategy_id"
    ));
    assert_eq!(dispatcher.len().await, 1);
}

#[tokio::test]
async fn snapshot_drives_the_matching_instances_only() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, _) = dispatcher_with(publisher.clone(), 4);
    for (strategy, symbol) in [("strat-1", "BTC"), ("strat-2", "ETH")] {
        let mut request = upsert_request(strategy, symbol, lifecycle_groups());
        request.arm = true;
        dispatcher.upsert(request).await.unwrap();
    }
    publisher.clear();

    let scheduled = dispatcher
        .on_snapshot(snapshot_for("BTC", &[("rsi", 80.0)]))
        .await;
    settle(&dispatcher).await;

    assert_eq!(scheduled, 1);
    let btc = dispatcher.get("strat-1", "BTC").await.unwrap();
    let eth = dispatcher.get("strat-2", "ETH").await.unwrap();
    assert_eq!(btc.state, InstanceState::SignalDetected);
    assert_eq!(eth.state, InstanceState::Monitoring);

    let changes = publisher.state_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].strategy_id, "strat-1");
    assert_eq!(changes[0].session_id, "session-1");
    assert_eq!(changes[0].trigger, TransitionTrigger::Group(GroupRole::SignalDetection));
    assert_eq!(changes[0].conditions[0].current_value, Some(80.0));

    assert_eq!(
        dispatcher.on_snapshot(snapshot_for("SOL", &[("rsi", 80.0)])).await,
        0
    );
}

#[tokio::test]
async fn life_cycle_advances_one_rule_per_snapshot() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, _) = dispatcher_with(publisher.clone(), 4);
    let mut request = upsert_request("strat-1", "BTC", lifecycle_groups());
    request.arm = true;
    dispatcher.upsert(request).await.unwrap();

    for values in [
        vec![("rsi", 80.0), ("volume", 500.0), ("pnl", 10.0)],
        vec![("rsi", 50.0), ("volume", 500.0), ("pnl", 10.0)],
        vec![("rsi", 50.0), ("volume", 500.0), ("pnl", 10.0)],
    ] {
        dispatcher.on_snapshot(snapshot_for("BTC", &values)).await;
        settle(&dispatcher).await;
    }

    let triggers: Vec<TransitionTrigger> = publisher
        .state_changes()
        .into_iter()
        .map(|change| change.trigger)
        .collect();
    assert_eq!(
        triggers,
        vec![
            TransitionTrigger::Arm,
            TransitionTrigger::Group(GroupRole::SignalDetection),
            TransitionTrigger::Group(GroupRole::EntryConditions),
            TransitionTrigger::Group(GroupRole::CloseOrderDetection),
        ]
    );
    let instance = dispatcher.get("strat-1", "BTC").await.unwrap();
    assert_eq!(instance.state, InstanceState::Exited);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bursts_for_one_instance_coalesce_to_the_latest_snapshot() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, metrics) = dispatcher_with(publisher.clone(), 1);
    dispatcher
        .upsert(upsert_request(
            "strat-1",
            "BTC",
            vec![all_of(GroupRole::SignalDetection, vec![cond("tick", ">", 1000.0)])],
        ))
        .await
        .unwrap();

    let total: u64 = 200;
    for tick in 0..total {
        dispatcher
            .on_snapshot(snapshot_for("BTC", &[("tick", tick as f64)]))
            .await;
    }
    settle(&dispatcher).await;

    let evaluated = metrics.evaluations_total.get();
    let coalesced = metrics.coalesced_snapshots_total.get();
    assert!(evaluated >= 1);
    assert_eq!(evaluated + coalesced, total);

    let instance = dispatcher.get("strat-1", "BTC").await.unwrap();
    let last = instance.last_snapshot.expect("evaluated");
    assert_eq!(last.value("tick"), Some((total - 1) as f64));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_instances_evaluate_in_parallel() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, metrics) = dispatcher_with(publisher.clone(), 3);
    for n in 0..20 {
        let mut request = upsert_request(&format!("strat-{n:02}"), "BTC", lifecycle_groups());
        request.arm = true;
        dispatcher.upsert(request).await.unwrap();
    }

    dispatcher
        .on_snapshot(snapshot_for("BTC", &[("rsi", 90.0)]))
        .await;
    settle(&dispatcher).await;

    assert_eq!(metrics.evaluations_total.get(), 20);
    let instances = dispatcher.list(Some("BTC")).await;
    assert_eq!(instances.len(), 20);
    assert!(instances
        .iter()
        .all(|i| i.state == InstanceState::SignalDetected));

    let detected = publisher
        .state_changes()
        .into_iter()
        .filter(|c| c.trigger == TransitionTrigger::Group(GroupRole::SignalDetection))
        .count();
    assert_eq!(detected, 20);
}

#[tokio::test]
async fn arming_re_evaluates_the_latest_snapshot() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, _) = dispatcher_with(publisher.clone(), 4);
    dispatcher
        .upsert(upsert_request("strat-1", "BTC", lifecycle_groups()))
        .await
        .unwrap();

    dispatcher
        .on_snapshot(snapshot_for("BTC", &[("rsi", 85.0)]))
        .await;
    settle(&dispatcher).await;
    assert_eq!(
        dispatcher.get("strat-1", "BTC").await.unwrap().state,
        InstanceState::Inactive
    );

    let armed = dispatcher.arm("strat-1", "BTC").await.unwrap();
    assert_eq!(armed.to_state, InstanceState::Monitoring);
    settle(&dispatcher).await;

    assert_eq!(
        dispatcher.get("strat-1", "BTC").await.unwrap().state,
        InstanceState::SignalDetected
    );
    assert!(matches!(
        dispatcher.arm("strat-1", "BTC").await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn upsert_reset_returns_to_inactive() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, _) = dispatcher_with(publisher.clone(), 4);
    let mut request = upsert_request("strat-1", "BTC", lifecycle_groups());
    request.arm = true;
    dispatcher.upsert(request).await.unwrap();
    dispatcher
        .on_snapshot(snapshot_for("BTC", &[("rsi", 80.0)]))
        .await;
    settle(&dispatcher).await;

    let mut request = upsert_request("strat-1", "BTC", lifecycle_groups());
    request.reset = true;
    let outcome = dispatcher.upsert(request).await.unwrap();
    settle(&dispatcher).await;

    assert_eq!(outcome.state, InstanceState::Inactive);
    let last = publisher.state_changes().pop().unwrap();
    assert_eq!(last.trigger, TransitionTrigger::Reset);
    assert_eq!(last.from_state, InstanceState::SignalDetected);
}

#[tokio::test]
async fn removed_instances_receive_nothing_further() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, metrics) = dispatcher_with(publisher.clone(), 4);
    let mut request = upsert_request("strat-1", "BTC", lifecycle_groups());
    request.arm = true;
    dispatcher.upsert(request).await.unwrap();

    dispatcher.remove("strat-1", "BTC").await.unwrap();
    publisher.clear();

    let scheduled = dispatcher
        .on_snapshot(snapshot_for("BTC", &[("rsi", 80.0)]))
        .await;
    settle(&dispatcher).await;

    assert_eq!(scheduled, 0);
    assert!(publisher.events().is_empty());
    assert!(dispatcher.get("strat-1", "BTC").await.is_none());
    assert_eq!(metrics.instances_active.get(), 0);
    assert_eq!(
        dispatcher.remove("strat-1", "BTC").await,
        Err(EngineError::not_found("strat-1", "BTC"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removal_discards_an_evaluation_waiting_for_a_worker() {
    let publisher = Arc::new(GatedPublisher::new("held"));
    let metrics = Arc::new(Metrics::new().unwrap());
    let dispatcher = Dispatcher::new(publisher.clone(), metrics.clone(), 1, EvaluationOptions::default());
    for (strategy, symbol) in [("held", "ETH"), ("strat-1", "BTC")] {
        let mut request = upsert_request(strategy, symbol, lifecycle_groups());
        request.arm = true;
        dispatcher.upsert(request).await.unwrap();
    }
    publisher.close();

    // The only worker stops inside the ETH transition publish.
    dispatcher.on_snapshot(snapshot_for("ETH", &[("rsi", 80.0)])).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !publisher.is_holding() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker never reached the publisher");

    assert_eq!(dispatcher.on_snapshot(snapshot_for("BTC", &[("rsi", 80.0)])).await, 1);
    let before = publisher.recorded.events_for("strat-1");
    dispatcher.remove("strat-1", "BTC").await.unwrap();

    publisher.open();
    settle(&dispatcher).await;

    assert_eq!(publisher.recorded.events_for("strat-1"), before);
    assert_eq!(metrics.discarded_evaluations_total.get(), 1);
    assert_eq!(metrics.evaluations_total.get(), 1);
    assert_eq!(publisher.recorded.state_changes().last().unwrap().strategy_id, "held");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nothing_is_published_after_remove_returns() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, metrics) = dispatcher_with(publisher.clone(), 4);

    for round in 0..50 {
        let strategy = format!("race-{round}");
        let mut request = upsert_request(&strategy, "RACE", lifecycle_groups());
        request.arm = true;
        dispatcher.upsert(request).await.unwrap();

        let feeder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    let rsi = if i % 2 == 0 { 80.0 } else { 20.0 };
                    dispatcher.on_snapshot(snapshot_for("RACE", &[("rsi", rsi)])).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        tokio::task::yield_now().await;
        dispatcher.remove(&strategy, "RACE").await.unwrap();
        let at_removal = publisher.events_for(&strategy);

        feeder.await.unwrap();
        settle(&dispatcher).await;
        assert_eq!(
            publisher.events_for(&strategy),
            at_removal,
            "round {round} published after remove returned"
        );
    }

    assert!(dispatcher.is_empty().await);
    assert_eq!(metrics.instances_active.get(), 0);
}

#[tokio::test]
async fn ingested_snapshots_store_non_finite_values_as_missing() {
    let (dispatcher, _) = dispatcher_with(Arc::new(RecordingPublisher::default()), 1);
    let mut raw = snapshot_for("BTC", &[("rsi", 50.0)]);
    raw.values.insert("junk".to_string(), Some(f64::INFINITY));

    dispatcher.on_snapshot(raw).await;

    let latest = dispatcher.latest_snapshot("BTC").await.unwrap();
    assert_eq!(latest.values.get("junk"), Some(&None));
    assert_eq!(latest.value("rsi"), Some(50.0));
    assert_eq!(*latest, (*latest).clone());
}

#[tokio::test]
async fn queries_filter_by_symbol_and_session() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, _) = dispatcher_with(publisher, 4);
    for (session, strategy, symbol) in [
        ("session-1", "beta", "BTC"),
        ("session-1", "alpha", "BTC"),
        ("session-1", "alpha", "ETH"),
        ("session-2", "gamma", "BTC"),
    ] {
        let mut request = upsert_request(strategy, symbol, lifecycle_groups());
        request.session_id = session.to_string();
        request.arm = true;
        dispatcher.upsert(request).await.unwrap();
    }

    let all = dispatcher.list(None).await;
    let keys: Vec<String> = all.iter().map(|i| i.key().to_string()).collect();
    assert_eq!(keys, vec!["alpha/BTC", "alpha/ETH", "beta/BTC", "gamma/BTC"]);
    assert_eq!(dispatcher.list(Some("ETH")).await.len(), 1);

    let session = dispatcher.session_conditions("session-1", Some("BTC")).await;
    assert_eq!(session.session_id, "session-1");
    let strategies: Vec<&str> = session
        .instances
        .iter()
        .map(|i| i.strategy_id.as_str())
        .collect();
    assert_eq!(strategies, vec!["alpha", "beta"]);

    let view = &session.instances[0];
    assert_eq!(view.state, InstanceState::Monitoring);
    assert_eq!(view.groups.len(), 5);
    for group in &view.groups {
        assert_eq!(group.is_relevant, group.id == GroupRole::SignalDetection);
    }

    assert!(dispatcher
        .session_conditions("session-3", None)
        .await
        .instances
        .is_empty());
}

#[tokio::test]
async fn fail_then_reap_terminal_instances() {
    let publisher = Arc::new(RecordingPublisher::default());
    let (dispatcher, _) = dispatcher_with(publisher.clone(), 4);
    for strategy in ["keep", "broken"] {
        let mut request = upsert_request(strategy, "BTC", lifecycle_groups());
        request.arm = true;
        dispatcher.upsert(request).await.unwrap();
    }

    let failed = dispatcher.fail("broken", "BTC", "indicator feed lost").await.unwrap();
    assert_eq!(failed.to_state, InstanceState::Error);
    assert_eq!(failed.reason.as_deref(), Some("indicator feed lost"));
    assert_eq!(
        dispatcher.fail("broken", "BTC", "again").await,
        Err(EngineError::Fault(TransitionFault::Terminal {
            state: InstanceState::Error
        }))
    );

    assert_eq!(dispatcher.reap_terminal(Duration::from_secs(3600)).await, 0);
    assert_eq!(dispatcher.reap_terminal(Duration::ZERO).await, 1);
    assert!(dispatcher.get("broken", "BTC").await.is_none());
    assert!(dispatcher.get("keep", "BTC").await.is_some());
}
