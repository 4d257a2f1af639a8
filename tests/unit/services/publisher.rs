use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tripwire::error::PublishError;
use tripwire::models::{EngineEvent, InstanceState};
use tripwire::services::{BroadcastPublisher, NoopPublisher, TransitionPublisher};
use tripwire::strategies::InstanceStateMachine;

use crate::common_fixtures::{instance_in, lifecycle_groups};

fn arm_event() -> EngineEvent {
    let mut instance = instance_in(InstanceState::Inactive, lifecycle_groups());
    InstanceStateMachine::arm(&mut instance).unwrap().into()
}

#[test]
fn publishing_without_subscribers_is_reported() {
    let publisher = BroadcastPublisher::new(8);

    let err = publisher.publish(arm_event()).unwrap_err();

    assert!(matches!(
        err,
        PublishError::NoSubscribers {
            event: "state_change"
        }
    ));
}

#[test]
fn noop_publisher_accepts_everything() {
    assert!(NoopPublisher.publish(arm_event()).is_ok());
}

#[tokio::test]
async fn subscribers_receive_events_in_order() {
    let publisher = BroadcastPublisher::new(8);
    let mut rx = publisher.subscribe();
    assert_eq!(publisher.subscriber_count(), 1);

    let instance = instance_in(InstanceState::Monitoring, lifecycle_groups());
    publisher.publish(arm_event()).unwrap();
    publisher
        .publish(EngineEvent::ConditionUpdate((&instance).into()))
        .unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.kind(), "state_change");
    assert_eq!(second.kind(), "condition_update");
    assert_eq!(second.symbol(), "BTC");
    assert_eq!(second.session_id(), "session-1");
}

#[tokio::test]
async fn slow_subscribers_lose_oldest_events() {
    let publisher = BroadcastPublisher::new(2);
    let mut rx = publisher.subscribe();

    for _ in 0..5 {
        publisher.publish(arm_event()).unwrap();
    }

    assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
    let next: Arc<EngineEvent> = rx.recv().await.unwrap();
    assert_eq!(next.kind(), "state_change");
}

#[test]
fn state_change_serializes_with_type_tag() {
    let json = serde_json::to_value(arm_event()).unwrap();

    assert_eq!(json["type"], "state_change");
    assert_eq!(json["from_state"], "INACTIVE");
    assert_eq!(json["new_state"], "MONITORING");
    assert_eq!(json["trigger"], "ARM");
    assert_eq!(json["emergency"], false);
    assert!(json.get("reason").is_none());
}
