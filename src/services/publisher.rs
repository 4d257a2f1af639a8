//! Hand-off point between the engine and its transports

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::PublishError;
use crate::models::events::EngineEvent;

/// Receives every transition and progress event. Implementations must
/// return promptly; evaluation calls this inline.
pub trait TransitionPublisher: Send + Sync {
    fn publish(&self, event: EngineEvent) -> Result<(), PublishError>;
}

/// Bounded fan-out over a broadcast channel. A slow subscriber loses the
/// oldest events instead of stalling the publisher.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Arc<EngineEvent>>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EngineEvent>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl TransitionPublisher for BroadcastPublisher {
    fn publish(&self, event: EngineEvent) -> Result<(), PublishError> {
        let kind = event.kind();
        self.tx
            .send(Arc::new(event))
            .map(|_| ())
            .map_err(|_| PublishError::NoSubscribers { event: kind })
    }
}

/// Discards everything. Used when no transport is attached.
pub struct NoopPublisher;

impl TransitionPublisher for NoopPublisher {
    fn publish(&self, _event: EngineEvent) -> Result<(), PublishError> {
        Ok(())
    }
}
