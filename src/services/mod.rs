//! Transports around the engine: snapshot ingress, event publishing and
//! the push channel.

pub mod feed;
pub mod publisher;
pub mod websocket;

pub use feed::{SnapshotFeed, SnapshotSender};
pub use publisher::{BroadcastPublisher, NoopPublisher, TransitionPublisher};
pub use websocket::{PushServer, PushServerConfig};
