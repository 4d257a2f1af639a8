//! Core application primitives (registry, dispatcher, HTTP, scheduling)

pub mod dispatcher;
pub mod http;
pub mod registry;
pub mod scheduler;

pub use dispatcher::{Dispatcher, UpsertOutcome, UpsertRequest};
pub use http::{create_router, start_server, AppState, HealthStatus};
pub use registry::{InstanceRegistry, InstanceSlot};
pub use scheduler::{cron_expression, ReaperScheduler};
