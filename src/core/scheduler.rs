//! Cron-based scheduler that reaps terminal instances

use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::dispatcher::Dispatcher;

/// Convert an interval into a six-field cron expression
/// (second minute hour day month weekday).
///
/// A `*/n` step restarts at the top of its field, so only intervals that
/// evenly divide a minute, an hour or a day keep a constant cadence. Other
/// intervals return `None`.
pub fn cron_expression(interval_seconds: u64) -> Option<String> {
    let divides = |unit: u64, step: u64| step > 0 && step < unit && unit % step == 0;
    match interval_seconds {
        s if divides(60, s) => Some(format!("*/{} * * * * *", s)),
        s if s % 60 == 0 && divides(60, s / 60) => Some(format!("0 */{} * * * *", s / 60)),
        s if s % 3_600 == 0 && divides(24, s / 3_600) => Some(format!("0 0 */{} * * *", s / 3_600)),
        86_400 => Some("0 0 0 * * *".to_string()),
        _ => None,
    }
}

/// Periodically removes EXITED and ERROR instances older than the retention window
pub struct ReaperScheduler {
    dispatcher: Arc<Dispatcher>,
    retention: Duration,
    schedule: Schedule,
    handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl ReaperScheduler {
    /// Create a new reaper
    ///
    /// # Arguments
    /// * `dispatcher` - Engine whose instances are reaped
    /// * `interval_seconds` - How often to sweep (0 = disabled)
    /// * `retention` - How long a terminal instance stays queryable
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        interval_seconds: u64,
        retention: Duration,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        if interval_seconds == 0 {
            return Err("Reaper disabled: interval_seconds is 0".into());
        }

        let cron_expr = cron_expression(interval_seconds).ok_or_else(|| {
            format!(
                "Unsupported reaper interval {}s: it must evenly divide a minute, an hour or a day",
                interval_seconds
            )
        })?;
        let schedule = Schedule::from_str(&cron_expr).map_err(|e| {
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid cron expression '{}': {}", cron_expr, e),
            )) as Box<dyn std::error::Error + Send + Sync>
        })?;

        info!(
            interval = interval_seconds,
            cron = %cron_expr,
            retention_secs = retention.as_secs(),
            "ReaperScheduler: created"
        );

        Ok(Self {
            dispatcher,
            retention,
            schedule,
            handle: Arc::new(RwLock::new(None)),
        })
    }

    /// Start the reaper
    pub async fn start(&self) {
        let dispatcher = self.dispatcher.clone();
        let schedule = self.schedule.clone();
        let retention = self.retention;

        let handle = tokio::spawn(async move {
            info!("ReaperScheduler: started, waiting for cron schedule...");
            loop {
                let mut upcoming = schedule.upcoming(chrono::Utc);
                if let Some(next_tick) = upcoming.next() {
                    let now = chrono::Utc::now();
                    if next_tick > now {
                        let duration = (next_tick - now).to_std().unwrap_or_default();
                        tokio::time::sleep(duration).await;
                    }
                } else {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    continue;
                }

                let reaped = dispatcher.reap_terminal(retention).await;
                debug!(reaped = reaped, "ReaperScheduler: cron tick");
            }
        });

        let mut h = self.handle.write().await;
        if let Some(previous) = h.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the reaper
    pub async fn stop(&self) {
        let mut handle = self.handle.write().await;
        if let Some(h) = handle.take() {
            h.abort();
            info!("ReaperScheduler: stopped");
        }
    }

    /// Check if the reaper is running
    pub async fn is_running(&self) -> bool {
        let handle = self.handle.read().await;
        handle.is_some()
    }
}
