//! Bounded ingress queue between the indicator provider and the dispatcher

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use crate::core::dispatcher::Dispatcher;
use crate::error::FeedError;
use crate::models::snapshot::IndicatorSnapshot;

/// Cloneable producer handle. Never waits: a full queue is reported back.
#[derive(Clone)]
pub struct SnapshotSender {
    tx: mpsc::Sender<IndicatorSnapshot>,
}

impl SnapshotSender {
    pub fn submit(&self, snapshot: IndicatorSnapshot) -> Result<(), FeedError> {
        self.tx.try_send(snapshot).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FeedError::Full,
            mpsc::error::TrySendError::Closed(_) => FeedError::Closed,
        })
    }
}

pub struct SnapshotFeed {
    dispatcher: Arc<Dispatcher>,
    tx: mpsc::Sender<IndicatorSnapshot>,
    rx: Arc<Mutex<mpsc::Receiver<IndicatorSnapshot>>>,
    handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl SnapshotFeed {
    pub fn new(dispatcher: Arc<Dispatcher>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            dispatcher,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn sender(&self) -> SnapshotSender {
        SnapshotSender {
            tx: self.tx.clone(),
        }
    }

    /// Start forwarding queued snapshots to the dispatcher
    pub async fn start(&self) {
        let mut handle = self.handle.write().await;
        if handle.is_some() {
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let rx = self.rx.clone();
        *handle = Some(tokio::spawn(async move {
            let mut rx = rx.lock().await;
            info!("Snapshot feed: started");
            while let Some(snapshot) = rx.recv().await {
                let symbol = snapshot.symbol.clone();
                let scheduled = dispatcher.on_snapshot(snapshot).await;
                debug!(symbol = %symbol, scheduled = scheduled, "Snapshot feed: dispatched");
            }
        }));
    }

    /// Stop the snapshot feed. Queued snapshots stay queued until restart.
    pub async fn stop(&self) {
        let mut handle = self.handle.write().await;
        if let Some(h) = handle.take() {
            h.abort();
            info!("Snapshot feed: stopped");
        }
    }

    /// Check if the feed is running
    pub async fn is_running(&self) -> bool {
        let handle = self.handle.read().await;
        handle.is_some()
    }
}
