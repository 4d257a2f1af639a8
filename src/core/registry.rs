//! Instance storage, indexed by symbol so a snapshot reaches only the
//! instances that trade it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::models::instance::{InstanceKey, StrategyInstance};
use crate::models::snapshot::IndicatorSnapshot;

/// Per-instance synchronisation state.
///
/// `eval_lock` serialises everything that mutates the instance (ticks,
/// arm/reset, reconfiguration) so emitted transitions follow decision order.
/// `instance` is only write-locked for the final commit, readers always see
/// a consistent copy.
pub struct InstanceSlot {
    key: InstanceKey,
    pub(crate) instance: RwLock<StrategyInstance>,
    pub(crate) eval_lock: Mutex<()>,
    pending: Mutex<Option<Arc<IndicatorSnapshot>>>,
    scheduled: AtomicBool,
    removed: AtomicBool,
}

impl InstanceSlot {
    pub fn new(instance: StrategyInstance) -> Self {
        Self {
            key: instance.key(),
            instance: RwLock::new(instance),
            eval_lock: Mutex::new(()),
            pending: Mutex::new(None),
            scheduled: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub async fn snapshot(&self) -> StrategyInstance {
        self.instance.read().await.clone()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Replace the pending snapshot. Returns true if an unevaluated one was dropped.
    pub(crate) async fn set_pending(&self, snapshot: Arc<IndicatorSnapshot>) -> bool {
        self.pending.lock().await.replace(snapshot).is_some()
    }

    pub(crate) async fn take_pending(&self) -> Option<Arc<IndicatorSnapshot>> {
        self.pending.lock().await.take()
    }

    pub(crate) async fn has_pending(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    /// Claim the right to drain this slot. Only one drainer exists at a time.
    pub(crate) fn try_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn finish_schedule(&self) {
        self.scheduled.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub struct InstanceRegistry {
    slots: RwLock<HashMap<String, HashMap<String, Arc<InstanceSlot>>>>,
    latest: RwLock<HashMap<String, Arc<IndicatorSnapshot>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, strategy_id: &str, symbol: &str) -> Option<Arc<InstanceSlot>> {
        let slots = self.slots.read().await;
        slots
            .get(symbol)
            .and_then(|by_strategy| by_strategy.get(strategy_id))
            .cloned()
    }

    /// Return the slot for `key`, creating it with `create` when absent.
    /// The boolean is true when a new slot was inserted.
    pub async fn get_or_insert_with<F>(&self, key: &InstanceKey, create: F) -> (Arc<InstanceSlot>, bool)
    where
        F: FnOnce() -> StrategyInstance,
    {
        let mut slots = self.slots.write().await;
        let by_strategy = slots.entry(key.symbol.clone()).or_default();
        if let Some(existing) = by_strategy.get(&key.strategy_id) {
            return (existing.clone(), false);
        }
        let slot = Arc::new(InstanceSlot::new(create()));
        by_strategy.insert(key.strategy_id.clone(), slot.clone());
        (slot, true)
    }

    /// Detach a slot. It is flagged as removed before the map lock is released.
    pub async fn remove(&self, strategy_id: &str, symbol: &str) -> Option<Arc<InstanceSlot>> {
        let mut slots = self.slots.write().await;
        let by_strategy = slots.get_mut(symbol)?;
        let slot = by_strategy.remove(strategy_id)?;
        slot.mark_removed();
        if by_strategy.is_empty() {
            slots.remove(symbol);
        }
        Some(slot)
    }

    pub async fn slots_for_symbol(&self, symbol: &str) -> Vec<Arc<InstanceSlot>> {
        let slots = self.slots.read().await;
        slots
            .get(symbol)
            .map(|by_strategy| by_strategy.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn all_slots(&self) -> Vec<Arc<InstanceSlot>> {
        let slots = self.slots.read().await;
        slots
            .values()
            .flat_map(|by_strategy| by_strategy.values().cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        let slots = self.slots.read().await;
        slots.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn set_latest(&self, snapshot: Arc<IndicatorSnapshot>) {
        let mut latest = self.latest.write().await;
        latest.insert(snapshot.symbol.clone(), snapshot);
    }

    pub async fn latest(&self, symbol: &str) -> Option<Arc<IndicatorSnapshot>> {
        let latest = self.latest.read().await;
        latest.get(symbol).cloned()
    }
}
