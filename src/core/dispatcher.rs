//! Routes snapshots to instances and runs evaluations on a bounded worker
//! pool. Each instance is evaluated by at most one task at a time; snapshots
//! that arrive meanwhile collapse into a single pending one.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::core::registry::{InstanceRegistry, InstanceSlot};
use crate::error::{ConfigurationError, EngineError, PublishError};
use crate::metrics::Metrics;
use crate::models::condition::ConfigWarning;
use crate::models::events::{ConditionUpdate, EngineEvent};
use crate::models::group::{build_groups, GroupSpec};
use crate::models::instance::{
    InstanceKey, InstanceState, SessionConditions, StateTransition, StrategyInstance,
    TransitionTrigger,
};
use crate::models::snapshot::IndicatorSnapshot;
use crate::services::publisher::TransitionPublisher;
use crate::strategies::machine::{EvaluationOptions, InstanceStateMachine};

pub const DEFAULT_SESSION: &str = "default";

fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}

/// Create or reconfigure one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertRequest {
    #[serde(default = "default_session")]
    pub session_id: String,
    pub strategy_id: String,
    pub symbol: String,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
    /// Return an existing instance to INACTIVE.
    #[serde(default)]
    pub reset: bool,
    /// Arm the instance if it ends up INACTIVE.
    #[serde(default)]
    pub arm: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub created: bool,
    pub state: InstanceState,
    pub warnings: Vec<ConfigWarning>,
}

pub struct Dispatcher {
    registry: InstanceRegistry,
    publisher: Arc<dyn TransitionPublisher>,
    metrics: Arc<Metrics>,
    workers: Semaphore,
    options: EvaluationOptions,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Dispatcher {
    pub fn new(
        publisher: Arc<dyn TransitionPublisher>,
        metrics: Arc<Metrics>,
        max_concurrent_evaluations: usize,
        options: EvaluationOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: InstanceRegistry::new(),
            publisher,
            metrics,
            workers: Semaphore::new(max_concurrent_evaluations.max(1)),
            options,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    pub fn options(&self) -> EvaluationOptions {
        self.options
    }

    /// Validate and apply an instance configuration. On error nothing changes.
    pub async fn upsert(self: &Arc<Self>, request: UpsertRequest) -> Result<UpsertOutcome, EngineError> {
        if request.strategy_id.trim().is_empty() {
            return Err(ConfigurationError::Empty {
                field: "strategy_id".to_string(),
            }
            .into());
        }
        if request.symbol.trim().is_empty() {
            return Err(ConfigurationError::Empty {
                field: "symbol".to_string(),
            }
            .into());
        }
        let (groups, warnings) = build_groups(request.groups)?;

        let key = InstanceKey::new(request.strategy_id.clone(), request.symbol.clone());
        let (slot, created) = self
            .registry
            .get_or_insert_with(&key, || {
                StrategyInstance::new(
                    request.session_id.clone(),
                    request.strategy_id.clone(),
                    request.symbol.clone(),
                    groups.clone(),
                )
            })
            .await;

        let state = {
            let _guard = slot.eval_lock.lock().await;
            let mut instance = slot.instance.write().await;
            if created {
                self.metrics.instances_active.inc();
                info!(
                    strategy_id = %key.strategy_id,
                    symbol = %key.symbol,
                    session_id = %request.session_id,
                    groups = instance.groups.len(),
                    "Instance registered"
                );
            } else {
                instance.groups = groups;
                instance.session_id = request.session_id.clone();
                instance.last_evaluations.clear();
                instance.last_snapshot = None;
                info!(
                    strategy_id = %key.strategy_id,
                    symbol = %key.symbol,
                    state = %instance.state,
                    "Instance reconfigured"
                );
                if request.reset {
                    let transition = InstanceStateMachine::reset(&mut instance);
                    self.publish_transition(transition);
                }
            }

            if request.arm && instance.state == InstanceState::Inactive {
                let transition = InstanceStateMachine::arm(&mut instance)?;
                self.publish_transition(transition);
            }
            self.emit(EngineEvent::ConditionUpdate(ConditionUpdate::from(&*instance)));
            instance.state
        };

        if !created || request.arm {
            self.schedule_latest(slot).await;
        }

        Ok(UpsertOutcome {
            created,
            state,
            warnings,
        })
    }

    /// Drop an instance. An evaluation already running for it is discarded.
    pub async fn remove(&self, strategy_id: &str, symbol: &str) -> Result<(), EngineError> {
        let slot = self
            .registry
            .remove(strategy_id, symbol)
            .await
            .ok_or_else(|| EngineError::not_found(strategy_id, symbol))?;

        // Wait out an in-flight evaluation so nothing is published after we return.
        let _guard = slot.eval_lock.lock().await;
        self.metrics.instances_active.dec();
        info!(strategy_id = %strategy_id, symbol = %symbol, "Instance removed");
        Ok(())
    }

    /// Record the latest snapshot for its symbol and schedule every instance
    /// trading it. Returns the number of instances scheduled.
    pub async fn on_snapshot(self: &Arc<Self>, snapshot: IndicatorSnapshot) -> usize {
        let snapshot = Arc::new(snapshot.normalized());
        self.registry.set_latest(snapshot.clone()).await;

        let slots = self.registry.slots_for_symbol(&snapshot.symbol).await;
        debug!(
            symbol = %snapshot.symbol,
            instances = slots.len(),
            "Dispatching snapshot"
        );
        let count = slots.len();
        for slot in slots {
            self.schedule(slot, snapshot.clone()).await;
        }
        count
    }

    pub async fn get(&self, strategy_id: &str, symbol: &str) -> Option<StrategyInstance> {
        match self.registry.get(strategy_id, symbol).await {
            Some(slot) => Some(slot.snapshot().await),
            None => None,
        }
    }

    /// All instances, optionally limited to one symbol, ordered by strategy then symbol.
    pub async fn list(&self, symbol: Option<&str>) -> Vec<StrategyInstance> {
        let slots = match symbol {
            Some(symbol) => self.registry.slots_for_symbol(symbol).await,
            None => self.registry.all_slots().await,
        };
        let mut instances = Vec::with_capacity(slots.len());
        for slot in slots {
            instances.push(slot.snapshot().await);
        }
        instances.sort_by(|a, b| a.key().cmp(&b.key()));
        instances
    }

    /// Payload for the session query endpoint.
    pub async fn session_conditions(&self, session_id: &str, symbol: Option<&str>) -> SessionConditions {
        let instances = self
            .list(symbol)
            .await
            .into_iter()
            .filter(|instance| instance.session_id == session_id)
            .map(|instance| instance.view())
            .collect();
        SessionConditions {
            session_id: session_id.to_string(),
            instances,
        }
    }

    pub async fn arm(self: &Arc<Self>, strategy_id: &str, symbol: &str) -> Result<StateTransition, EngineError> {
        let slot = self.slot(strategy_id, symbol).await?;
        let transition = {
            let _guard = slot.eval_lock.lock().await;
            let mut instance = slot.instance.write().await;
            let transition = InstanceStateMachine::arm(&mut instance)?;
            self.publish_transition(transition.clone());
            self.emit(EngineEvent::ConditionUpdate(ConditionUpdate::from(&*instance)));
            transition
        };
        self.schedule_latest(slot).await;
        Ok(transition)
    }

    pub async fn reset(&self, strategy_id: &str, symbol: &str) -> Result<StateTransition, EngineError> {
        let slot = self.slot(strategy_id, symbol).await?;
        let _guard = slot.eval_lock.lock().await;
        let mut instance = slot.instance.write().await;
        let transition = InstanceStateMachine::reset(&mut instance);
        self.publish_transition(transition.clone());
        self.emit(EngineEvent::ConditionUpdate(ConditionUpdate::from(&*instance)));
        Ok(transition)
    }

    /// Force an instance into ERROR with an operator-supplied reason.
    pub async fn fail(
        &self,
        strategy_id: &str,
        symbol: &str,
        reason: &str,
    ) -> Result<StateTransition, EngineError> {
        let slot = self.slot(strategy_id, symbol).await?;
        let _guard = slot.eval_lock.lock().await;
        let mut instance = slot.instance.write().await;
        let transition = InstanceStateMachine::fail(&mut instance, reason)?;
        self.publish_transition(transition.clone());
        Ok(transition)
    }

    /// Remove terminal instances that have not changed state for `retention`.
    pub async fn reap_terminal(&self, retention: std::time::Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = chrono::Utc::now() - retention;

        let mut expired = Vec::new();
        for slot in self.registry.all_slots().await {
            let instance = slot.instance.read().await;
            if instance.state.is_terminal() && instance.state_changed_at <= cutoff {
                expired.push(slot.key().clone());
            }
        }

        let mut reaped = 0;
        for key in expired {
            if self.remove(&key.strategy_id, &key.symbol).await.is_ok() {
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!(reaped = reaped, "Reaped terminal instances");
        }
        reaped
    }

    pub async fn latest_snapshot(&self, symbol: &str) -> Option<Arc<IndicatorSnapshot>> {
        self.registry.latest(symbol).await
    }

    pub async fn len(&self) -> usize {
        self.registry.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.is_empty().await
    }

    /// Resolve once no evaluation is queued or running.
    pub async fn settle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn slot(&self, strategy_id: &str, symbol: &str) -> Result<Arc<InstanceSlot>, EngineError> {
        self.registry
            .get(strategy_id, symbol)
            .await
            .ok_or_else(|| EngineError::not_found(strategy_id, symbol))
    }

    async fn schedule_latest(self: &Arc<Self>, slot: Arc<InstanceSlot>) {
        if let Some(snapshot) = self.registry.latest(&slot.key().symbol).await {
            self.schedule(slot, snapshot).await;
        }
    }

    async fn schedule(self: &Arc<Self>, slot: Arc<InstanceSlot>, snapshot: Arc<IndicatorSnapshot>) {
        if slot.set_pending(snapshot).await {
            self.metrics.coalesced_snapshots_total.inc();
            debug!(instance = %slot.key(), "Coalesced pending snapshot");
        }
        if slot.try_schedule() {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                dispatcher.drain(slot).await;
            });
        }
    }

    async fn drain(self: Arc<Self>, slot: Arc<InstanceSlot>) {
        {
            let _permit = self.workers.acquire().await.ok();
            loop {
                match slot.take_pending().await {
                    Some(snapshot) => self.evaluate(&slot, snapshot).await,
                    None => {
                        slot.finish_schedule();
                        // A snapshot may have landed between take and release.
                        if slot.has_pending().await && slot.try_schedule() {
                            continue;
                        }
                        break;
                    }
                }
            }
        }

        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn evaluate(&self, slot: &InstanceSlot, snapshot: Arc<IndicatorSnapshot>) {
        let _guard = slot.eval_lock.lock().await;
        if slot.is_removed() {
            self.metrics.discarded_evaluations_total.inc();
            return;
        }

        let started = Instant::now();
        let mut working = slot.snapshot().await;
        let outcome = InstanceStateMachine::apply_tick(&mut working, snapshot, self.options);
        self.metrics.evaluations_total.inc();
        self.metrics
            .evaluation_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        if slot.is_removed() {
            debug!(instance = %slot.key(), "Instance removed during evaluation, discarding result");
            self.metrics.discarded_evaluations_total.inc();
            return;
        }

        *slot.instance.write().await = working;
        if let Some(transition) = outcome.transition {
            if transition.trigger == TransitionTrigger::Fault {
                self.metrics.evaluation_faults_total.inc();
            }
            self.publish_transition(transition);
        }
        if let Some(progress) = outcome.progress {
            self.emit(progress.into());
        }
    }

    fn publish_transition(&self, transition: StateTransition) {
        self.metrics
            .transitions_total
            .with_label_values(&[transition.trigger.as_str()])
            .inc();
        self.emit(transition.into());
    }

    fn emit(&self, event: EngineEvent) {
        let kind = event.kind();
        if let Err(e) = self.publisher.publish(event) {
            self.metrics.publish_failures_total.inc();
            match e {
                PublishError::NoSubscribers { .. } => {
                    debug!(event = kind, "No subscribers for event");
                }
                _ => warn!(event = kind, error = %e, "Failed to publish event"),
            }
        }
    }
}
