//! Priority-ordered asynchronous event dispatch.
//!
//! Publishing appends to a queue kept sorted by descending priority (stable
//! within a priority) and makes sure a single drain task is running. The
//! drain task pops one event at a time and delivers it to every enabled
//! handler registered for its type, highest handler priority first. Each
//! delivery runs on its own task under a timeout and behind that handler's
//! circuit breaker. A failed delivery is retried for the failing handler only,
//! after exponential backoff, re-entering the queue at the front of its
//! priority tier; once the attempt budget is spent the event is dead-lettered.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::time::Instant;

use accord_core::config::BusConfig;
use accord_core::health::{ComponentHealth, HealthStatus};

use crate::backoff::Backoff;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::error::{BusError, HandlerError};
use crate::event::{topics, EnhancedEvent, EventMetadata, Priority, PublishOptions};
use crate::handler::{
    panic_message, EventHandler, HandlerId, HandlerInfo, HandlerOptions, Registration,
};

/// An event that exhausted its retry or age budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event: EnhancedEvent,
    pub reason: String,
    /// The handler whose failures exhausted the budget, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<HandlerId>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
    pub timed_out: u64,
    pub expired: u64,
    pub skipped_by_breaker: u64,
    pub unhandled: u64,
    pub dead_lettered: u64,
    pub replayed: u64,
    pub queued: usize,
    pub handlers: usize,
}

struct Queued {
    event: EnhancedEvent,
    /// Monotonic publish time. Retries keep it, so an event's age counts
    /// from its first publication.
    published_at: Instant,
    /// Set on retries: deliver to this handler only.
    only: Option<HandlerId>,
}

impl Queued {
    fn new(event: EnhancedEvent) -> Self {
        Self {
            event,
            published_at: Instant::now(),
            only: None,
        }
    }

    fn priority(&self) -> Priority {
        self.event.metadata.priority
    }
}

struct Target {
    id: HandlerId,
    handler: Arc<dyn EventHandler>,
    timeout: Duration,
    retries: u32,
}

#[derive(Default)]
struct BusState {
    next_handler_id: u64,
    handlers: BTreeMap<HandlerId, Registration>,
    queue: VecDeque<Queued>,
    draining: bool,
    pending_retries: usize,
    dead_letters: VecDeque<DeadLetter>,
    stats: BusStats,
}

impl BusState {
    /// Insert by descending priority. `front_of_tier` places the event ahead
    /// of others with the same priority; otherwise behind them.
    /// Returns `true` if the caller must start the drain task.
    fn enqueue(&mut self, queued: Queued, front_of_tier: bool) -> bool {
        let priority = queued.priority();
        let position = self
            .queue
            .iter()
            .position(|q| {
                if front_of_tier {
                    q.priority() <= priority
                } else {
                    q.priority() < priority
                }
            })
            .unwrap_or(self.queue.len());
        self.queue.insert(position, queued);
        if self.draining {
            false
        } else {
            self.draining = true;
            true
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && !self.draining && self.pending_retries == 0
    }
}

pub struct EventBus {
    config: BusConfig,
    backoff: Backoff,
    state: Mutex<BusState>,
    idle: Notify,
    this: Weak<EventBus>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Arc<Self> {
        let backoff = Backoff::exponential(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        Arc::new_cyclic(|this| EventBus {
            config,
            backoff,
            state: Mutex::new(BusState::default()),
            idle: Notify::new(),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        options: HandlerOptions,
    ) -> Result<HandlerId, BusError> {
        if event_type.trim().is_empty() {
            return Err(BusError::InvalidArgument("event type must not be empty".into()));
        }
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.default_handler_timeout());
        if timeout.is_zero() {
            return Err(BusError::InvalidArgument("handler timeout must be positive".into()));
        }

        let mut state = self.lock();
        state.next_handler_id += 1;
        let id = HandlerId(state.next_handler_id);
        state.handlers.insert(
            id,
            Registration {
                id,
                event_type: event_type.to_string(),
                handler,
                priority: options.priority.unwrap_or_default(),
                timeout,
                retries: options.retries.unwrap_or(self.config.default_retries),
                enabled: true,
                stats: Default::default(),
                breaker: CircuitBreaker::new(
                    self.config.breaker_failure_threshold,
                    self.config.breaker_reset(),
                ),
            },
        );
        tracing::debug!(handler_id = %id, event_type, "handler registered");
        Ok(id)
    }

    /// Remove a handler and its breaker. Returns `false` if it was not registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let removed = self.lock().handlers.remove(&id).is_some();
        if removed {
            tracing::debug!(handler_id = %id, "handler unregistered");
        }
        removed
    }

    pub fn set_enabled(&self, id: HandlerId, enabled: bool) -> bool {
        match self.lock().handlers.get_mut(&id) {
            Some(registration) => {
                registration.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn handlers(&self) -> Vec<HandlerInfo> {
        let now = Instant::now();
        self.lock()
            .handlers
            .values()
            .map(|r| HandlerInfo {
                id: r.id,
                event_type: r.event_type.clone(),
                priority: r.priority,
                timeout_ms: r.timeout.as_millis() as u64,
                retries: r.retries,
                enabled: r.enabled,
                stats: r.stats.clone(),
                breaker: r.breaker.snapshot(now),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Queue an event and return its id. Delivery happens on the drain task.
    pub fn publish(
        &self,
        event_type: &str,
        data: Value,
        options: PublishOptions,
    ) -> Result<String, BusError> {
        if event_type.trim().is_empty() {
            return Err(BusError::InvalidArgument("event type must not be empty".into()));
        }
        let retries = options.retries.unwrap_or(self.config.default_retries);
        let event = EnhancedEvent {
            event_type: event_type.to_string(),
            data,
            metadata: EventMetadata {
                id: uuid::Uuid::new_v4().to_string(),
                priority: options
                    .priority
                    .unwrap_or_else(|| Priority::new(self.config.default_priority)),
                timestamp: Utc::now(),
                source: options.source.unwrap_or_else(|| "unknown".to_string()),
                timeout: options
                    .timeout
                    .unwrap_or_else(|| self.config.default_event_timeout()),
                retries,
                attempt: 1,
                max_attempts: retries.saturating_add(1),
                replay_of: None,
            },
        };
        let id = event.metadata.id.clone();
        self.submit(Queued::new(event))?;
        Ok(id)
    }

    fn submit(&self, queued: Queued) -> Result<(), BusError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        tracing::debug!(
            event_type = %queued.event.event_type,
            event_id = %queued.event.metadata.id,
            priority = %queued.priority(),
            "event published",
        );
        let start = {
            let mut state = self.lock();
            state.stats.published += 1;
            state.enqueue(queued, false)
        };
        if start {
            self.spawn_drain(&runtime);
        }
        Ok(())
    }

    fn spawn_drain(&self, runtime: &tokio::runtime::Handle) {
        match self.this.upgrade() {
            Some(bus) => {
                runtime.spawn(bus.drain());
            }
            None => self.lock().draining = false,
        }
    }

    // -----------------------------------------------------------------------
    // Drain loop
    // -----------------------------------------------------------------------

    async fn drain(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                let next = state.queue.pop_front();
                if next.is_none() {
                    state.draining = false;
                }
                next
            };
            let Some(queued) = next else { break };

            if queued.published_at.elapsed() > queued.event.metadata.timeout {
                tracing::warn!(
                    event_type = %queued.event.event_type,
                    event_id = %queued.event.metadata.id,
                    "event expired before dispatch",
                );
                self.lock().stats.expired += 1;
                let reason = format!(
                    "expired: older than its {}ms timeout (attempt {})",
                    queued.event.metadata.timeout.as_millis(),
                    queued.event.metadata.attempt
                );
                self.dead_letter(queued.event, reason, None);
                continue;
            }

            self.dispatch(queued).await;
        }
        self.idle.notify_waiters();
    }

    async fn dispatch(&self, queued: Queued) {
        let Queued {
            event,
            only,
            published_at,
        } = queued;
        let now = Instant::now();

        let (targets, skipped) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut matching: Vec<&mut Registration> = state
                .handlers
                .values_mut()
                .filter(|r| r.enabled && r.event_type == event.event_type)
                .filter(|r| only.map_or(true, |id| id == r.id))
                .collect();
            matching.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

            let mut targets = Vec::with_capacity(matching.len());
            let mut skipped = Vec::new();
            for registration in matching {
                if registration.breaker.try_acquire(now) {
                    targets.push(Target {
                        id: registration.id,
                        handler: Arc::clone(&registration.handler),
                        timeout: registration.timeout,
                        retries: registration.retries,
                    });
                } else {
                    registration.stats.skipped += 1;
                    skipped.push(registration.id);
                }
            }
            state.stats.skipped_by_breaker += skipped.len() as u64;
            if targets.is_empty() && skipped.is_empty() && only.is_none() {
                state.stats.unhandled += 1;
            }
            (targets, skipped)
        };

        for id in &skipped {
            tracing::debug!(handler_id = %id, event_type = %event.event_type, "circuit open, delivery skipped");
        }
        if only.is_some() && !skipped.is_empty() {
            self.dead_letter(
                event.clone(),
                "circuit open for retried handler".to_string(),
                only,
            );
        }

        for target in targets {
            let started = Instant::now();
            let result = run_isolated(Arc::clone(&target.handler), event.clone(), target.timeout).await;
            self.record_outcome(&target, &event, published_at, result, started.elapsed());
        }
    }

    fn record_outcome(
        &self,
        target: &Target,
        event: &EnhancedEvent,
        published_at: Instant,
        result: Result<(), HandlerError>,
        elapsed: Duration,
    ) {
        let elapsed_ms = elapsed.as_millis() as u64;
        let err = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let registration = state.handlers.get_mut(&target.id);
            match result {
                Ok(()) => {
                    state.stats.delivered += 1;
                    if let Some(r) = registration {
                        r.stats.invocations += 1;
                        r.stats.successes += 1;
                        r.stats.total_duration_ms += elapsed_ms;
                        r.breaker.record_success();
                    }
                    None
                }
                Err(err) => {
                    state.stats.failed += 1;
                    if matches!(err, HandlerError::TimedOut(_)) {
                        state.stats.timed_out += 1;
                    }
                    if let Some(r) = registration {
                        r.stats.invocations += 1;
                        r.stats.failures += 1;
                        r.stats.total_duration_ms += elapsed_ms;
                        if matches!(err, HandlerError::TimedOut(_)) {
                            r.stats.timeouts += 1;
                        }
                        r.stats.last_error = Some(err.to_string());
                        r.breaker.record_failure(Instant::now());
                        if r.breaker.state() == BreakerState::Open {
                            tracing::warn!(handler_id = %r.id, event_type = %r.event_type, "circuit breaker opened");
                        }
                    }
                    Some(err)
                }
            }
        };

        let Some(err) = err else {
            tracing::debug!(handler_id = %target.id, event_type = %event.event_type, duration_ms = elapsed_ms, "handler succeeded");
            return;
        };

        tracing::warn!(
            handler_id = %target.id,
            event_type = %event.event_type,
            attempt = event.metadata.attempt,
            error = %err,
            "handler failed",
        );
        if err == HandlerError::Cancelled {
            self.report_internal(event, format!("handler {} task cancelled", target.id));
        }

        let budget = event
            .metadata
            .max_attempts
            .min(target.retries.saturating_add(1));
        if event.metadata.attempt < budget {
            self.schedule_retry(event, target.id, published_at);
        } else {
            let reason = format!(
                "handler {} failed after {} attempt(s): {err}",
                target.id, event.metadata.attempt
            );
            self.dead_letter(event.clone(), reason, Some(target.id));
        }
    }

    fn schedule_retry(&self, event: &EnhancedEvent, handler_id: HandlerId, published_at: Instant) {
        let Some(bus) = self.this.upgrade() else { return };
        let delay = self.backoff.delay_for_attempt(event.metadata.attempt);
        let mut retry = event.clone();
        retry.metadata.attempt += 1;
        {
            let mut state = self.lock();
            state.pending_retries += 1;
            state.stats.retried += 1;
        }
        tracing::debug!(
            handler_id = %handler_id,
            event_id = %event.metadata.id,
            attempt = retry.metadata.attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled",
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let queued = Queued {
                event: retry,
                published_at,
                only: Some(handler_id),
            };
            let start = {
                let mut state = bus.lock();
                state.pending_retries -= 1;
                state.enqueue(queued, true)
            };
            if start {
                tokio::spawn(Arc::clone(&bus).drain());
            }
        });
    }

    // -----------------------------------------------------------------------
    // Dead letters
    // -----------------------------------------------------------------------

    fn dead_letter(&self, event: EnhancedEvent, reason: String, handler_id: Option<HandlerId>) {
        tracing::warn!(
            event_type = %event.event_type,
            event_id = %event.metadata.id,
            reason = %reason,
            "event dead-lettered",
        );
        let evicted = {
            let mut state = self.lock();
            state.stats.dead_lettered += 1;
            let evicted = if state.dead_letters.len() >= self.config.dead_letter_capacity.max(1) {
                state.dead_letters.pop_front()
            } else {
                None
            };
            state.dead_letters.push_back(DeadLetter {
                event: event.clone(),
                reason,
                handler_id,
                failed_at: Utc::now(),
            });
            evicted
        };
        if let Some(lost) = evicted {
            self.report_internal(
                &event,
                format!(
                    "dead-letter queue full; dropped event {} ({})",
                    lost.event.metadata.id, lost.event.event_type
                ),
            );
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.iter().cloned().collect()
    }

    /// Re-publish dead-lettered events (all when `ids` is `None`) with a fresh
    /// attempt counter. Returns the new event ids.
    pub fn replay_dead_letter(&self, ids: Option<&[String]>) -> Result<Vec<String>, BusError> {
        tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let selected: Vec<DeadLetter> = {
            let mut state = self.lock();
            let (selected, kept): (Vec<_>, Vec<_>) =
                state.dead_letters.drain(..).partition(|entry| match ids {
                    Some(ids) => ids.iter().any(|id| id == &entry.event.metadata.id),
                    None => true,
                });
            state.dead_letters = kept.into();
            state.stats.replayed += selected.len() as u64;
            selected
        };

        let mut replayed = Vec::with_capacity(selected.len());
        for entry in selected {
            let mut event = entry.event;
            event.metadata.replay_of = Some(event.metadata.id.clone());
            event.metadata.id = uuid::Uuid::new_v4().to_string();
            event.metadata.attempt = 1;
            event.metadata.timestamp = Utc::now();
            tracing::info!(
                event_type = %event.event_type,
                replay_of = ?event.metadata.replay_of,
                "replaying dead-lettered event",
            );
            replayed.push(event.metadata.id.clone());
            self.submit(Queued::new(event))?;
        }
        Ok(replayed)
    }

    // -----------------------------------------------------------------------
    // Internal errors
    // -----------------------------------------------------------------------

    /// Publish a bus-internal failure as `system_error`. Failures while
    /// handling `system_error` itself are only logged.
    fn report_internal(&self, origin: &EnhancedEvent, message: String) {
        tracing::error!(event_type = %origin.event_type, error = %message, "event bus internal error");
        if origin.event_type == topics::SYSTEM_ERROR {
            return;
        }
        let data = json!({
            "component": "event_bus",
            "message": message,
            "event_id": origin.metadata.id,
            "event_type": origin.event_type,
        });
        let options = PublishOptions::new()
            .priority(Priority::MAX)
            .retries(0)
            .source("event_bus");
        if let Err(err) = self.publish(topics::SYSTEM_ERROR, data, options) {
            tracing::error!(error = %err, "failed to publish system_error");
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Wait until nothing is queued, dispatching, or waiting to retry.
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_idle() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn stats(&self) -> BusStats {
        let state = self.lock();
        BusStats {
            queued: state.queue.len(),
            handlers: state.handlers.len(),
            ..state.stats.clone()
        }
    }

    pub fn health(&self) -> ComponentHealth {
        let stats = self.stats();
        let (open, dead_letters) = {
            let state = self.lock();
            let open: Vec<String> = state
                .handlers
                .values()
                .filter(|r| r.breaker.state() == BreakerState::Open)
                .map(|r| format!("{} ({})", r.id, r.event_type))
                .collect();
            (open, state.dead_letters.len())
        };

        let mut health = ComponentHealth::healthy("event_bus").with_details(json!({
            "stats": stats,
            "dead_letters": dead_letters,
            "open_breakers": open,
        }));
        if !open.is_empty() {
            health.flag(
                HealthStatus::Error,
                format!("circuit open for {}", open.join(", ")),
            );
        }
        if dead_letters * 2 > self.config.dead_letter_capacity {
            health.flag(HealthStatus::Error, format!("{dead_letters} dead letters queued"));
        } else if dead_letters > 0 {
            health.flag(HealthStatus::Degraded, format!("{dead_letters} dead letters queued"));
        }
        health
    }
}

/// Run one handler invocation on its own task, aborting it on timeout.
/// Panics are reported as failures.
async fn run_isolated(
    handler: Arc<dyn EventHandler>,
    event: EnhancedEvent,
    timeout: Duration,
) -> Result<(), HandlerError> {
    let mut task = tokio::spawn(async move { handler.handle(event).await });
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => {
            Err(HandlerError::Panicked(panic_message(join_err.into_panic())))
        }
        Ok(Err(_)) => Err(HandlerError::Cancelled),
        Err(_) => {
            task.abort();
            Err(HandlerError::TimedOut(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus() -> Arc<EventBus> {
        EventBus::new(BusConfig {
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            ..BusConfig::default()
        })
    }

    #[tokio::test]
    async fn register_rejects_empty_event_type() {
        let bus = bus();
        let err = bus
            .register(" ", handler_fn(|_| async { Ok(()) }), HandlerOptions::new())
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let bus = bus();
        let id = bus
            .register("x", handler_fn(|_| async { Ok(()) }), HandlerOptions::new())
            .unwrap();
        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        assert!(bus.handlers().is_empty());
    }

    #[test]
    fn publish_outside_runtime_is_an_error() {
        let bus = bus();
        let err = bus.publish("x", Value::Null, PublishOptions::new()).unwrap_err();
        assert!(matches!(err, BusError::NoRuntime));
    }

    #[tokio::test]
    async fn retry_goes_only_to_the_failing_handler() {
        let bus = bus();
        let ok_calls = Arc::new(AtomicUsize::new(0));
        let flaky_calls = Arc::new(AtomicUsize::new(0));
        {
            let ok_calls = ok_calls.clone();
            bus.register(
                "job",
                handler_fn(move |_| {
                    let ok_calls = ok_calls.clone();
                    async move {
                        ok_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                HandlerOptions::new(),
            )
            .unwrap();
        }
        {
            let flaky_calls = flaky_calls.clone();
            bus.register(
                "job",
                handler_fn(move |_| {
                    let flaky_calls = flaky_calls.clone();
                    async move {
                        if flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(HandlerError::failed("first attempt fails"))
                        } else {
                            Ok(())
                        }
                    }
                }),
                HandlerOptions::new(),
            )
            .unwrap();
        }

        bus.publish("job", json!({}), PublishOptions::new()).unwrap();
        assert!(bus.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(ok_calls.load(Ordering::SeqCst), 1);
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
        let stats = bus.stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.dead_lettered, 0);
    }

    #[tokio::test]
    async fn handler_retries_cap_the_attempt_budget() {
        let bus = bus();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        bus.register(
            "job",
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::failed("always"))
                }
            }),
            HandlerOptions::new().retries(1),
        )
        .unwrap();

        bus.publish("job", json!({}), PublishOptions::new().retries(5)).unwrap();
        assert!(bus.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event.metadata.attempt, 2);
        assert!(dead[0].reason.contains("always"));
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let bus = bus();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register(
            "job",
            handler_fn(|_| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            }),
            HandlerOptions::new().retries(0),
        )
        .unwrap();
        let counter = calls.clone();
        bus.register(
            "job",
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            HandlerOptions::new(),
        )
        .unwrap();

        bus.publish("job", json!({}), PublishOptions::new()).unwrap();
        assert!(bus.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("panicked"));
    }
}
