//! Wires the bus, validator, engine, and resolver into one running system.
//!
//! ```text
//! submit_change ─► analyzer ─► change_analyzed ─► routing ─► validator
//!                                                               │
//!        ┌──────────────────── validation_complete ◄────────────┘
//!        ▼                              ▼
//!   sync engine                  conflict resolver
//! ```
//!
//! All cross-component signalling goes through the event bus.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use accord_bus::{
    handler_fn, topics, BusStats, EventBus, HandlerError, HandlerOptions, Priority, PublishOptions,
};
use accord_core::config::AccordConfig;
use accord_core::store::{DocumentStore, StructuredStore};
use accord_core::{AuditEntry, AuditLog, ChangePayload, SpecLocks};
use accord_sync::{
    ConflictResolver, ResolverStats, StateValidator, SyncEngine, SyncStats, ValidationResult,
    ValidatorStats,
};

use crate::analyzer::{should_validate, ChangeAnalysis, ChangeAnalyzer, SemanticAnalyzer};
use crate::error::DaemonError;
use crate::health::{OverallHealth, SystemHealth};

const SOURCE: &str = "orchestrator";
const DRAIN_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub changes_received: u64,
    pub changes_rejected: u64,
    pub changes_routed: u64,
    pub changes_skipped: u64,
    pub validations_with_conflicts: u64,
    pub repairs: u64,
}

/// What `stop()` observed while draining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopReport {
    /// Everything finished before the timeout.
    pub drained: bool,
    pub waited_ms: u64,
    pub queued_events: usize,
    pub active_syncs: usize,
    pub active_conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub health: SystemHealth,
    pub orchestrator: OrchestratorStats,
    pub bus: BusStats,
    pub validator: ValidatorStats,
    pub sync: SyncStats,
    pub resolver: ResolverStats,
    pub pending_tickets: usize,
    pub dead_letters: usize,
}

/// Store gateways and collaborators the orchestrator is built from.
pub struct Collaborators {
    pub documents: Arc<dyn DocumentStore>,
    pub structured: Arc<dyn StructuredStore>,
    pub analyzer: Arc<dyn ChangeAnalyzer>,
}

impl Collaborators {
    /// Gateways with the default semantic analyzer.
    pub fn new(documents: Arc<dyn DocumentStore>, structured: Arc<dyn StructuredStore>) -> Self {
        Self {
            documents,
            structured,
            analyzer: Arc::new(SemanticAnalyzer),
        }
    }
}

pub struct Orchestrator {
    config: AccordConfig,
    bus: Arc<EventBus>,
    validator: Arc<StateValidator>,
    engine: Arc<SyncEngine>,
    resolver: Arc<ConflictResolver>,
    analyzer: Arc<dyn ChangeAnalyzer>,
    running: AtomicBool,
    in_flight: AtomicUsize,
    monitor: Mutex<Option<JoinHandle<()>>>,
    last_health: Mutex<Option<SystemHealth>>,
    stats: Mutex<OrchestratorStats>,
    audit: AuditLog,
}

/// Decrements the in-flight counter when a routed change finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn init_err(component: &'static str, err: impl std::fmt::Display) -> DaemonError {
    DaemonError::Initialization {
        component,
        message: err.to_string(),
    }
}

impl Orchestrator {
    /// Build bus, validator, engine, and resolver in that order and subscribe
    /// each to its events. Any failure aborts with the failing component named.
    /// The result is initialized but not started.
    pub fn initialize(
        config: AccordConfig,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>, DaemonError> {
        config.validate().map_err(|e| init_err("config", e))?;
        let Collaborators {
            documents,
            structured,
            analyzer,
        } = collaborators;

        let bus = EventBus::new(config.bus.clone());
        let locks = Arc::new(SpecLocks::new());
        let validator = Arc::new(
            StateValidator::new(documents.clone(), structured.clone(), config.validator.clone())
                .with_locks(locks.clone()),
        );
        let engine = Arc::new(SyncEngine::new(
            documents,
            structured.clone(),
            validator.clone(),
            bus.clone(),
            locks,
            config.sync.clone(),
        ));
        engine.subscribe().map_err(|e| init_err("sync_engine", e))?;
        let resolver = Arc::new(ConflictResolver::new(
            engine.clone(),
            structured,
            bus.clone(),
            config.resolver.clone(),
            &config.validator,
        ));
        resolver
            .subscribe()
            .map_err(|e| init_err("conflict_resolver", e))?;

        let orchestrator = Arc::new(Self {
            audit: AuditLog::new(config.orchestrator.audit_capacity),
            config,
            bus,
            validator,
            engine,
            resolver,
            analyzer,
            running: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            monitor: Mutex::new(None),
            last_health: Mutex::new(None),
            stats: Mutex::new(OrchestratorStats::default()),
        });
        orchestrator
            .subscribe()
            .map_err(|e| init_err("orchestrator", e))?;
        tracing::info!("orchestrator initialized");
        Ok(orchestrator)
    }

    fn subscribe(self: &Arc<Self>) -> Result<(), DaemonError> {
        let orchestrator: Weak<Orchestrator> = Arc::downgrade(self);
        self.bus.register(
            topics::CHANGE_ANALYZED,
            handler_fn(move |event| {
                let orchestrator = orchestrator.clone();
                async move {
                    let Some(orchestrator) = orchestrator.upgrade() else { return Ok(()) };
                    let analysis: ChangeAnalysis =
                        serde_json::from_value(event.data).map_err(HandlerError::failed)?;
                    orchestrator.route(&analysis).await;
                    Ok(())
                }
            }),
            HandlerOptions::new(),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Accept changes and start the health monitor. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let orchestrator = Arc::downgrade(self);
        let period = self.config.orchestrator.health_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else { break };
                orchestrator.health_check();
            }
        });
        if let Some(previous) = self
            .monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle)
        {
            previous.abort();
        }
        self.audit.record("started", Value::Null);
        tracing::info!(health_interval_ms = period.as_millis() as u64, "orchestrator started");
    }

    /// Stop accepting changes and wait, bounded by the configured stop
    /// timeout, for queued events, syncs, and resolutions to finish.
    /// Components stay constructed; `start()` resumes.
    pub async fn stop(&self) -> StopReport {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self
            .monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }

        let timeout = self.config.orchestrator.stop_timeout();
        let started = Instant::now();
        let drained = tokio::time::timeout(timeout, async {
            while !self.is_drained() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await
        .is_ok();

        let report = StopReport {
            drained,
            waited_ms: started.elapsed().as_millis() as u64,
            queued_events: self.bus.stats().queued,
            active_syncs: self.engine.active_count(),
            active_conflicts: self.resolver.active_count(),
        };
        if drained {
            tracing::info!(waited_ms = report.waited_ms, "orchestrator stopped");
        } else {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                queued_events = report.queued_events,
                active_syncs = report.active_syncs,
                active_conflicts = report.active_conflicts,
                "orchestrator stopped before in-flight work drained",
            );
        }
        self.audit.record("stopped", json!(report));
        report
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_drained(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
            && self.bus.is_idle()
            && self.engine.active_count() == 0
            && self.resolver.active_count() == 0
    }

    // -----------------------------------------------------------------------
    // Change intake
    // -----------------------------------------------------------------------

    /// Analyze a change and publish it as `change_analyzed`. Returns the
    /// event id. Rejected while stopped.
    pub async fn submit_change(&self, payload: ChangePayload) -> Result<String, DaemonError> {
        if !self.is_running() {
            self.stats_mut(|s| s.changes_rejected += 1);
            return Err(DaemonError::Stopped);
        }
        self.stats_mut(|s| s.changes_received += 1);
        let analysis = self.analyzer.analyze(&payload).await;
        tracing::debug!(
            file = %payload.file_path.display(),
            impact = %analysis.impact,
            critical = analysis.critical,
            "change analyzed",
        );
        let data = serde_json::to_value(&analysis)?;
        let id = self.bus.publish(
            topics::CHANGE_ANALYZED,
            data,
            PublishOptions::new().source(SOURCE),
        )?;
        Ok(id)
    }

    /// Feed every payload received on `changes` into [`submit_change`].
    /// The task ends when the sender side closes.
    ///
    /// [`submit_change`]: Orchestrator::submit_change
    pub fn attach_change_source(
        self: &Arc<Self>,
        mut changes: mpsc::Receiver<ChangePayload>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(payload) = changes.recv().await {
                let Some(orchestrator) = orchestrator.upgrade() else { break };
                let file = payload.file_path.clone();
                if let Err(err) = orchestrator.submit_change(payload).await {
                    tracing::warn!(file = %file.display(), error = %err, "change from source dropped");
                }
            }
            tracing::debug!("change source closed");
        })
    }

    /// Apply the routing policy and, if the change warrants it, validate and
    /// publish the outcome.
    pub async fn route(&self, analysis: &ChangeAnalysis) -> Option<ValidationResult> {
        if !should_validate(analysis) {
            self.stats_mut(|s| s.changes_skipped += 1);
            tracing::debug!(
                file = %analysis.payload.file_path.display(),
                impact = %analysis.impact,
                "change below routing threshold, not validated",
            );
            return None;
        }
        let _in_flight = InFlight::enter(&self.in_flight);
        self.stats_mut(|s| s.changes_routed += 1);

        let result = self.validator.validate_change(&analysis.payload).await;
        self.stats_mut(|s| {
            s.repairs += result.repairs_performed.len() as u64;
            if !result.conflicts.is_empty() {
                s.validations_with_conflicts += 1;
            }
        });
        self.announce(&analysis.payload, &result);
        Some(result)
    }

    fn announce(&self, payload: &ChangePayload, result: &ValidationResult) {
        for repair in &result.repairs_performed {
            self.publish(topics::REPAIR_PERFORMED, json!(repair), Priority::NORMAL);
        }
        for conflict in &result.conflicts {
            self.publish(topics::CONFLICT_DETECTED, json!(conflict), Priority::HIGH);
        }
        self.publish(
            topics::VALIDATION_COMPLETE,
            json!({ "payload": payload, "result": result }),
            Priority::NORMAL,
        );
    }

    fn publish(&self, event_type: &str, data: Value, priority: Priority) {
        let options = PublishOptions::new().priority(priority).source(SOURCE);
        if let Err(err) = self.bus.publish(event_type, data, options) {
            tracing::error!(event_type, error = %err, "failed to publish");
        }
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Poll every component, remember the result, and publish
    /// `health_changed` when the overall status moved.
    pub fn health_check(&self) -> SystemHealth {
        let health = SystemHealth::from_components(vec![
            self.bus.health(),
            self.validator.health(),
            self.engine.health(),
            self.resolver.health(),
        ]);
        let previous = self
            .last_health
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(health.clone())
            .map(|h| h.status);

        let changed = match previous {
            Some(previous) => previous != health.status,
            None => health.status != OverallHealth::Healthy,
        };
        if changed {
            match health.status {
                OverallHealth::Critical => {
                    tracing::error!(previous = ?previous, "system health critical")
                }
                OverallHealth::Degraded => {
                    tracing::warn!(previous = ?previous, "system health degraded")
                }
                OverallHealth::Healthy => tracing::info!(previous = ?previous, "system healthy"),
            }
            self.publish(
                topics::HEALTH_CHANGED,
                json!({
                    "previous": previous,
                    "current": health.status,
                    "components": health.components,
                }),
                Priority::HIGH,
            );
            self.audit.record("health_changed", json!({ "status": health.status }));
        }
        health
    }

    pub fn last_health(&self) -> Option<SystemHealth> {
        self.last_health
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self) -> StatusReport {
        StatusReport {
            running: self.is_running(),
            health: self.health_check(),
            orchestrator: self.stats(),
            bus: self.bus.stats(),
            validator: self.validator.stats(),
            sync: self.engine.stats(),
            resolver: self.resolver.stats(),
            pending_tickets: self.resolver.pending_tickets().len(),
            dead_letters: self.bus.dead_letters().len(),
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn audit_entries(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.recent(limit)
    }

    pub fn config(&self) -> &AccordConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn validator(&self) -> &Arc<StateValidator> {
        &self.validator
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    fn stats_mut(&self, f: impl FnOnce(&mut OrchestratorStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self
            .monitor
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_core::{FsDocumentStore, FsStructuredStore};
    use tempfile::TempDir;

    fn orchestrator(dir: &TempDir, config: AccordConfig) -> Arc<Orchestrator> {
        let documents = Arc::new(FsDocumentStore::new(dir.path().join("specs")));
        let structured = Arc::new(FsStructuredStore::new(dir.path().join("state")));
        Orchestrator::initialize(config, Collaborators::new(documents, structured)).unwrap()
    }

    #[test]
    fn invalid_config_names_the_failing_component() {
        let dir = TempDir::new().unwrap();
        let mut config = AccordConfig::default();
        config.resolver.confidence_floor = 2.0;
        let documents = Arc::new(FsDocumentStore::new(dir.path().join("specs")));
        let structured = Arc::new(FsStructuredStore::new(dir.path().join("state")));
        let err = Orchestrator::initialize(config, Collaborators::new(documents, structured))
            .err()
            .expect("invalid config rejected");
        assert!(matches!(err, DaemonError::Initialization { component: "config", .. }));
    }

    #[tokio::test]
    async fn changes_are_rejected_until_started() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, AccordConfig::default());
        let payload = ChangePayload::new(accord_core::SourceType::Document, "specs/a.md");

        let err = orchestrator.submit_change(payload.clone()).await.unwrap_err();
        assert!(matches!(err, DaemonError::Stopped));
        assert_eq!(orchestrator.stats().changes_rejected, 1);

        orchestrator.start();
        assert!(orchestrator.is_running());
        let report = orchestrator.stop().await;
        assert!(report.drained);
        assert!(orchestrator.submit_change(payload).await.is_err());
    }

    #[tokio::test]
    async fn health_starts_healthy_and_is_remembered() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, AccordConfig::default());
        let health = orchestrator.health_check();
        assert_eq!(health.status, OverallHealth::Healthy);
        assert_eq!(health.components.len(), 4);
        assert_eq!(orchestrator.last_health().map(|h| h.status), Some(OverallHealth::Healthy));
    }
}
