#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use accord_bus::bus::EventBus;
use accord_bus::handler::{handler_fn, HandlerOptions};
use accord_core::config::{BusConfig, ResolverConfig, SyncConfig, ValidatorConfig};
use accord_core::store::{DocumentStore, StructuredStore};
use accord_core::{FsDocumentStore, FsStructuredStore, SpecLocks};
use accord_sync::{ConflictResolver, StateValidator, SyncEngine};

/// Spec `SPEC-1` with one task assigned to `agent`, last touched at
/// `task_updated`.
pub fn spec_with_task(agent: &str, task_updated: &str) -> String {
    spec_document("SPEC-1", agent, task_updated)
}

pub fn spec_document(spec_id: &str, agent: &str, task_updated: &str) -> String {
    format!(
        r#"---
id: {spec_id}
title: Login
status: active
type: feature
priority: high
updated: "{task_updated}"
tasks:
  - id: T1
    title: Form
    status: in_progress
    assigned_agent: {agent}
    updated: "{task_updated}"
---
# Login
"#
    )
}

pub struct Harness {
    pub dir: TempDir,
    pub fs_documents: Arc<FsDocumentStore>,
    pub fs_structured: Arc<FsStructuredStore>,
    pub bus: Arc<EventBus>,
    pub validator: Arc<StateValidator>,
    pub engine: Arc<SyncEngine>,
    pub resolver: Arc<ConflictResolver>,
    pub locks: Arc<SpecLocks>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(|docs, state| (docs, state))
    }

    /// Build with the file stores optionally wrapped by the test.
    pub fn build<F>(wrap: F) -> Self
    where
        F: FnOnce(
            Arc<dyn DocumentStore>,
            Arc<dyn StructuredStore>,
        ) -> (Arc<dyn DocumentStore>, Arc<dyn StructuredStore>),
    {
        Self::build_with(BusConfig::default(), wrap)
    }

    pub fn build_with<F>(bus_config: BusConfig, wrap: F) -> Self
    where
        F: FnOnce(
            Arc<dyn DocumentStore>,
            Arc<dyn StructuredStore>,
        ) -> (Arc<dyn DocumentStore>, Arc<dyn StructuredStore>),
    {
        let dir = TempDir::new().unwrap();
        let fs_documents = Arc::new(FsDocumentStore::new(dir.path().join("specs")));
        let fs_structured = Arc::new(FsStructuredStore::new(dir.path().join("state")));
        let (documents, structured) = wrap(fs_documents.clone(), fs_structured.clone());

        let bus = EventBus::new(bus_config);
        let locks = Arc::new(SpecLocks::new());
        let validator_config = ValidatorConfig::default();
        let validator = Arc::new(
            StateValidator::new(documents.clone(), structured.clone(), validator_config.clone())
                .with_locks(locks.clone()),
        );
        let engine = Arc::new(SyncEngine::new(
            documents,
            structured.clone(),
            validator.clone(),
            bus.clone(),
            locks.clone(),
            SyncConfig::default(),
        ));
        let resolver = Arc::new(ConflictResolver::new(
            engine.clone(),
            structured,
            bus.clone(),
            ResolverConfig::default(),
            &validator_config,
        ));
        Self {
            dir,
            fs_documents,
            fs_structured,
            bus,
            validator,
            engine,
            resolver,
            locks,
        }
    }

    pub fn spec_path(&self) -> PathBuf {
        self.spec_path_for("SPEC-1")
    }

    pub fn spec_path_for(&self, spec_id: &str) -> PathBuf {
        self.dir.path().join("specs").join(format!("{spec_id}.md"))
    }

    pub fn state_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("state").join(name)
    }

    pub fn write_spec(&self, content: &str) {
        self.write_spec_for("SPEC-1", content);
    }

    pub fn write_spec_for(&self, spec_id: &str, content: &str) {
        let path = self.spec_path_for(spec_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }

    /// Record every event of `event_type`.
    pub fn record(&self, event_type: &str) -> Recorder {
        let recorder = Recorder::default();
        let seen = recorder.events.clone();
        self.bus
            .register(
                event_type,
                handler_fn(move |event| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(event.data);
                        Ok(())
                    }
                }),
                HandlerOptions::new(),
            )
            .unwrap();
        recorder
    }

    pub async fn settle(&self) {
        assert!(self.bus.wait_idle(Duration::from_secs(5)).await, "bus did not drain");
    }
}

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Value>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Value> {
        self.events.lock().unwrap().clone()
    }
}
