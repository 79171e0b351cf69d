//! Handler trait and registration bookkeeping.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::error::HandlerError;
use crate::event::{EnhancedEvent, Priority};

/// A subscriber to one event type. Each invocation runs on its own task.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: EnhancedEvent) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EnhancedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: EnhancedEvent) -> Result<(), HandlerError> {
        (self.0)(event).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EnhancedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Run `work` on a task of its own and wait for it.
///
/// A handler that times out has its task aborted at the next await point.
/// Work started here is not aborted with it: it runs to completion, so a
/// multi-step store mutation still reaches its own rollback. The timed-out
/// delivery is reported as usual.
pub async fn detached<F>(work: F) -> Result<(), HandlerError>
where
    F: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            Err(HandlerError::Panicked(panic_message(join_err.into_panic())))
        }
        Err(_) => Err(HandlerError::Cancelled),
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(pub u64);

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Registration overrides; unset fields use the bus defaults.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Order among handlers of the same event type. Higher runs first.
    pub priority: Option<Priority>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub skipped: u64,
    pub total_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ExecutionStats {
    pub fn average_duration_ms(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.invocations as f64
        }
    }
}

pub(crate) struct Registration {
    pub id: HandlerId,
    pub event_type: String,
    pub handler: Arc<dyn EventHandler>,
    pub priority: Priority,
    pub timeout: Duration,
    pub retries: u32,
    pub enabled: bool,
    pub stats: ExecutionStats,
    pub breaker: CircuitBreaker,
}

/// Public view of one registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub id: HandlerId,
    pub event_type: String,
    pub priority: Priority,
    pub timeout_ms: u64,
    pub retries: u32,
    pub enabled: bool,
    pub stats: ExecutionStats,
    pub breaker: BreakerSnapshot,
}
