//! Gate telemetry.
//!
//! The interception layers emit a [`GateEvent`] for every decision they act
//! on. Events flow through sinks implemented as `tower::Service<GateEvent>`,
//! so they compose with ordinary tower combinators.
//!
//! - `Allowed` / `Skipped`: emitted by the reactive and proactive checks.
//! - `Recorded`: emitted after an attempt was written to the ledger.
//! - `StoreDegraded`: emitted when a fail-open job proceeded without a readable ledger.
//!
//! Emission is best-effort: a sink that is not ready or fails drops the event.

use crate::config::StoreFailureMode;
use crate::context::{JobId, ResourceId};
use crate::evaluator::SkipReason;
use crate::store::LastOutcome;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// Events emitted by the gate layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    /// A resource passed its check.
    Allowed { job_id: JobId, resource_id: ResourceId },
    /// A resource was kept from running.
    Skipped { job_id: JobId, resource_id: ResourceId, reason: SkipReason },
    /// An attempt was written to the ledger.
    Recorded {
        job_id: JobId,
        resource_id: ResourceId,
        outcome: LastOutcome,
        /// Attempt count after this attempt.
        attempt_count: u64,
    },
    /// The ledger could not be read and the job's failure mode decided instead.
    StoreDegraded {
        job_id: JobId,
        resource_id: ResourceId,
        reason: String,
        mode: StoreFailureMode,
    },
}

impl fmt::Display for GateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateEvent::Allowed { job_id, resource_id } => {
                write!(f, "Allowed(job={}, resource={})", job_id, resource_id)
            }
            GateEvent::Skipped { job_id, resource_id, reason } => {
                write!(f, "Skipped(job={}, resource={}, reason={})", job_id, resource_id, reason)
            }
            GateEvent::Recorded { job_id, resource_id, outcome, attempt_count } => write!(
                f,
                "Recorded(job={}, resource={}, outcome={:?}, attempts={})",
                job_id, resource_id, outcome, attempt_count
            ),
            GateEvent::StoreDegraded { job_id, resource_id, reason, mode } => write!(
                f,
                "StoreDegraded(job={}, resource={}, mode={:?}, reason={})",
                job_id, resource_id, mode, reason
            ),
        }
    }
}

/// A sink that consumes gate events.
pub trait GateSink:
    tower::Service<GateEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<K>(sink: K, event: GateEvent)
where
    K: GateSink,
    K::Future: Send,
{
    use tower::ServiceExt;

    let mut ready = match sink.ready_oneshot().await {
        Ok(ready) => ready,
        Err(_) => return,
    };
    let _ = ready.call(event).await;
}

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<GateEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: GateEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl GateSink for NullSink {
    type SinkError = Infallible;
}

/// A sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<GateEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GateEvent) -> Self::Future {
        match &event {
            GateEvent::Skipped { .. } | GateEvent::StoreDegraded { .. } => {
                tracing::warn!(target: "strikeout::gate", event = %event, "gate_event")
            }
            _ => tracing::info!(target: "strikeout::gate", event = %event, "gate_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl GateSink for LogSink {
    type SinkError = Infallible;
}

/// A sink that keeps events in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<GateEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<GateEvent> {
        self.events.lock().map(|e| e.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Number of events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Events of the `Skipped` kind, in arrival order.
    pub fn skipped(&self) -> Vec<GateEvent> {
        self.events().into_iter().filter(|e| matches!(e, GateEvent::Skipped { .. })).collect()
    }

    /// Events of the `Recorded` kind, in arrival order.
    pub fn recorded(&self) -> Vec<GateEvent> {
        self.events().into_iter().filter(|e| matches!(e, GateEvent::Recorded { .. })).collect()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<GateEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GateEvent) -> Self::Future {
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= self.capacity {
                events.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        Box::pin(async { Ok(()) })
    }
}

impl GateSink for MemorySink {
    type SinkError = Infallible;
}
