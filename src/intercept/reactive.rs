//! Reactive mode: gate one resource immediately before its own step.
//!
//! Semantics:
//! - The check runs first; on SKIP the wrapped service is never called and the caller
//!   gets [`Gated::Skipped`]. Sibling items in an enclosing loop are unaffected.
//! - With recording enabled the allowed call is recorded exactly once, on every exit
//!   path (see the `record` module). Skips are never recorded.
//! - A store outage resolves through the evaluator's failure mode; an invalid key fails
//!   the call with `GateError::InvalidKey`.

use crate::context::{JobId, ResourceId};
use crate::error::GateError;
use crate::evaluator::{RetryEvaluator, SkipReason, Verdict};
use crate::intercept::record::{run_and_record, AlwaysSuccess, Attempt, OutcomeClassifier};
use crate::intercept::ResourceBinding;
use crate::store::AttemptStore;
use crate::telemetry::{emit_best_effort, GateEvent, GateSink, NullSink};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Sentinel returned in place of a skipped step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipNotice {
    pub job_id: JobId,
    pub resource_id: ResourceId,
    pub reason: SkipReason,
}

/// Result of a gated step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gated<R> {
    /// The step ran and produced `R`.
    Ran(R),
    /// The step was bypassed.
    Skipped(SkipNotice),
}

impl<R> Gated<R> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Gated::Skipped(_))
    }

    pub fn ran(self) -> Option<R> {
        match self {
            Gated::Ran(r) => Some(r),
            Gated::Skipped(_) => None,
        }
    }

    pub fn skip_notice(&self) -> Option<&SkipNotice> {
        match self {
            Gated::Skipped(notice) => Some(notice),
            Gated::Ran(_) => None,
        }
    }
}

/// Tower layer gating single-resource steps.
pub struct ReactiveGateLayer<St: ?Sized, Req, C = AlwaysSuccess, K = NullSink> {
    evaluator: RetryEvaluator<St>,
    binding: ResourceBinding<Req>,
    record: bool,
    classifier: Arc<C>,
    sink: K,
}

impl<St, Req> ReactiveGateLayer<St, Req>
where
    St: AttemptStore + ?Sized,
{
    /// Check-only gate.
    pub fn new(evaluator: RetryEvaluator<St>, binding: ResourceBinding<Req>) -> Self {
        Self { evaluator, binding, record: false, classifier: Arc::new(AlwaysSuccess), sink: NullSink }
    }
}

impl<St: ?Sized, Req, C, K> ReactiveGateLayer<St, Req, C, K> {
    /// Also record the outcome of every allowed call.
    pub fn recording(mut self) -> Self {
        self.record = true;
        self
    }

    /// Record outcomes, classifying normal responses with `classifier`.
    pub fn classify_with<C2>(self, classifier: C2) -> ReactiveGateLayer<St, Req, C2, K>
    where
        C2: Send + Sync + 'static,
    {
        ReactiveGateLayer {
            evaluator: self.evaluator,
            binding: self.binding,
            record: true,
            classifier: Arc::new(classifier),
            sink: self.sink,
        }
    }

    /// Emit gate events to `sink`.
    pub fn with_sink<K2>(self, sink: K2) -> ReactiveGateLayer<St, Req, C, K2>
    where
        K2: GateSink,
    {
        ReactiveGateLayer {
            evaluator: self.evaluator,
            binding: self.binding,
            record: self.record,
            classifier: self.classifier,
            sink,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.record
    }
}

impl<St: ?Sized, Req, C, K: Clone> Clone for ReactiveGateLayer<St, Req, C, K> {
    fn clone(&self) -> Self {
        Self {
            evaluator: self.evaluator.clone(),
            binding: self.binding.clone(),
            record: self.record,
            classifier: self.classifier.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<St: ?Sized, Req, C, K> fmt::Debug for ReactiveGateLayer<St, Req, C, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveGateLayer")
            .field("operation", &self.binding.operation_name())
            .field("record", &self.record)
            .field("evaluator", &self.evaluator)
            .finish()
    }
}

impl<Svc, St: ?Sized, Req, C, K: Clone> Layer<Svc> for ReactiveGateLayer<St, Req, C, K> {
    type Service = ReactiveGateService<Svc, St, Req, C, K>;

    fn layer(&self, inner: Svc) -> Self::Service {
        ReactiveGateService { inner, layer: self.clone() }
    }
}

/// Service produced by [`ReactiveGateLayer`].
pub struct ReactiveGateService<Svc, St: ?Sized, Req, C, K> {
    inner: Svc,
    layer: ReactiveGateLayer<St, Req, C, K>,
}

impl<Svc: Clone, St: ?Sized, Req, C, K: Clone> Clone for ReactiveGateService<Svc, St, Req, C, K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<Svc, St, Req, C, K> Service<Req> for ReactiveGateService<Svc, St, Req, C, K>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Response: Send + 'static,
    Svc::Error: fmt::Display + Send + 'static,
    Svc::Future: Send + 'static,
    St: AttemptStore + ?Sized + 'static,
    Req: Send + 'static,
    C: OutcomeClassifier<Svc::Response>,
    K: GateSink,
    K::Future: Send,
{
    type Response = Gated<Svc::Response>;
    type Error = GateError<Svc::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();
        Box::pin(gate_call(inner, layer, req))
    }
}

async fn gate_call<Svc, St, Req, C, K>(
    mut inner: Svc,
    layer: ReactiveGateLayer<St, Req, C, K>,
    req: Req,
) -> Result<Gated<Svc::Response>, GateError<Svc::Error>>
where
    Svc: Service<Req>,
    Svc::Error: fmt::Display,
    St: AttemptStore + ?Sized,
    C: OutcomeClassifier<Svc::Response>,
    K: GateSink,
    K::Future: Send,
{
    let context = layer.binding.context_of(&req);
    let resource = layer.binding.resource_of(&req);
    let operation = layer.binding.operation_name();

    let verdict = layer.evaluator.verdict(&context, &resource).await?;
    match verdict {
        Verdict::Skip(reason) => {
            tracing::debug!(
                target: "strikeout::gate",
                operation,
                job = %context.job_id(),
                resource = %resource,
                reason = %reason,
                "step skipped"
            );
            let notice = SkipNotice {
                job_id: context.job_id().clone(),
                resource_id: resource,
                reason,
            };
            emit_best_effort(
                layer.sink.clone(),
                GateEvent::Skipped {
                    job_id: notice.job_id.clone(),
                    resource_id: notice.resource_id.clone(),
                    reason: notice.reason.clone(),
                },
            )
            .await;
            return Ok(Gated::Skipped(notice));
        }
        Verdict::Allow { degraded: Some(reason) } => {
            emit_best_effort(
                layer.sink.clone(),
                GateEvent::StoreDegraded {
                    job_id: context.job_id().clone(),
                    resource_id: resource.clone(),
                    reason,
                    mode: layer.evaluator.failure_mode(),
                },
            )
            .await;
        }
        Verdict::Allow { degraded: None } => {
            emit_best_effort(
                layer.sink.clone(),
                GateEvent::Allowed { job_id: context.job_id().clone(), resource_id: resource.clone() },
            )
            .await;
        }
    }

    if !layer.record {
        return inner.call(req).await.map(Gated::Ran).map_err(GateError::Inner);
    }
    let attempt = Attempt {
        evaluator: &layer.evaluator,
        context: &context,
        resource: &resource,
        operation,
        sink: &layer.sink,
    };
    run_and_record(inner, req, layer.classifier.as_ref(), attempt).await.map(Gated::Ran)
}
