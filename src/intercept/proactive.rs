//! Proactive mode: filter a whole collection before a bulk operation runs.
//!
//! The collection is taken out of the request, partitioned against the ledger in one
//! `get_many` read, and only the eligible items are put back, in their original order.
//! The operation runs even when nothing is eligible. Skipped items are reported next to
//! the operation's own response and emitted as `Skipped` events.
//!
//! With [`ProactiveFilterLayer::recording`] the check is combined with an update: once
//! the operation returns (or panics) one attempt is recorded for every item that was
//! handed to it, all with the same outcome. Skipped items are never recorded. The
//! error and panic rules are those of the `record` module.

use crate::error::{GateError, StoreError};
use crate::evaluator::{RetryEvaluator, SkipReport};
use crate::intercept::record::{AlwaysSuccess, Attempt, Completion, OutcomeClassifier};
use crate::intercept::CollectionBinding;
use crate::store::AttemptStore;
use crate::telemetry::{emit_best_effort, GateEvent, GateSink, NullSink};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Response of a filtered bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filtered<R> {
    pub response: R,
    /// Items withheld from the operation.
    pub skipped: SkipReport,
}

impl<R> Filtered<R> {
    pub fn into_response(self) -> R {
        self.response
    }
}

/// Tower layer filtering the collection of a bulk request.
pub struct ProactiveFilterLayer<St: ?Sized, Req, T, C = AlwaysSuccess, K = NullSink> {
    evaluator: RetryEvaluator<St>,
    binding: CollectionBinding<Req, T>,
    record: bool,
    classifier: Arc<C>,
    sink: K,
}

impl<St, Req, T> ProactiveFilterLayer<St, Req, T>
where
    St: AttemptStore + ?Sized,
{
    /// Filter-only layer.
    pub fn new(evaluator: RetryEvaluator<St>, binding: CollectionBinding<Req, T>) -> Self {
        Self { evaluator, binding, record: false, classifier: Arc::new(AlwaysSuccess), sink: NullSink }
    }
}

impl<St: ?Sized, Req, T, C, K> ProactiveFilterLayer<St, Req, T, C, K> {
    /// Also record one attempt per eligible item once the operation finishes.
    pub fn recording(mut self) -> Self {
        self.record = true;
        self
    }

    /// Record outcomes, classifying the operation's normal response with `classifier`.
    pub fn classify_with<C2>(self, classifier: C2) -> ProactiveFilterLayer<St, Req, T, C2, K>
    where
        C2: Send + Sync + 'static,
    {
        ProactiveFilterLayer {
            evaluator: self.evaluator,
            binding: self.binding,
            record: true,
            classifier: Arc::new(classifier),
            sink: self.sink,
        }
    }

    /// Emit gate events to `sink`.
    pub fn with_sink<K2>(self, sink: K2) -> ProactiveFilterLayer<St, Req, T, C, K2>
    where
        K2: GateSink,
    {
        ProactiveFilterLayer {
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

impl<St: ?Sized, Req, T, C, K: Clone> Clone for ProactiveFilterLayer<St, Req, T, C, K> {
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

impl<St: ?Sized, Req, T, C, K> fmt::Debug for ProactiveFilterLayer<St, Req, T, C, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProactiveFilterLayer")
            .field("operation", &self.binding.operation_name())
            .field("record", &self.record)
            .field("evaluator", &self.evaluator)
            .finish()
    }
}

impl<Svc, St: ?Sized, Req, T, C, K: Clone> Layer<Svc> for ProactiveFilterLayer<St, Req, T, C, K> {
    type Service = ProactiveFilterService<Svc, St, Req, T, C, K>;

    fn layer(&self, inner: Svc) -> Self::Service {
        ProactiveFilterService { inner, layer: self.clone() }
    }
}

/// Service produced by [`ProactiveFilterLayer`].
pub struct ProactiveFilterService<Svc, St: ?Sized, Req, T, C, K> {
    inner: Svc,
    layer: ProactiveFilterLayer<St, Req, T, C, K>,
}

impl<Svc: Clone, St: ?Sized, Req, T, C, K: Clone> Clone for ProactiveFilterService<Svc, St, Req, T, C, K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<Svc, St, Req, T, C, K> Service<Req> for ProactiveFilterService<Svc, St, Req, T, C, K>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Response: Send + 'static,
    Svc::Error: fmt::Display + Send + 'static,
    Svc::Future: Send + 'static,
    St: AttemptStore + ?Sized + 'static,
    Req: Send + 'static,
    T: Send + 'static,
    C: OutcomeClassifier<Svc::Response>,
    K: GateSink,
    K::Future: Send,
{
    type Response = Filtered<Svc::Response>;
    type Error = GateError<Svc::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();
        Box::pin(filter_call(inner, layer, req))
    }
}

async fn filter_call<Svc, St, Req, T, C, K>(
    mut inner: Svc,
    layer: ProactiveFilterLayer<St, Req, T, C, K>,
    mut req: Req,
) -> Result<Filtered<Svc::Response>, GateError<Svc::Error>>
where
    Svc: Service<Req>,
    Svc::Error: fmt::Display,
    St: AttemptStore + ?Sized,
    C: OutcomeClassifier<Svc::Response>,
    K: GateSink,
    K::Future: Send,
{
    let binding = &layer.binding;
    let context = binding.context_of(&req);
    let items = std::mem::take(binding.items_of(&mut req));
    let offered = items.len();

    let partition = layer.evaluator.filter_eligible_by(&context, items, |item| binding.id_of(item)).await?;

    for entry in &partition.report.entries {
        emit_best_effort(
            layer.sink.clone(),
            GateEvent::Skipped {
                job_id: context.job_id().clone(),
                resource_id: entry.resource_id.clone(),
                reason: entry.reason.clone(),
            },
        )
        .await;
    }
    if !partition.report.is_empty() {
        tracing::debug!(
            target: "strikeout::gate",
            operation = binding.operation_name(),
            job = %context.job_id(),
            offered,
            skipped = partition.report.count(),
            "collection filtered"
        );
    }

    if !layer.record {
        *binding.items_of(&mut req) = partition.eligible;
        let response = inner.call(req).await.map_err(GateError::Inner)?;
        return Ok(Filtered { response, skipped: partition.report });
    }

    let handed: Vec<_> = partition.eligible.iter().map(|item| binding.id_of(item)).collect();
    *binding.items_of(&mut req) = partition.eligible;
    let completion = Completion::of(inner, req).await;
    let outcome = completion.outcome(layer.classifier.as_ref());

    // Every item gets its write even after one fails; the first failure is kept.
    let mut recorded: Result<(), StoreError> = Ok(());
    for resource in &handed {
        let attempt = Attempt {
            evaluator: &layer.evaluator,
            context: &context,
            resource,
            operation: binding.operation_name(),
            sink: &layer.sink,
        };
        if let Err(err) = attempt.write(outcome.clone()).await {
            attempt.log_lost(&err);
            if recorded.is_ok() {
                recorded = Err(err);
            }
        }
    }
    let response = completion.settle(recorded)?;
    Ok(Filtered { response, skipped: partition.report })
}
