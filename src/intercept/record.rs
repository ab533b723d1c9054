//! Update mode: record the outcome of every real invocation.
//!
//! Semantics:
//! - The key is validated before the operation runs; an invalid key aborts the call
//!   without invoking anything.
//! - `Ok` responses are SUCCESS unless the [`OutcomeClassifier`] reports a domain
//!   failure.
//! - `Err` responses are FAILURE with the error's `Display` text; the original error is
//!   returned unchanged even when recording fails (the store error is logged).
//! - A panic inside the operation is recorded as FAILURE and then resumed.
//! - A successful response whose attempt could not be recorded is turned into
//!   `GateError::StoreUnavailable`.

use crate::context::{ResourceId, RetryJobContext};
use crate::error::{GateError, StoreError};
use crate::evaluator::RetryEvaluator;
use crate::intercept::ResourceBinding;
use crate::store::{validate_key, AttemptOutcome, AttemptRecord, AttemptStore, LastOutcome};
use crate::telemetry::{emit_best_effort, GateEvent, GateSink, NullSink};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Decides whether a normal response is a domain-level failure.
pub trait OutcomeClassifier<R>: Send + Sync + 'static {
    /// `Some(detail)` marks the attempt as FAILURE.
    fn failure_detail(&self, response: &R) -> Option<String>;
}

/// Treats every `Ok` response as SUCCESS.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSuccess;

impl<R> OutcomeClassifier<R> for AlwaysSuccess {
    fn failure_detail(&self, _response: &R) -> Option<String> {
        None
    }
}

impl<R, F> OutcomeClassifier<R> for F
where
    F: Fn(&R) -> Option<String> + Send + Sync + 'static,
{
    fn failure_detail(&self, response: &R) -> Option<String> {
        self(response)
    }
}

/// Tower layer recording one attempt per invocation.
pub struct RecordOutcomeLayer<St: ?Sized, Req, C = AlwaysSuccess, K = NullSink> {
    evaluator: RetryEvaluator<St>,
    binding: ResourceBinding<Req>,
    classifier: Arc<C>,
    sink: K,
}

impl<St, Req> RecordOutcomeLayer<St, Req>
where
    St: AttemptStore + ?Sized,
{
    pub fn new(evaluator: RetryEvaluator<St>, binding: ResourceBinding<Req>) -> Self {
        Self { evaluator, binding, classifier: Arc::new(AlwaysSuccess), sink: NullSink }
    }
}

impl<St: ?Sized, Req, C, K> RecordOutcomeLayer<St, Req, C, K> {
    /// Classify normal responses as SUCCESS or domain FAILURE.
    pub fn classify_with<C2>(self, classifier: C2) -> RecordOutcomeLayer<St, Req, C2, K>
    where
        C2: Send + Sync + 'static,
    {
        RecordOutcomeLayer {
            evaluator: self.evaluator,
            binding: self.binding,
            classifier: Arc::new(classifier),
            sink: self.sink,
        }
    }

    /// Emit `Recorded` events to `sink`.
    pub fn with_sink<K2>(self, sink: K2) -> RecordOutcomeLayer<St, Req, C, K2>
    where
        K2: GateSink,
    {
        RecordOutcomeLayer {
            evaluator: self.evaluator,
            binding: self.binding,
            classifier: self.classifier,
            sink,
        }
    }
}

impl<St: ?Sized, Req, C, K: Clone> Clone for RecordOutcomeLayer<St, Req, C, K> {
    fn clone(&self) -> Self {
        Self {
            evaluator: self.evaluator.clone(),
            binding: self.binding.clone(),
            classifier: self.classifier.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<St: ?Sized, Req, C, K> fmt::Debug for RecordOutcomeLayer<St, Req, C, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordOutcomeLayer")
            .field("operation", &self.binding.operation_name())
            .field("evaluator", &self.evaluator)
            .finish()
    }
}

impl<Svc, St: ?Sized, Req, C, K: Clone> Layer<Svc> for RecordOutcomeLayer<St, Req, C, K> {
    type Service = RecordOutcomeService<Svc, St, Req, C, K>;

    fn layer(&self, inner: Svc) -> Self::Service {
        RecordOutcomeService { inner, layer: self.clone() }
    }
}

/// Service produced by [`RecordOutcomeLayer`].
pub struct RecordOutcomeService<Svc, St: ?Sized, Req, C, K> {
    inner: Svc,
    layer: RecordOutcomeLayer<St, Req, C, K>,
}

impl<Svc: Clone, St: ?Sized, Req, C, K: Clone> Clone for RecordOutcomeService<Svc, St, Req, C, K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<Svc, St, Req, C, K> Service<Req> for RecordOutcomeService<Svc, St, Req, C, K>
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
    type Response = Svc::Response;
    type Error = GateError<Svc::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();
        Box::pin(record_call(inner, layer, req))
    }
}

async fn record_call<Svc, St, Req, C, K>(
    inner: Svc,
    layer: RecordOutcomeLayer<St, Req, C, K>,
    req: Req,
) -> Result<Svc::Response, GateError<Svc::Error>>
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
    validate_key(context.job_id(), &resource)?;
    let attempt = Attempt {
        evaluator: &layer.evaluator,
        context: &context,
        resource: &resource,
        operation: layer.binding.operation_name(),
        sink: &layer.sink,
    };
    run_and_record(inner, req, layer.classifier.as_ref(), attempt).await
}

/// Everything needed to write one attempt to the ledger.
pub(crate) struct Attempt<'a, St: ?Sized, K> {
    pub(crate) evaluator: &'a RetryEvaluator<St>,
    pub(crate) context: &'a RetryJobContext,
    pub(crate) resource: &'a ResourceId,
    pub(crate) operation: &'a str,
    pub(crate) sink: &'a K,
}

impl<St, K> Attempt<'_, St, K>
where
    St: AttemptStore + ?Sized,
    K: GateSink,
    K::Future: Send,
{
    pub(crate) async fn write(&self, outcome: AttemptOutcome) -> Result<AttemptRecord, StoreError> {
        let last = if outcome.is_failure() { LastOutcome::Failure } else { LastOutcome::Success };
        let record = self.evaluator.record_outcome(self.context, self.resource, outcome).await?;
        tracing::debug!(
            target: "strikeout::gate",
            operation = self.operation,
            job = %self.context.job_id(),
            resource = %self.resource,
            outcome = ?last,
            attempts = record.attempt_count,
            "attempt recorded"
        );
        emit_best_effort(
            self.sink.clone(),
            GateEvent::Recorded {
                job_id: self.context.job_id().clone(),
                resource_id: self.resource.clone(),
                outcome: last,
                attempt_count: record.attempt_count,
            },
        )
        .await;
        Ok(record)
    }

    pub(crate) fn log_lost(&self, err: &StoreError) {
        tracing::error!(
            target: "strikeout::gate",
            operation = self.operation,
            job = %self.context.job_id(),
            resource = %self.resource,
            error = %err,
            "failed to record attempt"
        );
    }
}

/// How one invocation of the wrapped operation ended.
pub(crate) enum Completion<R, E> {
    Returned(R),
    Failed(E),
    Panicked(Box<dyn Any + Send>),
}

impl<R, E: fmt::Display> Completion<R, E> {
    /// Call `inner` once, catching a panic instead of unwinding through the gate.
    pub(crate) async fn of<Svc, Req>(mut inner: Svc, req: Req) -> Self
    where
        Svc: Service<Req, Response = R, Error = E>,
    {
        match AssertUnwindSafe(async move { inner.call(req).await }).catch_unwind().await {
            Ok(Ok(response)) => Completion::Returned(response),
            Ok(Err(err)) => Completion::Failed(err),
            Err(panic) => Completion::Panicked(panic),
        }
    }

    pub(crate) fn returned(&self) -> bool {
        matches!(self, Completion::Returned(_))
    }

    /// The ledger outcome for this completion.
    pub(crate) fn outcome<C>(&self, classifier: &C) -> AttemptOutcome
    where
        C: OutcomeClassifier<R> + ?Sized,
    {
        match self {
            Completion::Returned(response) => match classifier.failure_detail(response) {
                Some(detail) => AttemptOutcome::Failure { detail },
                None => AttemptOutcome::Success,
            },
            Completion::Failed(err) => AttemptOutcome::failure(err.to_string()),
            Completion::Panicked(panic) => {
                AttemptOutcome::failure(format!("operation panicked: {}", panic_message(panic.as_ref())))
            }
        }
    }

    /// Hand the operation's result back to the caller.
    ///
    /// A failed write only surfaces when the operation returned normally; otherwise the
    /// operation's own error (or panic) wins and the caller is expected to have logged
    /// the lost write.
    pub(crate) fn settle(self, recorded: Result<(), StoreError>) -> Result<R, GateError<E>> {
        match self {
            Completion::Returned(response) => {
                recorded?;
                Ok(response)
            }
            Completion::Failed(err) => Err(GateError::Inner(err)),
            Completion::Panicked(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Invoke `inner` once and record the attempt on every exit path.
pub(crate) async fn run_and_record<Svc, Req, St, C, K>(
    inner: Svc,
    req: Req,
    classifier: &C,
    attempt: Attempt<'_, St, K>,
) -> Result<Svc::Response, GateError<Svc::Error>>
where
    Svc: Service<Req>,
    Svc::Error: fmt::Display,
    St: AttemptStore + ?Sized,
    C: OutcomeClassifier<Svc::Response>,
    K: GateSink,
    K::Future: Send,
{
    let completion = Completion::of(inner, req).await;
    let recorded = attempt.write(completion.outcome(classifier)).await.map(drop);
    if let Err(err) = &recorded {
        if !completion.returned() {
            attempt.log_lost(err);
        }
    }
    completion.settle(recorded)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
