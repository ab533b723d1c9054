//! Layer factory for one job run.
//!
//! [`RetryGate`] carries the evaluator (store + failure mode) and an optional event sink,
//! and hands out the interception layers already wired to both. Which check mode an
//! operation gets is decided here, per operation, by picking the layer:
//!
//! ```text
//! proactive(binding)          -> ProactiveFilterLayer   filter the batch
//! proactive_recorded(binding) -> ProactiveFilterLayer   filter -> execute -> record each item run
//! reactive(binding)           -> ReactiveGateLayer      check-only per-item gate
//! record(binding)             -> RecordOutcomeLayer     record every invocation
//! reactive_recorded(binding)  -> ReactiveGateLayer      check -> execute -> record
//! ```

use crate::evaluator::RetryEvaluator;
use crate::intercept::{
    AlwaysSuccess, CollectionBinding, ProactiveFilterLayer, ReactiveGateLayer, RecordOutcomeLayer,
    ResourceBinding,
};
use crate::store::AttemptStore;
use crate::telemetry::{GateSink, NullSink};
use std::fmt;

/// Builds interception layers bound to one evaluator and sink.
pub struct RetryGate<St: ?Sized, K = NullSink> {
    evaluator: RetryEvaluator<St>,
    sink: K,
}

impl<St> RetryGate<St>
where
    St: AttemptStore + ?Sized,
{
    pub fn new(evaluator: RetryEvaluator<St>) -> Self {
        Self { evaluator, sink: NullSink }
    }
}

impl<St, K> RetryGate<St, K>
where
    St: AttemptStore + ?Sized,
    K: GateSink,
{
    /// Send the events of every layer built from here on to `sink`.
    pub fn with_sink<K2: GateSink>(self, sink: K2) -> RetryGate<St, K2> {
        RetryGate { evaluator: self.evaluator, sink }
    }

    pub fn evaluator(&self) -> &RetryEvaluator<St> {
        &self.evaluator
    }

    /// Filter the bound collection before the operation runs.
    pub fn proactive<Req, T>(
        &self,
        binding: CollectionBinding<Req, T>,
    ) -> ProactiveFilterLayer<St, Req, T, AlwaysSuccess, K> {
        ProactiveFilterLayer::new(self.evaluator.clone(), binding).with_sink(self.sink.clone())
    }

    /// Filter the collection, run, and record one attempt per item the operation saw.
    pub fn proactive_recorded<Req, T>(
        &self,
        binding: CollectionBinding<Req, T>,
    ) -> ProactiveFilterLayer<St, Req, T, AlwaysSuccess, K> {
        self.proactive(binding).recording()
    }

    /// Gate the bound resource right before the step, without recording.
    pub fn reactive<Req>(
        &self,
        binding: ResourceBinding<Req>,
    ) -> ReactiveGateLayer<St, Req, AlwaysSuccess, K> {
        ReactiveGateLayer::new(self.evaluator.clone(), binding).with_sink(self.sink.clone())
    }

    /// Record the outcome of every invocation, without checking first.
    pub fn record<Req>(
        &self,
        binding: ResourceBinding<Req>,
    ) -> RecordOutcomeLayer<St, Req, AlwaysSuccess, K> {
        RecordOutcomeLayer::new(self.evaluator.clone(), binding).with_sink(self.sink.clone())
    }

    /// Gate, run, and record: nothing is recorded for a skipped step.
    pub fn reactive_recorded<Req>(
        &self,
        binding: ResourceBinding<Req>,
    ) -> ReactiveGateLayer<St, Req, AlwaysSuccess, K> {
        self.reactive(binding).recording()
    }
}

impl<St: ?Sized, K: Clone> Clone for RetryGate<St, K> {
    fn clone(&self) -> Self {
        Self { evaluator: self.evaluator.clone(), sink: self.sink.clone() }
    }
}

impl<St: ?Sized, K> fmt::Debug for RetryGate<St, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryGate").field("evaluator", &self.evaluator).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ResourceId, RetryJobContext};
    use crate::job::RetryJobs;
    use crate::store::InMemoryAttemptStore;
    use crate::telemetry::{GateEvent, MemorySink};
    use tower::{service_fn, Layer, ServiceExt};

    #[derive(Clone)]
    struct Visit {
        ctx: RetryJobContext,
        id: &'static str,
    }

    fn binding() -> ResourceBinding<Visit> {
        ResourceBinding::new(|v: &Visit| v.ctx.clone(), |v: &Visit| ResourceId::from(v.id))
            .operation("checkout")
    }

    #[tokio::test]
    async fn layers_share_the_run_sink() {
        let jobs = RetryJobs::new(InMemoryAttemptStore::new());
        let run = jobs.new_context("nightly", 1).unwrap();
        let sink = MemorySink::new();
        let gate = run.gate().with_sink(sink.clone());

        let svc = gate
            .reactive_recorded(binding())
            .layer(service_fn(|_v: Visit| async { Ok::<_, std::io::Error>("done") }));
        let visit = Visit { ctx: run.context().clone(), id: "v1" };

        assert_eq!(svc.clone().oneshot(visit.clone()).await.unwrap().ran(), Some("done"));
        assert!(svc.oneshot(visit).await.unwrap().is_skipped());

        let events = sink.events();
        assert!(matches!(events[0], GateEvent::Allowed { .. }));
        assert!(matches!(events[1], GateEvent::Recorded { attempt_count: 1, .. }));
        assert!(matches!(events[2], GateEvent::Skipped { .. }));
        assert_eq!(run.attempts(&ResourceId::from("v1")).await.unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn reactive_alone_does_not_record() {
        let jobs = RetryJobs::new(InMemoryAttemptStore::new());
        let run = jobs.new_context("nightly", 1).unwrap();
        let layer = run.gate().reactive(binding());
        assert!(!layer.is_recording());
        assert!(run.gate().reactive_recorded(binding()).is_recording());
    }

    #[test]
    fn proactive_records_only_when_asked() {
        let jobs = RetryJobs::new(InMemoryAttemptStore::new());
        let run = jobs.new_context("nightly", 1).unwrap();
        let visits = || {
            CollectionBinding::new(
                |b: &(RetryJobContext, Vec<String>)| b.0.clone(),
                |b: &mut (RetryJobContext, Vec<String>)| &mut b.1,
                |id: &String| ResourceId::new(id.clone()),
            )
        };
        assert!(!run.gate().proactive(visits()).is_recording());
        assert!(run.gate().proactive_recorded(visits()).is_recording());
    }
}
