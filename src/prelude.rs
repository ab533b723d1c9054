//! Convenient re-exports for common Strikeout types.
pub use crate::{
    config::{JobPolicy, PolicyTable, StoreFailureMode},
    context::{JobId, ResourceId, ResourceRef, RetryJobContext},
    error::{GateError, PolicyError, StoreError},
    evaluator::{Decision, RetryEvaluator, SkipReason, SkipReport},
    gate::RetryGate,
    intercept::{CollectionBinding, Filtered, Gated, OutcomeClassifier, ResourceBinding},
    job::{JobReport, JobRun, RetryJobs},
    store::{AttemptOutcome, AttemptRecord, AttemptStore, InMemoryAttemptStore, LastOutcome},
    telemetry::{GateEvent, GateSink, LogSink, MemorySink},
};
