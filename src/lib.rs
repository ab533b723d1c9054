#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Strikeout
//!
//! Retry-attempt gating for batch jobs. A job re-runs over a set of resources;
//! Strikeout counts how many times each resource was actually attempted within
//! the job and keeps exhausted ones from being tried again.
//!
//! ## Features
//!
//! - **Attempt ledger**: per-(job, resource) counters behind the [`AttemptStore`] trait,
//!   with an in-memory implementation and a JSON-lines one in `strikeout-jsonl`
//! - **Threshold policy**: SKIP iff `attempt_count >= max_attempts`
//! - **Proactive filtering** of whole collections before a bulk step
//! - **Reactive gating** of a single resource right before its step
//! - **Outcome recording** after every real invocation, panics included
//! - **Store outage policy**: fail-closed by default, fail-open per job
//! - **Tower layers** for all of the above, plus pluggable telemetry sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use strikeout::prelude::*;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! #[derive(Clone)]
//! struct Checkout {
//!     ctx: RetryJobContext,
//!     visit: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let jobs = RetryJobs::new(InMemoryAttemptStore::new());
//!     let run = jobs.new_context("nightly-checkout", 2)?;
//!
//!     let checkout = run
//!         .gate()
//!         .reactive_recorded(ResourceBinding::new(
//!             |c: &Checkout| c.ctx.clone(),
//!             |c: &Checkout| ResourceId::new(c.visit.clone()),
//!         ))
//!         .layer(service_fn(|_c: Checkout| async {
//!             Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "gateway timeout"))
//!         }));
//!
//!     let req = Checkout { ctx: run.context().clone(), visit: "visit-42".into() };
//!     for _ in 0..2 {
//!         assert!(checkout.clone().oneshot(req.clone()).await.is_err());
//!     }
//!     // Third pass: the visit is exhausted and the step never runs.
//!     assert!(checkout.oneshot(req).await?.is_skipped());
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod gate;
pub mod intercept;
pub mod job;
pub mod prelude;
pub mod store;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DynamicConfig, JobPolicy, PolicyTable, StoreFailureMode};
pub use context::{JobId, ResourceId, ResourceRef, RetryJobContext};
pub use error::{GateError, PolicyError, StoreError};
pub use evaluator::{
    evaluate, Decision, Partition, RetryEvaluator, SkipReason, SkipReport, SkippedResource, Verdict,
};
pub use gate::RetryGate;
pub use intercept::{
    AlwaysSuccess, CollectionBinding, Filtered, Gated, OutcomeClassifier, ProactiveFilterLayer,
    ReactiveGateLayer, RecordOutcomeLayer, ResourceBinding, SkipNotice,
};
pub use job::{JobReport, JobRun, RetryJobs};
pub use store::{AttemptOutcome, AttemptRecord, AttemptStore, InMemoryAttemptStore, LastOutcome};
pub use telemetry::{GateEvent, GateSink, LogSink, MemorySink, NullSink};
