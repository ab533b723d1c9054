//! Retry policy evaluation.
//!
//! Semantics:
//! - A resource is SKIP once `attempt_count >= max_attempts`; `max_attempts = 3` permits
//!   exactly three attempts.
//! - Absent records read as zero attempts, so unseen resources are always ALLOW.
//! - Outcomes are recorded only for resources that were actually attempted. Nothing here
//!   increments on a skip.
//! - A store outage on the check path resolves through [`StoreFailureMode`]; on the record
//!   path it is returned to the caller.
//!
//! Invariants:
//! - `filter_eligible` keeps input order inside both partitions.
//! - Checks never write to the store.

use crate::config::StoreFailureMode;
use crate::context::{JobId, ResourceId, ResourceRef, RetryJobContext};
use crate::error::StoreError;
use crate::store::{AttemptOutcome, AttemptRecord, AttemptStore};
use std::fmt;
use std::sync::Arc;

/// Gate decision for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Another attempt may run.
    Allow,
    /// The resource must not be attempted.
    Skip,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Decision::Skip)
    }
}

/// Why a resource was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The resource used up its attempts.
    Exhausted { attempts: u64, max_attempts: u64 },
    /// The store could not be read and the job fails closed.
    StoreUnavailable { reason: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Exhausted { attempts, max_attempts } => {
                write!(f, "exhausted ({} of {} attempts used)", attempts, max_attempts)
            }
            SkipReason::StoreUnavailable { reason } => {
                write!(f, "attempt store unavailable, failing closed: {}", reason)
            }
        }
    }
}

/// Detailed check result used by the interception layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Proceed. `degraded` carries the store error when a fail-open job allowed blindly.
    Allow { degraded: Option<String> },
    Skip(SkipReason),
}

impl Verdict {
    pub fn decision(&self) -> Decision {
        match self {
            Verdict::Allow { .. } => Decision::Allow,
            Verdict::Skip(_) => Decision::Skip,
        }
    }
}

/// One skipped resource in a [`SkipReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedResource {
    pub resource_id: ResourceId,
    pub reason: SkipReason,
}

/// Skipped resources of one proactive filter pass, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipReport {
    pub job_id: JobId,
    pub entries: Vec<SkippedResource>,
}

impl SkipReport {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id, entries: Vec::new() }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resource_ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.entries.iter().map(|e| &e.resource_id)
    }
}

/// Result of [`RetryEvaluator::filter_eligible`].
#[derive(Debug, Clone)]
pub struct Partition<T> {
    pub eligible: Vec<T>,
    pub skipped: Vec<T>,
    pub report: SkipReport,
}

/// The pure threshold law: SKIP iff `attempt_count >= max_attempts`.
pub fn evaluate(context: &RetryJobContext, record: &AttemptRecord) -> Decision {
    if record.attempt_count >= context.max_attempts() {
        Decision::Skip
    } else {
        Decision::Allow
    }
}

/// Policy evaluator bound to one attempt store.
pub struct RetryEvaluator<S: ?Sized> {
    store: Arc<S>,
    failure_mode: StoreFailureMode,
}

impl<S: ?Sized> Clone for RetryEvaluator<S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), failure_mode: self.failure_mode }
    }
}

impl<S: ?Sized> fmt::Debug for RetryEvaluator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEvaluator")
            .field("store", &"<attempt store>")
            .field("failure_mode", &self.failure_mode)
            .finish()
    }
}

impl<S> RetryEvaluator<S>
where
    S: AttemptStore,
{
    /// Fail-closed evaluator owning `store`.
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }
}

impl<S> RetryEvaluator<S>
where
    S: AttemptStore + ?Sized,
{
    /// Fail-closed evaluator over a shared store.
    pub fn from_shared(store: Arc<S>) -> Self {
        Self { store, failure_mode: StoreFailureMode::FailClosed }
    }

    /// Choose what checks do when the store is unreachable.
    pub fn with_failure_mode(mut self, mode: StoreFailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn failure_mode(&self) -> StoreFailureMode {
        self.failure_mode
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// See [`evaluate`].
    pub fn evaluate(&self, context: &RetryJobContext, record: &AttemptRecord) -> Decision {
        evaluate(context, record)
    }

    /// Reactive gate for a single resource.
    pub async fn check_one(
        &self,
        context: &RetryJobContext,
        resource: &ResourceId,
    ) -> Result<Decision, StoreError> {
        self.verdict(context, resource).await.map(|v| v.decision())
    }

    /// Like [`check_one`](Self::check_one), keeping the skip reason.
    pub async fn verdict(
        &self,
        context: &RetryJobContext,
        resource: &ResourceId,
    ) -> Result<Verdict, StoreError> {
        let read = self.store.get(context.job_id(), resource).await;
        self.resolve(context, resource, read)
    }

    /// Partition `resources` into eligible and skipped, preserving input order.
    pub async fn filter_eligible<P>(
        &self,
        context: &RetryJobContext,
        resources: Vec<ResourceRef<P>>,
    ) -> Result<Partition<ResourceRef<P>>, StoreError> {
        self.filter_eligible_by(context, resources, |r| r.id().clone()).await
    }

    /// [`filter_eligible`](Self::filter_eligible) for any item type, given its identity.
    pub async fn filter_eligible_by<T, F>(
        &self,
        context: &RetryJobContext,
        items: Vec<T>,
        resource_id: F,
    ) -> Result<Partition<T>, StoreError>
    where
        F: Fn(&T) -> ResourceId,
    {
        let ids: Vec<ResourceId> = items.iter().map(&resource_id).collect();
        let verdicts: Vec<Verdict> = match self.store.get_many(context.job_id(), &ids).await {
            Ok(records) => ids
                .iter()
                .zip(records)
                .map(|(id, record)| self.resolve(context, id, Ok(record)))
                .collect::<Result<_, _>>()?,
            Err(err @ StoreError::InvalidKey { .. }) => return Err(err),
            Err(err) => ids
                .iter()
                .map(|id| self.resolve(context, id, Err(err.clone())))
                .collect::<Result<_, _>>()?,
        };

        let mut partition = Partition {
            eligible: Vec::with_capacity(items.len()),
            skipped: Vec::new(),
            report: SkipReport::new(context.job_id().clone()),
        };
        for ((item, id), verdict) in items.into_iter().zip(ids).zip(verdicts) {
            match verdict {
                Verdict::Allow { .. } => partition.eligible.push(item),
                Verdict::Skip(reason) => {
                    partition.skipped.push(item);
                    partition.report.entries.push(SkippedResource { resource_id: id, reason });
                }
            }
        }
        tracing::debug!(
            target: "strikeout::evaluator",
            job = %context.job_id(),
            eligible = partition.eligible.len(),
            skipped = partition.skipped.len(),
            "batch filtered"
        );
        Ok(partition)
    }

    /// Record one actual attempt. Call exactly once per invocation, never for a skip.
    pub async fn record_outcome(
        &self,
        context: &RetryJobContext,
        resource: &ResourceId,
        outcome: AttemptOutcome,
    ) -> Result<AttemptRecord, StoreError> {
        self.store.increment(context.job_id(), resource, outcome).await
    }

    /// Current ledger entry, for reporting.
    pub async fn attempts(
        &self,
        context: &RetryJobContext,
        resource: &ResourceId,
    ) -> Result<AttemptRecord, StoreError> {
        self.store.get(context.job_id(), resource).await
    }

    fn resolve(
        &self,
        context: &RetryJobContext,
        resource: &ResourceId,
        read: Result<AttemptRecord, StoreError>,
    ) -> Result<Verdict, StoreError> {
        match read {
            Ok(record) => Ok(match evaluate(context, &record) {
                Decision::Allow => Verdict::Allow { degraded: None },
                Decision::Skip => Verdict::Skip(SkipReason::Exhausted {
                    attempts: record.attempt_count,
                    max_attempts: context.max_attempts(),
                }),
            }),
            Err(StoreError::Unavailable { reason }) => match self.failure_mode {
                StoreFailureMode::FailClosed => {
                    tracing::warn!(
                        target: "strikeout::evaluator",
                        job = %context.job_id(),
                        resource = %resource,
                        error = %reason,
                        "attempt store unavailable; skipping (fail-closed)"
                    );
                    Ok(Verdict::Skip(SkipReason::StoreUnavailable { reason }))
                }
                StoreFailureMode::FailOpen => {
                    tracing::warn!(
                        target: "strikeout::evaluator",
                        job = %context.job_id(),
                        resource = %resource,
                        error = %reason,
                        "attempt store unavailable; allowing (fail-open)"
                    );
                    Ok(Verdict::Allow { degraded: Some(reason) })
                }
            },
            Err(err) => Err(err),
        }
    }
}
