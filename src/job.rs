//! Driver-facing entry point.
//!
//! The batch driver owns one [`RetryJobs`] (store + failure mode) and asks it
//! for a [`JobRun`] whenever a job starts. A `JobRun` bundles the immutable
//! context with an evaluator over the shared store; it is cheap to clone and
//! can be handed to every worker of the run.

use crate::config::{JobPolicy, PolicyTable, StoreFailureMode};
use crate::context::{JobId, ResourceId, RetryJobContext};
use crate::error::{PolicyError, StoreError};
use crate::evaluator::RetryEvaluator;
use crate::gate::RetryGate;
use crate::store::{AttemptRecord, AttemptStore, LastOutcome};
use std::sync::Arc;

/// Factory for job runs sharing one attempt store.
pub struct RetryJobs<S: ?Sized> {
    evaluator: RetryEvaluator<S>,
}

impl<S: ?Sized> Clone for RetryJobs<S> {
    fn clone(&self) -> Self {
        Self { evaluator: self.evaluator.clone() }
    }
}

impl<S> RetryJobs<S>
where
    S: AttemptStore,
{
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }
}

impl<S> RetryJobs<S>
where
    S: AttemptStore + ?Sized,
{
    pub fn from_shared(store: Arc<S>) -> Self {
        Self { evaluator: RetryEvaluator::from_shared(store) }
    }

    /// Allow checks to proceed when the store is unreachable.
    pub fn fail_open(self) -> Self {
        self.with_failure_mode(StoreFailureMode::FailOpen)
    }

    pub fn with_failure_mode(mut self, mode: StoreFailureMode) -> Self {
        self.evaluator = self.evaluator.with_failure_mode(mode);
        self
    }

    /// Start a job run. Fails with `InvalidMaxAttempts` when `max_attempts <= 0`.
    pub fn new_context(
        &self,
        job_id: impl Into<JobId>,
        max_attempts: i64,
    ) -> Result<JobRun<S>, PolicyError> {
        let context = RetryJobContext::new(job_id, max_attempts)?;
        tracing::debug!(target: "strikeout::job", job = %context.job_id(), max_attempts = context.max_attempts(), "job run started");
        Ok(JobRun { context, evaluator: self.evaluator.clone() })
    }

    /// Start a job run from a configured policy, including its failure mode.
    pub fn start(&self, job_id: impl Into<JobId>, policy: &JobPolicy) -> Result<JobRun<S>, PolicyError> {
        let mut run = self.new_context(job_id, policy.max_attempts)?;
        run.evaluator = run.evaluator.with_failure_mode(policy.on_store_unavailable);
        Ok(run)
    }

    /// Start a run of `job_name` under whatever policy `table` holds for it right now.
    /// Later table updates do not touch runs already started.
    pub fn start_named(&self, table: &PolicyTable, job_name: &str) -> Result<JobRun<S>, PolicyError> {
        self.start(job_name, &table.policy_for(job_name))
    }

    pub fn evaluator(&self) -> &RetryEvaluator<S> {
        &self.evaluator
    }
}

/// One running job: its context plus the evaluator bound to the shared store.
pub struct JobRun<S: ?Sized> {
    context: RetryJobContext,
    evaluator: RetryEvaluator<S>,
}

impl<S: ?Sized> Clone for JobRun<S> {
    fn clone(&self) -> Self {
        Self { context: self.context.clone(), evaluator: self.evaluator.clone() }
    }
}

impl<S> JobRun<S>
where
    S: AttemptStore + ?Sized,
{
    pub fn context(&self) -> &RetryJobContext {
        &self.context
    }

    pub fn evaluator(&self) -> &RetryEvaluator<S> {
        &self.evaluator
    }

    /// Layer factory bound to this run's evaluator.
    pub fn gate(&self) -> RetryGate<S> {
        RetryGate::new(self.evaluator.clone())
    }

    /// Current ledger entry for `resource` in this run's job.
    pub async fn attempts(&self, resource: &ResourceId) -> Result<AttemptRecord, StoreError> {
        self.evaluator.attempts(&self.context, resource).await
    }

    /// End-of-run summary built from the job's ledger.
    pub async fn report(&self) -> Result<JobReport, StoreError> {
        let records = self.evaluator.store().snapshot(self.context.job_id()).await?;
        Ok(JobReport::from_records(&self.context, records))
    }
}

/// Summary of a job's ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: JobId,
    pub max_attempts: u64,
    /// Resources with at least one recorded attempt.
    pub attempted: usize,
    /// Total attempts across all resources.
    pub total_attempts: u64,
    /// Resources whose last attempt succeeded.
    pub succeeded: Vec<ResourceId>,
    /// Resources that failed last and still have attempts left.
    pub retryable: Vec<ResourceId>,
    /// Resources that reached the threshold without a final success.
    pub exhausted: Vec<ResourceId>,
}

impl JobReport {
    fn from_records(context: &RetryJobContext, records: Vec<(ResourceId, AttemptRecord)>) -> Self {
        let max_attempts = context.max_attempts();
        let mut report = JobReport {
            job_id: context.job_id().clone(),
            max_attempts,
            attempted: records.len(),
            total_attempts: 0,
            succeeded: Vec::new(),
            retryable: Vec::new(),
            exhausted: Vec::new(),
        };
        for (id, record) in records {
            report.total_attempts += record.attempt_count;
            match record.last_outcome {
                LastOutcome::Success => report.succeeded.push(id),
                _ if record.attempt_count >= max_attempts => report.exhausted.push(id),
                LastOutcome::Failure => report.retryable.push(id),
                LastOutcome::None => {}
            }
        }
        report
    }
}
