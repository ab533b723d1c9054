//! Attempt ledger storage.
//!
//! - [`AttemptStore`]: keyed ledger mapping `(job, resource)` to an [`AttemptRecord`].
//! - [`InMemoryAttemptStore`]: process-local implementation (in the `memory` module).
//!
//! Stores know nothing about policy. They hand out records (an implicit zero
//! record when a key was never touched) and apply increments atomically per
//! key. Durable backends live in sibling crates and implement the same trait.

use crate::context::{JobId, ResourceId};
use crate::error::StoreError;
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;
pub use memory::InMemoryAttemptStore;

/// Outcome recorded on a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LastOutcome {
    /// No attempt recorded yet.
    #[default]
    None,
    Success,
    Failure,
}

/// The result of one attempt, as handed to [`AttemptStore::increment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure {
        /// Diagnostic detail captured from the failed operation.
        detail: String,
    },
}

impl AttemptOutcome {
    pub fn failure(detail: impl Into<String>) -> Self {
        Self::Failure { detail: detail.into() }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

/// Ledger entry for one `(job, resource)` pair.
///
/// Invariants:
/// - `attempt_count` never decreases.
/// - `last_error` is `Some` only when `last_outcome` is `Failure`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AttemptRecord {
    pub attempt_count: u64,
    pub last_outcome: LastOutcome,
    pub last_error: Option<String>,
    /// Wall-clock millis of the last increment; `None` for the implicit zero record.
    pub updated_at: Option<u64>,
}

impl AttemptRecord {
    /// The record of a key that was never attempted.
    pub fn zero() -> Self {
        Self::default()
    }

    /// The record after one more attempt with `outcome`, stamped at `now_millis`.
    pub fn advanced(&self, outcome: &AttemptOutcome, now_millis: u64) -> Self {
        let (last_outcome, last_error) = match outcome {
            AttemptOutcome::Success => (LastOutcome::Success, None),
            AttemptOutcome::Failure { detail } => (LastOutcome::Failure, Some(detail.clone())),
        };
        Self {
            attempt_count: self.attempt_count.saturating_add(1),
            last_outcome,
            last_error,
            updated_at: Some(now_millis),
        }
    }
}

/// Reject empty or whitespace-only identifiers.
pub fn validate_key(job: &JobId, resource: &ResourceId) -> Result<(), StoreError> {
    if job.is_blank() || resource.is_blank() {
        return Err(StoreError::InvalidKey {
            job_id: job.as_str().to_string(),
            resource_id: resource.as_str().to_string(),
        });
    }
    Ok(())
}

/// Abstract storage interface for attempt ledgers.
///
/// Implementations must linearize `increment` calls on the same key (no lost
/// update) while letting different keys proceed independently. Reads may be
/// stale but must never observe a count going backwards.
#[async_trait]
pub trait AttemptStore: Send + Sync + std::fmt::Debug {
    /// Fetch the record for a key, or the zero record if absent.
    async fn get(&self, job: &JobId, resource: &ResourceId) -> Result<AttemptRecord, StoreError>;

    /// Bump the attempt count by exactly one and record `outcome`.
    ///
    /// Returns the record as written.
    async fn increment(
        &self,
        job: &JobId,
        resource: &ResourceId,
        outcome: AttemptOutcome,
    ) -> Result<AttemptRecord, StoreError>;

    /// Every stored record of `job`, sorted by resource id.
    async fn snapshot(&self, job: &JobId) -> Result<Vec<(ResourceId, AttemptRecord)>, StoreError>;

    /// Fetch several records in input order.
    ///
    /// The default issues one `get` per key; backends with batched reads
    /// should override it.
    async fn get_many(
        &self,
        job: &JobId,
        resources: &[ResourceId],
    ) -> Result<Vec<AttemptRecord>, StoreError> {
        let mut records = Vec::with_capacity(resources.len());
        for resource in resources {
            records.push(self.get(job, resource).await?);
        }
        Ok(records)
    }
}

#[async_trait]
impl<T> AttemptStore for Arc<T>
where
    T: AttemptStore + ?Sized,
{
    async fn get(&self, job: &JobId, resource: &ResourceId) -> Result<AttemptRecord, StoreError> {
        (**self).get(job, resource).await
    }

    async fn increment(
        &self,
        job: &JobId,
        resource: &ResourceId,
        outcome: AttemptOutcome,
    ) -> Result<AttemptRecord, StoreError> {
        (**self).increment(job, resource, outcome).await
    }

    async fn snapshot(&self, job: &JobId) -> Result<Vec<(ResourceId, AttemptRecord)>, StoreError> {
        (**self).snapshot(job).await
    }

    async fn get_many(
        &self,
        job: &JobId,
        resources: &[ResourceId],
    ) -> Result<Vec<AttemptRecord>, StoreError> {
        (**self).get_many(job, resources).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advanced_bumps_count_and_sets_outcome() {
        let zero = AttemptRecord::zero();
        let failed = zero.advanced(&AttemptOutcome::failure("timeout"), 10);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_outcome, LastOutcome::Failure);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));
        assert_eq!(failed.updated_at, Some(10));

        let ok = failed.advanced(&AttemptOutcome::Success, 20);
        assert_eq!(ok.attempt_count, 2);
        assert_eq!(ok.last_outcome, LastOutcome::Success);
        assert!(ok.last_error.is_none(), "success clears the previous error");
    }

    #[test]
    fn validate_key_rejects_blank_ids() {
        let job = JobId::from("job");
        assert!(validate_key(&job, &ResourceId::from("r1")).is_ok());
        assert!(validate_key(&job, &ResourceId::from("")).unwrap_err().is_invalid_key());
        assert!(validate_key(&JobId::from(" "), &ResourceId::from("r1")).is_err());
    }
}
