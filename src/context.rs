//! Job and resource identity, and the per-run retry context.
//!
//! A [`RetryJobContext`] is created once by the batch driver when a job run
//! starts and is then shared, read-only, with every intercepted call of that
//! run. Cloning is an `Arc` bump.

use crate::config::JobPolicy;
use crate::error::PolicyError;
use std::fmt;
use std::sync::Arc;

/// Opaque identifier of one job run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(transparent))]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier for a new run.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Stable identity of a business resource (a visit, a visitor record, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(transparent))]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A candidate item: its identity plus the domain payload, which this crate never inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef<P> {
    id: ResourceId,
    payload: P,
}

impl<P> ResourceRef<P> {
    pub fn new(id: impl Into<ResourceId>, payload: P) -> Self {
        Self { id: id.into(), payload }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn into_parts(self) -> (ResourceId, P) {
        (self.id, self.payload)
    }
}

#[derive(Debug)]
struct ContextInner {
    job_id: JobId,
    max_attempts: u64,
}

/// One execution of a retryable batch job.
///
/// Invariants:
/// - `max_attempts` is always >= 1; construction rejects anything else.
/// - Immutable for the run's duration; safe to share across workers.
#[derive(Debug, Clone)]
pub struct RetryJobContext {
    inner: Arc<ContextInner>,
}

impl RetryJobContext {
    /// Create the context for a new job run.
    ///
    /// `max_attempts` counts total attempts per resource. Values `<= 0` are a
    /// configuration error and are never defaulted. A blank `job_id` could never
    /// address the ledger and is rejected as well.
    pub fn new(job_id: impl Into<JobId>, max_attempts: i64) -> Result<Self, PolicyError> {
        let max_attempts = u64::try_from(max_attempts)
            .ok()
            .filter(|n| *n > 0)
            .ok_or(PolicyError::InvalidMaxAttempts(max_attempts))?;
        let job_id = job_id.into();
        if job_id.is_blank() {
            return Err(PolicyError::BlankJobId);
        }
        Ok(Self { inner: Arc::new(ContextInner { job_id, max_attempts }) })
    }

    /// Create a context from a configured [`JobPolicy`].
    pub fn from_policy(job_id: impl Into<JobId>, policy: &JobPolicy) -> Result<Self, PolicyError> {
        Self::new(job_id, policy.max_attempts)
    }

    pub fn job_id(&self) -> &JobId {
        &self.inner.job_id
    }

    pub fn max_attempts(&self) -> u64 {
        self.inner.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_max_attempts() {
        assert_eq!(
            RetryJobContext::new("job", 0).unwrap_err(),
            PolicyError::InvalidMaxAttempts(0)
        );
        assert_eq!(
            RetryJobContext::new("job", -3).unwrap_err(),
            PolicyError::InvalidMaxAttempts(-3)
        );
    }

    #[test]
    fn rejects_blank_job_id() {
        assert_eq!(RetryJobContext::new("", 3).unwrap_err(), PolicyError::BlankJobId);
        assert_eq!(RetryJobContext::new("   ", 3).unwrap_err(), PolicyError::BlankJobId);
    }

    #[test]
    fn clones_share_the_same_run() {
        let ctx = RetryJobContext::new("nightly-checkout", 3).expect("valid context");
        let other = ctx.clone();
        assert_eq!(other.job_id().as_str(), "nightly-checkout");
        assert_eq!(other.max_attempts(), 3);
        assert!(Arc::ptr_eq(&ctx.inner, &other.inner));
    }

    #[test]
    fn generated_job_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
    }

    #[test]
    fn blank_ids_are_detected() {
        assert!(ResourceId::new("").is_blank());
        assert!(ResourceId::new("  ").is_blank());
        assert!(!ResourceId::new("visit-1").is_blank());
        assert!(JobId::new("").is_blank());
    }

    #[test]
    fn resource_ref_exposes_parts() {
        let r = ResourceRef::new("visit-7", 42u32);
        assert_eq!(r.id().as_str(), "visit-7");
        assert_eq!(*r.payload(), 42);
        let (id, payload) = r.into_parts();
        assert_eq!(id, ResourceId::from("visit-7"));
        assert_eq!(payload, 42);
    }
}
