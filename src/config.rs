//! Per-job retry configuration.
//!
//! [`JobPolicy`] is what a driver configures for one kind of job. A
//! [`PolicyTable`] keeps the named policies of a deployment behind a
//! [`DynamicConfig`] so operators can change thresholds without restarting;
//! a change only affects contexts created afterwards, never a running job.

use crate::error::PolicyError;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    /// Create a new `DynamicConfig` with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure. Concurrent updates are applied one after another.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|cur| f(cur));
    }
}

/// What a check does when the attempt store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StoreFailureMode {
    /// Treat the resource as SKIP. Never risks unbounded retries.
    #[default]
    FailClosed,
    /// Treat the resource as ALLOW and log a warning.
    FailOpen,
}

/// Retry configuration for one kind of job.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobPolicy {
    /// Total attempts allowed per resource. Must be > 0.
    pub max_attempts: i64,
    /// Check-path behavior when the store is unavailable.
    #[cfg_attr(feature = "serde", serde(default))]
    pub on_store_unavailable: StoreFailureMode,
}

impl JobPolicy {
    /// Fail-closed policy with the given threshold.
    pub fn new(max_attempts: i64) -> Self {
        Self { max_attempts, on_store_unavailable: StoreFailureMode::FailClosed }
    }

    /// Opt into fail-open checks.
    pub fn fail_open(mut self) -> Self {
        self.on_store_unavailable = StoreFailureMode::FailOpen;
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts <= 0 {
            return Err(PolicyError::InvalidMaxAttempts(self.max_attempts));
        }
        Ok(())
    }
}

/// Named job policies with a fallback default.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    default: JobPolicy,
    named: DynamicConfig<HashMap<String, JobPolicy>>,
}

impl PolicyTable {
    /// Create a table whose unnamed jobs use `default`.
    pub fn new(default: JobPolicy) -> Result<Self, PolicyError> {
        default.validate()?;
        Ok(Self { default, named: DynamicConfig::new(HashMap::new()) })
    }

    /// Register or replace the policy for `job_name`.
    pub fn set(&self, job_name: impl Into<String>, policy: JobPolicy) -> Result<(), PolicyError> {
        policy.validate()?;
        let job_name = job_name.into();
        self.named.update(|current| {
            let mut next = current.clone();
            next.insert(job_name.clone(), policy.clone());
            next
        });
        tracing::debug!(target: "strikeout::config", job = %job_name, max_attempts = policy.max_attempts, "job policy updated");
        Ok(())
    }

    /// Drop a named policy; the job falls back to the default.
    pub fn remove(&self, job_name: &str) {
        self.named.update(|current| {
            let mut next = current.clone();
            next.remove(job_name);
            next
        });
    }

    /// The policy in force for `job_name` right now.
    pub fn policy_for(&self, job_name: &str) -> JobPolicy {
        self.named.get().get(job_name).cloned().unwrap_or_else(|| self.default.clone())
    }

    pub fn default_policy(&self) -> &JobPolicy {
        &self.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_config_get_set_update() {
        let a = DynamicConfig::new(1);
        assert_eq!(*a.get(), 1);
        a.set(2);
        assert_eq!(*a.get(), 2);
        a.update(|v| v + 3);
        assert_eq!(*a.get(), 5);
    }

    #[test]
    fn job_policy_defaults_to_fail_closed() {
        let policy = JobPolicy::new(3);
        assert_eq!(policy.on_store_unavailable, StoreFailureMode::FailClosed);
        assert_eq!(policy.fail_open().on_store_unavailable, StoreFailureMode::FailOpen);
    }

    #[test]
    fn validate_rejects_non_positive() {
        assert!(JobPolicy::new(1).validate().is_ok());
        assert_eq!(JobPolicy::new(0).validate(), Err(PolicyError::InvalidMaxAttempts(0)));
        assert_eq!(JobPolicy::new(-1).validate(), Err(PolicyError::InvalidMaxAttempts(-1)));
    }

    #[test]
    fn table_falls_back_to_default() {
        let table = PolicyTable::new(JobPolicy::new(3)).expect("valid default");
        table.set("visit-checkout", JobPolicy::new(5)).expect("valid policy");

        assert_eq!(table.policy_for("visit-checkout").max_attempts, 5);
        assert_eq!(table.policy_for("visitor-sync").max_attempts, 3);

        table.remove("visit-checkout");
        assert_eq!(table.policy_for("visit-checkout").max_attempts, 3);
    }

    #[test]
    fn table_rejects_invalid_policies() {
        assert!(PolicyTable::new(JobPolicy::new(0)).is_err());
        let table = PolicyTable::new(JobPolicy::new(2)).expect("valid default");
        assert!(table.set("bad", JobPolicy::new(-4)).is_err());
        assert_eq!(table.policy_for("bad").max_attempts, 2);
    }

    #[test]
    fn clones_observe_updates() {
        let table = PolicyTable::new(JobPolicy::new(2)).expect("valid default");
        let view = table.clone();
        table.set("nightly", JobPolicy::new(7)).expect("valid policy");
        assert_eq!(view.policy_for("nightly").max_attempts, 7);
    }
}
