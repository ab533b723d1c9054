//! Error types for attempt gating
use std::fmt;

/// Errors produced while building a job context or policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// `max_attempts` must be > 0.
    #[error("invalid retry policy: max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(i64),
    /// The job identifier is empty or whitespace.
    #[error("invalid retry policy: job id must not be blank")]
    BlankJobId,
}

/// Errors surfaced by an [`AttemptStore`](crate::store::AttemptStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The job or resource identifier was empty.
    #[error("invalid attempt key (job '{job_id}', resource '{resource_id}')")]
    InvalidKey { job_id: String, resource_id: String },
    /// The backing ledger could not be reached.
    #[error("attempt store unavailable: {reason}")]
    Unavailable { reason: String },
}

impl StoreError {
    /// Shorthand for an `Unavailable` error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable { reason: reason.into() }
    }

    /// Check if this error is due to a malformed key
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey { .. })
    }

    /// Check if this error is due to the ledger being unreachable
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Unified error type for the interception layers.
#[derive(Debug, Clone)]
pub enum GateError<E> {
    /// The call carried an empty job or resource identifier
    InvalidKey { job_id: String, resource_id: String },
    /// The attempt store failed while checking or recording
    StoreUnavailable { reason: String },
    /// The wrapped operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey { job_id, resource_id } => {
                write!(f, "invalid attempt key (job '{}', resource '{}')", job_id, resource_id)
            }
            Self::StoreUnavailable { reason } => write!(f, "attempt store unavailable: {}", reason),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<StoreError> for GateError<E> {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidKey { job_id, resource_id } => {
                GateError::InvalidKey { job_id, resource_id }
            }
            StoreError::Unavailable { reason } => GateError::StoreUnavailable { reason },
        }
    }
}

impl<E> GateError<E> {
    /// Check if this error is due to a malformed key
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey { .. })
    }
    /// Check if this error is due to the attempt store
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
    /// Check if this error wraps an operation failure.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Transform the wrapped operation error, keeping gate variants.
    pub fn map_inner<F, E2>(self, f: F) -> GateError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Self::InvalidKey { job_id, resource_id } => GateError::InvalidKey { job_id, resource_id },
            Self::StoreUnavailable { reason } => GateError::StoreUnavailable { reason },
            Self::Inner(e) => GateError::Inner(f(e)),
        }
    }
}
