//! Error taxonomy shared across the orchestrator.

use thiserror::Error;

/// Result type for orchestrator operations.
pub type OrchResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by the allocation, lifecycle, and capacity engines.
///
/// Kinds are transport-neutral; the HTTP layer maps them onto status
/// codes and the CLI onto exit codes.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Unknown user, unknown instance, or no workspace record.
    #[error("not found: {0}")]
    NotFound(String),

    /// A concurrent allocation for the same user won the conditional
    /// persist. Retry-safe for the loser.
    #[error("concurrent allocation conflict for user {0}")]
    Conflict(String),

    /// Warm pool empty; the client should retry after the ASG catches up.
    #[error("no warm capacity available")]
    NoCapacity,

    /// Instance failed readiness validation (wrong state or missing
    /// public endpoint). The compensating path terminates it.
    #[error("instance {0} failed validation: {1}")]
    BadInstance(String, String),

    /// Cloud or state-store I/O failure after bounded retries.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    /// Credential or IAM misconfiguration. Not retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Invariant violation detected by a reconciler.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl OrchestratorError {
    /// Stable machine-readable kind string, used in API error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::NoCapacity => "no_capacity",
            Self::BadInstance(_, _) => "bad_instance",
            Self::TransientUpstream(_) => "transient_upstream",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Whether the caller may safely retry the operation.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::NoCapacity | Self::Conflict(_) | Self::TransientUpstream(_)
        )
    }
}

impl From<redis::RedisError> for OrchestratorError {
    fn from(err: redis::RedisError) -> Self {
        OrchestratorError::TransientUpstream(format!("redis: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(
            OrchestratorError::NotFound("x".into()).kind(),
            "not_found"
        );
        assert_eq!(OrchestratorError::NoCapacity.kind(), "no_capacity");
        assert_eq!(
            OrchestratorError::BadInstance("i-1".into(), "no endpoint".into()).kind(),
            "bad_instance"
        );
        assert_eq!(
            OrchestratorError::PermissionDenied("iam".into()).kind(),
            "permission_denied"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(OrchestratorError::NoCapacity.retryable());
        assert!(OrchestratorError::Conflict("u".into()).retryable());
        assert!(OrchestratorError::TransientUpstream("io".into()).retryable());
        assert!(!OrchestratorError::PermissionDenied("iam".into()).retryable());
        assert!(!OrchestratorError::Fatal("bad".into()).retryable());
        assert!(!OrchestratorError::NotFound("u".into()).retryable());
    }
}
