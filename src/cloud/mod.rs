//! Cloud adapter: a thin, stateless abstraction over the provider's
//! instance and auto-scaling APIs.
//!
//! All operations are safe to call from concurrent paths; the adapter
//! holds no mutable state of its own.

pub mod aws;
pub mod fake;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tracing::warn;

use crate::error::OrchestratorError;

/// Tag key recording which user owns an instance.
pub const TAG_OWNER: &str = "Owner";
/// Tag key flagging a pre-booted, unassigned instance.
pub const TAG_WARM_SPARE: &str = "WarmSpare";
/// Tag key marking instances under this orchestrator's control.
pub const TAG_MANAGED_BY: &str = "ManagedBy";
/// Owner tag value for instances in the warm pool.
pub const OWNER_UNASSIGNED: &str = "UNASSIGNED";
/// ManagedBy tag value written on every instance we touch.
pub const MANAGED_BY_VALUE: &str = "devpool";

/// Tags asserting a user's ownership of an instance.
pub fn owner_tags(user_id: &str) -> Vec<(String, String)> {
    vec![
        (TAG_OWNER.to_string(), user_id.to_string()),
        (TAG_WARM_SPARE.to_string(), "false".to_string()),
        (TAG_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
    ]
}

/// Tags returning an instance to the unassigned warm pool.
pub fn warm_spare_tags() -> Vec<(String, String)> {
    vec![
        (TAG_OWNER.to_string(), OWNER_UNASSIGNED.to_string()),
        (TAG_WARM_SPARE.to_string(), "true".to_string()),
        (TAG_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
    ]
}

/// Result type for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Classified cloud failure.
#[derive(Error, Debug, Clone)]
pub enum CloudError {
    /// Throttling, timeouts, 5xx. Worth a bounded retry.
    #[error("transient cloud failure: {0}")]
    Transient(String),

    /// The referenced instance or ASG does not exist.
    #[error("cloud resource not found: {0}")]
    NotFound(String),

    /// The request contradicts current cloud state.
    #[error("conflicting cloud state: {0}")]
    Conflict(String),

    /// Credential or IAM failure. Never retried.
    #[error("cloud permission denied: {0}")]
    Permission(String),

    /// Anything else.
    #[error("cloud failure: {0}")]
    Fatal(String),
}

impl CloudError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_))
    }
}

impl From<CloudError> for OrchestratorError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Transient(m) => OrchestratorError::TransientUpstream(m),
            CloudError::NotFound(m) => OrchestratorError::NotFound(m),
            CloudError::Conflict(m) => OrchestratorError::Conflict(m),
            CloudError::Permission(m) => OrchestratorError::PermissionDenied(m),
            CloudError::Fatal(m) => OrchestratorError::Fatal(m),
        }
    }
}

/// Provider-reported instance state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopped,
    Other(String),
}

impl InstanceState {
    pub fn is_running(&self) -> bool {
        matches!(self, InstanceState::Running)
    }
}

impl std::str::FromStr for InstanceState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopped" | "stopping" => InstanceState::Stopped,
            other => InstanceState::Other(other.to_string()),
        })
    }
}

/// Snapshot of a single instance.
#[derive(Debug, Clone)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceState,
    /// Public address, absent while the instance is still booting.
    pub public_endpoint: Option<String>,
    pub tags: HashMap<String, String>,
}

impl InstanceDescription {
    /// Readiness criterion: running with a reachable endpoint.
    pub fn is_ready(&self) -> bool {
        self.state.is_running()
            && self
                .public_endpoint
                .as_deref()
                .is_some_and(|e| !e.is_empty())
    }
}

/// Snapshot of the auto-scaling group.
#[derive(Debug, Clone)]
pub struct AsgDescription {
    pub desired_capacity: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub instance_ids: Vec<String>,
}

/// Per-instance outcome of a batch protection call.
#[derive(Debug, Clone)]
pub struct ProtectionStatus {
    pub instance_id: String,
    pub ok: bool,
    pub message: Option<String>,
}

/// Cloud provider operations the orchestrator consumes.
///
/// Implementations must be stateless and callable concurrently.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<InstanceDescription>;

    /// Additive/overwriting tag mutation.
    async fn set_tags(&self, instance_id: &str, tags: &[(String, String)]) -> CloudResult<()>;

    /// Batch scale-in protection toggle; partial failures come back as
    /// per-id statuses rather than failing the whole call.
    async fn set_scale_in_protection(
        &self,
        instance_ids: &[String],
        protect: bool,
    ) -> CloudResult<Vec<ProtectionStatus>>;

    async fn describe_asg(&self) -> CloudResult<AsgDescription>;

    /// Idempotent on the target value; returns without awaiting settlement.
    async fn set_desired_capacity(&self, desired: u32) -> CloudResult<()>;

    /// Terminate an instance and decrement desired capacity in one
    /// provider-side operation.
    async fn terminate_in_asg_decrementing(&self, instance_id: &str) -> CloudResult<()>;
}

/// Retry policy for transient cloud failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub extra_attempts: u32,
    /// Base backoff; each retry waits `base * attempt` plus jitter.
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(extra_attempts: u32, base_backoff_ms: u64) -> Self {
        Self {
            extra_attempts,
            base_backoff: Duration::from_millis(base_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, 250)
    }
}

/// Run a cloud operation, retrying transient failures within the policy.
///
/// Only [`CloudError::Transient`] is retried; everything else surfaces
/// immediately.
pub async fn with_transient_retry<T, F, Fut>(
    op: &str,
    policy: RetryPolicy,
    mut call: F,
) -> CloudResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CloudResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.extra_attempts => {
                attempt += 1;
                let base = policy.base_backoff.as_millis() as u64 * attempt as u64;
                let jitter = rand::thread_rng().gen_range(0..=policy.base_backoff.as_millis() as u64);
                let delay = Duration::from_millis(base + jitter);
                warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying transient cloud failure");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
