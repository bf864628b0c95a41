//! The allocation, lifecycle, and capacity-control engine.

pub mod allocator;
pub mod capacity;
pub mod lifecycle;
pub mod reaper;

use async_trait::async_trait;

use crate::cloud::InstanceDescription;
use crate::error::OrchResult;

/// Per-instance preparation delegated to external collaborators
/// (persistent-storage attach, reverse-proxy route). Implementations
/// must be idempotent; the allocator rolls back on failure.
#[async_trait]
pub trait InstanceBinder: Send + Sync {
    async fn bind(&self, user_id: &str, instance: &InstanceDescription) -> OrchResult<()>;
}

/// Binder for deployments where preparation happens out of band.
pub struct NoopBinder;

#[async_trait]
impl InstanceBinder for NoopBinder {
    async fn bind(&self, _user_id: &str, _instance: &InstanceDescription) -> OrchResult<()> {
        Ok(())
    }
}

/// Current wall clock as epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
