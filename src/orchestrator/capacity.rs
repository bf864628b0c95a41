//! ASG capacity controller.
//!
//! Drives desired capacity toward `min(active_users + warm_spare_target,
//! max_instances)`. Scale-up is immediate; scale-down happens only when
//! the surplus is genuinely in warm spares, and only after every active
//! instance carries scale-in protection.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cloud::{
    with_transient_retry, CloudError, CloudProvider, RetryPolicy, OWNER_UNASSIGNED, TAG_OWNER,
};
use crate::config::AsgConfig;
use crate::error::OrchResult;
use crate::metrics::Metrics;
use crate::store::{PoolStore, SessionStore};

pub struct CapacityController {
    cloud: Arc<dyn CloudProvider>,
    sessions: Arc<dyn SessionStore>,
    pool: Arc<dyn PoolStore>,
    asg: AsgConfig,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl CapacityController {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        sessions: Arc<dyn SessionStore>,
        pool: Arc<dyn PoolStore>,
        asg: AsgConfig,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            cloud,
            sessions,
            pool,
            asg,
            retry,
            metrics,
        }
    }

    /// Reconcile desired capacity with demand. Re-entrant and idempotent;
    /// returns the computed target without waiting for the ASG to settle.
    pub async fn reconcile(&self) -> OrchResult<u32> {
        let active = self.sessions.active_count().await?;
        let pool_size = self.pool.size().await?;
        let target = (active as u32)
            .saturating_add(self.asg.warm_spare_target)
            .min(self.asg.max_instances);

        let group = with_transient_retry("describe_asg", self.retry, || self.cloud.describe_asg())
            .await?;
        let current = group.desired_capacity;

        self.metrics.set_active_users(active);
        self.metrics.set_warm_pool_size(pool_size);

        if target > current {
            info!(active, current, target, "raising desired capacity");
            with_transient_retry("set_desired_capacity", self.retry, || {
                self.cloud.set_desired_capacity(target)
            })
            .await?;
            self.metrics.set_desired_capacity(target);
            return Ok(target);
        }

        if target < current && pool_size > self.asg.warm_spare_target as u64 {
            self.scale_down(&group.instance_ids, target).await?;
            return Ok(target);
        }

        debug!(active, current, target, pool_size, "capacity already reconciled");
        self.metrics.set_desired_capacity(current);
        Ok(target)
    }

    /// Protect every active instance, then shrink. The cloud picks the
    /// victims; protection guarantees they are warm spares.
    async fn scale_down(&self, instance_ids: &[String], target: u32) -> OrchResult<()> {
        let mut active_ids = Vec::new();
        for id in instance_ids {
            if self.instance_is_active(id).await? {
                active_ids.push(id.clone());
            }
        }

        let statuses = with_transient_retry("set_scale_in_protection", self.retry, || {
            self.cloud.set_scale_in_protection(&active_ids, true)
        })
        .await?;

        if let Some(failed) = statuses.iter().find(|s| !s.ok) {
            // Shrinking with an unprotected active instance risks killing
            // a live workspace; leave capacity alone until the next pass.
            warn!(
                instance_id = %failed.instance_id,
                message = failed.message.as_deref().unwrap_or("unknown"),
                "protection incomplete, deferring scale-down"
            );
            return Ok(());
        }

        info!(target, protected = active_ids.len(), "lowering desired capacity");
        with_transient_retry("set_desired_capacity", self.retry, || {
            self.cloud.set_desired_capacity(target)
        })
        .await?;
        self.metrics.set_desired_capacity(target);
        Ok(())
    }

    /// Session store is authoritative; tags are the self-healing fallback
    /// for instances the store has no record of.
    async fn instance_is_active(&self, instance_id: &str) -> OrchResult<bool> {
        if self.sessions.user_for_instance(instance_id).await?.is_some() {
            return Ok(true);
        }
        match self.cloud.describe_instance(instance_id).await {
            Ok(desc) => Ok(desc
                .tags
                .get(TAG_OWNER)
                .is_some_and(|owner| owner != OWNER_UNASSIGNED)),
            Err(CloudError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
