//! Idle workspace reaper.
//!
//! On a fixed interval, takes a snapshot of users whose last liveness
//! signal predates the idle threshold, terminates their instances
//! (decrementing the ASG), purges their session state, and re-runs the
//! capacity reconcile. A ping arriving after the snapshot does not
//! cancel a reap; the idle threshold is large relative to ping spacing.

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use super::capacity::CapacityController;
use super::now_ms;
use crate::cloud::{with_transient_retry, CloudError, CloudProvider, RetryPolicy};
use crate::config::ReaperConfig;
use crate::error::OrchResult;
use crate::metrics::Metrics;
use crate::store::{PoolStore, SessionStore, WorkspaceState};

/// What one tick did.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub examined: usize,
    pub reaped: usize,
    pub failed: usize,
}

pub struct IdleReaper {
    cloud: Arc<dyn CloudProvider>,
    sessions: Arc<dyn SessionStore>,
    pool: Arc<dyn PoolStore>,
    capacity: Arc<CapacityController>,
    config: ReaperConfig,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl IdleReaper {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        sessions: Arc<dyn SessionStore>,
        pool: Arc<dyn PoolStore>,
        capacity: Arc<CapacityController>,
        config: ReaperConfig,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            cloud,
            sessions,
            pool,
            capacity,
            config,
            retry,
            metrics,
        }
    }

    /// Tick forever. Spawned as a background task at startup.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(self.config.cleanup_interval_ms));
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(summary) if summary.reaped > 0 || summary.failed > 0 => {
                    info!(
                        examined = summary.examined,
                        reaped = summary.reaped,
                        failed = summary.failed,
                        "reaper tick complete"
                    );
                }
                Ok(_) => debug!("reaper tick: nothing idle"),
                Err(e) => warn!(error = %e, "reaper tick failed"),
            }
        }
    }

    /// One bounded pass over the idle snapshot. Per-user failures are
    /// logged and do not abort the batch.
    pub async fn tick(&self) -> OrchResult<TickSummary> {
        let cutoff = now_ms() - self.config.idle_timeout_ms as i64;
        let idle = self
            .sessions
            .idle_users(cutoff, self.config.max_users_per_tick)
            .await?;

        let mut summary = TickSummary {
            examined: idle.len(),
            ..TickSummary::default()
        };

        for user_id in &idle {
            match self.reap_user(user_id).await {
                Ok(true) => summary.reaped += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.failed += 1;
                    warn!(user_id = %user_id, error = %e, "failed to reap idle workspace");
                }
            }
        }

        if summary.reaped > 0 {
            self.metrics.record_reaped(summary.reaped as u64);
        }

        self.heal_pool().await;

        if let Err(e) = self.capacity.reconcile().await {
            warn!(error = %e, "post-reap capacity reconcile failed");
        }

        Ok(summary)
    }

    /// Terminate and purge a single idle user's workspace.
    async fn reap_user(&self, user_id: &str) -> OrchResult<bool> {
        let Some(workspace) = self.sessions.workspace(user_id).await? else {
            warn!(user_id, "liveness index entry without a workspace record");
            return Ok(false);
        };
        if workspace.state == WorkspaceState::Stopped {
            return Ok(false);
        }
        let instance_id = workspace.instance_id;

        // Defensive: the instance must not be claimable while dying.
        self.pool.remove(&instance_id).await?;

        match with_transient_retry("terminate_in_asg_decrementing", self.retry, || {
            self.cloud.terminate_in_asg_decrementing(&instance_id)
        })
        .await
        {
            Ok(()) => {}
            Err(CloudError::NotFound(_)) => {
                debug!(user_id, instance_id = %instance_id, "instance already gone, purging session only");
            }
            Err(e) => return Err(e.into()),
        }

        self.sessions.cleanup(user_id, &instance_id).await?;
        self.sessions.purge(user_id).await?;
        info!(user_id, instance_id = %instance_id, "idle workspace reaped");
        Ok(true)
    }

    /// Invariant sweep: a pool member bound to a user is a contradiction;
    /// the session store wins and the pool entry goes.
    async fn heal_pool(&self) {
        let members = match self.pool.members().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "pool sweep failed to list members");
                return;
            }
        };
        for instance_id in members {
            match self.sessions.user_for_instance(&instance_id).await {
                Ok(Some(user_id)) => {
                    warn!(
                        instance_id = %instance_id,
                        user_id = %user_id,
                        "bound instance found in warm pool, removing"
                    );
                    if let Err(e) = self.pool.remove(&instance_id).await {
                        warn!(instance_id = %instance_id, error = %e, "failed to remove bound instance from pool");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(instance_id = %instance_id, error = %e, "pool sweep lookup failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::FakeCloud;
    use crate::config::AsgConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::WorkspaceRecord;

    fn reaper(
        cloud: Arc<FakeCloud>,
        store: Arc<MemoryStore>,
        idle_timeout_ms: u64,
        max_per_tick: usize,
    ) -> IdleReaper {
        let metrics = Metrics::new();
        let retry = RetryPolicy::new(0, 1);
        let capacity = Arc::new(CapacityController::new(
            cloud.clone(),
            store.clone(),
            store.clone(),
            AsgConfig {
                name: "test-asg".into(),
                max_instances: 10,
                warm_spare_target: 1,
            },
            retry,
            metrics.clone(),
        ));
        IdleReaper::new(
            cloud,
            store.clone(),
            store,
            capacity,
            ReaperConfig {
                idle_timeout_ms,
                cleanup_interval_ms: 1_000,
                max_users_per_tick: max_per_tick,
            },
            retry,
            metrics,
        )
    }

    async fn bind(store: &MemoryStore, user: &str, instance: &str, last_seen: i64) {
        store
            .bind_workspace(
                user,
                &WorkspaceRecord {
                    instance_id: instance.into(),
                    public_endpoint: "1.2.3.4".into(),
                    custom_domain: None,
                    state: WorkspaceState::Running,
                    last_seen,
                    ts: last_seen,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn idle_user_is_terminated_and_purged() {
        let cloud = Arc::new(FakeCloud::with_asg(3, 0, 10).await);
        cloud.add_running_instance("i-1", "1.2.3.4").await;
        let store = Arc::new(MemoryStore::new());
        bind(&store, "alice", "i-1", now_ms() - 400_000).await;

        let r = reaper(cloud.clone(), store.clone(), 300_000, 100);
        let summary = r.tick().await.unwrap();

        assert_eq!(summary.examined, 1);
        assert_eq!(summary.reaped, 1);
        assert_eq!(summary.failed, 0);

        assert!(cloud.was_terminated("i-1").await);
        assert_eq!(store.active_count().await.unwrap(), 0);
        assert_eq!(store.user_for_instance("i-1").await.unwrap(), None);
        assert!(store.workspace("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_user_is_untouched() {
        let cloud = Arc::new(FakeCloud::with_asg(2, 0, 10).await);
        cloud.add_running_instance("i-1", "1.2.3.4").await;
        let store = Arc::new(MemoryStore::new());
        bind(&store, "alice", "i-1", now_ms()).await;

        let r = reaper(cloud.clone(), store.clone(), 300_000, 100);
        let summary = r.tick().await.unwrap();

        assert_eq!(summary.examined, 0);
        assert!(!cloud.was_terminated("i-1").await);
        assert_eq!(store.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_is_bounded_per_tick() {
        let cloud = Arc::new(FakeCloud::with_asg(3, 0, 10).await);
        cloud.add_running_instance("i-old", "1.1.1.1").await;
        cloud.add_running_instance("i-older", "1.1.1.2").await;
        let store = Arc::new(MemoryStore::new());
        bind(&store, "older", "i-older", now_ms() - 900_000).await;
        bind(&store, "old", "i-old", now_ms() - 800_000).await;

        let r = reaper(cloud.clone(), store.clone(), 300_000, 1);
        let summary = r.tick().await.unwrap();

        // Oldest first, one per tick.
        assert_eq!(summary.reaped, 1);
        assert!(cloud.was_terminated("i-older").await);
        assert!(!cloud.was_terminated("i-old").await);

        let summary = r.tick().await.unwrap();
        assert_eq!(summary.reaped, 1);
        assert!(cloud.was_terminated("i-old").await);
    }

    #[tokio::test]
    async fn per_user_failure_does_not_abort_batch() {
        let cloud = Arc::new(FakeCloud::with_asg(3, 0, 10).await);
        cloud.add_running_instance("i-a", "1.1.1.1").await;
        cloud.add_running_instance("i-b", "1.1.1.2").await;
        cloud
            .inject_failure("terminate", CloudError::Fatal("api down".into()))
            .await;
        let store = Arc::new(MemoryStore::new());
        bind(&store, "a", "i-a", now_ms() - 900_000).await;
        bind(&store, "b", "i-b", now_ms() - 800_000).await;

        let r = reaper(cloud.clone(), store.clone(), 300_000, 100);
        let summary = r.tick().await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.reaped, 1);
        // The failed user keeps their record for the next tick.
        assert!(store.workspace("a").await.unwrap().is_some());
        assert!(cloud.was_terminated("i-b").await);
    }

    #[tokio::test]
    async fn gone_instance_still_purges_session() {
        // Instance terminated out from under us between snapshot and reap.
        let cloud = Arc::new(FakeCloud::with_asg(1, 0, 10).await);
        let store = Arc::new(MemoryStore::new());
        bind(&store, "alice", "i-gone", now_ms() - 400_000).await;

        let r = reaper(cloud, store.clone(), 300_000, 100);
        let summary = r.tick().await.unwrap();

        assert_eq!(summary.reaped, 1);
        assert_eq!(store.active_count().await.unwrap(), 0);
        assert!(store.workspace("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn already_stopped_user_is_not_reaped_again() {
        let cloud = Arc::new(FakeCloud::with_asg(1, 0, 10).await);
        cloud.add_running_instance("i-1", "1.2.3.4").await;
        let store = Arc::new(MemoryStore::new());
        bind(&store, "alice", "i-1", now_ms() - 400_000).await;
        store.cleanup("alice", "i-1").await.unwrap();

        let r = reaper(cloud.clone(), store.clone(), 300_000, 100);
        let summary = r.tick().await.unwrap();

        assert_eq!(summary.examined, 0);
        assert_eq!(summary.reaped, 0);
        assert!(!cloud.was_terminated("i-1").await);
    }

    #[tokio::test]
    async fn pool_sweep_removes_bound_instances() {
        let cloud = Arc::new(FakeCloud::with_asg(2, 0, 10).await);
        cloud.add_running_instance("i-1", "1.2.3.4").await;
        let store = Arc::new(MemoryStore::new());
        bind(&store, "alice", "i-1", now_ms()).await;
        // Contradiction: bound instance also sitting in the pool.
        PoolStore::add(store.as_ref(), "i-1").await.unwrap();

        let r = reaper(cloud, store.clone(), 300_000, 100);
        r.tick().await.unwrap();

        assert!(!store.pool_contains("i-1").await);
        assert_eq!(store.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reap_reconciles_capacity_afterwards() {
        let cloud = Arc::new(FakeCloud::with_asg(2, 0, 10).await);
        cloud.add_running_instance("i-1", "1.2.3.4").await;
        let store = Arc::new(MemoryStore::new());
        bind(&store, "alice", "i-1", now_ms() - 400_000).await;

        let r = reaper(cloud.clone(), store.clone(), 300_000, 100);
        r.tick().await.unwrap();

        // Terminate decremented to 1; reconcile then drives toward
        // active(0) + spares(1) = 1.
        assert_eq!(cloud.desired_capacity().await, 1);
    }
}
