//! Per-user allocation pipeline.
//!
//! Ordered protocol: idempotency check, warm-spare claim, readiness
//! validation, external bind, ownership tagging, scale-in protection,
//! conditional persistence, capacity reconcile. Any failure after the
//! claim triggers the compensation sequence, a fixed list of best-effort
//! inverse actions executed in reverse order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::capacity::CapacityController;
use super::{now_ms, InstanceBinder};
use crate::cloud::{
    owner_tags, warm_spare_tags, with_transient_retry, CloudError, CloudProvider, RetryPolicy,
};
use crate::error::{OrchResult, OrchestratorError};
use crate::metrics::{AllocationResult, Metrics};
use crate::store::{BindOutcome, PoolStore, SessionStore, WorkspaceRecord, WorkspaceState};

/// State of a claimed instance, driving the compensation sequence.
struct Claim {
    instance_id: String,
    tagged: bool,
    protected: bool,
    /// Failed validation; compensation terminates instead of re-pooling
    /// so a boot failure cannot cycle through the pool forever.
    bad: bool,
}

enum PipelineOutcome {
    Bound(WorkspaceRecord),
    /// A concurrent allocation for the same user persisted first.
    LostToWinner(WorkspaceRecord),
}

pub struct Allocator {
    cloud: Arc<dyn CloudProvider>,
    sessions: Arc<dyn SessionStore>,
    pool: Arc<dyn PoolStore>,
    binder: Arc<dyn InstanceBinder>,
    capacity: Arc<CapacityController>,
    deadline: Duration,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl Allocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        sessions: Arc<dyn SessionStore>,
        pool: Arc<dyn PoolStore>,
        binder: Arc<dyn InstanceBinder>,
        capacity: Arc<CapacityController>,
        deadline_ms: u64,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            cloud,
            sessions,
            pool,
            binder,
            capacity,
            deadline: Duration::from_millis(deadline_ms),
            retry,
            metrics,
        }
    }

    /// Allocate (or return) the workspace for `user_id`. Safe to call
    /// at-least-once; repeats return the existing record unchanged. A
    /// shortage surfaces as [`OrchestratorError::NoCapacity`], which the
    /// transport layer turns into retry advice.
    pub async fn allocate(&self, user_id: &str) -> OrchResult<WorkspaceRecord> {
        let started = Instant::now();
        let result = self.allocate_at(user_id, started).await;

        let label = match &result {
            Ok(_) => AllocationResult::Ready,
            Err(OrchestratorError::NoCapacity) => AllocationResult::Processing,
            Err(OrchestratorError::Conflict(_)) => AllocationResult::Conflict,
            Err(OrchestratorError::BadInstance(_, _)) => AllocationResult::BadInstance,
            Err(_) => AllocationResult::Error,
        };
        self.metrics.record_allocation(label, started.elapsed());
        result
    }

    async fn allocate_at(
        &self,
        user_id: &str,
        started: Instant,
    ) -> OrchResult<WorkspaceRecord> {
        // Idempotency: a RUNNING record with an endpoint is returned as-is.
        if let Some(existing) = self.sessions.workspace(user_id).await? {
            if existing.state == WorkspaceState::Running && !existing.public_endpoint.is_empty() {
                debug!(user_id, instance_id = %existing.instance_id, "allocation repeat, returning existing record");
                return Ok(existing);
            }
        }

        // Claim a warm spare. On shortage, raise capacity and tell the
        // client to retry; never block waiting for a boot here.
        let Some(instance_id) = self.pool.pop().await? else {
            if let Err(e) = self.capacity.reconcile().await {
                warn!(user_id, error = %e, "capacity reconcile failed during shortage");
            }
            info!(user_id, "warm pool empty, allocation deferred");
            return Err(OrchestratorError::NoCapacity);
        };

        let mut claim = Claim {
            instance_id,
            tagged: false,
            protected: false,
            bad: false,
        };

        match self.run_pipeline(user_id, &mut claim, started).await {
            Ok(PipelineOutcome::Bound(record)) => {
                // Top the pool back up; failures wait for the next tick.
                if let Err(e) = self.capacity.reconcile().await {
                    warn!(user_id, error = %e, "post-allocation reconcile failed");
                }
                info!(user_id, instance_id = %record.instance_id, "workspace allocated");
                Ok(record)
            }
            Ok(PipelineOutcome::LostToWinner(winner)) => {
                self.compensate(&claim).await;
                debug!(user_id, "lost allocation race, returning winner's record");
                Ok(winner)
            }
            Err(e) => {
                self.compensate(&claim).await;
                Err(e)
            }
        }
    }

    /// Steps 3–7. Mutates `claim` as side effects land so the caller can
    /// compensate precisely.
    async fn run_pipeline(
        &self,
        user_id: &str,
        claim: &mut Claim,
        started: Instant,
    ) -> OrchResult<PipelineOutcome> {
        let instance_id = claim.instance_id.clone();

        // Validate: must be running with a public endpoint. A vanished or
        // unready instance is terminated, not re-pooled.
        let description = match with_transient_retry("describe_instance", self.retry, || {
            self.cloud.describe_instance(&instance_id)
        })
        .await
        {
            Ok(d) => d,
            Err(CloudError::NotFound(_)) => {
                claim.bad = true;
                return Err(OrchestratorError::BadInstance(
                    instance_id,
                    "instance no longer exists".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        if !description.is_ready() {
            claim.bad = true;
            return Err(OrchestratorError::BadInstance(
                instance_id,
                "not running or missing public endpoint".into(),
            ));
        }
        self.check_deadline(started)?;

        // External per-instance preparation (idempotent by contract).
        self.binder.bind(user_id, &description).await?;
        self.check_deadline(started)?;

        // Assert ownership in tags.
        let tags = owner_tags(user_id);
        with_transient_retry("set_tags", self.retry, || {
            self.cloud.set_tags(&instance_id, &tags)
        })
        .await?;
        claim.tagged = true;
        self.check_deadline(started)?;

        // Shield from scale-in before the session becomes visible.
        let ids = [instance_id.clone()];
        let statuses = with_transient_retry("set_scale_in_protection", self.retry, || {
            self.cloud.set_scale_in_protection(&ids, true)
        })
        .await?;
        if !statuses.iter().all(|s| s.ok) {
            return Err(OrchestratorError::TransientUpstream(format!(
                "scale-in protection refused for {instance_id}"
            )));
        }
        claim.protected = true;
        self.check_deadline(started)?;

        // Conditional persist: only if no RUNNING record exists.
        let now = now_ms();
        let record = WorkspaceRecord {
            instance_id: instance_id.clone(),
            public_endpoint: description.public_endpoint.clone().unwrap_or_default(),
            custom_domain: None,
            state: WorkspaceState::Running,
            last_seen: now,
            ts: now,
        };
        match self.sessions.bind_workspace(user_id, &record).await? {
            BindOutcome::Bound => Ok(PipelineOutcome::Bound(record)),
            BindOutcome::Lost(Some(winner)) => Ok(PipelineOutcome::LostToWinner(winner)),
            BindOutcome::Lost(None) => Err(OrchestratorError::Conflict(user_id.to_string())),
        }
    }

    fn check_deadline(&self, started: Instant) -> OrchResult<()> {
        if started.elapsed() >= self.deadline {
            return Err(OrchestratorError::TransientUpstream(
                "allocation deadline exceeded".into(),
            ));
        }
        Ok(())
    }

    /// Fixed inverse-action list, each step best-effort and separately
    /// logged: unprotect, untag, then re-pool or terminate.
    async fn compensate(&self, claim: &Claim) {
        let instance_id = &claim.instance_id;
        warn!(instance_id = %instance_id, bad = claim.bad, "rolling back allocation");

        if claim.protected {
            let ids = [instance_id.clone()];
            if let Err(e) = self.cloud.set_scale_in_protection(&ids, false).await {
                warn!(instance_id = %instance_id, error = %e, "rollback: failed to remove protection");
            }
        }

        if claim.tagged {
            let tags = warm_spare_tags();
            if let Err(e) = self.cloud.set_tags(instance_id, &tags).await {
                warn!(instance_id = %instance_id, error = %e, "rollback: failed to restore tags");
            }
        }

        if claim.bad {
            match self.cloud.terminate_in_asg_decrementing(instance_id).await {
                Ok(()) => info!(instance_id = %instance_id, "rollback: bad instance terminated"),
                Err(CloudError::NotFound(_)) => {
                    debug!(instance_id = %instance_id, "rollback: instance already gone")
                }
                Err(e) => warn!(instance_id = %instance_id, error = %e, "rollback: failed to terminate bad instance"),
            }
        } else if let Err(e) = self.pool.add(instance_id).await {
            warn!(instance_id = %instance_id, error = %e, "rollback: failed to return instance to pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::FakeCloud;
    use crate::cloud::{InstanceState, TAG_OWNER, TAG_WARM_SPARE};
    use crate::config::AsgConfig;
    use crate::orchestrator::NoopBinder;
    use crate::store::memory::MemoryStore;
    use tokio::sync::Mutex;

    struct Harness {
        cloud: Arc<FakeCloud>,
        store: Arc<MemoryStore>,
        allocator: Allocator,
    }

    fn harness_with(
        cloud: Arc<FakeCloud>,
        store: Arc<MemoryStore>,
        sessions: Arc<dyn SessionStore>,
        max: u32,
        spare: u32,
        deadline_ms: u64,
    ) -> Harness {
        let metrics = Metrics::new();
        let retry = RetryPolicy::new(0, 1);
        let capacity = Arc::new(CapacityController::new(
            cloud.clone(),
            sessions.clone(),
            store.clone(),
            AsgConfig {
                name: "test-asg".into(),
                max_instances: max,
                warm_spare_target: spare,
            },
            retry,
            metrics.clone(),
        ));
        let allocator = Allocator::new(
            cloud.clone(),
            sessions,
            store.clone(),
            Arc::new(NoopBinder),
            capacity,
            deadline_ms,
            retry,
            metrics,
        );
        Harness {
            cloud,
            store,
            allocator,
        }
    }

    async fn harness(max: u32, spare: u32) -> Harness {
        let cloud = Arc::new(FakeCloud::with_asg(1, 0, max).await);
        let store = Arc::new(MemoryStore::new());
        harness_with(cloud.clone(), store.clone(), store.clone(), max, spare, 30_000)
    }

    async fn add_spare(h: &Harness, instance_id: &str, endpoint: &str) {
        h.cloud.add_running_instance(instance_id, endpoint).await;
        PoolStore::add(h.store.as_ref(), instance_id).await.unwrap();
    }

    #[tokio::test]
    async fn happy_path_binds_tags_protects_and_reconciles() {
        let h = harness(5, 1).await;
        add_spare(&h, "i-1", "1.2.3.4").await;

        let record = h.allocator.allocate("alice").await.unwrap();

        assert_eq!(record.instance_id, "i-1");
        assert_eq!(record.public_endpoint, "1.2.3.4");
        assert_eq!(record.state, WorkspaceState::Running);

        // Session state: record, inverse mapping, liveness index.
        let ws = h.store.workspace("alice").await.unwrap().unwrap();
        assert_eq!(ws.instance_id, "i-1");
        assert_eq!(
            h.store.user_for_instance("i-1").await.unwrap().as_deref(),
            Some("alice")
        );
        assert_eq!(h.store.active_count().await.unwrap(), 1);

        // Cloud state: ownership tag, protection, pool removal.
        assert_eq!(h.cloud.tag("i-1", TAG_OWNER).await.as_deref(), Some("alice"));
        assert_eq!(h.cloud.tag("i-1", TAG_WARM_SPARE).await.as_deref(), Some("false"));
        assert!(h.cloud.is_protected("i-1").await);
        assert!(!h.store.pool_contains("i-1").await);

        // Reconcile raised desired to active + warm spare target.
        assert_eq!(h.cloud.desired_capacity().await, 2);
    }

    #[tokio::test]
    async fn repeat_allocation_is_idempotent() {
        let h = harness(5, 1).await;
        add_spare(&h, "i-1", "1.2.3.4").await;

        let first = h.allocator.allocate("alice").await.unwrap();
        let desired_after_first = h.cloud.desired_capacity().await;

        let second = h.allocator.allocate("alice").await.unwrap();

        assert_eq!(second, first);
        assert_eq!(h.cloud.desired_capacity().await, desired_after_first);
    }

    #[tokio::test]
    async fn shortage_defers_and_raises_capacity() {
        let h = harness(5, 1).await;
        // No spares registered at all.
        let err = h.allocator.allocate("carol").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoCapacity));
        // Reconcile ran: active 0 + spare 1 = 1, current was 1, unchanged.
        assert_eq!(h.cloud.desired_capacity().await, 1);
        assert!(h.store.workspace("carol").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shortage_at_max_leaves_capacity_alone() {
        // warmSpareTarget=1, maxInstances=2, two active users, empty pool.
        let cloud = Arc::new(FakeCloud::with_asg(2, 0, 2).await);
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(cloud, store.clone(), store.clone(), 2, 1, 30_000);

        for (user, inst) in [("alice", "i-1"), ("bob", "i-2")] {
            h.cloud.add_running_instance(inst, "9.9.9.9").await;
            h.store
                .bind_workspace(
                    user,
                    &WorkspaceRecord {
                        instance_id: inst.into(),
                        public_endpoint: "9.9.9.9".into(),
                        custom_domain: None,
                        state: WorkspaceState::Running,
                        last_seen: now_ms(),
                        ts: now_ms(),
                    },
                )
                .await
                .unwrap();
        }

        let err = h.allocator.allocate("carol").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoCapacity));
        // min(2 + 1, 2) == 2: already there.
        assert_eq!(h.cloud.desired_capacity().await, 2);
    }

    #[tokio::test]
    async fn bad_instance_is_terminated_not_repooled() {
        let h = harness(5, 1).await;
        // Running but no public endpoint: fails validation.
        h.cloud
            .add_instance("i-bad", InstanceState::Running, None)
            .await;
        PoolStore::add(h.store.as_ref(), "i-bad").await.unwrap();
        let desired_before = h.cloud.desired_capacity().await;

        let err = h.allocator.allocate("dave").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::BadInstance(_, _)));

        assert!(h.cloud.was_terminated("i-bad").await);
        assert!(!h.store.pool_contains("i-bad").await);
        assert!(h.store.workspace("dave").await.unwrap().is_none());
        assert_eq!(h.cloud.desired_capacity().await, desired_before - 1);
    }

    #[tokio::test]
    async fn vanished_instance_is_treated_as_bad() {
        let h = harness(5, 1).await;
        // In the pool but unknown to the cloud.
        PoolStore::add(h.store.as_ref(), "i-ghost").await.unwrap();

        let err = h.allocator.allocate("dave").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::BadInstance(_, _)));
        assert!(!h.store.pool_contains("i-ghost").await);
    }

    #[tokio::test]
    async fn transient_validation_failure_returns_instance_to_pool() {
        let h = harness(5, 1).await;
        add_spare(&h, "i-1", "1.2.3.4").await;
        h.cloud
            .inject_failure(
                "describe_instance",
                CloudError::Transient("throttled".into()),
            )
            .await;

        let err = h.allocator.allocate("erin").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TransientUpstream(_)));

        // Instance survives and is claimable again.
        assert!(h.store.pool_contains("i-1").await);
        assert!(!h.cloud.was_terminated("i-1").await);

        let record = h.allocator.allocate("erin").await.unwrap();
        assert_eq!(record.instance_id, "i-1");
    }

    /// SessionStore wrapper that fails the first N binds.
    struct FlakyBind {
        inner: Arc<MemoryStore>,
        failures_left: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl SessionStore for FlakyBind {
        async fn workspace(&self, user_id: &str) -> OrchResult<Option<WorkspaceRecord>> {
            self.inner.workspace(user_id).await
        }
        async fn bind_workspace(
            &self,
            user_id: &str,
            record: &WorkspaceRecord,
        ) -> OrchResult<BindOutcome> {
            let mut left = self.failures_left.lock().await;
            if *left > 0 {
                *left -= 1;
                return Err(OrchestratorError::TransientUpstream(
                    "store write failed".into(),
                ));
            }
            self.inner.bind_workspace(user_id, record).await
        }
        async fn user_for_instance(&self, instance_id: &str) -> OrchResult<Option<String>> {
            self.inner.user_for_instance(instance_id).await
        }
        async fn record_ping(&self, user_id: &str, now_ms: i64) -> OrchResult<()> {
            self.inner.record_ping(user_id, now_ms).await
        }
        async fn idle_users(&self, cutoff_ms: i64, limit: usize) -> OrchResult<Vec<String>> {
            self.inner.idle_users(cutoff_ms, limit).await
        }
        async fn active_count(&self) -> OrchResult<u64> {
            self.inner.active_count().await
        }
        async fn cleanup(&self, user_id: &str, instance_id: &str) -> OrchResult<()> {
            self.inner.cleanup(user_id, instance_id).await
        }
        async fn purge(&self, user_id: &str) -> OrchResult<()> {
            self.inner.purge(user_id).await
        }
    }

    #[tokio::test]
    async fn persist_failure_rolls_back_and_repools() {
        let cloud = Arc::new(FakeCloud::with_asg(1, 0, 5).await);
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(FlakyBind {
            inner: store.clone(),
            failures_left: Mutex::new(1),
        });
        let h = harness_with(cloud, store.clone(), sessions, 5, 1, 30_000);
        add_spare(&h, "i-9", "1.2.3.4").await;

        let err = h.allocator.allocate("erin").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TransientUpstream(_)));

        // Compensation: unprotected, retagged unassigned, back in pool.
        assert!(!h.cloud.is_protected("i-9").await);
        assert_eq!(
            h.cloud.tag("i-9", TAG_OWNER).await.as_deref(),
            Some(crate::cloud::OWNER_UNASSIGNED)
        );
        assert_eq!(h.cloud.tag("i-9", TAG_WARM_SPARE).await.as_deref(), Some("true"));
        assert!(h.store.pool_contains("i-9").await);
        assert!(h.store.workspace("erin").await.unwrap().is_none());

        // The next attempt claims the same instance and succeeds.
        let record = h.allocator.allocate("erin").await.unwrap();
        assert_eq!(record.instance_id, "i-9");
    }

    #[tokio::test]
    async fn expired_deadline_compensates_and_surfaces() {
        let h = harness(5, 1).await;
        add_spare(&h, "i-1", "1.2.3.4").await;

        // Zero deadline: the first inter-step check fires.
        let slow = harness_with(
            h.cloud.clone(),
            h.store.clone(),
            h.store.clone(),
            5,
            1,
            0,
        );

        let err = slow.allocator.allocate("erin").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TransientUpstream(_)));
        assert!(h.store.pool_contains("i-1").await);
        assert!(!h.cloud.was_terminated("i-1").await);
    }

    #[tokio::test]
    async fn concurrent_same_user_converges_to_one_instance() {
        let h = harness(10, 1).await;
        for i in 0..4 {
            add_spare(&h, &format!("i-{i}"), "1.2.3.4").await;
        }

        let allocator = Arc::new(h.allocator);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let a = allocator.clone();
            handles.push(tokio::spawn(async move { a.allocate("alice").await }));
        }

        let mut instance_ids = Vec::new();
        for handle in handles {
            instance_ids.push(handle.await.unwrap().unwrap().instance_id);
        }

        // Every caller saw the same binding.
        instance_ids.dedup();
        assert_eq!(instance_ids.len(), 1);
        let bound = &instance_ids[0];

        // Exactly one instance left the pool for good.
        assert_eq!(PoolStore::size(h.store.as_ref()).await.unwrap(), 3);
        assert!(!h.store.pool_contains(bound).await);
        assert_eq!(h.store.active_count().await.unwrap(), 1);

        // Losers' instances were fully released.
        for i in 0..4 {
            let id = format!("i-{i}");
            if &id != bound {
                assert!(!h.cloud.is_protected(&id).await);
            }
        }
        assert!(h.cloud.is_protected(bound).await);
    }

    #[tokio::test]
    async fn concurrent_distinct_users_get_distinct_instances() {
        let h = harness(10, 1).await;
        for i in 0..3 {
            add_spare(&h, &format!("i-{i}"), "1.2.3.4").await;
        }

        let allocator = Arc::new(h.allocator);
        let mut handles = Vec::new();
        for user in ["alice", "bob", "carol"] {
            let a = allocator.clone();
            handles.push(tokio::spawn(async move { a.allocate(user).await }));
        }

        let mut instance_ids = Vec::new();
        for handle in handles {
            instance_ids.push(handle.await.unwrap().unwrap().instance_id);
        }

        instance_ids.sort();
        instance_ids.dedup();
        assert_eq!(instance_ids.len(), 3, "instances must be pairwise distinct");
        assert_eq!(h.store.active_count().await.unwrap(), 3);
        assert_eq!(PoolStore::size(h.store.as_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stopped_record_does_not_satisfy_idempotency() {
        let h = harness(5, 1).await;
        add_spare(&h, "i-1", "1.2.3.4").await;
        add_spare(&h, "i-2", "5.6.7.8").await;

        // Allocate, then simulate a reap leaving a STOPPED hash behind.
        h.allocator.allocate("alice").await.unwrap();
        h.store.cleanup("alice", "i-1").await.unwrap();

        let record = h.allocator.allocate("alice").await.unwrap();
        assert_eq!(record.instance_id, "i-2");
    }
}
