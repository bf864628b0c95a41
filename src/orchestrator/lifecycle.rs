//! Reacts to asynchronous ASG lifecycle events.
//!
//! Launch events poll the instance for readiness and insert it into the
//! warm pool; terminate events tear down any session state that still
//! references the instance. Handlers are idempotent: the provider
//! retries and duplicates events.

use std::sync::Arc;

use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::cloud::{warm_spare_tags, CloudError, CloudProvider};
use crate::config::LifecycleConfig;
use crate::metrics::{EventKind, Metrics};
use crate::store::{PoolStore, SessionStore};

/// A lifecycle notification, already signature-verified upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Launch { instance_id: String },
    Terminate { instance_id: String },
}

/// Provider event envelope. Accepts both the plain form
/// `{"event": "instance-launch", "instanceId": "i-..."}` and the
/// AWS-style transition names.
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    #[serde(alias = "LifecycleTransition", alias = "detail-type")]
    pub event: String,
    #[serde(rename = "instanceId", alias = "EC2InstanceId")]
    pub instance_id: String,
}

impl LifecycleEvent {
    /// Classify an envelope; `None` for event kinds we do not handle.
    pub fn from_envelope(envelope: &EventEnvelope) -> Option<Self> {
        if envelope.instance_id.is_empty() {
            return None;
        }
        let kind = envelope.event.to_ascii_uppercase();
        if kind.contains("LAUNCH") {
            Some(LifecycleEvent::Launch {
                instance_id: envelope.instance_id.clone(),
            })
        } else if kind.contains("TERMINAT") {
            Some(LifecycleEvent::Terminate {
                instance_id: envelope.instance_id.clone(),
            })
        } else {
            None
        }
    }

    pub fn instance_id(&self) -> &str {
        match self {
            LifecycleEvent::Launch { instance_id } | LifecycleEvent::Terminate { instance_id } => {
                instance_id
            }
        }
    }
}

pub struct LifecycleReactor {
    cloud: Arc<dyn CloudProvider>,
    sessions: Arc<dyn SessionStore>,
    pool: Arc<dyn PoolStore>,
    config: LifecycleConfig,
    metrics: Metrics,
}

impl LifecycleReactor {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        sessions: Arc<dyn SessionStore>,
        pool: Arc<dyn PoolStore>,
        config: LifecycleConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            cloud,
            sessions,
            pool,
            config,
            metrics,
        }
    }

    /// Dispatch one event. Runs after the HTTP acknowledgement; errors
    /// are logged, never surfaced to the provider.
    pub async fn handle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Launch { instance_id } => {
                self.metrics.record_lifecycle_event(EventKind::Launch);
                self.handle_launch(&instance_id).await;
            }
            LifecycleEvent::Terminate { instance_id } => {
                self.metrics.record_lifecycle_event(EventKind::Terminate);
                self.handle_terminate(&instance_id).await;
            }
        }
    }

    /// Poll for readiness, then tag unassigned and insert into the pool.
    ///
    /// Exhaustion is logged and left alone: the ASG health check owns
    /// truly dead instances, and terminating here would race it.
    pub async fn handle_launch(&self, instance_id: &str) {
        for attempt in 1..=self.config.readiness_max_attempts {
            match self.cloud.describe_instance(instance_id).await {
                Ok(description) if description.is_ready() => {
                    let tags = warm_spare_tags();
                    if let Err(e) = self.cloud.set_tags(instance_id, &tags).await {
                        // Pool membership requires the unassigned tags; a
                        // duplicate event delivery will retry the insert.
                        error!(instance_id, error = %e, "failed to tag warm spare, not pooling");
                        return;
                    }
                    if let Err(e) = self.pool.add(instance_id).await {
                        error!(instance_id, error = %e, "failed to add warm spare to pool");
                        return;
                    }
                    info!(instance_id, attempt, "instance ready, joined warm pool");
                    return;
                }
                Ok(description) => {
                    debug!(instance_id, attempt, state = ?description.state, "instance not ready yet");
                }
                Err(CloudError::NotFound(_)) => {
                    warn!(instance_id, "launched instance vanished before readiness");
                    return;
                }
                Err(e) => {
                    warn!(instance_id, attempt, error = %e, "readiness probe failed");
                }
            }
            if attempt < self.config.readiness_max_attempts {
                sleep(Duration::from_millis(self.config.readiness_backoff_ms)).await;
            }
        }
        error!(
            instance_id,
            attempts = self.config.readiness_max_attempts,
            "instance never became ready; leaving to the ASG health check"
        );
    }

    /// Remove the instance from the pool and tear down any session that
    /// still references it. Safe on unknown instances.
    pub async fn handle_terminate(&self, instance_id: &str) {
        if let Err(e) = self.pool.remove(instance_id).await {
            warn!(instance_id, error = %e, "failed to remove terminated instance from pool");
        }

        match self.sessions.user_for_instance(instance_id).await {
            Ok(Some(user_id)) => {
                if let Err(e) = self.sessions.cleanup(&user_id, instance_id).await {
                    warn!(instance_id, user_id = %user_id, error = %e, "terminate cleanup failed");
                    return;
                }
                if let Err(e) = self.sessions.purge(&user_id).await {
                    warn!(instance_id, user_id = %user_id, error = %e, "terminate purge failed");
                }
                info!(instance_id, user_id = %user_id, "terminated instance's session cleaned up");
            }
            Ok(None) => debug!(instance_id, "terminate event for unowned instance"),
            Err(e) => warn!(instance_id, error = %e, "failed to resolve owner of terminated instance"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::FakeCloud;
    use crate::cloud::{InstanceState, OWNER_UNASSIGNED, TAG_OWNER, TAG_WARM_SPARE};
    use crate::store::memory::MemoryStore;
    use crate::store::{WorkspaceRecord, WorkspaceState};

    fn config(attempts: u32, backoff_ms: u64) -> LifecycleConfig {
        LifecycleConfig {
            readiness_max_attempts: attempts,
            readiness_backoff_ms: backoff_ms,
        }
    }

    fn reactor(
        cloud: Arc<FakeCloud>,
        store: Arc<MemoryStore>,
        cfg: LifecycleConfig,
    ) -> LifecycleReactor {
        LifecycleReactor::new(cloud, store.clone(), store, cfg, Metrics::new())
    }

    #[tokio::test]
    async fn ready_instance_is_tagged_and_pooled() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.add_running_instance("i-new", "1.2.3.4").await;
        let store = Arc::new(MemoryStore::new());
        let r = reactor(cloud.clone(), store.clone(), config(3, 1));

        r.handle_launch("i-new").await;

        assert!(store.pool_contains("i-new").await);
        assert_eq!(
            cloud.tag("i-new", TAG_OWNER).await.as_deref(),
            Some(OWNER_UNASSIGNED)
        );
        assert_eq!(cloud.tag("i-new", TAG_WARM_SPARE).await.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn unready_instance_exhausts_without_terminating() {
        let cloud = Arc::new(FakeCloud::new());
        cloud
            .add_instance("i-slow", InstanceState::Pending, None)
            .await;
        let store = Arc::new(MemoryStore::new());
        let r = reactor(cloud.clone(), store.clone(), config(2, 1));

        r.handle_launch("i-slow").await;

        assert!(!store.pool_contains("i-slow").await);
        assert!(!cloud.was_terminated("i-slow").await);
    }

    #[tokio::test]
    async fn readiness_retries_until_instance_appears_ready() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.add_running_instance("i-retry", "1.2.3.4").await;
        cloud
            .inject_failure(
                "describe_instance",
                CloudError::Transient("throttled".into()),
            )
            .await;
        let store = Arc::new(MemoryStore::new());
        let r = reactor(cloud.clone(), store.clone(), config(3, 1));

        r.handle_launch("i-retry").await;

        assert!(store.pool_contains("i-retry").await);
    }

    #[tokio::test]
    async fn instance_becoming_ready_mid_poll_joins_pool() {
        let cloud = Arc::new(FakeCloud::new());
        cloud
            .add_instance("i-boot", InstanceState::Pending, None)
            .await;
        let store = Arc::new(MemoryStore::new());
        let r = Arc::new(reactor(cloud.clone(), store.clone(), config(5, 50)));

        let task = {
            let r = r.clone();
            tokio::spawn(async move { r.handle_launch("i-boot").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cloud.add_running_instance("i-boot", "1.2.3.4").await;
        task.await.unwrap();

        assert!(store.pool_contains("i-boot").await);
    }

    #[tokio::test]
    async fn terminate_cleans_owned_session() {
        let cloud = Arc::new(FakeCloud::new());
        let store = Arc::new(MemoryStore::new());
        store
            .bind_workspace(
                "alice",
                &WorkspaceRecord {
                    instance_id: "i-1".into(),
                    public_endpoint: "1.2.3.4".into(),
                    custom_domain: None,
                    state: WorkspaceState::Running,
                    last_seen: 1_000,
                    ts: 1_000,
                },
            )
            .await
            .unwrap();
        PoolStore::add(store.as_ref(), "i-1").await.unwrap();

        let r = reactor(cloud, store.clone(), config(3, 1));
        r.handle_terminate("i-1").await;

        assert!(!store.pool_contains("i-1").await);
        assert_eq!(store.user_for_instance("i-1").await.unwrap(), None);
        assert_eq!(store.active_count().await.unwrap(), 0);
        assert!(store.workspace("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminate_unknown_instance_is_noop() {
        let cloud = Arc::new(FakeCloud::new());
        let store = Arc::new(MemoryStore::new());
        let r = reactor(cloud, store.clone(), config(3, 1));

        r.handle_terminate("i-mystery").await;
        assert_eq!(store.active_count().await.unwrap(), 0);
    }

    #[test]
    fn envelope_parses_plain_form() {
        let envelope: EventEnvelope =
            serde_json::from_str(r#"{"event": "instance-launch", "instanceId": "i-42"}"#).unwrap();
        assert_eq!(
            LifecycleEvent::from_envelope(&envelope),
            Some(LifecycleEvent::Launch {
                instance_id: "i-42".into()
            })
        );
    }

    #[test]
    fn envelope_parses_provider_transition_names() {
        let envelope: EventEnvelope = serde_json::from_str(
            r#"{"LifecycleTransition": "autoscaling:EC2_INSTANCE_TERMINATING", "EC2InstanceId": "i-7"}"#,
        )
        .unwrap();
        assert_eq!(
            LifecycleEvent::from_envelope(&envelope),
            Some(LifecycleEvent::Terminate {
                instance_id: "i-7".into()
            })
        );
    }

    #[test]
    fn envelope_rejects_unknown_kind_and_empty_id() {
        let envelope: EventEnvelope =
            serde_json::from_str(r#"{"event": "instance-refresh", "instanceId": "i-1"}"#).unwrap();
        assert_eq!(LifecycleEvent::from_envelope(&envelope), None);

        let envelope: EventEnvelope =
            serde_json::from_str(r#"{"event": "instance-launch", "instanceId": ""}"#).unwrap();
        assert_eq!(LifecycleEvent::from_envelope(&envelope), None);
    }
}
