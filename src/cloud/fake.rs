//! Deterministic in-memory [`CloudProvider`] used by the test suites and
//! by `devpool check --offline`.
//!
//! Failures are injected per operation through a FIFO queue so tests can
//! script exact partial-failure sequences.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    AsgDescription, CloudError, CloudProvider, CloudResult, InstanceDescription, InstanceState,
    ProtectionStatus,
};

#[derive(Debug, Clone)]
struct FakeInstance {
    state: InstanceState,
    public_endpoint: Option<String>,
    tags: HashMap<String, String>,
    protected: bool,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<String, FakeInstance>,
    desired: u32,
    min_size: u32,
    max_size: u32,
    terminated: Vec<String>,
    failures: HashMap<&'static str, VecDeque<CloudError>>,
}

/// In-memory cloud with a scriptable ASG.
#[derive(Default)]
pub struct FakeCloud {
    inner: Mutex<Inner>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_asg(desired: u32, min_size: u32, max_size: u32) -> Self {
        let cloud = Self::new();
        {
            let mut inner = cloud.inner.lock().await;
            inner.desired = desired;
            inner.min_size = min_size;
            inner.max_size = max_size;
        }
        cloud
    }

    /// Register a running instance with a public endpoint.
    pub async fn add_running_instance(&self, instance_id: &str, endpoint: &str) {
        self.add_instance(instance_id, InstanceState::Running, Some(endpoint)).await;
    }

    /// Register an instance in an arbitrary state.
    pub async fn add_instance(
        &self,
        instance_id: &str,
        state: InstanceState,
        endpoint: Option<&str>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.instances.insert(
            instance_id.to_string(),
            FakeInstance {
                state,
                public_endpoint: endpoint.map(str::to_string),
                tags: HashMap::new(),
                protected: false,
            },
        );
    }

    /// Queue an error for the next call of the named operation.
    pub async fn inject_failure(&self, op: &'static str, err: CloudError) {
        let mut inner = self.inner.lock().await;
        inner.failures.entry(op).or_default().push_back(err);
    }

    async fn take_failure(&self, op: &'static str) -> Option<CloudError> {
        let mut inner = self.inner.lock().await;
        inner.failures.get_mut(op).and_then(|q| q.pop_front())
    }

    pub async fn desired_capacity(&self) -> u32 {
        self.inner.lock().await.desired
    }

    pub async fn tag(&self, instance_id: &str, key: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .instances
            .get(instance_id)
            .and_then(|i| i.tags.get(key).cloned())
    }

    pub async fn is_protected(&self, instance_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|i| i.protected)
            .unwrap_or(false)
    }

    pub async fn was_terminated(&self, instance_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .terminated
            .iter()
            .any(|id| id == instance_id)
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<InstanceDescription> {
        if let Some(err) = self.take_failure("describe_instance").await {
            return Err(err);
        }
        let inner = self.inner.lock().await;
        let instance = inner
            .instances
            .get(instance_id)
            .ok_or_else(|| CloudError::NotFound(format!("instance {instance_id}")))?;
        Ok(InstanceDescription {
            instance_id: instance_id.to_string(),
            state: instance.state.clone(),
            public_endpoint: instance.public_endpoint.clone(),
            tags: instance.tags.clone(),
        })
    }

    async fn set_tags(&self, instance_id: &str, tags: &[(String, String)]) -> CloudResult<()> {
        if let Some(err) = self.take_failure("set_tags").await {
            return Err(err);
        }
        let mut inner = self.inner.lock().await;
        let instance = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| CloudError::NotFound(format!("instance {instance_id}")))?;
        for (key, value) in tags {
            instance.tags.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn set_scale_in_protection(
        &self,
        instance_ids: &[String],
        protect: bool,
    ) -> CloudResult<Vec<ProtectionStatus>> {
        if let Some(err) = self.take_failure("set_scale_in_protection").await {
            return Err(err);
        }
        let mut inner = self.inner.lock().await;
        let mut statuses = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            match inner.instances.get_mut(id) {
                Some(instance) => {
                    instance.protected = protect;
                    statuses.push(ProtectionStatus {
                        instance_id: id.clone(),
                        ok: true,
                        message: None,
                    });
                }
                None => statuses.push(ProtectionStatus {
                    instance_id: id.clone(),
                    ok: false,
                    message: Some(format!("instance {id} not in group")),
                }),
            }
        }
        Ok(statuses)
    }

    async fn describe_asg(&self) -> CloudResult<AsgDescription> {
        if let Some(err) = self.take_failure("describe_asg").await {
            return Err(err);
        }
        let inner = self.inner.lock().await;
        Ok(AsgDescription {
            desired_capacity: inner.desired,
            min_size: inner.min_size,
            max_size: inner.max_size,
            instance_ids: inner.instances.keys().cloned().collect(),
        })
    }

    async fn set_desired_capacity(&self, desired: u32) -> CloudResult<()> {
        if let Some(err) = self.take_failure("set_desired_capacity").await {
            return Err(err);
        }
        let mut inner = self.inner.lock().await;
        if inner.max_size > 0 && desired > inner.max_size {
            return Err(CloudError::Conflict(format!(
                "desired {desired} exceeds max size {}",
                inner.max_size
            )));
        }
        inner.desired = desired;
        Ok(())
    }

    async fn terminate_in_asg_decrementing(&self, instance_id: &str) -> CloudResult<()> {
        if let Some(err) = self.take_failure("terminate").await {
            return Err(err);
        }
        let mut inner = self.inner.lock().await;
        if inner.instances.remove(instance_id).is_none() {
            return Err(CloudError::NotFound(format!("instance {instance_id}")));
        }
        inner.terminated.push(instance_id.to_string());
        inner.desired = inner.desired.saturating_sub(1);
        Ok(())
    }
}
