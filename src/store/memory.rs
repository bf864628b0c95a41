//! In-memory store used by the hermetic test suites.
//!
//! A single mutex around all state gives the same atomic multi-key
//! semantics the Redis transactions provide.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{BindOutcome, PoolStore, SessionStore, WorkspaceRecord, WorkspaceState};
use crate::error::{OrchResult, OrchestratorError};

#[derive(Default)]
struct Inner {
    workspaces: HashMap<String, WorkspaceRecord>,
    instance_to_user: HashMap<String, String>,
    pings: HashMap<String, i64>,
    // Insertion-ordered so tests get deterministic claims.
    pool: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pool_contains(&self, instance_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .pool
            .iter()
            .any(|id| id == instance_id)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn workspace(&self, user_id: &str) -> OrchResult<Option<WorkspaceRecord>> {
        Ok(self.inner.lock().await.workspaces.get(user_id).cloned())
    }

    async fn bind_workspace(
        &self,
        user_id: &str,
        record: &WorkspaceRecord,
    ) -> OrchResult<BindOutcome> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.workspaces.get(user_id) {
            if existing.state == WorkspaceState::Running {
                return Ok(BindOutcome::Lost(Some(existing.clone())));
            }
        }
        inner
            .workspaces
            .insert(user_id.to_string(), record.clone());
        inner
            .instance_to_user
            .insert(record.instance_id.clone(), user_id.to_string());
        inner.pings.insert(user_id.to_string(), record.last_seen);
        Ok(BindOutcome::Bound)
    }

    async fn user_for_instance(&self, instance_id: &str) -> OrchResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .await
            .instance_to_user
            .get(instance_id)
            .cloned())
    }

    async fn record_ping(&self, user_id: &str, now_ms: i64) -> OrchResult<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .workspaces
            .get_mut(user_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("no workspace for user {user_id}")))?;
        record.last_seen = now_ms;
        record.state = WorkspaceState::Running;
        inner.pings.insert(user_id.to_string(), now_ms);
        Ok(())
    }

    async fn idle_users(&self, cutoff_ms: i64, limit: usize) -> OrchResult<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut idle: Vec<(String, i64)> = inner
            .pings
            .iter()
            .filter(|(_, &seen)| seen <= cutoff_ms)
            .map(|(u, &seen)| (u.clone(), seen))
            .collect();
        idle.sort_by_key(|(_, seen)| *seen);
        Ok(idle.into_iter().take(limit).map(|(u, _)| u).collect())
    }

    async fn active_count(&self) -> OrchResult<u64> {
        Ok(self.inner.lock().await.pings.len() as u64)
    }

    async fn cleanup(&self, user_id: &str, instance_id: &str) -> OrchResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.workspaces.get_mut(user_id) {
            record.state = WorkspaceState::Stopped;
        }
        inner.pings.remove(user_id);
        inner.instance_to_user.remove(instance_id);
        Ok(())
    }

    async fn purge(&self, user_id: &str) -> OrchResult<()> {
        self.inner.lock().await.workspaces.remove(user_id);
        Ok(())
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn pop(&self) -> OrchResult<Option<String>> {
        let mut inner = self.inner.lock().await;
        if inner.pool.is_empty() {
            Ok(None)
        } else {
            Ok(Some(inner.pool.remove(0)))
        }
    }

    async fn add(&self, instance_id: &str) -> OrchResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.pool.iter().any(|id| id == instance_id) {
            inner.pool.push(instance_id.to_string());
        }
        Ok(())
    }

    async fn remove(&self, instance_id: &str) -> OrchResult<()> {
        self.inner.lock().await.pool.retain(|id| id != instance_id);
        Ok(())
    }

    async fn size(&self) -> OrchResult<u64> {
        Ok(self.inner.lock().await.pool.len() as u64)
    }

    async fn members(&self) -> OrchResult<Vec<String>> {
        Ok(self.inner.lock().await.pool.clone())
    }
}
