//! Session and warm-pool state, backed by the remote key-value store.
//!
//! The store is the authoritative record of which instance belongs to
//! which user; cloud tags are advisory. Every correctness-critical
//! mutation is a single atomic multi-key unit.

pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::OrchResult;

/// Workspace lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkspaceState {
    Pending,
    Running,
    Stopped,
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl std::str::FromStr for WorkspaceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "STOPPED" => Ok(Self::Stopped),
            other => Err(format!("unknown workspace state: {other}")),
        }
    }
}

/// Per-user workspace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    /// The currently bound instance.
    pub instance_id: String,
    /// Reachable address for the client.
    pub public_endpoint: String,
    /// Optional vanity URL allocated by an external collaborator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    pub state: WorkspaceState,
    /// Epoch-ms of the most recent liveness signal.
    pub last_seen: i64,
    /// Epoch-ms of creation.
    pub ts: i64,
}

impl WorkspaceRecord {
    /// Rebuild from hash fields (camelCase per the wire schema). `None`
    /// when the hash is absent or missing its instance binding.
    pub(crate) fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let instance_id = fields.get("instanceId")?.clone();
        if instance_id.is_empty() {
            return None;
        }
        Some(Self {
            instance_id,
            public_endpoint: fields.get("publicEndpoint").cloned().unwrap_or_default(),
            custom_domain: fields.get("customDomain").cloned(),
            state: fields
                .get("state")
                .and_then(|s| s.parse().ok())
                .unwrap_or(WorkspaceState::Pending),
            last_seen: fields
                .get("lastSeen")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            ts: fields.get("ts").and_then(|s| s.parse().ok()).unwrap_or(0),
        })
    }
}

/// Outcome of the conditional per-user bind.
#[derive(Debug, Clone)]
pub enum BindOutcome {
    /// The record was persisted; the caller owns the workspace.
    Bound,
    /// A concurrent bind won. Carries the winner's record when it could
    /// be re-read.
    Lost(Option<WorkspaceRecord>),
}

/// Per-user workspace records, the inverse instance mapping, and the
/// liveness index. Multi-key operations are atomic.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn workspace(&self, user_id: &str) -> OrchResult<Option<WorkspaceRecord>>;

    /// Persist the record, the inverse mapping, and the liveness entry in
    /// one unit — only if no RUNNING record already exists for the user.
    async fn bind_workspace(
        &self,
        user_id: &str,
        record: &WorkspaceRecord,
    ) -> OrchResult<BindOutcome>;

    async fn user_for_instance(&self, instance_id: &str) -> OrchResult<Option<String>>;

    /// Advance `lastSeen` in the hash and the liveness index atomically,
    /// forcing `state=RUNNING`.
    async fn record_ping(&self, user_id: &str, now_ms: i64) -> OrchResult<()>;

    /// Users whose `lastSeen` is at or below the cutoff, oldest first.
    async fn idle_users(&self, cutoff_ms: i64, limit: usize) -> OrchResult<Vec<String>>;

    /// Cardinality of the liveness index.
    async fn active_count(&self) -> OrchResult<u64>;

    /// In one unit: mark the workspace STOPPED, drop the user from the
    /// liveness index, delete the inverse mapping.
    async fn cleanup(&self, user_id: &str, instance_id: &str) -> OrchResult<()>;

    /// Delete the (STOPPED) workspace hash. Idempotent.
    async fn purge(&self, user_id: &str) -> OrchResult<()>;
}

/// The set of unassigned, ready instances.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Atomically claim one member; no instance is handed to two callers.
    async fn pop(&self) -> OrchResult<Option<String>>;

    /// Idempotent insert. Callers must have verified the instance is
    /// tagged unassigned and unprotected.
    async fn add(&self, instance_id: &str) -> OrchResult<()>;

    /// Idempotent delete.
    async fn remove(&self, instance_id: &str) -> OrchResult<()>;

    async fn size(&self) -> OrchResult<u64>;

    /// Snapshot of current members, used by the reconciliation sweep.
    async fn members(&self) -> OrchResult<Vec<String>>;
}

/// Key layout under a deployment namespace.
#[derive(Debug, Clone)]
pub(crate) struct Keys {
    ns: String,
}

impl Keys {
    pub fn new(namespace: &str) -> Self {
        Self {
            ns: namespace.to_string(),
        }
    }

    pub fn workspace(&self, user_id: &str) -> String {
        format!("{}:ws:{}", self.ns, user_id)
    }

    pub fn instance(&self, instance_id: &str) -> String {
        format!("{}:inst:{}", self.ns, instance_id)
    }

    pub fn pings(&self) -> String {
        format!("{}:ws:pings", self.ns)
    }

    pub fn pool(&self) -> String {
        format!("{}:ws:pool", self.ns)
    }
}
