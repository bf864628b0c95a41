//! Redis implementation of the session and pool stores.
//!
//! Unconditional multi-key units use MULTI/EXEC pipelines. The
//! conditional bind and the ping update run as server-side Lua scripts:
//! WATCH state is per physical connection, and the connection manager
//! multiplexes every clone over one link, so WATCH/MULTI/EXEC cannot
//! provide compare-and-set here — a script can.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

use super::{BindOutcome, Keys, PoolStore, SessionStore, WorkspaceRecord, WorkspaceState};
use crate::error::{OrchResult, OrchestratorError};

/// Persist the workspace record only if no RUNNING record exists.
///
/// KEYS: workspace hash, inverse mapping, liveness index.
/// ARGV: userId, instanceId, publicEndpoint, state, lastSeen, ts,
/// customDomain ("" when absent). Returns 1 when bound, 0 when an
/// existing RUNNING record won.
const BIND_WORKSPACE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
local bound = redis.call('HGET', KEYS[1], 'instanceId')
if state == 'RUNNING' and bound and bound ~= '' then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1],
  'instanceId', ARGV[2],
  'publicEndpoint', ARGV[3],
  'state', ARGV[4],
  'lastSeen', ARGV[5],
  'ts', ARGV[6])
if ARGV[7] ~= '' then
  redis.call('HSET', KEYS[1], 'customDomain', ARGV[7])
end
redis.call('SET', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
return 1
"#;

/// Advance lastSeen and force RUNNING, only while a binding exists.
///
/// KEYS: workspace hash, liveness index. ARGV: userId, nowMs.
/// Returns 1 on update, 0 when the workspace is gone.
const RECORD_PING_SCRIPT: &str = r#"
local bound = redis.call('HGET', KEYS[1], 'instanceId')
if not bound or bound == '' then
  return 0
end
redis.call('HSET', KEYS[1], 'lastSeen', ARGV[2], 'state', 'RUNNING')
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

/// Redis-backed store. Cheap to clone; the connection manager multiplexes
/// and reconnects internally.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    keys: Keys,
    rpc_timeout: Duration,
    bind_script: Arc<Script>,
    ping_script: Arc<Script>,
}

impl RedisStore {
    pub async fn connect(url: &str, namespace: &str, rpc_timeout_ms: u64) -> OrchResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            keys: Keys::new(namespace),
            rpc_timeout: Duration::from_millis(rpc_timeout_ms),
            bind_script: Arc::new(Script::new(BIND_WORKSPACE_SCRIPT)),
            ping_script: Arc::new(Script::new(RECORD_PING_SCRIPT)),
        })
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> OrchResult<T> {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(OrchestratorError::TransientUpstream(
                "state store rpc timed out".into(),
            )),
        }
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn workspace(&self, user_id: &str) -> OrchResult<Option<WorkspaceRecord>> {
        let mut conn = self.manager.clone();
        let key = self.keys.workspace(user_id);
        let fields: HashMap<String, String> = self.bounded(conn.hgetall(&key)).await?;
        Ok(WorkspaceRecord::from_fields(&fields))
    }

    async fn bind_workspace(
        &self,
        user_id: &str,
        record: &WorkspaceRecord,
    ) -> OrchResult<BindOutcome> {
        let mut conn = self.manager.clone();
        let ws_key = self.keys.workspace(user_id);
        let inst_key = self.keys.instance(&record.instance_id);
        let pings_key = self.keys.pings();

        let bound: i64 = self
            .bounded(
                self.bind_script
                    .key(&ws_key)
                    .key(&inst_key)
                    .key(&pings_key)
                    .arg(user_id)
                    .arg(&record.instance_id)
                    .arg(&record.public_endpoint)
                    .arg(record.state.to_string())
                    .arg(record.last_seen)
                    .arg(record.ts)
                    .arg(record.custom_domain.as_deref().unwrap_or(""))
                    .invoke_async(&mut conn),
            )
            .await?;

        if bound == 1 {
            debug!(user_id, instance_id = %record.instance_id, "workspace bound");
            return Ok(BindOutcome::Bound);
        }

        // A concurrent bind won; hand back the winner's record.
        let winner: HashMap<String, String> = self.bounded(conn.hgetall(&ws_key)).await?;
        Ok(BindOutcome::Lost(
            WorkspaceRecord::from_fields(&winner)
                .filter(|r| r.state == WorkspaceState::Running),
        ))
    }

    async fn user_for_instance(&self, instance_id: &str) -> OrchResult<Option<String>> {
        let mut conn = self.manager.clone();
        let key = self.keys.instance(instance_id);
        self.bounded(conn.get(&key)).await
    }

    async fn record_ping(&self, user_id: &str, now_ms: i64) -> OrchResult<()> {
        let mut conn = self.manager.clone();
        let ws_key = self.keys.workspace(user_id);
        let pings_key = self.keys.pings();

        let updated: i64 = self
            .bounded(
                self.ping_script
                    .key(&ws_key)
                    .key(&pings_key)
                    .arg(user_id)
                    .arg(now_ms)
                    .invoke_async(&mut conn),
            )
            .await?;

        if updated == 0 {
            return Err(OrchestratorError::NotFound(format!(
                "no workspace for user {user_id}"
            )));
        }
        Ok(())
    }

    async fn idle_users(&self, cutoff_ms: i64, limit: usize) -> OrchResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let key = self.keys.pings();
        self.bounded(conn.zrangebyscore_limit(&key, "-inf", cutoff_ms, 0, limit as isize))
            .await
    }

    async fn active_count(&self) -> OrchResult<u64> {
        let mut conn = self.manager.clone();
        let key = self.keys.pings();
        self.bounded(conn.zcard(&key)).await
    }

    async fn cleanup(&self, user_id: &str, instance_id: &str) -> OrchResult<()> {
        let mut conn = self.manager.clone();
        let ws_key = self.keys.workspace(user_id);
        let inst_key = self.keys.instance(instance_id);
        let pings_key = self.keys.pings();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&ws_key, "state", WorkspaceState::Stopped.to_string())
            .ignore()
            .zrem(&pings_key, user_id)
            .ignore()
            .del(&inst_key)
            .ignore();

        let _: Option<()> = self.bounded(pipe.query_async(&mut conn)).await?;
        debug!(user_id, instance_id, "session cleaned up");
        Ok(())
    }

    async fn purge(&self, user_id: &str) -> OrchResult<()> {
        let mut conn = self.manager.clone();
        let key = self.keys.workspace(user_id);
        self.bounded(conn.del(&key)).await
    }
}

#[async_trait]
impl PoolStore for RedisStore {
    async fn pop(&self) -> OrchResult<Option<String>> {
        let mut conn = self.manager.clone();
        let key = self.keys.pool();
        self.bounded(conn.spop(&key)).await
    }

    async fn add(&self, instance_id: &str) -> OrchResult<()> {
        let mut conn = self.manager.clone();
        let key = self.keys.pool();
        self.bounded(conn.sadd(&key, instance_id)).await
    }

    async fn remove(&self, instance_id: &str) -> OrchResult<()> {
        let mut conn = self.manager.clone();
        let key = self.keys.pool();
        self.bounded(conn.srem(&key, instance_id)).await
    }

    async fn size(&self) -> OrchResult<u64> {
        let mut conn = self.manager.clone();
        let key = self.keys.pool();
        self.bounded(conn.scard(&key)).await
    }

    async fn members(&self) -> OrchResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let key = self.keys.pool();
        self.bounded(conn.smembers(&key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> RedisStore {
        RedisStore::connect("redis://127.0.0.1:6379", "devpool-test", 2_000)
            .await
            .expect("requires a running Redis")
    }

    fn record(instance_id: &str) -> WorkspaceRecord {
        WorkspaceRecord {
            instance_id: instance_id.into(),
            public_endpoint: "1.2.3.4".into(),
            custom_domain: None,
            state: WorkspaceState::Running,
            last_seen: 1_700_000_000_000,
            ts: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    #[ignore] // requires a running Redis instance
    async fn bind_then_read_roundtrip() {
        let store = test_store().await;
        store.purge("rt-user").await.unwrap();
        store.cleanup("rt-user", "i-rt").await.unwrap();
        store.purge("rt-user").await.unwrap();

        let rec = record("i-rt");
        assert!(matches!(
            store.bind_workspace("rt-user", &rec).await.unwrap(),
            BindOutcome::Bound
        ));
        assert_eq!(store.workspace("rt-user").await.unwrap().unwrap(), rec);
        assert_eq!(
            store.user_for_instance("i-rt").await.unwrap().as_deref(),
            Some("rt-user")
        );

        store.cleanup("rt-user", "i-rt").await.unwrap();
        store.purge("rt-user").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // requires a running Redis instance
    async fn second_bind_loses_to_running_record() {
        let store = test_store().await;
        store.cleanup("dup-user", "i-a").await.unwrap();
        store.purge("dup-user").await.unwrap();

        store.bind_workspace("dup-user", &record("i-a")).await.unwrap();
        match store.bind_workspace("dup-user", &record("i-b")).await.unwrap() {
            BindOutcome::Lost(Some(winner)) => assert_eq!(winner.instance_id, "i-a"),
            other => panic!("expected Lost, got {other:?}"),
        }

        store.cleanup("dup-user", "i-a").await.unwrap();
        store.purge("dup-user").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // requires a running Redis instance
    async fn pool_pop_is_single_claim() {
        let store = test_store().await;
        store.remove("i-p1").await.unwrap();
        store.add("i-p1").await.unwrap();

        let first = store.pop().await.unwrap();
        let second = store.pop().await.unwrap();
        assert_eq!(first.as_deref(), Some("i-p1"));
        assert_eq!(second, None);
    }
}
