use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the devpool daemon.
///
/// Loaded from a TOML file, then overridden by `DEVPOOL_*` environment
/// variables so deployments can stay file-less.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub asg: AsgConfig,
    pub store: StoreConfig,
    pub cloud: CloudConfig,
    pub allocation: AllocationConfig,
    pub reaper: ReaperConfig,
    pub lifecycle: LifecycleConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults plus env overrides alone.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `DEVPOOL_*` environment variable overrides.
    fn apply_env(&mut self) {
        env_override("DEVPOOL_ASG_NAME", &mut self.asg.name);
        env_parse("DEVPOOL_MAX_INSTANCES", &mut self.asg.max_instances);
        env_parse("DEVPOOL_WARM_SPARE_TARGET", &mut self.asg.warm_spare_target);
        env_override("DEVPOOL_REDIS_URL", &mut self.store.url);
        env_override("DEVPOOL_NAMESPACE", &mut self.store.namespace);
        env_parse("DEVPOOL_STORE_TIMEOUT_MS", &mut self.store.rpc_timeout_ms);
        env_override("DEVPOOL_AWS_REGION", &mut self.cloud.region);
        env_parse("DEVPOOL_CLOUD_TIMEOUT_MS", &mut self.cloud.rpc_timeout_ms);
        env_parse("DEVPOOL_CLOUD_RETRY_ATTEMPTS", &mut self.cloud.retry_extra_attempts);
        env_parse("DEVPOOL_ALLOCATION_TIMEOUT_MS", &mut self.allocation.timeout_ms);
        env_parse("DEVPOOL_IDLE_TIMEOUT_MS", &mut self.reaper.idle_timeout_ms);
        env_parse("DEVPOOL_CLEANUP_INTERVAL_MS", &mut self.reaper.cleanup_interval_ms);
        env_parse("DEVPOOL_REAPER_BATCH_LIMIT", &mut self.reaper.max_users_per_tick);
        env_parse(
            "DEVPOOL_READINESS_MAX_ATTEMPTS",
            &mut self.lifecycle.readiness_max_attempts,
        );
        env_parse(
            "DEVPOOL_READINESS_BACKOFF_MS",
            &mut self.lifecycle.readiness_backoff_ms,
        );
        env_override("DEVPOOL_BIND_ADDR", &mut self.server.bind_addr);
        env_parse("DEVPOOL_PORT", &mut self.server.port);
        env_override("DEVPOOL_ADMIN_TOKEN", &mut self.server.admin_token);
        env_override("DEVPOOL_USER_HEADER", &mut self.server.user_header);
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.asg.name.is_empty(), "asg.name must be set");
        anyhow::ensure!(self.asg.max_instances >= 1, "asg.max_instances must be >= 1");
        anyhow::ensure!(
            self.asg.warm_spare_target <= self.asg.max_instances,
            "asg.warm_spare_target must be <= asg.max_instances"
        );
        anyhow::ensure!(!self.store.url.is_empty(), "store.url must be set");
        anyhow::ensure!(
            self.reaper.idle_timeout_ms >= self.reaper.cleanup_interval_ms,
            "reaper.idle_timeout_ms must be >= reaper.cleanup_interval_ms"
        );
        anyhow::ensure!(
            self.reaper.max_users_per_tick >= 1,
            "reaper.max_users_per_tick must be >= 1"
        );
        anyhow::ensure!(
            self.lifecycle.readiness_max_attempts >= 1,
            "lifecycle.readiness_max_attempts must be >= 1"
        );
        anyhow::ensure!(
            self.allocation.timeout_ms >= 1_000,
            "allocation.timeout_ms must be >= 1000"
        );
        anyhow::ensure!(self.server.port != 0, "server.port must be nonzero");
        Ok(())
    }
}

fn env_override(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *target = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}

/// Auto-scaling group control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsgConfig {
    /// Name of the ASG this orchestrator owns.
    pub name: String,
    /// Upper bound on desired capacity.
    pub max_instances: u32,
    /// Warm spares kept on top of active users.
    pub warm_spare_target: u32,
}

impl Default for AsgConfig {
    fn default() -> Self {
        Self {
            name: "devpool-workers".into(),
            max_instances: 20,
            warm_spare_target: 2,
        }
    }
}

/// State store (Redis) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix so several deployments can share one Redis.
    pub namespace: String,
    /// Per-RPC timeout.
    pub rpc_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            namespace: "devpool".into(),
            rpc_timeout_ms: 2_000,
        }
    }
}

/// Cloud provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// AWS region; empty means use the ambient provider chain.
    pub region: String,
    /// Per-RPC timeout.
    pub rpc_timeout_ms: u64,
    /// Extra attempts after the first for transient failures.
    pub retry_extra_attempts: u32,
    /// Base backoff between retries; jittered up to 2x.
    pub retry_backoff_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            rpc_timeout_ms: 10_000,
            retry_extra_attempts: 2,
            retry_backoff_ms: 250,
        }
    }
}

/// Per-request allocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Deadline for a single allocation request.
    pub timeout_ms: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Idle reaper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// A user idle longer than this is reaped.
    pub idle_timeout_ms: u64,
    /// Tick period.
    pub cleanup_interval_ms: u64,
    /// Users processed per tick at most.
    pub max_users_per_tick: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
            cleanup_interval_ms: 60_000,
            max_users_per_tick: 100,
        }
    }
}

/// Launch-event readiness polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Attempts before giving up on a launched instance.
    pub readiness_max_attempts: u32,
    /// Spacing between attempts (linear).
    pub readiness_backoff_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            readiness_max_attempts: 3,
            readiness_backoff_ms: 60_000,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Bearer token for admin endpoints. Empty disables admin auth
    /// (safe only on loopback).
    pub admin_token: String,
    /// Header carrying the authenticated user id, set by the fronting
    /// auth proxy.
    pub user_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 8088,
            admin_token: String::new(),
            user_header: "x-devpool-user".into(),
        }
    }
}
