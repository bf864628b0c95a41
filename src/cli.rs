//! CLI-only subcommand implementations: `check` and `status`.
//!
//! These commands do not start the daemon; they are for verifying an
//! environment before `serve` and for quick fleet inspection after.

use std::path::PathBuf;

use anyhow::Result;

use crate::cloud::fake::FakeCloud;
use crate::cloud::{aws::AwsCloud, CloudError, CloudProvider};
use crate::config::Config;
use crate::server::system::fleet_snapshot;
use crate::store::redis::RedisStore;
use crate::store::{PoolStore, SessionStore};

/// Load configuration from a file, or from defaults plus env overrides
/// when no file is given.
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path),
        None => Config::from_env(),
    }
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self {
            label,
            ok: true,
            detail: detail.into(),
            fix: None,
        }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            label,
            ok: false,
            detail: detail.into(),
            fix: Some(fix.into()),
        }
    }
}

/// Run `devpool check`. Returns `Ok(())` if all checks pass.
pub async fn run_check(config: &Config, offline: bool) -> Result<()> {
    println!("Checking prerequisites...\n");

    let mut checks: Vec<Check> = Vec::new();

    checks.push(Check::pass(
        "config",
        format!(
            "asg '{}', max {} instances, {} warm spares",
            config.asg.name, config.asg.max_instances, config.asg.warm_spare_target
        ),
    ));

    if offline {
        let stub = FakeCloud::with_asg(0, 0, config.asg.max_instances).await;
        checks.push(match stub.describe_asg().await {
            Ok(_) => Check::pass("cloud", "offline stub wired"),
            Err(e) => Check::fail("cloud", e.to_string(), "offline stub should never fail"),
        });
        checks.push(Check::pass("state store", "skipped (offline)"));
    } else {
        checks.push(check_store(config).await);
        checks.push(check_cloud(config).await);
    }

    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if let Some(fix) = &c.fix {
            println!("      fix: {fix}");
        }
    }
    println!();

    if all_pass {
        println!("All checks passed.");
        Ok(())
    } else {
        anyhow::bail!("one or more checks failed")
    }
}

async fn check_store(config: &Config) -> Check {
    match RedisStore::connect(
        &config.store.url,
        &config.store.namespace,
        config.store.rpc_timeout_ms,
    )
    .await
    {
        Ok(store) => match SessionStore::active_count(&store).await {
            Ok(active) => Check::pass("state store", format!("reachable, {active} active users")),
            Err(e) => Check::fail(
                "state store",
                e.to_string(),
                format!("verify {} is reachable from this host", config.store.url),
            ),
        },
        Err(e) => Check::fail(
            "state store",
            e.to_string(),
            format!("verify store.url ({}) and network path", config.store.url),
        ),
    }
}

async fn check_cloud(config: &Config) -> Check {
    let cloud = AwsCloud::new(&config.cloud, &config.asg.name).await;
    match cloud.describe_asg().await {
        Ok(group) => Check::pass(
            "cloud",
            format!(
                "asg visible: desired {} (min {}, max {})",
                group.desired_capacity, group.min_size, group.max_size
            ),
        ),
        Err(e @ CloudError::Permission(_)) => Check::fail(
            "cloud",
            e.to_string(),
            "verify the credentials grant autoscaling:Describe* on this ASG",
        ),
        Err(CloudError::NotFound(_)) => Check::fail(
            "cloud",
            format!("asg '{}' not found", config.asg.name),
            "check asg.name and the configured region",
        ),
        Err(e) => Check::fail(
            "cloud",
            e.to_string(),
            "check credentials, region, and network path to the cloud API",
        ),
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Run `devpool status`: print a one-shot fleet snapshot as JSON.
pub async fn run_status(config: &Config) -> Result<()> {
    let store = RedisStore::connect(
        &config.store.url,
        &config.store.namespace,
        config.store.rpc_timeout_ms,
    )
    .await?;
    let cloud = AwsCloud::new(&config.cloud, &config.asg.name).await;

    let snapshot = fleet_snapshot(
        &store as &dyn SessionStore,
        &store as &dyn PoolStore,
        &cloud,
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
