mod cli;
mod cloud;
mod config;
mod error;
mod metrics;
mod orchestrator;
mod server;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cloud::aws::AwsCloud;
use crate::cloud::{CloudProvider, RetryPolicy};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::orchestrator::allocator::Allocator;
use crate::orchestrator::capacity::CapacityController;
use crate::orchestrator::lifecycle::LifecycleReactor;
use crate::orchestrator::reaper::IdleReaper;
use crate::orchestrator::NoopBinder;
use crate::server::AppState;
use crate::store::redis::RedisStore;
use crate::store::{PoolStore, SessionStore};

#[derive(Parser)]
#[command(
    name = "devpool",
    about = "Warm-pool workspace orchestrator for cloud dev instances"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator daemon.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify config and upstream connectivity. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Skip live store/cloud probes.
        #[arg(long)]
        offline: bool,
    },
    /// Print a one-shot fleet snapshot as JSON.
    Status {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

// Exit codes: 0 normal, 1 configuration error, 2 store/cloud failure.
const EXIT_CONFIG: u8 = 1;
const EXIT_UPSTREAM: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config: path } => {
            let config = match cli::load_config(path) {
                Ok(c) => c,
                Err(e) => return config_failure(e),
            };
            match serve(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = format!("{e:#}"), "startup failed");
                    ExitCode::from(EXIT_UPSTREAM)
                }
            }
        }
        Commands::Check {
            config: path,
            offline,
        } => {
            let config = match cli::load_config(path) {
                Ok(c) => c,
                Err(e) => return config_failure(e),
            };
            match cli::run_check(&config, offline).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(_) => ExitCode::from(EXIT_UPSTREAM),
            }
        }
        Commands::Status { config: path } => {
            let config = match cli::load_config(path) {
                Ok(c) => c,
                Err(e) => return config_failure(e),
            };
            match cli::run_status(&config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("status failed: {e:#}");
                    ExitCode::from(EXIT_UPSTREAM)
                }
            }
        }
    }
}

fn config_failure(e: anyhow::Error) -> ExitCode {
    eprintln!("configuration error: {e:#}");
    ExitCode::from(EXIT_CONFIG)
}

async fn serve(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let metrics = Metrics::new();

    info!(
        asg = %config.asg.name,
        max_instances = config.asg.max_instances,
        warm_spare_target = config.asg.warm_spare_target,
        "devpool starting"
    );

    let store = RedisStore::connect(
        &config.store.url,
        &config.store.namespace,
        config.store.rpc_timeout_ms,
    )
    .await
    .context("connecting to state store")?;
    let sessions: Arc<dyn SessionStore> = Arc::new(store.clone());
    let pool: Arc<dyn PoolStore> = Arc::new(store);

    let cloud: Arc<dyn CloudProvider> =
        Arc::new(AwsCloud::new(&config.cloud, &config.asg.name).await);
    // Fail fast on bad credentials or a misnamed ASG.
    cloud
        .describe_asg()
        .await
        .context("verifying cloud credentials and ASG visibility")?;

    let retry = RetryPolicy::new(
        config.cloud.retry_extra_attempts,
        config.cloud.retry_backoff_ms,
    );

    let capacity = Arc::new(CapacityController::new(
        cloud.clone(),
        sessions.clone(),
        pool.clone(),
        config.asg.clone(),
        retry,
        metrics.clone(),
    ));
    let allocator = Arc::new(Allocator::new(
        cloud.clone(),
        sessions.clone(),
        pool.clone(),
        Arc::new(NoopBinder),
        capacity.clone(),
        config.allocation.timeout_ms,
        retry,
        metrics.clone(),
    ));
    let reactor = Arc::new(LifecycleReactor::new(
        cloud.clone(),
        sessions.clone(),
        pool.clone(),
        config.lifecycle.clone(),
        metrics.clone(),
    ));
    let reaper = Arc::new(IdleReaper::new(
        cloud.clone(),
        sessions.clone(),
        pool.clone(),
        capacity.clone(),
        config.reaper.clone(),
        retry,
        metrics.clone(),
    ));

    // Converge desired capacity once on boot so a restarted orchestrator
    // recovers without waiting for the first reaper tick.
    if let Err(e) = capacity.reconcile().await {
        warn!(error = %e, "startup capacity reconcile failed");
    }

    let reaper_task = tokio::spawn(reaper.run());
    info!("idle reaper started");

    let state = Arc::new(AppState {
        config: config.clone(),
        cloud,
        sessions,
        pool,
        allocator,
        reactor,
        metrics,
    });

    server::serve(state, shutdown_signal()).await?;

    reaper_task.abort();
    info!("devpool shut down");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, initiating shutdown");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}
