//! FlowPulse Monitor - IDE activity relay and focus momentum engine.
//!
//! This binary relays the activity logs written by editor plugins to the flow
//! service and keeps a live momentum score for each plugin.
//!
//! # Commands
//!
//! - `flowpulse-monitor run`: Start the monitor daemon
//! - `flowpulse-monitor publish`: Run one pipeline cycle for every plugin and exit
//! - `flowpulse-monitor sweep-archive`: Delete expired archived batches
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flowpulse_monitor::agent::{AgentConfig, PluginAgent};
use flowpulse_monitor::config::Config;
use flowpulse_monitor::pipeline::{PluginPipeline, ARCHIVE_RETENTION};
use flowpulse_monitor::sender::{HttpFlowClient, SenderConfig};
use flowpulse_monitor::types::MomentumUpdate;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Capacity of the momentum update channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// FlowPulse Monitor - IDE activity relay and focus momentum engine.
///
/// Watches the activity logs written by editor plugins, publishes them to the
/// flow service in bounded batches, and tracks a live momentum score.
#[derive(Parser, Debug)]
#[command(name = "flowpulse-monitor")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    FLOWPULSE_SERVER_URL              Flow service URL (required for 'run' and 'publish')
    FLOWPULSE_SOURCE_ID               Monitor identifier (default: hostname)
    FLOWPULSE_FLOW_DIR                Plugin directory root (default: ~/.flowpulse/plugins)
    FLOWPULSE_PLUGINS                 Comma-separated plugins to monitor (default: all)
    FLOWPULSE_PUBLISH_INTERVAL_SECS   Seconds between pipeline cycles (default: 300)
    FLOWPULSE_REFRESH_INTERVAL_SECS   Seconds between snapshot refreshes (default: 120)
    FLOWPULSE_INTENTION_CREDIT        Credit momentum for new intentions (default: false)

EXAMPLES:
    # Start the monitor
    export FLOWPULSE_SERVER_URL=https://flow.example.com
    flowpulse-monitor run

    # Publish whatever is pending and exit
    flowpulse-monitor publish

    # Delete archived batches older than 30 days
    flowpulse-monitor sweep-archive --max-age-days 30
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the monitor daemon.
    ///
    /// Runs one agent per plugin until Ctrl+C or SIGTERM.
    /// Requires FLOWPULSE_SERVER_URL environment variable.
    Run,

    /// Recover, commit, and publish every plugin once, then exit.
    Publish,

    /// Delete archived batches older than the retention period.
    SweepArchive {
        /// Maximum age in days (default: 60).
        #[arg(long)]
        max_age_days: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    init_logging();

    runtime.block_on(async {
        match cli.command {
            Command::Run => run_monitor().await,
            Command::Publish => run_publish().await,
            Command::SweepArchive { max_age_days } => run_sweep(max_age_days).await,
        }
    })
}

fn load_config() -> Result<Config> {
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        source_id = %config.source_id,
        flow_dir = %config.flow_dir.display(),
        "Configuration loaded"
    );
    Ok(config)
}

fn build_client(config: &Config) -> Result<HttpFlowClient> {
    let server_url = config
        .require_server_url()
        .context("The flow service URL is required for this command")?;
    let sender_config = SenderConfig::new(server_url.to_string(), config.source_id.clone());
    HttpFlowClient::new(sender_config).context("Failed to create HTTP client")
}

fn plugins(config: &Config) -> Result<Vec<String>> {
    let plugins = config.resolve_plugins().context("Failed to determine plugins")?;
    if plugins.is_empty() {
        warn!(flow_dir = %config.flow_dir.display(), "No plugins found");
    }
    Ok(plugins)
}

/// Runs the monitor daemon.
async fn run_monitor() -> Result<()> {
    info!("Starting FlowPulse Monitor");

    let config = load_config()?;
    let client = Arc::new(build_client(&config)?);
    let (updates_tx, mut updates_rx) = mpsc::channel::<MomentumUpdate>(UPDATE_CHANNEL_CAPACITY);

    let agent_config = AgentConfig {
        publish_interval: config.publish_interval,
        refresh_interval: config.refresh_interval,
        intention_credit: config.intention_credit,
        ..AgentConfig::default()
    };

    let mut agents = Vec::new();
    for plugin_id in plugins(&config)? {
        let plugin_dir = config.plugin_dir(&plugin_id);
        if !plugin_dir.exists() {
            info!(plugin_id = %plugin_id, dir = %plugin_dir.display(), "Creating plugin directory");
            std::fs::create_dir_all(&plugin_dir).context("Failed to create plugin directory")?;
        }

        let (handle, task) = PluginAgent::spawn(
            plugin_id.clone(),
            plugin_dir,
            Arc::clone(&client),
            updates_tx.clone(),
            agent_config.clone(),
        )
        .with_context(|| format!("Failed to start agent for plugin {plugin_id}"))?;
        agents.push((handle, task));
    }
    drop(updates_tx);

    info!(agents = agents.len(), "Monitor running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received");
                break;
            }
            update = updates_rx.recv() => match update {
                Some(update) => info!(
                    plugin_id = %update.plugin_id,
                    momentum = update.momentum,
                    time = %update.time,
                    "Momentum update"
                ),
                None => {
                    warn!("All plugin agents have stopped");
                    break;
                }
            },
        }
    }

    info!("Shutting down...");
    for (handle, task) in agents {
        if handle.shutdown().await.is_err() {
            continue;
        }
        let timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        if tokio::time::timeout(timeout, task).await.is_err() {
            error!(plugin_id = %handle.plugin_id(), "Timeout while stopping plugin agent");
        }
    }

    info!("Monitor stopped");
    Ok(())
}

/// Runs one pipeline cycle for every plugin.
async fn run_publish() -> Result<()> {
    let config = load_config()?;
    let client = build_client(&config)?;

    for plugin_id in plugins(&config)? {
        let pipeline = PluginPipeline::new(plugin_id.clone(), config.plugin_dir(&plugin_id));
        match pipeline.run_cycle(&client).await {
            Ok(report) => println!(
                "{plugin_id}: {} archived, {} quarantined, {} deferred",
                report.publish.archived, report.publish.quarantined, report.publish.deferred
            ),
            Err(e) => error!(plugin_id = %plugin_id, error = %e, "Pipeline cycle failed"),
        }
    }
    Ok(())
}

/// Sweeps the archive of every plugin.
async fn run_sweep(max_age_days: Option<u64>) -> Result<()> {
    let config = load_config()?;
    let max_age = max_age_days
        .map(|days| Duration::from_secs(days * 24 * 60 * 60))
        .unwrap_or(ARCHIVE_RETENTION);

    for plugin_id in plugins(&config)? {
        let pipeline = PluginPipeline::new(plugin_id.clone(), config.plugin_dir(&plugin_id));
        let deleted = pipeline
            .sweep_archive(max_age)
            .await
            .with_context(|| format!("Failed to sweep archive for plugin {plugin_id}"))?;
        println!("{plugin_id}: {deleted} archived batch(es) deleted");
    }
    Ok(())
}

/// Initializes the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
