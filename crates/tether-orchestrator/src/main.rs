//! tether: run a local backend for the current project
//!
//! Starts the backend on the project's per-branch state, pushes the
//! configured environment, deploys, and redeploys whenever files under the
//! watched directories change. Ctrl+C stops the backend.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use notify::{RecursiveMode, Watcher};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_core::config::{self, TetherConfig};
use tether_orchestrator::deploy::FileChange;
use tether_orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Run a local backend and keep it deployed")]
#[command(version)]
struct Args {
    /// Project root
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    /// Path to configuration file (defaults to <project>/tether.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Discard persisted backend state and start fresh
    #[arg(long)]
    reset: bool,

    /// Extra discriminator for the state identity (e.g. a worktree name)
    #[arg(long)]
    suffix: Option<String>,

    /// Backend binary to run instead of downloading one
    #[arg(long, env = "TETHER_BACKEND_BINARY")]
    binary: Option<PathBuf>,

    /// Address of the dev server, passed to computed environments
    #[arg(long)]
    dev_server: Option<String>,

    /// Delete the backend state on exit
    #[arg(long)]
    purge_on_exit: bool,

    /// Run with verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let project_root = args
        .project
        .canonicalize()
        .with_context(|| format!("Project directory {:?} not found", args.project))?;

    // Load configuration
    let mut config: TetherConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path(&project_root);
        if default_path.exists() {
            config::load_config(&default_path)
                .with_context(|| format!("Failed to load config from {:?}", default_path))?
        } else {
            tracing::info!("Using default configuration");
            TetherConfig::default()
        }
    };

    // CLI overrides
    if args.reset {
        config.state.reset = true;
    }
    if args.suffix.is_some() {
        config.state.suffix = args.suffix.clone();
    }
    if args.binary.is_some() {
        config.binary.path = args.binary.clone();
    }
    if args.purge_on_exit {
        config.backend.purge_on_exit = true;
    }

    let orchestrator = Arc::new(Orchestrator::new(project_root, config));
    orchestrator.install_signal_handlers();

    let endpoint = match orchestrator.start().await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            let _ = orchestrator.shutdown().await;
            return Err(e).context("Failed to start backend");
        }
    };
    tracing::info!("Backend running at {}", endpoint.url());

    // Feed file changes into the orchestrator
    let watch_target = Arc::clone(&orchestrator);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                for change in FileChange::from_event(&event) {
                    watch_target.notify_file_change(change);
                }
            }
            Err(e) => tracing::warn!("File watcher error: {}", e),
        }
    })
    .context("Failed to create file watcher")?;

    for root in orchestrator.watch_roots() {
        if root.exists() {
            watcher
                .watch(&root, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {:?}", root))?;
            tracing::info!("Watching {:?}", root);
        } else {
            tracing::warn!("Watch directory {:?} does not exist", root);
        }
    }

    if let Err(e) = orchestrator.dev_server_listening(args.dev_server.as_deref()).await {
        let _ = orchestrator.shutdown().await;
        return Err(e).context("Failed to configure backend");
    }

    tracing::info!("Ready. Press Ctrl+C to stop.");
    orchestrator.wait_for_shutdown().await;
    drop(watcher);

    tracing::info!("tether stopped");
    Ok(())
}
