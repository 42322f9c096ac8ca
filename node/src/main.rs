// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # MarketPulse Node
//!
//! Entry point for the `marketpulse-node` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the vault store, starts the vault
//! manager loop, and serves the HTTP/WS API.
//!
//! Subcommands:
//!
//! - `run`    : start the node
//! - `init`   : write a default configuration file
//! - `version`: print build version information

mod api;
mod cli;
mod config;
mod logging;
mod manager;
mod metrics;
mod simulation;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;

use marketpulse_engine::clock::{Clock, SystemClock};
use marketpulse_engine::storage::VaultStore;
use marketpulse_engine::VaultRegistry;

use cli::{Commands, MarketPulseCli};
use config::NodeConfig;
use manager::{ManagerStatus, VaultManager};
use metrics::NodeMetrics;
use simulation::Simulation;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = MarketPulseCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_config(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the node: store, registry, manager loop, API and metrics servers.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let mut node_config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(operator) = args.operator {
        node_config.operator = operator;
    }
    if let Some(format) = args.log_format {
        node_config.logging.format = format;
    }
    node_config.validate()?;
    logging::init_logging(&node_config.logging)?;

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        ephemeral = args.ephemeral,
        operator = %node_config.operator,
        "starting marketpulse-node"
    );

    // --- Persistent storage ---
    let store = if args.ephemeral {
        tracing::warn!("ephemeral mode: vault state is discarded on shutdown");
        VaultStore::open_temporary().context("failed to open temporary store")?
    } else {
        let db_path = args.data_dir.join("vaults");
        std::fs::create_dir_all(&db_path).with_context(|| {
            format!("failed to create database directory: {}", db_path.display())
        })?;
        let store = VaultStore::open(&db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;
        tracing::info!(path = %db_path.display(), "database opened");
        store
    };

    // --- Registry over simulated collaborators ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sim = Simulation::new(node_config.venue.price_impact_bps);
    let registry = Arc::new(
        VaultRegistry::open(
            node_config.registry_config(),
            sim.context(Arc::clone(&clock)),
            store,
        )
        .context("failed to open vault registry")?,
    );
    sim.restore(&registry)?;

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics")?);
    let metrics_feed = metrics::spawn_event_feed(Arc::clone(&node_metrics), Arc::clone(&registry));

    // --- Vault manager ---
    let (manager_status, manager_loop) = if node_config.liquidity_manager.enabled {
        let manager = VaultManager::new(
            Arc::clone(&registry),
            Arc::clone(&clock),
            &node_config.operator,
            node_config.check_interval(),
        )
        .with_metrics(Arc::clone(&node_metrics));
        let status = manager.status();
        (status, Some(tokio::spawn(manager.run())))
    } else {
        tracing::info!("vault manager disabled");
        let status = ManagerStatus {
            operator: node_config.operator.clone(),
            check_interval_secs: node_config.liquidity_manager.check_interval,
            ..ManagerStatus::default()
        };
        (Arc::new(parking_lot::RwLock::new(status)), None)
    };

    // --- Application state ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        operator: node_config.operator.clone(),
        registry: Arc::clone(&registry),
        sim,
        metrics: Arc::clone(&node_metrics),
        manager: manager_status,
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Some(handle) = manager_loop {
        handle.abort();
    }
    metrics_feed.abort();
    tracing::info!(
        vaults = registry.vault_count(),
        tvl = registry.total_value_locked(),
        "marketpulse-node stopped"
    );
    Ok(())
}

/// Writes a default configuration file.
fn init_config(args: cli::InitArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        bail!(
            "{} already exists (pass --force to overwrite)",
            args.output.display()
        );
    }
    NodeConfig::default().write(&args.output)?;
    println!("Wrote default configuration to {}", args.output.display());
    Ok(())
}

fn print_version() {
    println!("marketpulse-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc            {}", rustc_version());
}

fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// If a handler cannot be installed, that signal is never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
