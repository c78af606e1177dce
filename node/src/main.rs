// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Covenant Node
//!
//! Entry point for the `covenant-node` binary. Parses CLI arguments, loads
//! the configuration, restores the last snapshot, and serves the HTTP/WS API
//! and the metrics endpoint until interrupted.
//!
//! The binary supports three subcommands:
//!
//! - `run`: start the node
//! - `init`: create the data directory and a default `config.toml`
//! - `version`: print build version information

mod api;
mod cli;
mod config;
mod events;
mod ledger;
mod logging;
mod metrics;
mod storage;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;

use covenant_contracts::events::{FanoutSink, TracingSink};
use covenant_contracts::{EscrowEngine, EscrowRegistry, PartyId, SystemClock};

use cli::{Commands, CovenantCli};
use config::{NodeConfig, CONFIG_FILE_NAME};
use events::{NodeEventSink, EVENT_CHANNEL_CAPACITY};
use ledger::Ledger;
use metrics::EscrowMetrics;
use storage::{Snapshot, SNAPSHOT_FILE_NAME};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CovenantCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Resolves the configuration: explicit `--config`, then
/// `<data_dir>/config.toml`, then defaults. CLI flags win over the file.
fn load_config(args: &cli::RunArgs) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let path = args.data_dir.join(CONFIG_FILE_NAME);
            if path.exists() {
                NodeConfig::load(&path)
                    .with_context(|| format!("failed to load config from {}", path.display()))?
            } else {
                NodeConfig::default()
            }
        }
    };

    if let Some(addr) = args.listen {
        config.api.listen_addr = addr.to_string();
    }
    if let Some(addr) = args.metrics_listen {
        config.api.metrics_addr = addr.to_string();
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

/// Restores registry and ledger from the snapshot, or starts fresh with the
/// configured genesis balances.
fn restore_state(snapshot_path: &Path, config: &NodeConfig) -> Result<(EscrowRegistry, Ledger)> {
    if let Some(snapshot) = storage::load(snapshot_path)
        .with_context(|| format!("failed to read snapshot {}", snapshot_path.display()))?
    {
        return snapshot.restore().context("failed to restore snapshot");
    }

    let ledger = Ledger::new();
    for (party, amount) in &config.ledger.genesis {
        ledger
            .credit(&PartyId::new(party.as_str()), *amount)
            .with_context(|| format!("invalid genesis allocation for {}", party))?;
    }
    tracing::info!(
        accounts = config.ledger.genesis.len(),
        "no snapshot found, starting from genesis"
    );
    Ok((EscrowRegistry::new(), ledger))
}

/// Starts the node: API server and metrics endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    logging::init_logging(&config.logging.level, config.logging.format);

    let api_addr = config.api_addr()?;
    let metrics_addr = config.metrics_addr()?;
    tracing::info!(
        api = %api_addr,
        metrics = %metrics_addr,
        data_dir = %args.data_dir.display(),
        "starting covenant-node"
    );

    std::fs::create_dir_all(&args.data_dir).with_context(|| {
        format!("failed to create data directory: {}", args.data_dir.display())
    })?;
    let snapshot_path = args.data_dir.join(SNAPSHOT_FILE_NAME);

    // --- Metrics ---
    let node_metrics = Arc::new(EscrowMetrics::new().context("failed to register metrics")?);

    // --- Event fan-out ---
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(Arc::new(NodeEventSink::new(
            event_tx.clone(),
            Arc::clone(&node_metrics),
        )));

    // --- Engine ---
    let (registry, ledger) = restore_state(&snapshot_path, &config)?;
    let ledger = Arc::new(ledger);
    let engine = Arc::new(EscrowEngine::with_registry(
        registry,
        config.escrow.clone(),
        Arc::new(SystemClock::new()),
        ledger.clone(),
        Arc::new(sink),
    ));
    node_metrics
        .funds_held
        .set(i64::try_from(engine.funds_held()).unwrap_or(i64::MAX));
    tracing::info!(
        escrows = engine.escrow_count(),
        funds_held = engine.funds_held(),
        vault = ledger.vault_balance(),
        "escrow engine ready"
    );

    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine: Arc::clone(&engine),
        ledger: Arc::clone(&ledger),
        event_tx,
        metrics: Arc::clone(&node_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    storage::save(
        &snapshot_path,
        &Snapshot::capture(engine.registry(), &ledger),
    )
    .context("failed to save snapshot")?;

    tracing::info!("covenant-node stopped");
    Ok(())
}

/// Creates the data directory and writes a default `config.toml`.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging(config::DEFAULT_LOG_LEVEL, logging::LogFormat::Pretty);

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let config_path = data_dir.join(CONFIG_FILE_NAME);
    if config_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let rendered = NodeConfig::default().to_toml()?;
    std::fs::write(&config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    tracing::info!(path = %config_path.display(), "default configuration written");

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());

    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("covenant-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc         {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed that branch never completes.
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
            Ok(mut stream) => {
                stream.recv().await;
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
