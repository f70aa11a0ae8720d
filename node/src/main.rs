// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # skycast-node
//!
//! Entry point for the skycast broadcast node. Parses CLI arguments,
//! initializes logging, opens storage, and runs the scheduler daemon next to
//! the operator API and the Prometheus metrics server.
//!
//! ## Subcommands
//!
//! - `run`: Start the scheduler daemon and the HTTP servers.
//! - `init`: Create a data directory and generate a server secret.
//! - `regions`: List regions or flip a region's receiver flag.
//! - `version`: Print version info.

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use skycast_protocol::auth::TokenAuthority;
use skycast_protocol::config::{self, BidPolicy, QueueConfig, SchedulerConfig};
use skycast_protocol::notify::BroadcastSink;
use skycast_protocol::payload::FsPayloadStore;
use skycast_protocol::storage::QueueDb;
use skycast_protocol::{BroadcastQueue, Scheduler};

use cli::{Commands, RegionAction, SkycastCli};
use logging::LogFormat;
use metrics::{MetricsSink, NodeMetrics};

/// Capacity of the event bus feeding websocket subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How often queue depth gauges are refreshed.
const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Name of the server secret file inside the data directory.
const SECRET_FILE: &str = "server.secret";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SkycastCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Regions(args) => regions(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Opens storage, starts the scheduler daemon, and serves the operator API
/// and metrics until a shutdown signal arrives.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format);

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        transmit_rate = args.transmit_rate,
        data_dir = %args.data_dir.display(),
        "starting skycast-node"
    );

    // --- Persistent storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = QueueDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let payload_dir = args.data_dir.join("messages");
    let payloads = FsPayloadStore::open(&payload_dir)
        .with_context(|| format!("failed to open payload directory {}", payload_dir.display()))?;

    let secret = load_secret(args.server_secret.as_deref(), &args.data_dir)?;

    // --- Metrics + event bus ---
    let node_metrics =
        Arc::new(NodeMetrics::new().context("failed to create prometheus registry")?);
    let bus = BroadcastSink::new(EVENT_CHANNEL_CAPACITY);
    let sink = MetricsSink::new(Arc::clone(&node_metrics), Arc::new(bus.clone()));

    // --- Queue service ---
    let queue_config = QueueConfig {
        bids: BidPolicy {
            min_per_byte_bid: args.min_per_byte_bid,
            min_bid: args.min_bid,
        },
        max_message_size: config::max_message_size(args.transmit_rate),
        pending_order_ttl: Duration::from_secs(args.pending_order_ttl_hours.saturating_mul(3600)),
        message_retention: Duration::from_secs(args.retention_days.saturating_mul(86_400)),
        callback_root: args.callback_root.clone(),
        ..QueueConfig::default()
    };
    let queue = BroadcastQueue::open(
        db,
        Arc::new(payloads),
        Arc::new(sink),
        TokenAuthority::new(&secret),
        queue_config,
    )
    .context("failed to open broadcast queue")?;
    let queue = Arc::new(queue);
    tracing::info!(
        regions = queue.regions().len(),
        required_tx = ?queue.quorum().required_tx,
        required_rx = ?queue.quorum().required_rx,
        "region registry loaded"
    );

    // --- Scheduler daemon ---
    let scheduler_config = SchedulerConfig {
        transmit_rate: args.transmit_rate,
        duty_cycle: Duration::from_secs(args.duty_cycle_secs),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
    };
    let scheduler = Scheduler::new(Arc::clone(&queue), scheduler_config, &args.data_dir)
        .context("failed to start scheduler")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    // --- Gauge sampling ---
    let gauge_queue = Arc::clone(&queue);
    let gauge_metrics = Arc::clone(&node_metrics);
    let gauge_loop = tokio::spawn(async move {
        let mut interval = tokio::time::interval(GAUGE_REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            gauge_metrics.observe_queue(&gauge_queue);
        }
    });

    // --- API server ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        transmit_rate: args.transmit_rate,
        queue: Arc::clone(&queue),
        events: bus.sender(),
        metrics: Arc::clone(&node_metrics),
    };
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
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    let mut scheduler_done = false;
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
        res = &mut scheduler_task => {
            scheduler_done = true;
            match res {
                Ok(Ok(())) => tracing::warn!("scheduler exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "scheduler failed"),
                Err(e) => tracing::error!(error = %e, "scheduler task panicked"),
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, waiting for the channel to go idle");
        }
    }

    gauge_loop.abort();
    // Ignored if the scheduler already exited.
    let _ = shutdown_tx.send(true);
    if !scheduler_done {
        match scheduler_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "scheduler failed during shutdown"),
            Err(e) => tracing::error!(error = %e, "scheduler task panicked"),
        }
    }

    queue.db().flush().context("failed to flush database")?;
    tracing::info!("skycast-node stopped");
    Ok(())
}

/// Reads the hex server secret from the flag/env value or the data directory.
fn load_secret(provided: Option<&str>, data_dir: &Path) -> Result<Vec<u8>> {
    let (encoded, source) = match provided {
        Some(s) => (s.trim().to_string(), "SKYCAST_SERVER_SECRET".to_string()),
        None => {
            let path = data_dir.join(SECRET_FILE);
            let contents = std::fs::read_to_string(&path).with_context(|| {
                format!(
                    "failed to read server secret from {} (run `skycast-node init` first)",
                    path.display()
                )
            })?;
            (contents.trim().to_string(), path.display().to_string())
        }
    };
    let secret = hex::decode(&encoded)
        .with_context(|| format!("server secret in {} is not valid hex", source))?;
    if secret.is_empty() {
        bail!("server secret in {} is empty", source);
    }
    Ok(secret)
}

/// Initializes a data directory and writes a fresh server secret.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("skycast_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    tracing::info!(data_dir = %data_dir.display(), "initializing node");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let secret_path = data_dir.join(SECRET_FILE);
    if secret_path.exists() && !args.force {
        bail!(
            "{} already exists; pass --force to replace it",
            secret_path.display()
        );
    }

    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    std::fs::write(&secret_path, hex::encode(secret))
        .with_context(|| format!("failed to write server secret to {}", secret_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&secret_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let db_path = data_dir.join("db");
    let db = QueueDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let seeded = db
        .seed_regions(&skycast_protocol::region::catalog())
        .context("failed to seed regions")?;
    db.flush().context("failed to flush database")?;

    tracing::info!(secret_path = %secret_path.display(), seeded, "server secret generated");

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Server secret  : {}", secret_path.display());
    println!("  Regions seeded : {}", seeded);

    Ok(())
}

/// Lists regions or records receiver presence for one of them.
fn regions(args: cli::RegionsArgs) -> Result<()> {
    let db_path = args.data_dir.join("db");
    let db = QueueDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    db.seed_regions(&skycast_protocol::region::catalog())
        .context("failed to seed regions")?;

    match args.action {
        RegionAction::List => {
            let regions = db.load_regions().context("failed to load regions")?;
            println!("{:<4} {:<4} {:<16} {:<16} receiver", "num", "id", "satellite", "coverage");
            for r in regions {
                println!(
                    "{:<4} {:<4} {:<16} {:<16} {}",
                    r.number,
                    r.id(),
                    r.name,
                    r.coverage,
                    if r.has_receiver { "yes" } else { "no" }
                );
            }
        }
        RegionAction::SetReceiver { number, presence } => {
            let Some(region) = db
                .set_has_receiver(number, presence.as_bool())
                .context("failed to update region")?
            else {
                bail!("region {} not found", number);
            };
            println!(
                "region {} ({}, {}): receiver {}",
                region.number,
                region.name,
                region.coverage,
                if region.has_receiver { "on" } else { "off" }
            );
            println!("restart the node for the quorum change to take effect");
        }
    }

    db.flush().context("failed to flush database")?;
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("skycast-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc        {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed the corresponding branch never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
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
