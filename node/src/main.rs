// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # DEDI Gateway Node
//!
//! Entry point for the `dedi-gateway` binary. Parses CLI arguments, sets up
//! logging and metrics, assembles the [`Gateway`] and serves its HTTP
//! surface.
//!
//! - `run`     start the gateway
//! - `init`    create a data directory with a node key and starter config
//! - `status`  query a running gateway
//! - `version` print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use dedi_protocol::config::PROTOCOL_VERSION;
use dedi_protocol::Gateway;

use cli::{Commands, DediGatewayCli};
use logging::{LogFormat, DEFAULT_FILTER};
use metrics::GatewayMetrics;

/// How often expired challenges, join requests and invites are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DediGatewayCli::parse();

    match cli.command {
        Commands::Run(args) => run_gateway(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

async fn run_gateway(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, args.log_format);

    let config = settings::resolve(&args).context("failed to load configuration")?;
    tracing::info!(
        node = %config.node_name,
        endpoint = %config.endpoint,
        listen = %args.listen,
        "starting dedi-gateway"
    );

    // Bad key material or an unopenable store end the process here.
    let gateway = Arc::new(Gateway::build(config).context("failed to assemble gateway")?);
    let metrics = Arc::new(GatewayMetrics::new().context("failed to register metrics")?);
    let state = api::AppState::new(Arc::clone(&gateway), Arc::clone(&metrics));

    let router = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!(listen = %args.listen, peer_id = %gateway.node_info().peer_id, "HTTP surface up");

    // Known peers from a previous run.
    let dialer = Arc::clone(&gateway);
    tokio::spawn(async move {
        dialer.connect_known_peers().await;
    });

    let sweeper = tokio::spawn(housekeeping(Arc::clone(&gateway), Arc::clone(&metrics)));

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    sweeper.abort();
    gateway.shutdown();
    tracing::info!("dedi-gateway stopped");
    Ok(())
}

/// Periodic expiry sweep, plus the session gauge.
async fn housekeeping(gateway: Arc<Gateway>, metrics: Arc<GatewayMetrics>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let sweep = gateway.expire_stale();
        if sweep.challenges_expired + sweep.join_requests_expired + sweep.invites_expired > 0 {
            tracing::info!(
                challenges = sweep.challenges_expired,
                join_requests = sweep.join_requests_expired,
                invites = sweep.invites_expired,
                purged = sweep.purged,
                "expired stale admissions"
            );
        }
        metrics
            .connected_peers
            .set(gateway.status().sessions as i64);
    }
}

fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::Pretty);

    let init = settings::initialize(&args)?;
    let peer_id = init.keypair.peer_id();
    tracing::info!(%peer_id, key_path = %init.key_path.display(), "node key generated");

    println!("Node initialized.");
    println!("  Data directory : {}", args.data_dir.display());
    println!("  Config         : {}", init.config_path.display());
    println!("  Node key       : {}", init.key_path.display());
    println!("  Peer id        : {}", peer_id);
    println!("  Public key     : {}", init.keypair.public_key().to_hex());
    Ok(())
}

async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.url.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .with_context(|| format!("unexpected reply from {url}"))?;
    if !status.is_success() {
        anyhow::bail!("{url} answered {status}: {body}");
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn print_version() {
    println!("dedi-gateway {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", PROTOCOL_VERSION);
}

/// Resolves on SIGINT or SIGTERM. If a handler cannot be installed, that
/// signal is simply never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown signal received, draining connections");
}
