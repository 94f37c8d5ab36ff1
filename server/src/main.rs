// Copyright (c) 2026 SQRL Auth Contributors. MIT License.
// See LICENSE for details.

//! # SQRL Authentication Server
//!
//! Entry point for the `sqrl-server` binary. Parses CLI arguments,
//! initializes logging and metrics, starts the nut sweeper, and serves the
//! HTTP API.
//!
//! The binary supports two subcommands:
//!
//! - `run`     — start the authentication server
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use sqrl_protocol::{MemoryStore, SqrlConfig, SqrlHandler, SqrlStore, UrlBuilder};

use cli::{Commands, SqrlServerCli};
use logging::LogFormat;
use metrics::ServerMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = SqrlServerCli::parse();

    match cli.command {
        Commands::Run(args) => run_server(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the full authentication server: API, metrics endpoint, and the
/// background nut sweeper.
async fn run_server(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "sqrl_server=info,sqrl_protocol=info,tower_http=debug",
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        base_url = %args.base_url,
        port = args.port,
        metrics_port = args.metrics_port,
        nut_timeout_secs = args.nut_timeout_secs,
        "starting sqrl-server"
    );

    // --- Protocol configuration ---
    let config = SqrlConfig::new(&args.base_url, &args.hmac_secret)
        .with_context(|| format!("invalid base URL: {}", args.base_url))?
        .with_nut_timeout(Duration::from_secs(args.nut_timeout_secs));

    // --- Storage & protocol engine ---
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(SqrlHandler::new(
        config.clone(),
        Arc::clone(&store) as Arc<dyn SqrlStore>,
    ));
    let urls = Arc::new(UrlBuilder::new(
        config,
        Arc::clone(&store) as Arc<dyn SqrlStore>,
    ));

    // --- Metrics ---
    let server_metrics = Arc::new(ServerMetrics::new());

    // --- Application state ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        handler,
        urls,
        metrics: Arc::clone(&server_metrics),
        sessions: Arc::new(dashmap::DashMap::new()),
    };

    // --- API server ---
    let api_router = api::create_router(app_state.clone());
    let api_addr = format!("0.0.0.0:{}", args.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&server_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Nut sweeper ---
    // Nuts stay around twice their redeemable lifetime so that late protocol
    // retries still get a coherent transient-error answer instead of a miss.
    let sweep_store = Arc::clone(&store);
    let sweep_metrics = Arc::clone(&server_metrics);
    let retention = Duration::from_secs(args.nut_timeout_secs * 2);
    let sweep_interval = Duration::from_secs(args.sweep_interval_secs.max(1));
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await; // first tick fires immediately, skip it
        loop {
            interval.tick().await;
            match sweep_store.sweep_nuts(retention).await {
                Ok(0) => tracing::debug!("nut sweep: nothing to remove"),
                Ok(n) => {
                    sweep_metrics.nuts_swept_total.inc_by(n);
                    tracing::info!(removed = n, "nut sweep completed");
                }
                Err(e) => tracing::error!("nut sweep failed: {}", e),
            }
        }
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(
            api_listener,
            api_router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        ) => {
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
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    sweeper.abort();
    tracing::info!("sqrl-server stopped");
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("sqrl-server {}", env!("CARGO_PKG_VERSION"));
    println!(
        "protocol    {}",
        sqrl_protocol::config::PROTOCOL_VERSION
    );
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
