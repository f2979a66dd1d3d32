// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # relaynet Node
//!
//! Entry point for the `relaynet-node` binary. Parses CLI arguments,
//! initializes logging and metrics, starts the transports for the selected
//! network mode, and serves `/metrics` and `/peers`.
//!
//! The binary supports three subcommands:
//!
//! - `run`      start the node and serve until SIGINT/SIGTERM
//! - `scenario` run the built-in end-to-end checks
//! - `version`  print build version information

mod cli;
mod context;
mod logging;
mod metrics;
mod scenarios;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use relaynet_transport::config::WIRE_VERSION;

use cli::{Commands, RelaynetCli};
use context::AppContext;
use metrics::{MetricsState, NodeMetrics};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = RelaynetCli::parse();
    logging::init_logging(logging::DEFAULT_FILTER, cli.log_format);

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Scenario(args) => scenarios::run(&args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the transports and the metrics endpoint, then waits for a
/// shutdown signal.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    tracing::info!(
        address = %args.address,
        mode = %args.mode,
        mobile = args.mobile,
        listen_port = args.listen_port,
        metrics_port = args.metrics_port,
        peers = args.peers.len(),
        "starting relaynet-node"
    );

    let ctx = Arc::new(AppContext::from_args(&args).await?);
    ctx.start()?;

    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics registry")?);
    let router = metrics::router(MetricsState {
        ctx: Arc::clone(&ctx),
        metrics: node_metrics,
    });
    let metrics_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.metrics_port));
    let listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    tracing::info!("shutdown signal received, stopping transports");
    ctx.stop();

    served.context("metrics server error")?;
    tracing::info!("relaynet-node stopped");
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("relaynet-node {}", env!("CARGO_PKG_VERSION"));
    println!("wire          v{}", WIRE_VERSION);
    println!("rustc         {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. A handler that cannot
/// be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
