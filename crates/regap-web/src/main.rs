//! regapweb relay server entry point.
//!
//! # Usage
//!
//! ```text
//! regap-web [OPTIONS]
//!
//! Options:
//!   -c, --config <PATH>   TOML configuration file [env: REGAP_CONFIG] [default: ./regapweb.toml]
//!   -v, --verbose         Log at debug level unless RUST_LOG says otherwise
//! ```
//!
//! The process binds the browser WebSocket listener and the gamepad TCP
//! listener, wires both halves through the forwarder and serves until Ctrl+C.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use regap_web::application::Relay;
use regap_web::infrastructure::{
    load_config, run_tcp_server, run_ws_server, BasicAuth, TcpSessionTimings,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// regapweb relay server.
#[derive(Debug, Parser)]
#[command(
    name = "regap-web",
    about = "Signaling and gamepad relay for regapweb",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        default_value = "./regapweb.toml",
        env = "REGAP_CONFIG"
    )]
    config: PathBuf,

    /// Log at debug level; overrides `verbose` in the file when set.
    #[arg(short, long)]
    verbose: bool,
}

fn default_log_level(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    let verbose = cli.verbose || config.verbose;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_level(verbose))),
        )
        .init();
    info!(config = ?config, "regapweb relay starting");

    let ws_addr = config.ws_server.bind_addr()?;
    let tcp_addr = config.tcp_server.bind_addr()?;
    let ws_listener = TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {ws_addr}"))?;
    let tcp_listener = TcpListener::bind(tcp_addr)
        .await
        .with_context(|| format!("failed to bind gamepad listener on {tcp_addr}"))?;

    let relay = Relay::start(&config.tcp_server.secret).context("failed to start forwarder")?;

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let timings = TcpSessionTimings {
        ping_interval: config.ping_interval(),
        handshake_timeout: config.tcp_server.handshake_timeout(),
    };
    let served = tokio::try_join!(
        run_ws_server(
            ws_listener,
            Arc::clone(&relay.ws),
            BasicAuth::new(config.ws_server.accounts.clone()),
            config.ping_interval(),
            Arc::clone(&running),
        ),
        run_tcp_server(tcp_listener, Arc::clone(&relay.tcp), timings, Arc::clone(&running)),
    );

    relay.shutdown().await;
    served?;
    info!("regapweb relay stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
