//! kvm-relay: Bridges the KVM web console to a UDP target device.
//!
//! The device registers itself with a `SYNC` datagram and keeps sending
//! `Heartbeat`s. Console commands arrive over HTTP, are forwarded to the
//! device, and answered with the device output collected for a short window.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relay_daemon::config::Config;
use relay_daemon::http;
use relay_daemon::relay::{Relay, RelayOptions};

#[derive(Parser, Debug)]
#[command(name = "kvm-relay")]
#[command(about = "HTTP to UDP sync relay for the KVM web console")]
struct Args {
    /// Path to a JSON config file
    #[arg(long, env = "KVM_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address for the HTTP bridge (overrides the config file)
    #[arg(long, env = "KVM_RELAY_HTTP_LISTEN")]
    http_listen: Option<String>,

    /// Address for the UDP endpoint (overrides the config file)
    #[arg(long, env = "KVM_RELAY_UDP_BIND")]
    udp_bind: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "info,relay_daemon=debug,relay_core=debug,tower_http=debug"
    } else {
        "info,relay_daemon=info,relay_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting kvm-relay");

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(http_listen) = args.http_listen {
        config.http_listen = http_listen;
    }
    if let Some(udp_bind) = args.udp_bind {
        config.udp_bind = udp_bind;
    }

    info!("HTTP listen address: {}", config.http_listen);
    info!("UDP bind address: {}", config.udp_bind);
    info!("Collection window: {:?}", config.collection_window());

    // Both sockets are required; failing to bind either is fatal
    let options = RelayOptions {
        heartbeat: config.heartbeat_config(),
        collection_window: config.collection_window(),
        max_datagram_size: config.max_datagram_size,
    };
    let (relay, handle) = Relay::bind(&config.udp_bind, options).await?;

    let listener = tokio::net::TcpListener::bind(&config.http_listen)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", config.http_listen))?;
    info!("HTTP bridge listening on {}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_task = tokio::spawn(relay.run(shutdown_rx));

    let app = http::router(handle);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight bridge requests have drained; stop the relay loop
    let _ = shutdown_tx.send(true);
    if let Err(e) = relay_task.await {
        error!("Relay task failed: {}", e);
    }

    info!("Shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}
