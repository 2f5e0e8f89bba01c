//! Waypost proxy binary: a caching HTTP/1.0 forward proxy.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use waypost::proxy::{CacheStore, ProxyServer};

/// Waypost version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "proxy", version, about = "Waypost caching HTTP/1.0 forward proxy")]
struct Args {
    /// Listen port
    port: u16,

    /// Cache directory
    #[arg(short = 'c', long, default_value = "./cache")]
    cache_dir: PathBuf,

    /// Debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("waypost={level}").parse().unwrap()),
        )
        .init();

    info!("Waypost proxy v{} on port {}", VERSION, args.port);

    let store = match CacheStore::open(&args.cache_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open cache directory {}: {}", args.cache_dir.display(), e);
            return ExitCode::FAILURE;
        }
    };
    info!("cache directory: {}", args.cache_dir.display());

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);
    let server = match ProxyServer::bind(addr, store).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Accept until interrupted; dropping the server closes the listener and
    // lets in-flight sessions finish on their own.
    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Shutting down...");
        }
    }
    ExitCode::SUCCESS
}
