//! Accept loop: one detached task per client connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::cache::CacheStore;
use super::session::handle_client;

/// The proxy listener. Bound once at startup; `run` accepts until the task
/// is cancelled (the binary cancels it on ctrl-c) and never aborts on a
/// per-connection failure.
pub struct ProxyServer {
    listener: TcpListener,
    store: Arc<CacheStore>,
}

impl ProxyServer {
    /// Binds the listening socket. The cache directory must already be open.
    pub async fn bind(addr: SocketAddr, store: Arc<CacheStore>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, store })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts forever, spawning a detached session per client. Concurrency
    /// is unbounded; in-flight sessions outlive the loop when it is dropped.
    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            info!("proxy listening on {}", addr);
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("client connected: {}", peer);
                    let store = Arc::clone(&self.store);
                    tokio::spawn(async move {
                        handle_client(stream, store).await;
                        debug!("client finished: {}", peer);
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                }
            }
        }
    }
}
