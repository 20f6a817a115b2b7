//! TCP Proxy Server Implementation
//!
//! Listens on a port and forwards every accepted connection to a fixed
//! upstream. Each direction of each connection runs the configured transport
//! on its own OS thread, since the transports park in `epoll_wait` for as
//! long as the connection lives.

use splicer_transport::Transport;
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TcpProxyServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to connect to upstream {address}: {source}")]
    UpstreamConnect {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[error("Timed out connecting to upstream {address} after {timeout:?}")]
    UpstreamTimeout {
        address: SocketAddr,
        timeout: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct TcpProxyServerConfig {
    pub bind_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub connect_timeout: Duration,
    /// Idle time before TCP keepalive probes start on both sockets
    pub keepalive: Option<Duration>,
}

impl Default for TcpProxyServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            upstream_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            connect_timeout: Duration::from_secs(10),
            keepalive: None,
        }
    }
}

/// Simple connection ID generator for logging
#[derive(Clone)]
pub struct ConnectionIdGenerator {
    next_id: Arc<AtomicU64>,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TcpProxyServer {
    config: TcpProxyServerConfig,
    transport: Arc<dyn Transport>,
    connection_ids: ConnectionIdGenerator,
}

impl TcpProxyServer {
    pub fn new(config: TcpProxyServerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            connection_ids: ConnectionIdGenerator::new(),
        }
    }

    /// Bind the listening socket, retrying while the port sits in TIME_WAIT.
    pub async fn bind(&self) -> Result<TcpListener, TcpProxyServerError> {
        // Up to 3 attempts with 1 second delays
        for attempt in 1..=3 {
            match TcpListener::bind(&self.config.bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "Successfully bound to {} on attempt {}/3",
                            self.config.bind_addr, attempt
                        );
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                        self.config.bind_addr.port(), attempt
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(TcpProxyServerError::BindError {
                        address: self.config.bind_addr.ip().to_string(),
                        port: self.config.bind_addr.port(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(TcpProxyServerError::BindError {
            address: self.config.bind_addr.ip().to_string(),
            port: self.config.bind_addr.port(),
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    /// Bind and serve until the accept loop fails.
    pub async fn start(self) -> Result<(), TcpProxyServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), TcpProxyServerError> {
        let addr = listener.local_addr()?;
        info!(
            "TCP proxy listening on {}, forwarding to {} via {} transport",
            addr,
            self.config.upstream_addr,
            self.transport.name()
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let connection_id = self.connection_ids.generate();
                    let config = self.config.clone();
                    let transport = self.transport.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, peer_addr, connection_id, config, transport)
                                .await
                        {
                            error!(
                                "Error handling connection {} from {}: {}",
                                connection_id, peer_addr, e
                            );
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        client: TcpStream,
        peer_addr: SocketAddr,
        connection_id: u64,
        config: TcpProxyServerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(), TcpProxyServerError> {
        info!(
            "New connection {} from {} forwarded to {}",
            connection_id, peer_addr, config.upstream_addr
        );

        let upstream =
            match tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.upstream_addr))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(TcpProxyServerError::UpstreamConnect {
                        address: config.upstream_addr,
                        source: e,
                    })
                }
                Err(_) => {
                    return Err(TcpProxyServerError::UpstreamTimeout {
                        address: config.upstream_addr,
                        timeout: config.connect_timeout,
                    })
                }
            };

        // Both transports expect non-blocking std sockets, which is what into_std hands back
        let client = Arc::new(Self::prepare(client, config.keepalive)?);
        let upstream = Arc::new(Self::prepare(upstream, config.keepalive)?);

        let client_to_upstream = spawn_direction(
            transport.clone(),
            client.clone(),
            upstream.clone(),
            connection_id,
            "client->upstream",
        )?;
        let upstream_to_client = match spawn_direction(
            transport,
            upstream.clone(),
            client.clone(),
            connection_id,
            "upstream->client",
        ) {
            Ok(done) => done,
            Err(e) => {
                // Unblock the direction that did start so its thread exits
                let _ = client.shutdown(Shutdown::Both);
                let _ = upstream.shutdown(Shutdown::Both);
                let _ = client_to_upstream.await;
                return Err(e);
            }
        };

        let (forward, backward) = tokio::join!(client_to_upstream, upstream_to_client);
        for result in [forward, backward] {
            if result.is_err() {
                error!(
                    "Transfer thread of connection {} exited without reporting",
                    connection_id
                );
            }
        }

        debug!("Connection {} from {} closed", connection_id, peer_addr);
        // Last references to both sockets drop here, closing each exactly once
        Ok(())
    }

    fn prepare(
        stream: TcpStream,
        keepalive: Option<Duration>,
    ) -> Result<StdTcpStream, TcpProxyServerError> {
        stream.set_nodelay(true)?;
        let stream = stream.into_std()?;
        if let Some(idle) = keepalive {
            let params = socket2::TcpKeepalive::new().with_time(idle);
            socket2::SockRef::from(&stream).set_tcp_keepalive(&params)?;
        }
        Ok(stream)
    }
}

/// Run one direction on a dedicated thread, then half-close its destination
/// so the far peer sees end of stream. The receiver fires once the thread is done.
fn spawn_direction(
    transport: Arc<dyn Transport>,
    source: Arc<StdTcpStream>,
    destination: Arc<StdTcpStream>,
    connection_id: u64,
    direction: &'static str,
) -> Result<oneshot::Receiver<()>, TcpProxyServerError> {
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name(format!("splicer-conn-{}", connection_id))
        .spawn(move || {
            match transport.transport(&*source, &*destination) {
                Ok(()) => debug!("Connection {} {} finished", connection_id, direction),
                Err(e) if e.is_setup_failure() => error!(
                    "Connection {} {} aborted before transfer: {}",
                    connection_id, direction, e
                ),
                Err(e) => error!(
                    "Connection {} {} aborted by {} transport: {}",
                    connection_id,
                    direction,
                    transport.name(),
                    e
                ),
            }

            if let Err(e) = destination.shutdown(Shutdown::Write) {
                if e.kind() != std::io::ErrorKind::NotConnected {
                    debug!(
                        "Half-close of connection {} {} failed: {}",
                        connection_id, direction, e
                    );
                }
            }

            let _ = done_tx.send(());
        })?;

    Ok(done_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_proxy_server_config() {
        let config = TcpProxyServerConfig {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            upstream_addr: "127.0.0.1:9090".parse().unwrap(),
            ..Default::default()
        };
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.upstream_addr.port(), 9090);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.keepalive.is_none());
    }

    #[test]
    fn test_default_addresses() {
        let config = TcpProxyServerConfig::default();
        assert_eq!(config.bind_addr.port(), 4000);
        assert_eq!(config.upstream_addr.to_string(), "127.0.0.1:5000");
    }

    #[test]
    fn test_connection_id_generator() {
        let gen = ConnectionIdGenerator::new();
        assert_eq!(gen.generate(), 1);
        assert_eq!(gen.generate(), 2);

        let shared = gen.clone();
        assert_eq!(shared.generate(), 3);
    }
}
