//! Echo server implementation

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Prefix written in front of every echoed chunk
pub const ACK_PREFIX: &[u8] = b"ACK: ";

/// Size of the per-connection read buffer
pub const READ_BUFFER_SIZE: usize = 1024;

/// Echo server errors
#[derive(Debug, Error)]
pub enum EchoServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Echo server configuration
#[derive(Debug, Clone)]
pub struct EchoServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for EchoServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
        }
    }
}

pub struct EchoServer {
    config: EchoServerConfig,
}

impl EchoServer {
    pub fn new(config: EchoServerConfig) -> Self {
        Self { config }
    }

    /// Bind the listening socket, retrying while the port sits in TIME_WAIT.
    pub async fn bind(&self) -> Result<TcpListener, EchoServerError> {
        for attempt in 1..=3 {
            match TcpListener::bind(&self.config.bind_addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3), retrying in 1 second...",
                        self.config.bind_addr.port(),
                        attempt
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(EchoServerError::BindError {
                        address: self.config.bind_addr.ip().to_string(),
                        port: self.config.bind_addr.port(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(EchoServerError::BindError {
            address: self.config.bind_addr.ip().to_string(),
            port: self.config.bind_addr.port(),
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    /// Start the echo server
    pub async fn start(self) -> Result<(), EchoServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), EchoServerError> {
        info!("Echo server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted echo connection from {}", peer_addr);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(socket, peer_addr).await {
                            error!("Echo connection from {} failed: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept echo connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        mut socket: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), EchoServerError> {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        let mut reply = Vec::with_capacity(ACK_PREFIX.len() + READ_BUFFER_SIZE);

        loop {
            let n = socket.read(&mut buffer).await?;
            if n == 0 {
                debug!("Echo client {} closed the connection", peer_addr);
                return Ok(());
            }

            info!(
                "RCV {} bytes from {}: {}",
                n,
                peer_addr,
                String::from_utf8_lossy(&buffer[..n])
            );

            reply.clear();
            reply.extend_from_slice(ACK_PREFIX);
            reply.extend_from_slice(&buffer[..n]);
            socket.write_all(&reply).await?;
        }
    }
}
