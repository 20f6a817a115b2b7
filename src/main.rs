//! Splicer CLI - zero-copy TCP proxy and its demonstration upstream

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use splicer_server_echo::{EchoServer, EchoServerConfig};
use splicer_server_tcp_proxy::{TcpProxyServer, TcpProxyServerConfig};
use splicer_transport::{EngineConfig, PipeSize, TransportKind, DEFAULT_MAX_CONSECUTIVE_FAULTS};

/// Splicer - forward TCP connections without copying through user space
#[derive(Parser, Debug)]
#[command(name = "splicer")]
#[command(about = "Zero-copy TCP proxy built on splice(2)", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "SPLICER_LOG_LEVEL")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept TCP connections and forward them to an upstream
    Proxy {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:4000", env = "SPLICER_LISTEN")]
        listen: SocketAddr,

        /// Upstream every connection is forwarded to
        #[arg(short, long, default_value = "127.0.0.1:5000", env = "SPLICER_UPSTREAM")]
        upstream: SocketAddr,

        /// Transfer strategy (splice, userspace)
        #[arg(short, long, default_value = "splice", env = "SPLICER_TRANSPORT")]
        transport: TransportKind,

        /// Pipe size in bytes (default: read from /proc/sys/fs/pipe-max-size)
        #[arg(long, env = "SPLICER_PIPE_SIZE")]
        pipe_size: Option<PipeSize>,

        /// Consecutive source faults tolerated before a direction is aborted
        #[arg(long, default_value_t = DEFAULT_MAX_CONSECUTIVE_FAULTS)]
        max_transfer_faults: u32,

        /// Seconds to wait for the upstream to accept a connection
        #[arg(long, default_value_t = 10)]
        connect_timeout_secs: u64,

        /// Enable TCP keepalive after this many idle seconds
        #[arg(long)]
        keepalive_secs: Option<u64>,
    },

    /// Run the acknowledging echo server used as a demo upstream
    Echo {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:5000", env = "SPLICER_ECHO_LISTEN")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Proxy {
            listen,
            upstream,
            transport,
            pipe_size,
            max_transfer_faults,
            connect_timeout_secs,
            keepalive_secs,
        } => {
            // Pipe size is decided once here and handed to every engine
            let mut engine = EngineConfig::detect().with_max_consecutive_faults(max_transfer_faults);
            if let Some(size) = pipe_size {
                engine = engine.with_pipe_size(size);
            }
            info!(
                "Using {} transport (pipe size {} bytes, fault budget {})",
                transport, engine.pipe_size, engine.max_consecutive_faults
            );

            let config = TcpProxyServerConfig {
                bind_addr: listen,
                upstream_addr: upstream,
                connect_timeout: Duration::from_secs(connect_timeout_secs),
                keepalive: keepalive_secs.map(Duration::from_secs),
            };
            let server = TcpProxyServer::new(config, transport.build(engine));

            tokio::select! {
                result = server.start() => {
                    result.context("TCP proxy stopped")?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down proxy");
                }
            }
        }
        Commands::Echo { listen } => {
            let server = EchoServer::new(EchoServerConfig { bind_addr: listen });

            tokio::select! {
                result = server.start() => {
                    result.context("Echo server stopped")?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down echo server");
                }
            }
        }
    }

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
