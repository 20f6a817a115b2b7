//! TCP Proxy Server
//!
//! Accepts client connections, dials the upstream for each one and forwards
//! both directions through a pluggable [`splicer_transport::Transport`].

mod server;

pub use server::{
    ConnectionIdGenerator, TcpProxyServer, TcpProxyServerConfig, TcpProxyServerError,
};
