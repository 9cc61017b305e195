use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::Connection;

/// TCP listener transport.
///
/// Provides bind/accept on a TCP address and the matching client-side
/// [`connect`](TcpTransport::connect).
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on a TCP address such as `127.0.0.1:50051`.
    ///
    /// Port `0` picks an ephemeral port; read it back with
    /// [`local_addr`](TcpTransport::local_addr).
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

        info!(%local_addr, "listening on tcp");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept the next incoming connection.
    pub async fn accept(&self) -> Result<Connection> {
        let (stream, remote) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        debug!(%remote, "accepted connection");
        Ok(Connection::from_tcp(stream))
    }

    /// Connect to a listening TCP address.
    pub async fn connect(addr: &str) -> Result<Connection> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                source: e,
            })?;
        debug!(addr, "connected over tcp");
        Ok(Connection::from_tcp(stream))
    }

    /// Connect, giving up after `timeout` when one is set.
    pub async fn connect_timeout(addr: &str, timeout: Option<Duration>) -> Result<Connection> {
        match timeout {
            None => Self::connect(addr).await,
            Some(limit) => tokio::time::timeout(limit, Self::connect(addr))
                .await
                .map_err(|_| TransportError::ConnectTimeout {
                    addr: addr.to_string(),
                    timeout: limit,
                })?,
        }
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}
