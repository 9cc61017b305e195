use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A connected byte stream implementing `AsyncRead + AsyncWrite`.
///
/// This is the fundamental I/O type handed to a channel. It wraps a TCP
/// stream for real links, or one end of an in-memory pipe for local use.
pub struct Connection {
    inner: ConnectionInner,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

enum ConnectionInner {
    Tcp(TcpStream),
    Memory(DuplexStream),
}

impl Connection {
    /// Wrap a connected TCP stream, capturing both endpoint addresses.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, "failed to set TCP_NODELAY");
        }
        Self {
            inner: ConnectionInner::Tcp(stream),
            local_addr,
            remote_addr,
        }
    }

    /// Create a connected in-memory pair.
    ///
    /// `max_buf_size` bounds how many bytes each direction buffers; a value of
    /// `1` makes every read and write move a single byte.
    pub fn pair(max_buf_size: usize) -> (Self, Self) {
        let (left, right) = tokio::io::duplex(max_buf_size);
        (Self::from_memory(left), Self::from_memory(right))
    }

    fn from_memory(stream: DuplexStream) -> Self {
        Self {
            inner: ConnectionInner::Memory(stream),
            local_addr: None,
            remote_addr: None,
        }
    }

    /// Local endpoint address, if the stream has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote endpoint address, if the stream has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            ConnectionInner::Tcp(_) => "tcp",
            ConnectionInner::Memory(_) => "memory",
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            ConnectionInner::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ConnectionInner::Memory(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            ConnectionInner::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ConnectionInner::Memory(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            ConnectionInner::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ConnectionInner::Memory(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            ConnectionInner::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ConnectionInner::Memory(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("type", &self.transport_name())
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}
