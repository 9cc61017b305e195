use std::time::Duration;

/// Errors that can occur in channel, client and server operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error (bind, dial, accept).
    #[error("transport error: {0}")]
    Transport(#[from] tagwire_transport::TransportError),

    /// Frame-level error on a live connection.
    #[error("frame error: {0}")]
    Frame(#[from] tagwire_frame::FrameError),

    /// No reply arrived within the request timeout.
    #[error("request for reply type {msg_type:#x} timed out after {after:?}")]
    Timeout { msg_type: u32, after: Duration },

    /// A request expecting the same reply type is already outstanding.
    #[error("a request expecting reply type {0:#x} is already in flight")]
    RequestInFlight(u32),

    /// The connection went away before the operation completed.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The channel has been closed.
    #[error("channel closed")]
    Closed,

    /// The client has no live connection.
    #[error("not connected")]
    NotConnected,

    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,

    /// The channel's loops are already running.
    #[error("channel already started")]
    AlreadyStarted,
}

impl PeerError {
    /// Returns true if the error came from dialing the remote address.
    pub fn is_dial_failure(&self) -> bool {
        matches!(self, PeerError::Transport(err) if err.is_dial_failure())
    }

    /// Returns true if the error is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PeerError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
