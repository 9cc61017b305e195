//! Callback surfaces for inbound traffic.
//!
//! Handlers run on a channel's dispatch loop: the next inbound frame is not
//! dispatched until the current call returns. Keep them short and hand long
//! work to a spawned task. Replies can be queued from inside a handler with
//! the non-waiting `try_send`/`try_reply` methods.

use tagwire_frame::Frame;

use crate::client::Client;
use crate::error::PeerError;
use crate::stub::ClientStub;

/// Receives what a single [`DuplexChannel`](crate::DuplexChannel) dispatches.
pub trait ChannelHandler: Send + Sync {
    /// A frame that no pending request claimed.
    fn on_message(&self, frame: Frame);

    /// The error that terminated the channel. Called at most once.
    fn on_error(&self, err: &PeerError) {
        let _ = err;
    }
}

/// Callbacks for a [`Client`] connection manager.
pub trait ClientHandler: Send + Sync + 'static {
    /// A connection (or reconnection) has been established.
    fn on_connected(&self, client: &Client) {
        let _ = client;
    }

    /// A frame that no pending request claimed.
    fn on_message(&self, frame: Frame, client: &Client);

    /// A channel error or a failed dial.
    fn on_error(&self, err: &PeerError, client: &Client) {
        let _ = (err, client);
    }
}

/// Callbacks for a [`Server`](crate::Server).
pub trait ServerHandler: Send + Sync + 'static {
    /// A client connected and was registered.
    fn on_new_client(&self, stub: &ClientStub) {
        let _ = stub;
    }

    /// A frame from `stub` that no pending request claimed.
    fn on_message(&self, frame: Frame, stub: &ClientStub);

    /// The error that terminated `stub`'s channel.
    fn on_error(&self, err: &PeerError, stub: &ClientStub) {
        let _ = (err, stub);
    }
}
