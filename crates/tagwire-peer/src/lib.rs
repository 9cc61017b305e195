//! Request-correlating client/server link over tagwire frames.
//!
//! This is the "just works" layer. A [`DuplexChannel`] runs one connection;
//! [`Client`] keeps a channel to a server alive across drops; [`Server`]
//! accepts connections and tracks each as a [`ClientStub`]. Requests of type
//! `T` are answered by frames of type `T + 1`, matched by the channel's
//! [`RequestCorrelator`].

pub mod channel;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod handler;
pub mod server;
pub mod stub;

pub use channel::DuplexChannel;
pub use client::{Client, ConnectionState};
pub use config::{
    ChannelConfig, ClientConfig, ServerConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_RECONNECT_BACKOFF,
    DEFAULT_REGISTRY_CAPACITY, DEFAULT_REQUEST_TIMEOUT,
};
pub use correlator::{ReplyFuture, RequestCorrelator};
pub use error::{PeerError, Result};
pub use handler::{ChannelHandler, ClientHandler, ServerHandler};
pub use server::{Server, ServerHandle};
pub use stub::ClientStub;
