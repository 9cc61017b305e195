//! Stream transport for tagwire.
//!
//! Provides TCP bind/accept/connect and a [`Connection`] type that wraps
//! either a TCP stream or an in-memory pipe behind one `AsyncRead +
//! AsyncWrite` surface.
//!
//! This is the lowest layer of tagwire. Framing and request correlation
//! build on top of the [`Connection`] type provided here.

pub mod error;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use tcp::TcpTransport;
pub use traits::Connection;
