//! Length-prefixed binary messaging with request/reply correlation.
//!
//! tagwire frames opaque payloads behind a fixed 16-byte header, carries them
//! over one persistent TCP connection per client/server pair, and pairs each
//! request of type `T` with the reply of type `T + 1`.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP bind/accept/connect and the `Connection` stream
//! - [`frame`]: Wire header, `Frame`, and the `tokio_util` codec
//! - [`peer`]: Duplex channel, request correlator, reconnecting client and
//!   multi-client server (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use tagwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use tagwire_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use tagwire_peer::*;
}
