//! Length-prefixed message framing for tagwire.
//!
//! Every message is framed with a fixed 16-byte header:
//! - A 2-byte magic number (0x55 0xAA) for stream synchronization
//! - A 4-byte little-endian message type
//! - A 4-byte little-endian payload length
//! - A 4-byte little-endian sequence number
//! - 2 reserved bytes
//!
//! No partial reads, no buffer management in user code.

pub mod codec;
pub mod error;
pub mod framed;

pub use codec::{
    decode_frame, decode_header, encode_frame, reply_type, Frame, FrameConfig, FrameHeader,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC,
};
pub use error::{FrameError, Result};
pub use framed::FrameCodec;
