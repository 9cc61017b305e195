use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + type (4) + length (4) + sequence (4) + reserved (2) = 16 bytes.
pub const HEADER_SIZE: usize = 16;

/// Magic bytes: 0x55 0xAA.
pub const MAGIC: [u8; 2] = [0x55, 0xAA];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// The message type a reply to `request_type` carries.
///
/// Replies are tagged `request_type + 1`; the sum wraps at `u32::MAX`.
pub fn reply_type(request_type: u32) -> u32 {
    request_type.wrapping_add(1)
}

/// A framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Application-defined message type.
    pub msg_type: u32,
    /// Caller-chosen sequence number, carried through unchanged.
    pub sequence: u32,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame. The header length is taken from the payload.
    pub fn new(msg_type: u32, sequence: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            sequence,
            payload: payload.into(),
        }
    }

    /// Create a frame with an explicitly declared payload length.
    ///
    /// Fails with [`FrameError::LengthMismatch`] when `length` is not the
    /// payload's actual length.
    pub fn with_length(
        msg_type: u32,
        length: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Result<Self> {
        let payload = payload.into();
        check_length(length, payload.len())?;
        Ok(Self {
            msg_type,
            sequence,
            payload,
        })
    }

    /// Message type.
    pub fn msg_type(&self) -> u32 {
        self.msg_type
    }

    /// Payload length as carried in the header.
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Read-only view of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The header fields of this frame.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            msg_type: self.msg_type,
            length: self.length(),
            sequence: self.sequence,
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Decoded fields of a 16-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: u32,
    pub length: u32,
    pub sequence: u32,
}

impl FrameHeader {
    /// Render the header into its wire form. Reserved bytes are zero.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&MAGIC);
        out[2..6].copy_from_slice(&self.msg_type.to_le_bytes());
        out[6..10].copy_from_slice(&self.length.to_le_bytes());
        out[10..14].copy_from_slice(&self.sequence.to_le_bytes());
        out
    }
}

/// Extract the fields of a frame header.
///
/// The reserved bytes (14-15) are ignored.
pub fn decode_header(raw: &[u8; HEADER_SIZE]) -> Result<FrameHeader> {
    if raw[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic {
            found: [raw[0], raw[1]],
        });
    }

    Ok(FrameHeader {
        msg_type: u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
        length: u32::from_le_bytes([raw[6], raw[7], raw[8], raw[9]]),
        sequence: u32::from_le_bytes([raw[10], raw[11], raw[12], raw[13]]),
    })
}

/// Encode a frame into the wire format.
///
/// Wire format (all integers little-endian):
/// ```text
/// ┌───────────┬──────────┬──────────┬──────────┬──────────┬────────────────┐
/// │ Magic 2B  │ Type 4B  │ Length   │ Sequence │ Reserved │ Payload        │
/// │ 0x55 0xAA │          │ 4B       │ 4B       │ 2B       │ (Length bytes) │
/// └───────────┴──────────┴──────────┴──────────┴──────────┴────────────────┘
/// ```
pub fn encode_frame(
    msg_type: u32,
    length: u32,
    sequence: u32,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    check_length(length, payload.len())?;

    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(msg_type);
    dst.put_u32_le(length);
    dst.put_u32_le(sequence);
    dst.put_bytes(0, 2);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&src[..HEADER_SIZE]);
    let header = decode_header(&raw)?;

    let payload_len = header.length as usize;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        msg_type: header.msg_type,
        sequence: header.sequence,
        payload,
    }))
}

fn check_length(declared: u32, actual: usize) -> Result<()> {
    if declared as usize != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }
    Ok(())
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
