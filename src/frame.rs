//! Wire frames and the stream codec.
//!
//! Wire format (protocol version 0.1), used by stream transports:
//!
//! ```text
//! [type_id: u16 LE][payload_len: u32 LE][payload: payload_len bytes]
//! ```
//!
//! The in-process transport hands [`MessageFrame`] values over directly and
//! never encodes them.
//!
//! Every connection starts with one handshake frame in each direction, sent
//! with the reserved type id [`HANDSHAKE_TYPE_ID`]:
//!
//! ```text
//! [MAGIC: 4 bytes "rfmq"][VERSION: major, minor][role: u8]
//! ```

use crate::error::Error;
use crate::role::NodeRole;
use bytes::Bytes;
use std::io::{ErrorKind, Read};
use tracing::{trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Type id reserved for the connection handshake frame.
pub const HANDSHAKE_TYPE_ID: u16 = 0xFFFF;

const MAGIC: &[u8] = b"rfmq";
const MAGIC_SIZE: usize = MAGIC.len();
const VERSION_MAJOR: u8 = 0;
const VERSION_MINOR: u8 = 1;
const HANDSHAKE_SIZE: usize = MAGIC_SIZE + 2 + 1;

const TYPE_ID_SIZE: usize = 2;
const LENGTH_SIZE: usize = 4;
/// Size of the fixed frame header on stream transports.
pub const HEADER_SIZE: usize = TYPE_ID_SIZE + LENGTH_SIZE;

// ============================================================================
// MessageFrame
// ============================================================================

/// One self-delimited unit on the wire: a type id and an opaque payload.
///
/// Frames are immutable and cheap to clone; cloning shares the payload, which
/// is how a publisher fans one encoded message out to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    type_id: u16,
    payload: Bytes,
}

impl MessageFrame {
    /// Creates a frame from a type id and a serialized payload.
    pub fn new(type_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            payload: payload.into(),
        }
    }

    pub fn type_id(&self) -> u16 {
        self.type_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Number of bytes this frame occupies on a stream transport.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub(crate) fn is_handshake(&self) -> bool {
        self.type_id == HANDSHAKE_TYPE_ID
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Appends the stream encoding of `frame` to `buf`.
///
/// Payloads longer than `u32::MAX` cannot be represented and are rejected.
pub fn encode_frame_into(frame: &MessageFrame, buf: &mut Vec<u8>) -> Result<(), Error> {
    let len = u32::try_from(frame.payload.len()).map_err(|_| Error::FrameTooLarge {
        len: frame.payload.len(),
        max: u32::MAX as usize,
    })?;
    buf.reserve(frame.encoded_len());
    buf.extend_from_slice(&frame.type_id.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&frame.payload);
    Ok(())
}

/// Returns the stream encoding of `frame`.
pub fn encode_frame(frame: &MessageFrame) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(frame.encoded_len());
    encode_frame_into(frame, &mut buf)?;
    Ok(buf)
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes one frame from the front of `buf`.
///
/// Designed for buffers that fill incrementally:
/// - `Ok(Some((frame, bytes_read)))` - a complete frame was decoded
/// - `Ok(None)` - not enough data yet
/// - `Err(_)` - the announced length exceeds `max_frame_size`
pub fn decode_frame(buf: &[u8], max_frame_size: usize) -> Result<Option<(MessageFrame, usize)>, Error> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let type_id = u16::from_le_bytes([buf[0], buf[1]]);
    let len = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    if len > max_frame_size {
        return Err(Error::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }

    let frame_size = HEADER_SIZE + len;
    if buf.len() < frame_size {
        return Ok(None);
    }

    let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..frame_size]);
    Ok(Some((MessageFrame { type_id, payload }, frame_size)))
}

/// Reads exactly one frame from a blocking reader.
///
/// Returns `Ok(None)` when the stream ends cleanly at a frame boundary. A
/// stream that ends inside a frame is a [`Error::Framing`] error; nothing
/// partial is ever returned.
pub fn read_frame<R: Read>(reader: &mut R, max_frame_size: usize) -> Result<Option<MessageFrame>, Error> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(Error::Framing(format!(
                    "stream closed after {filled} of {HEADER_SIZE} header bytes"
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let type_id = u16::from_le_bytes([header[0], header[1]]);
    let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if len > max_frame_size {
        warn!(type_id, len, max = max_frame_size, "Oversized frame");
        return Err(Error::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::Framing(format!("stream closed inside a {len} byte payload"))
        } else {
            Error::Io(e)
        }
    })?;

    trace!(type_id, len, "Read frame");
    Ok(Some(MessageFrame::new(type_id, payload)))
}

// ============================================================================
// Handshake
// ============================================================================

/// Builds the handshake frame announcing `role`.
pub(crate) fn handshake_frame(role: NodeRole) -> MessageFrame {
    let mut payload = Vec::with_capacity(HANDSHAKE_SIZE);
    payload.extend_from_slice(MAGIC);
    payload.push(VERSION_MAJOR);
    payload.push(VERSION_MINOR);
    payload.push(role.as_u8());
    MessageFrame::new(HANDSHAKE_TYPE_ID, payload)
}

/// Validates a handshake frame and returns the role it announces.
pub(crate) fn parse_handshake(frame: &MessageFrame) -> Result<NodeRole, Error> {
    if !frame.is_handshake() {
        return Err(Error::HandshakeFailed(format!(
            "expected handshake, got frame of type {}",
            frame.type_id
        )));
    }
    let payload = frame.payload();
    if payload.len() != HANDSHAKE_SIZE {
        return Err(Error::HandshakeFailed(format!(
            "handshake has {} bytes, expected {HANDSHAKE_SIZE}",
            payload.len()
        )));
    }
    if &payload[..MAGIC_SIZE] != MAGIC {
        return Err(Error::HandshakeFailed("invalid magic bytes".to_string()));
    }
    let (major, minor) = (payload[MAGIC_SIZE], payload[MAGIC_SIZE + 1]);
    if major != VERSION_MAJOR || minor != VERSION_MINOR {
        return Err(Error::HandshakeFailed(format!(
            "protocol version mismatch: expected {VERSION_MAJOR}.{VERSION_MINOR}, peer uses {major}.{minor}"
        )));
    }
    NodeRole::from_u8(payload[MAGIC_SIZE + 2])
        .ok_or_else(|| Error::HandshakeFailed(format!("unknown role {}", payload[MAGIC_SIZE + 2])))
}
