//! Wire format for inter-node frames.
//!
//! Frame format: `[length:4][checksum:4][request_id:8][kind:1][flag:1][payload:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of (request_id + kind + flag + payload)
//! - **request_id**: Correlates a response with its request (little-endian u64)
//! - **kind**: What the frame carries, see [`FrameKind`]
//! - **flag**: Request, response or error response, see [`FrameFlag`]
//! - **payload**: Message bytes; for [`FrameFlag::Error`] a UTF-8 message

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header size: 4 (length) + 4 (checksum) + 8 (request id) + 1 (kind) + 1 (flag).
pub const HEADER_SIZE: usize = 18;

/// Maximum payload size (1MB).
///
/// Frames larger than this are rejected to prevent memory exhaustion.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from header.
        expected: u32,
        /// Computed checksum from data.
        actual: u32,
    },

    /// Payload exceeds maximum allowed size.
    #[error("frame too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    FrameTooLarge {
        /// Actual payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Unknown frame kind byte.
    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    /// Unknown frame flag byte.
    #[error("unknown frame flag: {0}")]
    UnknownFlag(u8),
}

/// What a frame carries.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Opening handshake.
    Open = 1,
    /// Closing handshake.
    Close = 2,
    /// Liveness probe.
    Keepalive = 3,
    /// Ordinary application remote call.
    Application = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Open),
            2 => Ok(Self::Close),
            3 => Ok(Self::Keepalive),
            4 => Ok(Self::Application),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Direction of a frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFlag {
    /// A request expecting a response with the same id.
    Request = 0,
    /// A successful response.
    Response = 1,
    /// A failed response; the payload is a UTF-8 error message.
    Error = 2,
}

impl TryFrom<u8> for FrameFlag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Error),
            other => Err(WireError::UnknownFlag(other)),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request id shared by a request and its response.
    pub request_id: u64,
    /// What the frame carries.
    pub kind: FrameKind,
    /// Request, response or error.
    pub flag: FrameFlag,
    /// Message bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Build a request frame.
    pub fn request(request_id: u64, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            request_id,
            kind,
            flag: FrameFlag::Request,
            payload,
        }
    }

    /// Build a successful response to `request`.
    pub fn response_to(request: &Frame, payload: Bytes) -> Self {
        Self {
            request_id: request.request_id,
            kind: request.kind,
            flag: FrameFlag::Response,
            payload,
        }
    }

    /// Build an error response to `request`.
    pub fn error_to(request: &Frame, message: &str) -> Self {
        Self {
            request_id: request.request_id,
            kind: request.kind,
            flag: FrameFlag::Error,
            payload: Bytes::copy_from_slice(message.as_bytes()),
        }
    }
}

/// CRC32C over everything after the checksum field.
fn compute_checksum(request_id: u64, kind: u8, flag: u8, payload: &[u8]) -> u32 {
    let mut head = [0u8; 10];
    head[..8].copy_from_slice(&request_id.to_le_bytes());
    head[8] = kind;
    head[9] = flag;
    crc32c::crc32c_append(crc32c::crc32c(&head), payload)
}

/// Serialize a frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode_frame(frame: &Frame) -> Result<Bytes, WireError> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: frame.payload.len(),
        });
    }

    let total_length = HEADER_SIZE + frame.payload.len();
    let kind = frame.kind as u8;
    let flag = frame.flag as u8;
    let checksum = compute_checksum(frame.request_id, kind, flag, &frame.payload);

    let mut buf = BytesMut::with_capacity(total_length);
    buf.put_u32_le(total_length as u32);
    buf.put_u32_le(checksum);
    buf.put_u64_le(frame.request_id);
    buf.put_u8(kind);
    buf.put_u8(flag);
    buf.put_slice(&frame.payload);
    Ok(buf.freeze())
}

/// Try to decode one frame from the front of a stream buffer.
///
/// # Returns
///
/// - `Ok(Some(frame))` if a complete frame was parsed; its bytes are consumed
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` if the data is malformed; the connection should be dropped
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if (length as usize) < HEADER_SIZE || length as usize > HEADER_SIZE + MAX_PAYLOAD_SIZE {
        return Err(WireError::InvalidLength { length });
    }
    if buf.len() < length as usize {
        buf.reserve(length as usize - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(length as usize);
    frame.advance(4);
    let expected = frame.get_u32_le();
    let request_id = frame.get_u64_le();
    let kind = frame.get_u8();
    let flag = frame.get_u8();
    let payload = frame.freeze();

    let actual = compute_checksum(request_id, kind, flag, &payload);
    if actual != expected {
        return Err(WireError::ChecksumMismatch { expected, actual });
    }

    Ok(Some(Frame {
        request_id,
        kind: FrameKind::try_from(kind)?,
        flag: FrameFlag::try_from(flag)?,
        payload,
    }))
}
