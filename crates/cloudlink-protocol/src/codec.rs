//! Codec for encoding and decoding RFC 6455 frames.
//!
//! Wire layout of one frame:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |   ...extended length (cont.)  |  Masking-key, if MASK set     |
//! +-------------------------------+-------------------------------+
//! |                          Payload Data                         |
//! +---------------------------------------------------------------+
//! ```
//!
//! The client always masks what it sends and the server must never mask what
//! it sends, so [`decode_header`] treats a set mask bit as a protocol
//! violation. [`parse_header`] is the role-neutral parser underneath it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{Frame, FrameHeader, Opcode};

/// Maximum accepted payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Largest possible header: 2 fixed bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_SIZE: usize = 14;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not enough data to decode the header.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// The server masked a frame.
    #[error("Server frame was masked")]
    MaskedServerFrame,

    /// Opcode outside the RFC 6455 set.
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// A reserved bit was set without a negotiated extension.
    #[error("Reserved bits set without a negotiated extension")]
    ReservedBits,

    /// A continuation frame or a frame without FIN.
    #[error("Fragmented frames are not supported")]
    Fragmented,

    /// Control frame with a payload over 125 bytes.
    #[error("Control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLong(u64),

    /// 64-bit length with the most significant bit set.
    #[error("Invalid payload length")]
    InvalidLength,

    /// Frame exceeds the configured maximum size.
    #[error("Frame size {0} exceeds maximum {1}")]
    FrameTooLarge(u64, usize),

    /// Text frame payload is not UTF-8.
    #[error("Text frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// XOR `data` in place with `key`, cycling every four bytes.
///
/// Masking is its own inverse, so this both masks and unmasks.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Generate a random masking key.
#[must_use]
pub fn generate_mask_key() -> [u8; 4] {
    rand::random()
}

/// Encode a single non-fragmented frame.
///
/// When `masked` is true a fresh random key is generated for the frame.
#[must_use]
pub fn encode(payload: &[u8], opcode: Opcode, masked: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAX_HEADER_SIZE + payload.len());
    encode_into(payload, opcode, masked, &mut buf);
    buf.freeze()
}

/// Encode a frame into an existing buffer.
pub fn encode_into(payload: &[u8], opcode: Opcode, masked: bool, buf: &mut BytesMut) {
    let mask = masked.then(generate_mask_key);
    encode_with_mask(payload, opcode, mask, buf);
}

/// Encode a frame with an explicit masking key (`None` = unmasked).
pub fn encode_with_mask(payload: &[u8], opcode: Opcode, mask: Option<[u8; 4]>, buf: &mut BytesMut) {
    let mask_bit: u8 = if mask.is_some() { 0x80 } else { 0 };
    let length = payload.len();

    buf.reserve(MAX_HEADER_SIZE + length);
    buf.put_u8(0x80 | u8::from(opcode));

    if length <= 125 {
        buf.put_u8(mask_bit | length as u8);
    } else if length <= usize::from(u16::MAX) {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(length as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(length as u64);
    }

    match mask {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.extend_from_slice(payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.extend_from_slice(payload),
    }
}

/// Encode a [`Frame`], masking it when `masked` is true.
#[must_use]
pub fn encode_frame(frame: &Frame, masked: bool) -> Bytes {
    encode(&frame.payload, frame.opcode, masked)
}

/// Parse a frame header without applying any role policy.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if `data` is too short to hold the
/// whole header, [`ProtocolError::InvalidOpcode`] for an unknown opcode and
/// [`ProtocolError::InvalidLength`] for a 64-bit length with the top bit set.
pub fn parse_header(data: &[u8]) -> Result<FrameHeader, ProtocolError> {
    if data.len() < 2 {
        return Err(ProtocolError::Incomplete(2 - data.len()));
    }

    let first = data[0];
    let second = data[1];
    let opcode = Opcode::try_from(first & 0x0F).map_err(ProtocolError::InvalidOpcode)?;
    let masked = second & 0x80 != 0;

    let (length, mut offset) = match second & 0x7F {
        126 => {
            if data.len() < 4 {
                return Err(ProtocolError::Incomplete(4 - data.len()));
            }
            (u64::from(u16::from_be_bytes([data[2], data[3]])), 4)
        }
        127 => {
            if data.len() < 10 {
                return Err(ProtocolError::Incomplete(10 - data.len()));
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[2..10]);
            let length = u64::from_be_bytes(raw);
            if length >> 63 != 0 {
                return Err(ProtocolError::InvalidLength);
            }
            (length, 10)
        }
        n => (u64::from(n), 2),
    };

    let mask_key = if masked {
        if data.len() < offset + 4 {
            return Err(ProtocolError::Incomplete(offset + 4 - data.len()));
        }
        let key = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    Ok(FrameHeader {
        fin: first & 0x80 != 0,
        rsv1: first & 0x40 != 0,
        rsv2: first & 0x20 != 0,
        rsv3: first & 0x10 != 0,
        opcode,
        mask_key,
        length,
        payload_offset: offset,
    })
}

/// Parse the header of a frame received from the server.
///
/// The mask bit is checked before anything else, so a masked frame is
/// rejected as soon as two bytes are available and its payload is never
/// looked at.
///
/// # Errors
///
/// Returns [`ProtocolError::MaskedServerFrame`] if the mask bit is set,
/// [`ProtocolError::ReservedBits`], [`ProtocolError::Fragmented`] or
/// [`ProtocolError::ControlFrameTooLong`] for frames this client does not
/// accept, and any error of [`parse_header`].
pub fn decode_header(data: &[u8]) -> Result<FrameHeader, ProtocolError> {
    if data.len() >= 2 && data[1] & 0x80 != 0 {
        return Err(ProtocolError::MaskedServerFrame);
    }

    let header = parse_header(data)?;

    if header.rsv1 || header.rsv2 || header.rsv3 {
        return Err(ProtocolError::ReservedBits);
    }
    if !header.fin || header.opcode == Opcode::Continuation {
        return Err(ProtocolError::Fragmented);
    }
    if header.opcode.is_control() && header.length > MAX_CONTROL_PAYLOAD {
        return Err(ProtocolError::ControlFrameTooLong(header.length));
    }

    Ok(header)
}

/// Decode one complete server frame from bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if `data` does not hold the whole
/// frame, or any error of [`decode_header`].
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let header = decode_header(data)?;
    let total = header.frame_len();
    if (data.len() as u64) < total {
        return Err(ProtocolError::Incomplete((total - data.len() as u64) as usize));
    }

    let payload = Bytes::copy_from_slice(&data[header.payload_offset..total as usize]);
    Ok(Frame::new(header.opcode, payload))
}

/// Try to decode a server frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the header is invalid or the payload exceeds
/// `max_frame_size`.
pub fn decode_from(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>, ProtocolError> {
    let header = match decode_header(buf) {
        Ok(header) => header,
        Err(ProtocolError::Incomplete(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    if header.length > max_frame_size as u64 {
        return Err(ProtocolError::FrameTooLarge(header.length, max_frame_size));
    }

    let total = header.payload_offset + header.length as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    buf.advance(header.payload_offset);
    let payload = buf.split_to(header.length as usize).freeze();

    Ok(Some(Frame::new(header.opcode, payload)))
}

/// Client-side codec: masks outbound frames, rejects masked inbound frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the largest accepted inbound payload.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame for sending. Always masked.
    #[must_use]
    pub fn encode(&self, frame: &Frame) -> Bytes {
        encode_frame(frame, true)
    }

    /// Try to decode a server frame from a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is invalid.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        decode_from(buf, self.max_frame_size)
    }
}
