//! Frame types for the RFC 6455 framing layer.
//!
//! A frame is the unit the framed connection reads and writes. This client
//! never fragments, so every frame it produces has `fin` set and every frame
//! it accepts must have `fin` set too.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message (unsupported).
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(other),
        }
    }
}

impl Opcode {
    /// Returns true for close, ping and pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Close status code carried in the first two bytes of a close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNSUPPORTED_DATA_TYPE: CloseCode = CloseCode(1003);
    pub const STATUS_NOT_AVAILABLE: CloseCode = CloseCode(1005);
    pub const ABNORMAL_CLOSED: CloseCode = CloseCode(1006);
    pub const INVALID_PAYLOAD: CloseCode = CloseCode(1007);
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);
    pub const INVALID_EXTENSION: CloseCode = CloseCode(1010);
    pub const UNEXPECTED_CONDITION: CloseCode = CloseCode(1011);
    pub const SERVICE_RESTART: CloseCode = CloseCode(1012);
    pub const TRY_AGAIN_LATER: CloseCode = CloseCode(1013);
    pub const BAD_GATEWAY: CloseCode = CloseCode(1014);
    pub const TLS_HANDSHAKE_ERROR: CloseCode = CloseCode(1015);
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        CloseCode(code)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status code and reason of a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame body.
    #[must_use]
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Serialize as a 2-byte big-endian code followed by the UTF-8 reason.
    #[must_use]
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.code.0);
        buf.put_slice(self.reason.as_bytes());
        buf.freeze()
    }

    /// Parse a close frame payload.
    ///
    /// An empty payload means the peer sent no status; it is reported as
    /// [`CloseCode::STATUS_NOT_AVAILABLE`]. A reason that is not valid UTF-8 is
    /// replaced lossily rather than rejected, since the connection is going
    /// away regardless.
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Self {
        if payload.len() < 2 {
            return Self::new(CloseCode::STATUS_NOT_AVAILABLE, "");
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        Self::new(
            CloseCode(code),
            String::from_utf8_lossy(&payload[2..]).into_owned(),
        )
    }
}

/// A complete, non-fragmented frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag. Always true for frames this crate produces.
    pub fin: bool,
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Bytes,
    /// Whether the frame was masked on the wire.
    pub masked: bool,
}

impl Frame {
    /// Create a frame with `fin` set.
    #[must_use]
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
            masked: false,
        }
    }

    #[must_use]
    pub fn text(payload: impl Into<String>) -> Self {
        Self::new(Opcode::Text, Bytes::from(payload.into()))
    }

    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    #[must_use]
    pub fn close(close: &CloseFrame) -> Self {
        Self::new(Opcode::Close, close.to_payload())
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    /// Masking key, present only when the mask bit was set.
    pub mask_key: Option<[u8; 4]>,
    /// Payload length in bytes.
    pub length: u64,
    /// Offset of the first payload byte from the start of the frame.
    pub payload_offset: usize,
}

impl FrameHeader {
    /// Total encoded size of the frame (header plus payload).
    #[must_use]
    pub fn frame_len(&self) -> u64 {
        self.payload_offset as u64 + self.length
    }
}
