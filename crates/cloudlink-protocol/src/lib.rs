//! # cloudlink-protocol
//!
//! Wire protocol definitions for the cloudlink cloud variable client.
//!
//! Two layers live here, both free of I/O:
//!
//! - **Framing** - an RFC 6455 subset: single-frame messages, client frames
//!   always masked, server frames never masked
//! - **Packets** - newline-delimited JSON objects (`handshake`, `set`,
//!   `create`, `delete`) carried inside text frames
//!
//! The opening handshake is split the same way: [`handshake`] builds the
//! upgrade request and verifies the response, the transport crate moves the
//! bytes.
//!
//! ## Example
//!
//! ```rust
//! use cloudlink_protocol::{codec, Opcode, Packet};
//!
//! let line = Packet::set("score", "42", "alice", "1234").to_line().unwrap();
//! let wire = codec::encode(line.as_bytes(), Opcode::Text, false);
//! let frame = codec::decode(&wire).unwrap();
//!
//! let text = std::str::from_utf8(&frame.payload).unwrap();
//! assert_eq!(Packet::parse_batch(text).len(), 1);
//! ```

pub mod codec;
pub mod frames;
pub mod handshake;
pub mod packet;

pub use codec::{decode_header, encode, FrameCodec, ProtocolError, MAX_FRAME_SIZE};
pub use frames::{CloseCode, CloseFrame, Frame, FrameHeader, Opcode};
pub use handshake::{compute_accept_key, ClientHandshake, HandshakeError, Headers, WsUrl};
pub use packet::{normalize_name, Packet, VariableEntry, CLOUD_PREFIX, MAX_VALUE_LENGTH};
