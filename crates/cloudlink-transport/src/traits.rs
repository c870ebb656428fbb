//! Transport abstraction traits for cloudlink.
//!
//! A [`Dialer`] turns a parsed URL into a duplex byte stream. The framed
//! connection only ever sees the boxed stream, so TCP, TLS and in-memory
//! test pipes are interchangeable.

use async_trait::async_trait;
use cloudlink_protocol::{CloseCode, HandshakeError, ProtocolError, WsUrl};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream usable as a connection transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased transport stream.
pub type BoxedStream = Box<dyn AsyncStream>;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier for one physical connection, used in log fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let seq = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{seq:x}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operation on a connection that is no longer open.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer sent a close frame.
    #[error("Connection closed by peer: {code} {reason}")]
    Closed {
        /// Status code from the close frame.
        code: CloseCode,
        /// Reason text from the close frame.
        reason: String,
    },

    /// Opening handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Framing violation.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Reset, EOF or broken pipe on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or negotiation failed.
    #[error("TLS error: {0}")]
    Tls(String),
}

impl TransportError {
    /// True for failures that mean the link itself is gone.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed | TransportError::Closed { .. } | TransportError::Io(_)
        )
    }
}

/// Opens the byte stream a framed connection runs over.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `url`'s host and port, wrapping in TLS when `url.tls` is set.
    async fn dial(&self, url: &WsUrl) -> Result<BoxedStream, TransportError>;

    /// Get the dialer name (e.g., "tcp").
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(TransportError::ConnectionClosed.is_connection_error());
        assert!(TransportError::Io(std::io::ErrorKind::BrokenPipe.into()).is_connection_error());
        assert!(!TransportError::Protocol(ProtocolError::MaskedServerFrame).is_connection_error());
        assert!(!TransportError::Handshake(HandshakeError::MissingAccept).is_connection_error());
    }
}
