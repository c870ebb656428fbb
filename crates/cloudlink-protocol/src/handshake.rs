//! Opening handshake (RFC 6455 Section 4), client side.
//!
//! Only the pure parts live here: URL parsing, request composition and
//! response verification. The transport crate drives the I/O.
//!
//! ```http
//! GET / HTTP/1.1
//! Host: clouddata.scratch.mit.edu
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```

use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt;
use thiserror::Error;

/// GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol version sent in `Sec-WebSocket-Version`.
pub const WS_VERSION: &str = "13";

/// Largest response head accepted before giving up.
pub const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Handshake failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The response was not an HTTP status line plus headers.
    #[error("Malformed handshake response: {0}")]
    MalformedResponse(String),

    /// The server answered with something other than 101.
    #[error("Server rejected upgrade: {status} {reason}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Reason phrase.
        reason: String,
    },

    /// No `Sec-WebSocket-Accept` header in the response.
    #[error("Missing Sec-WebSocket-Accept header")]
    MissingAccept,

    /// `Sec-WebSocket-Accept` did not match the key that was sent.
    #[error("Invalid Sec-WebSocket-Accept: expected {expected}, got {actual}")]
    AcceptMismatch {
        /// Value derived from our key.
        expected: String,
        /// Value the server sent.
        actual: String,
    },

    /// The response head grew past [`MAX_RESPONSE_HEAD`].
    #[error("Handshake response exceeds {max} bytes", max = MAX_RESPONSE_HEAD)]
    ResponseTooLarge,

    /// The stream ended before the response head was complete.
    #[error("Connection closed during handshake")]
    Truncated,
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// ```
/// use cloudlink_protocol::handshake::compute_accept_key;
///
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generate a random base64-encoded 16-byte nonce.
#[must_use]
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Parsed `ws://` or `wss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub host: String,
    /// Defaults to 80 for `ws` and 443 for `wss`.
    pub port: u16,
    /// Request path, `/` if absent.
    pub path: String,
    /// True for `wss`.
    pub tls: bool,
}

impl WsUrl {
    /// Parse a WebSocket URL.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidUrl`] for a missing or unsupported
    /// scheme, an empty host or an invalid port.
    pub fn parse(url: &str) -> Result<Self, HandshakeError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| HandshakeError::InvalidUrl(format!("missing scheme in {url}")))?;

        let tls = match scheme.to_ascii_lowercase().as_str() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(HandshakeError::InvalidUrl(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };
        let default_port = if tls { 443 } else { 80 };

        let (authority, path) = match rest.find(['/', '?']) {
            Some(idx) if rest.as_bytes()[idx] == b'?' => (&rest[..idx], format!("/{}", &rest[idx..])),
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };

        let parse_port = |raw: &str| {
            raw.parse::<u16>()
                .map_err(|_| HandshakeError::InvalidUrl(format!("invalid port: {raw}")))
        };

        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            // [::1]:8080
            let (host, tail) = stripped
                .split_once(']')
                .ok_or_else(|| HandshakeError::InvalidUrl("unterminated IPv6 literal".into()))?;
            let port = match tail.strip_prefix(':') {
                Some(raw) => parse_port(raw)?,
                None => default_port,
            };
            (host.to_string(), port)
        } else if let Some((host, raw)) = authority.rsplit_once(':') {
            (host.to_string(), parse_port(raw)?)
        } else {
            (authority.to_string(), default_port)
        };

        if host.is_empty() {
            return Err(HandshakeError::InvalidUrl("empty host".into()));
        }

        Ok(Self {
            host,
            port,
            path,
            tls,
        })
    }

    fn default_port(&self) -> u16 {
        if self.tls {
            443
        } else {
            80
        }
    }

    /// Value for the `Host` header.
    #[must_use]
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Default `Origin`: the HTTP(S) equivalent of this URL's authority.
    #[must_use]
    pub fn origin(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.host_header())
    }
}

impl fmt::Display for WsUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "wss" } else { "ws" };
        write!(f, "{}://{}{}", scheme, self.host_header(), self.path)
    }
}

/// Ordered header list with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any existing header with the same name.
    ///
    /// A replaced header keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(slot) => *slot = (name, value),
            None => self.0.push((name, value)),
        }
    }

    /// Builder form of [`Headers::insert`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Look up a header value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Remove a header, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(idx).1)
    }

    /// Overlay `other` on top of `self`; `other` wins on collisions.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in &other.0 {
            self.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Find the end of an HTTP head, returning the offset just past `\r\n\r\n`.
#[must_use]
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// One client handshake attempt: the key and the request built from it.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    url: WsUrl,
    key: String,
    headers: Headers,
}

impl ClientHandshake {
    /// Build a handshake with a fresh random key.
    ///
    /// `extra` is merged over the protocol headers, so callers may override
    /// any of them (including `Host` and `Origin`).
    #[must_use]
    pub fn new(url: WsUrl, extra: &Headers) -> Self {
        Self::with_key(url, generate_key(), extra)
    }

    /// Build a handshake with a fixed key.
    #[must_use]
    pub fn with_key(url: WsUrl, key: impl Into<String>, extra: &Headers) -> Self {
        let key = key.into();
        let mut headers = Headers::new()
            .with("Host", url.host_header())
            .with("Upgrade", "websocket")
            .with("Connection", "Upgrade")
            .with("Sec-WebSocket-Key", key.clone())
            .with("Sec-WebSocket-Version", WS_VERSION)
            .with("Origin", url.origin());
        headers.merge(extra);

        Self { url, key, headers }
    }

    #[must_use]
    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The accept value a conforming server must echo.
    #[must_use]
    pub fn expected_accept(&self) -> String {
        compute_accept_key(&self.key)
    }

    /// Serialize the upgrade request.
    #[must_use]
    pub fn request_bytes(&self) -> Vec<u8> {
        let mut request = format!("GET {} HTTP/1.1\r\n", self.url.path);
        for (name, value) in self.headers.iter() {
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        request.into_bytes()
    }

    /// Check a response head (status line and headers, up to the blank line).
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Rejected`] for a status other than 101,
    /// [`HandshakeError::MissingAccept`] or [`HandshakeError::AcceptMismatch`]
    /// for a bad accept value, and [`HandshakeError::MalformedResponse`] if the
    /// head is not HTTP.
    pub fn verify_response(&self, head: &[u8]) -> Result<(), HandshakeError> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::MalformedResponse(status_line.to_string()));
        }
        let status: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| HandshakeError::MalformedResponse(status_line.to_string()))?;
        if status != 101 {
            return Err(HandshakeError::Rejected {
                status,
                reason: parts.next().unwrap_or_default().to_string(),
            });
        }

        let accept = lines
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("Sec-WebSocket-Accept"))
            .map(|(_, value)| value.trim().to_string())
            .ok_or(HandshakeError::MissingAccept)?;

        let expected = self.expected_accept();
        if accept != expected {
            return Err(HandshakeError::AcceptMismatch {
                expected,
                actual: accept,
            });
        }

        Ok(())
    }
}
