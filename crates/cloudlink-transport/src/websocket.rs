//! Framed WebSocket connection, client side.
//!
//! A connection owns one stream and moves through
//! `Connecting -> Open -> Closing -> Closed`. It can be split into a
//! [`ConnectionReader`] and a cloneable [`ConnectionSender`] so a receive
//! loop and any number of writers can share it. Ping and close frames are
//! answered by the reader without surfacing them to the caller.

use bytes::{Bytes, BytesMut};
use cloudlink_protocol::{
    codec,
    handshake::{find_head_end, MAX_RESPONSE_HEAD},
    ClientHandshake, CloseCode, CloseFrame, Frame, FrameCodec, HandshakeError, Headers, Opcode,
    ProtocolError, WsUrl, MAX_FRAME_SIZE,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::tcp::TcpDialer;
use crate::traits::{BoxedStream, ConnectionId, Dialer, TransportError};

/// Longest close reason that fits a control frame after the status code.
const MAX_CLOSE_REASON: usize = 123;

/// WebSocket connection configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Largest inbound frame payload in bytes.
    pub max_frame_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// An application-visible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    /// Borrow the text of a text message.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    fn opcode(&self) -> Opcode {
        match self {
            Message::Text(_) => Opcode::Text,
            Message::Binary(_) => Opcode::Binary,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data.into())
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Transport setup and handshake in progress.
    Connecting = 0,
    Open = 1,
    /// Close frame sent, transport not yet torn down.
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// State shared by the reader and every sender of one connection.
struct Shared {
    id: ConnectionId,
    state: AtomicU8,
    writer: Arc<Mutex<Option<WriteHalf<BoxedStream>>>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Mask, encode and write one frame.
    ///
    /// The write runs on its own task once the writer lock is held, so a
    /// caller that gives up early never leaves half a frame on the stream.
    /// Any write failure tears the connection down.
    async fn write_frame(
        self: &Arc<Self>,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let data = codec::encode(payload, opcode, true);

        let mut guard = Arc::clone(&self.writer).lock_owned().await;
        if guard.is_none() {
            return Err(TransportError::ConnectionClosed);
        }

        let shared = Arc::clone(self);
        let write = tokio::spawn(async move {
            let Some(writer) = guard.as_mut() else {
                return Err(TransportError::ConnectionClosed);
            };
            let result = async {
                writer.write_all(&data).await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = result {
                warn!(connection = %shared.id, error = %e, "Write failed, closing connection");
                *guard = None;
                shared.set_state(ConnectionState::Closed);
                return Err(TransportError::Io(e));
            }

            trace!(connection = %shared.id, opcode = ?opcode, bytes = data.len(), "Frame sent");
            Ok(())
        });

        join_write(write).await
    }

    /// Run the close sequence once: send a close frame, shut the stream down.
    ///
    /// Returns `Ok(())` without doing anything if the connection is not open.
    async fn close(self: &Arc<Self>, close: CloseFrame) -> Result<(), TransportError> {
        if self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        debug!(connection = %self.id, code = %close.code, reason = %close.reason, "Closing connection");

        let data = codec::encode(&close.to_payload(), Opcode::Close, true);
        let mut guard = Arc::clone(&self.writer).lock_owned().await;
        let shared = Arc::clone(self);
        let write = tokio::spawn(async move {
            let result = match guard.take() {
                Some(mut writer) => async {
                    writer.write_all(&data).await?;
                    writer.flush().await?;
                    writer.shutdown().await
                }
                .await
                .map_err(TransportError::Io),
                None => Ok(()),
            };
            shared.set_state(ConnectionState::Closed);
            result
        });

        join_write(write).await
    }

    /// Drop the writer after the peer vanished.
    async fn abort(&self) {
        self.set_state(ConnectionState::Closed);
        self.writer.lock().await.take();
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Wait for a detached write task.
async fn join_write(
    write: JoinHandle<Result<(), TransportError>>,
) -> Result<(), TransportError> {
    match write.await {
        Ok(result) => result,
        Err(e) => Err(TransportError::Io(std::io::Error::other(e))),
    }
}

/// Receiving half of a connection.
pub struct ConnectionReader {
    shared: Arc<Shared>,
    reader: ReadHalf<BoxedStream>,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl ConnectionReader {
    /// Wait for the next text or binary message.
    ///
    /// Pings are answered with a pong carrying the same payload and never
    /// returned. A close frame completes the close handshake and is reported
    /// as [`TransportError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Protocol`] on a framing violation (the
    /// connection is closed with the matching status first),
    /// [`TransportError::Io`] on reset or EOF, and
    /// [`TransportError::ConnectionClosed`] if the connection was already closed.
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        loop {
            match self.codec.decode_from(&mut self.buffer) {
                Ok(Some(frame)) => {
                    if let Some(message) = self.handle_frame(frame).await? {
                        return Ok(message);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => return Err(self.fail(e).await),
            }

            if self.shared.state() == ConnectionState::Closed {
                return Err(TransportError::ConnectionClosed);
            }

            match self.reader.read_buf(&mut self.buffer).await {
                Ok(0) => {
                    debug!(connection = %self.shared.id, "Stream ended");
                    self.shared.abort().await;
                    return Err(TransportError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
                Ok(n) => trace!(connection = %self.shared.id, bytes = n, "Read from stream"),
                Err(e) => {
                    warn!(connection = %self.shared.id, error = %e, "Read failed");
                    self.shared.abort().await;
                    return Err(TransportError::Io(e));
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>, TransportError> {
        match frame.opcode {
            Opcode::Text => match String::from_utf8(frame.payload.to_vec()) {
                Ok(text) => Ok(Some(Message::Text(text))),
                Err(e) => Err(self.fail(ProtocolError::InvalidUtf8(e)).await),
            },
            Opcode::Binary => Ok(Some(Message::Binary(frame.payload))),
            Opcode::Ping => {
                trace!(connection = %self.shared.id, "Ping received, sending pong");
                if self.shared.state() == ConnectionState::Open {
                    self.shared.write_frame(Opcode::Pong, &frame.payload).await?;
                }
                Ok(None)
            }
            Opcode::Pong => Ok(None),
            Opcode::Close => {
                let close = CloseFrame::from_payload(&frame.payload);
                debug!(
                    connection = %self.shared.id,
                    code = %close.code,
                    reason = %close.reason,
                    "Close frame received"
                );
                // Echo the status back; a failed echo changes nothing for the caller.
                if let Err(e) = self.shared.close(close.clone()).await {
                    trace!(connection = %self.shared.id, error = %e, "Close echo failed");
                }
                self.shared.abort().await;
                Err(TransportError::Closed {
                    code: close.code,
                    reason: close.reason,
                })
            }
            Opcode::Continuation => Err(self.fail(ProtocolError::Fragmented).await),
        }
    }

    /// Close with the status matching `error` and hand the error back.
    async fn fail(&mut self, error: ProtocolError) -> TransportError {
        let code = match error {
            ProtocolError::InvalidUtf8(_) => CloseCode::INVALID_PAYLOAD,
            ProtocolError::FrameTooLarge(..) => CloseCode::MESSAGE_TOO_BIG,
            _ => CloseCode::PROTOCOL_ERROR,
        };
        warn!(connection = %self.shared.id, error = %error, "Protocol violation");

        let reason = error.to_string();
        if let Err(e) = self
            .shared
            .close(CloseFrame::new(code, truncate_reason(&reason)))
            .await
        {
            trace!(connection = %self.shared.id, error = %e, "Close after protocol error failed");
        }
        self.shared.abort().await;
        self.buffer.clear();

        TransportError::Protocol(error)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.state() == ConnectionState::Open
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }
}

/// Sending half of a connection. Clones share the same stream.
#[derive(Clone)]
pub struct ConnectionSender {
    shared: Arc<Shared>,
}

impl ConnectionSender {
    /// Send a message as a single masked frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] unless the connection is
    /// open, or [`TransportError::Io`] if the write fails.
    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.shared.state() != ConnectionState::Open {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared.write_frame(message.opcode(), message.payload()).await
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// See [`ConnectionSender::send`].
    pub async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if self.shared.state() != ConnectionState::Open {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared.write_frame(Opcode::Text, text.as_bytes()).await
    }

    /// Send a ping.
    ///
    /// # Errors
    ///
    /// See [`ConnectionSender::send`].
    pub async fn ping(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.shared.state() != ConnectionState::Open {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared.write_frame(Opcode::Ping, payload).await
    }

    /// Send a close frame and tear the transport down.
    ///
    /// Closing a connection that is not open is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the close frame cannot be written;
    /// the connection is closed regardless.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), TransportError> {
        self.shared
            .close(CloseFrame::new(code, truncate_reason(reason)))
            .await
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.state() == ConnectionState::Open
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }
}

/// A client WebSocket connection.
pub struct WebSocketConnection {
    reader: ConnectionReader,
    sender: ConnectionSender,
}

impl WebSocketConnection {
    /// Dial `url` over TCP (TLS for `wss`) and run the opening handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the stream cannot be opened or
    /// the handshake fails.
    pub async fn connect(url: &str, headers: &Headers) -> Result<Self, TransportError> {
        let url = WsUrl::parse(url)?;
        Self::connect_with(&TcpDialer::new(), &url, headers, &WebSocketConfig::default()).await
    }

    /// Dial through a custom [`Dialer`] and run the opening handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if dialing or the handshake fails.
    pub async fn connect_with(
        dialer: &dyn Dialer,
        url: &WsUrl,
        headers: &Headers,
        config: &WebSocketConfig,
    ) -> Result<Self, TransportError> {
        debug!(url = %url, dialer = dialer.name(), "Connecting");
        let stream = dialer.dial(url).await?;
        Self::from_stream(stream, url, headers, config).await
    }

    /// Run the opening handshake over an already-open stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] if the server's response is not
    /// a valid upgrade, or [`TransportError::Io`] if the stream fails.
    pub async fn from_stream(
        mut stream: BoxedStream,
        url: &WsUrl,
        headers: &Headers,
        config: &WebSocketConfig,
    ) -> Result<Self, TransportError> {
        let id = ConnectionId::generate();

        let leftover = match perform_handshake(&mut stream, url, headers).await {
            Ok(leftover) => leftover,
            Err(e) => {
                warn!(connection = %id, url = %url, error = %e, "WebSocket handshake failed");
                // Best effort: the stream is unusable either way.
                let _ = stream.shutdown().await;
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            id,
            state: AtomicU8::new(ConnectionState::Open as u8),
            writer: Arc::new(Mutex::new(Some(write_half))),
        });

        debug!(connection = %shared.id, url = %url, "WebSocket handshake completed");

        Ok(Self {
            reader: ConnectionReader {
                shared: Arc::clone(&shared),
                reader: read_half,
                buffer: leftover,
                codec: FrameCodec::new().with_max_frame_size(config.max_frame_size),
            },
            sender: ConnectionSender { shared },
        })
    }

    /// Wait for the next text or binary message.
    ///
    /// # Errors
    ///
    /// See [`ConnectionReader::recv`].
    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        self.reader.recv().await
    }

    /// Send a message.
    ///
    /// # Errors
    ///
    /// See [`ConnectionSender::send`].
    pub async fn send(&self, message: impl Into<Message>) -> Result<(), TransportError> {
        self.sender.send(&message.into()).await
    }

    /// Close the connection; a no-op if it is already closed.
    ///
    /// # Errors
    ///
    /// See [`ConnectionSender::close`].
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), TransportError> {
        self.sender.close(code, reason).await
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.sender.state()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        self.sender.id()
    }

    /// Split into a reader and a cloneable sender.
    #[must_use]
    pub fn split(self) -> (ConnectionReader, ConnectionSender) {
        (self.reader, self.sender)
    }
}

/// Send the upgrade request and read the response head.
///
/// Returns whatever arrived after the head; it belongs to the frame stream.
async fn perform_handshake(
    stream: &mut BoxedStream,
    url: &WsUrl,
    headers: &Headers,
) -> Result<BytesMut, TransportError> {
    let handshake = ClientHandshake::new(url.clone(), headers);
    stream.write_all(&handshake.request_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = buf.split_to(end);
            handshake.verify_response(&head)?;
            return Ok(buf);
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(HandshakeError::ResponseTooLarge.into());
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::Truncated.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudlink_protocol::{codec::apply_mask, codec::parse_header, compute_accept_key};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    /// Read the upgrade request and return its key.
    async fn read_request(server: &mut DuplexStream) -> String {
        let mut buf = BytesMut::new();
        loop {
            if let Some(end) = find_head_end(&buf) {
                let head = String::from_utf8_lossy(&buf[..end]).into_owned();
                return head
                    .lines()
                    .find_map(|l| {
                        l.strip_prefix("Sec-WebSocket-Key: ")
                            .map(|k| k.trim().to_string())
                    })
                    .unwrap();
            }
            server.read_buf(&mut buf).await.unwrap();
        }
    }

    /// Accept the upgrade, optionally appending raw bytes to the response.
    async fn accept(server: &mut DuplexStream, trailing: &[u8]) {
        let key = read_request(server).await;
        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            compute_accept_key(&key)
        )
        .into_bytes();
        response.extend_from_slice(trailing);
        server.write_all(&response).await.unwrap();
    }

    /// Read one masked client frame and return its opcode and unmasked payload.
    async fn read_client_frame(server: &mut DuplexStream) -> (Opcode, Vec<u8>) {
        let mut buf = BytesMut::new();
        loop {
            if let Ok(header) = parse_header(&buf) {
                let end = header.payload_offset + header.length as usize;
                if buf.len() >= end {
                    let key = header.mask_key.expect("client frames are masked");
                    let mut payload = buf[header.payload_offset..end].to_vec();
                    apply_mask(&mut payload, key);
                    return (header.opcode, payload);
                }
            }
            server.read_buf(&mut buf).await.unwrap();
        }
    }

    /// Read `count` consecutive client frames from one buffered stream.
    async fn read_client_frames(server: &mut DuplexStream, count: usize) -> Vec<Vec<u8>> {
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        while frames.len() < count {
            if let Ok(header) = parse_header(&buf) {
                let end = header.payload_offset + header.length as usize;
                if buf.len() >= end {
                    let frame = buf.split_to(end);
                    let mut payload = frame[header.payload_offset..].to_vec();
                    apply_mask(&mut payload, header.mask_key.unwrap());
                    frames.push(payload);
                    continue;
                }
            }
            server.read_buf(&mut buf).await.unwrap();
        }
        frames
    }

    fn server_frame(payload: &[u8], opcode: Opcode) -> Bytes {
        codec::encode(payload, opcode, false)
    }

    fn test_url() -> WsUrl {
        WsUrl::parse("ws://cloud.test/").unwrap()
    }

    async fn open_pair() -> (WebSocketConnection, DuplexStream) {
        let (client, mut server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            accept(&mut server, &[]).await;
            server
        });
        let conn = WebSocketConnection::from_stream(
            Box::new(client),
            &test_url(),
            &Headers::new(),
            &WebSocketConfig::default(),
        )
        .await
        .unwrap();
        (conn, server_task.await.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_and_text_exchange() {
        let (mut conn, mut server) = open_pair().await;
        assert_eq!(conn.state(), ConnectionState::Open);

        conn.send("hello").await.unwrap();
        let (opcode, payload) = read_client_frame(&mut server).await;
        assert_eq!(opcode, Opcode::Text);
        assert_eq!(payload, b"hello");

        server.write_all(&server_frame(b"world", Opcode::Text)).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Message::Text("world".into()));
    }

    #[tokio::test]
    async fn test_abandoned_send_still_writes_whole_frame() {
        let (client, mut server) = duplex(64);
        let server_task = tokio::spawn(async move {
            accept(&mut server, &[]).await;
            server
        });
        let conn = WebSocketConnection::from_stream(
            Box::new(client),
            &test_url(),
            &Headers::new(),
            &WebSocketConfig::default(),
        )
        .await
        .unwrap();
        let mut server = server_task.await.unwrap();
        let (_reader, sender) = conn.split();

        // The pipe holds 64 bytes and nobody reads yet, so the write stalls.
        let large = "1".repeat(200);
        let first =
            tokio::time::timeout(Duration::from_millis(20), sender.send_text(&large)).await;
        assert!(first.is_err());
        assert_eq!(sender.state(), ConnectionState::Open);

        let second = tokio::spawn({
            let sender = sender.clone();
            async move { sender.send_text("{\"method\":\"set\"}\n").await }
        });

        let frames = read_client_frames(&mut server, 2).await;
        assert_eq!(frames[0], large.as_bytes());
        assert_eq!(frames[1], b"{\"method\":\"set\"}\n");
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_binary_messages_use_binary_opcode() {
        let (mut conn, mut server) = open_pair().await;

        conn.send(vec![1u8, 2, 3]).await.unwrap();
        let (opcode, payload) = read_client_frame(&mut server).await;
        assert_eq!(opcode, Opcode::Binary);
        assert_eq!(payload, vec![1, 2, 3]);

        server.write_all(&server_frame(&[9, 9], Opcode::Binary)).await.unwrap();
        assert_eq!(
            conn.recv().await.unwrap(),
            Message::Binary(Bytes::from_static(&[9, 9]))
        );
    }

    #[tokio::test]
    async fn test_frame_bundled_with_handshake_response() {
        let (client, mut server) = duplex(64 * 1024);
        let first = server_frame(b"{\"name\":\"\xe2\x98\x81 a\",\"value\":\"1\"}\n", Opcode::Text);
        let server_task = tokio::spawn(async move {
            accept(&mut server, &first).await;
            server
        });

        let mut conn = WebSocketConnection::from_stream(
            Box::new(client),
            &test_url(),
            &Headers::new(),
            &WebSocketConfig::default(),
        )
        .await
        .unwrap();
        let _server = server_task.await.unwrap();

        let message = conn.recv().await.unwrap();
        assert!(message.as_text().unwrap().contains("☁ a"));
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_accept() {
        let (client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: nope\r\n\r\n")
                .await
                .unwrap();
        });

        let result = WebSocketConnection::from_stream(
            Box::new(client),
            &test_url(),
            &Headers::new(),
            &WebSocketConfig::default(),
        )
        .await;
        assert!(matches!(
            result,
            Err(TransportError::Handshake(HandshakeError::AcceptMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_101() {
        let (client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let result = WebSocketConnection::from_stream(
            Box::new(client),
            &test_url(),
            &Headers::new(),
            &WebSocketConfig::default(),
        )
        .await;
        assert!(matches!(
            result,
            Err(TransportError::Handshake(HandshakeError::Rejected { status: 401, .. }))
        ));
    }

    #[tokio::test]
    async fn test_handshake_truncated() {
        let (client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            read_request(&mut server).await;
            server.write_all(b"HTTP/1.1 101 Switch").await.unwrap();
        });

        let result = WebSocketConnection::from_stream(
            Box::new(client),
            &test_url(),
            &Headers::new(),
            &WebSocketConfig::default(),
        )
        .await;
        assert!(matches!(
            result,
            Err(TransportError::Handshake(HandshakeError::Truncated))
        ));
    }

    #[tokio::test]
    async fn test_ping_is_answered_and_not_surfaced() {
        let (mut conn, mut server) = open_pair().await;

        server.write_all(&server_frame(b"hb", Opcode::Ping)).await.unwrap();
        server.write_all(&server_frame(b"after", Opcode::Text)).await.unwrap();

        assert_eq!(conn.recv().await.unwrap(), Message::Text("after".into()));

        let (opcode, payload) = read_client_frame(&mut server).await;
        assert_eq!(opcode, Opcode::Pong);
        assert_eq!(payload, b"hb");
    }

    #[tokio::test]
    async fn test_masked_server_frame_closes_with_protocol_error() {
        let (mut conn, mut server) = open_pair().await;

        server.write_all(&codec::encode(b"sneaky", Opcode::Text, true)).await.unwrap();

        match conn.recv().await {
            Err(TransportError::Protocol(ProtocolError::MaskedServerFrame)) => {}
            other => panic!("Expected MaskedServerFrame, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);

        let (opcode, payload) = read_client_frame(&mut server).await;
        assert_eq!(opcode, Opcode::Close);
        assert_eq!(CloseFrame::from_payload(&payload).code, CloseCode::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn test_peer_close_is_echoed_and_reported() {
        let (mut conn, mut server) = open_pair().await;

        let close = CloseFrame::new(CloseCode::GOING_AWAY, "restarting");
        server
            .write_all(&server_frame(&close.to_payload(), Opcode::Close))
            .await
            .unwrap();

        match conn.recv().await {
            Err(TransportError::Closed { code, reason }) => {
                assert_eq!(code, CloseCode::GOING_AWAY);
                assert_eq!(reason, "restarting");
            }
            other => panic!("Expected Closed, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);

        let (opcode, payload) = read_client_frame(&mut server).await;
        assert_eq!(opcode, Opcode::Close);
        assert_eq!(CloseFrame::from_payload(&payload), close);
    }

    #[tokio::test]
    async fn test_eof_surfaces_connection_error() {
        let (mut conn, server) = open_pair().await;
        drop(server);

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert!(err.is_connection_error());
        assert_eq!(conn.state(), ConnectionState::Closed);

        assert!(matches!(
            conn.send("late").await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, mut server) = open_pair().await;

        conn.close(CloseCode::NORMAL, "bye").await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.close(CloseCode::NORMAL, "bye").await.unwrap();

        let (opcode, payload) = read_client_frame(&mut server).await;
        assert_eq!(opcode, Opcode::Close);
        assert_eq!(&payload[..2], &[0x03, 0xE8]);
        assert_eq!(&payload[2..], b"bye");

        // Nothing after the single close frame.
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_split_halves_share_state() {
        let (conn, mut server) = open_pair().await;
        let (mut reader, sender) = conn.split();
        let sender2 = sender.clone();

        sender.send_text("a").await.unwrap();
        sender2.send_text("b").await.unwrap();
        assert_eq!(read_client_frame(&mut server).await.1, b"a");
        assert_eq!(read_client_frame(&mut server).await.1, b"b");

        server.write_all(&server_frame(b"c", Opcode::Text)).await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), Message::Text("c".into()));

        sender.close(CloseCode::NORMAL, "").await.unwrap();
        assert!(!reader.is_open());
        assert_eq!(sender2.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_truncate_reason() {
        let long = "é".repeat(100);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate_reason("short"), "short");
    }

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
    }
}
