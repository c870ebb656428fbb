//! # cloudlink-transport
//!
//! Client-side WebSocket transport for cloudlink.
//!
//! - **Dialers** open the byte stream: [`TcpDialer`] for TCP, upgraded to TLS
//!   for `wss://` when the `tls` feature is on (default)
//! - **Connections** run the opening handshake over that stream and then
//!   exchange single-frame messages
//!
//! The [`Dialer`] trait is the seam: anything that yields an
//! `AsyncRead + AsyncWrite` stream can carry a connection.
//!
//! ```rust,ignore
//! use cloudlink_protocol::Headers;
//! use cloudlink_transport::WebSocketConnection;
//!
//! async fn run() -> Result<(), cloudlink_transport::TransportError> {
//!     let conn = WebSocketConnection::connect("wss://echo.example", &Headers::new()).await?;
//!     let (mut reader, sender) = conn.split();
//!     sender.send_text("hello\n").await?;
//!     while let Ok(message) = reader.recv().await {
//!         // Process message
//!     }
//!     Ok(())
//! }
//! ```

pub mod tcp;
pub mod traits;
pub mod websocket;

pub use tcp::TcpDialer;
pub use traits::{AsyncStream, BoxedStream, ConnectionId, Dialer, TransportError};
pub use websocket::{
    ConnectionReader, ConnectionSender, ConnectionState, Message, WebSocketConfig,
    WebSocketConnection,
};
