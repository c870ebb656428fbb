//! TCP dialer, with TLS for `wss://` URLs.
//!
//! TLS uses rustls with the webpki root set; certificates are verified.

use async_trait::async_trait;
use cloudlink_protocol::WsUrl;
use tokio::net::TcpStream;
use tracing::debug;

#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio_rustls::{
    rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};

use crate::traits::{BoxedStream, Dialer, TransportError};

/// Dials plain TCP, upgrading to TLS for secure URLs.
#[derive(Clone)]
pub struct TcpDialer {
    nodelay: bool,
    #[cfg(feature = "tls")]
    tls: TlsConnector,
}

impl TcpDialer {
    /// Create a dialer trusting the webpki root certificates.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodelay: true,
            #[cfg(feature = "tls")]
            tls: TlsConnector::from(Arc::new(default_tls_config())),
        }
    }

    /// Create a dialer with a custom rustls client configuration.
    #[cfg(feature = "tls")]
    #[must_use]
    pub fn with_tls_config(config: Arc<ClientConfig>) -> Self {
        Self {
            nodelay: true,
            tls: TlsConnector::from(config),
        }
    }

    /// Toggle `TCP_NODELAY` on dialed sockets (on by default).
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    #[cfg(feature = "tls")]
    async fn wrap_tls(&self, stream: TcpStream, host: &str) -> Result<BoxedStream, TransportError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::Tls(format!("invalid server name {host}: {e}")))?;
        let stream = self
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        debug!(host = %host, "TLS session established");
        Ok(Box::new(stream))
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap_tls(&self, _stream: TcpStream, _host: &str) -> Result<BoxedStream, TransportError> {
        Err(TransportError::Tls(
            "cloudlink-transport was built without the `tls` feature".into(),
        ))
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TcpDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpDialer")
            .field("nodelay", &self.nodelay)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
fn default_tls_config() -> ClientConfig {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, url: &WsUrl) -> Result<BoxedStream, TransportError> {
        let stream = TcpStream::connect((url.host.as_str(), url.port)).await?;
        stream.set_nodelay(self.nodelay)?;

        debug!(host = %url.host, port = url.port, tls = url.tls, "TCP connection established");

        if url.tls {
            self.wrap_tls(stream, &url.host).await
        } else {
            Ok(Box::new(stream))
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
