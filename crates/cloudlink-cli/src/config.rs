//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (CLOUDLINK_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use cloudlink_core::{config::DEFAULT_CLOUD_URL, config::DEFAULT_ORIGIN};
use cloudlink_core::{Identity, ReconnectMode, ReconnectPolicy, SessionConfig};
use cloudlink_protocol::{Headers, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Who to connect as.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Cloud server connection.
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Reconnection behaviour.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Local HTTP status and bridge endpoint.
    #[serde(default)]
    pub status: StatusConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_project_id")]
    pub project_id: String,

    /// Login session id, required by the official cloud host.
    #[serde(default = "default_session_id")]
    pub session_id: Option<String>,
}

/// Cloud server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_origin")]
    pub origin: String,

    /// Extra handshake headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub mode: ReconnectMode,

    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

/// Status endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_status_host")]
    pub host: String,

    #[serde(default = "default_status_port")]
    pub port: u16,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_username() -> String {
    std::env::var("CLOUDLINK_USERNAME").unwrap_or_default()
}

fn default_project_id() -> String {
    std::env::var("CLOUDLINK_PROJECT_ID").unwrap_or_default()
}

fn default_session_id() -> Option<String> {
    std::env::var("CLOUDLINK_SESSION_ID").ok()
}

fn default_url() -> String {
    std::env::var("CLOUDLINK_URL").unwrap_or_else(|_| DEFAULT_CLOUD_URL.to_string())
}

fn default_origin() -> String {
    DEFAULT_ORIGIN.to_string()
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_initial_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_status_host() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    7070
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            project_id: default_project_id(),
            session_id: default_session_id(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            origin: default_origin(),
            headers: BTreeMap::new(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            mode: ReconnectMode::default(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_status_host(),
            port: default_status_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `$CLOUDLINK_CONFIG`, the default paths, or
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("CLOUDLINK_CONFIG") {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        let config_paths = ["cloudlink.toml", "~/.config/cloudlink/cloudlink.toml"];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// The session identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the username or project id is missing.
    pub fn identity(&self) -> Result<Identity> {
        let identity = &self.identity;
        if identity.username.is_empty() {
            bail!("No username configured (set identity.username or CLOUDLINK_USERNAME)");
        }
        if identity.project_id.is_empty() {
            bail!("No project id configured (set identity.project_id or CLOUDLINK_PROJECT_ID)");
        }

        let mut result = Identity::new(&identity.username, &identity.project_id);
        if let Some(session_id) = &identity.session_id {
            result = result.with_session_id(session_id);
        }
        Ok(result)
    }

    /// Session configuration derived from the `[cloud]` and `[reconnect]`
    /// sections.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            url: self.cloud.url.clone(),
            origin: self.cloud.origin.clone(),
            headers: self
                .cloud
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect::<Headers>(),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            },
            reconnect_mode: self.reconnect.mode,
            max_frame_size: self.cloud.max_frame_size,
            ..SessionConfig::default()
        }
    }

    /// Address the status endpoint binds to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn status_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.status.host, self.status.port)
            .parse()
            .with_context(|| {
                format!("Invalid status address {}:{}", self.status.host, self.status.port)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cloud.origin, "https://scratch.mit.edu");
        assert_eq!(config.reconnect.mode, ReconnectMode::Replace);
        assert!(config.status.enabled);
        assert!(!config.metrics.enabled);
        assert_eq!(config.status_addr().unwrap().port(), 7070);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [identity]
            username = "alice"
            project_id = "1234"
            session_id = "sid"

            [cloud]
            url = "wss://cloud.example.org/"

            [cloud.headers]
            "User-Agent" = "cloudlink"

            [reconnect]
            mode = "merge"
            initial_delay_ms = 100
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        let identity = config.identity().unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.session_id.as_deref(), Some("sid"));

        let session = config.session_config();
        assert_eq!(session.url, "wss://cloud.example.org/");
        assert_eq!(session.headers.get("user-agent"), Some("cloudlink"));
        assert_eq!(session.reconnect_mode, ReconnectMode::Merge);
        assert_eq!(session.reconnect.initial_delay, Duration::from_millis(100));
        assert_eq!(session.reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(session.mutation_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_identity_requires_username_and_project() {
        let mut config: Config = toml::from_str(
            r#"
            [identity]
            username = ""
            project_id = "1"
            "#,
        )
        .unwrap();
        assert!(config.identity().is_err());

        config.identity.username = "alice".into();
        config.identity.project_id = String::new();
        assert!(config.identity().is_err());
    }

    #[test]
    fn test_invalid_status_addr() {
        let mut config = Config::default();
        config.status.host = "not a host".into();
        assert!(config.status_addr().is_err());
    }
}
