//! Session identity and configuration.

use cloudlink_protocol::{Headers, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Host whose cloud server requires a logged-in session.
pub const OFFICIAL_CLOUD_HOST: &str = "clouddata.scratch.mit.edu";

/// Default cloud server URL.
pub const DEFAULT_CLOUD_URL: &str = "wss://clouddata.scratch.mit.edu";

/// Origin sent unless the caller overrides it.
pub const DEFAULT_ORIGIN: &str = "https://scratch.mit.edu";

/// Who the session acts as and which project it syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub project_id: String,
    /// Login session credential, sent as a cookie to the official host only.
    pub session_id: Option<String>,
}

impl Identity {
    #[must_use]
    pub fn new(username: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            project_id: project_id.into(),
            session_id: None,
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// True if a non-empty session credential is present.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.session_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// What happens to local variables when a dropped connection is re-established.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    /// The fresh handshake reply becomes the whole store; local-only
    /// variables are lost.
    #[default]
    Replace,
    /// The fresh reply is laid over the existing store; server values win.
    Merge,
}

/// Delays between reconnection attempts.
///
/// The first attempt is made immediately. Each failure doubles the delay,
/// starting at `initial_delay` and capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay to wait after `failures` consecutive failed attempts.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `ws://` or `wss://` URL of the cloud server.
    pub url: String,
    /// `Origin` header value.
    pub origin: String,
    /// Extra handshake headers; these win over the defaults.
    pub headers: Headers,
    pub reconnect: ReconnectPolicy,
    pub reconnect_mode: ReconnectMode,
    /// Minimum spacing between outbound mutations.
    pub mutation_interval: Duration,
    /// Largest inbound frame payload in bytes.
    pub max_frame_size: usize,
}

impl SessionConfig {
    /// Defaults pointed at another server.
    #[must_use]
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CLOUD_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            headers: Headers::new(),
            reconnect: ReconnectPolicy::default(),
            reconnect_mode: ReconnectMode::default(),
            mutation_interval: crate::rate_limit::MIN_MUTATION_INTERVAL,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.url, DEFAULT_CLOUD_URL);
        assert_eq!(config.origin, DEFAULT_ORIGIN);
        assert_eq!(config.reconnect_mode, ReconnectMode::Replace);
        assert_eq!(config.mutation_interval, Duration::from_millis(100));
        assert!(config.headers.is_empty());
    }

    #[test]
    fn test_identity_login() {
        let identity = Identity::new("alice", "1234");
        assert!(!identity.is_logged_in());
        assert!(!identity.clone().with_session_id("").is_logged_in());
        assert!(identity.with_session_id("abc").is_logged_in());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
        assert_eq!(policy.delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_reconnect_mode_serde() {
        let mode: ReconnectMode = serde_json::from_str("\"merge\"").unwrap();
        assert_eq!(mode, ReconnectMode::Merge);
    }
}
