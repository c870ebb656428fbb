//! Cloud variable packets.
//!
//! Packets are JSON objects terminated by a newline and carried in text
//! frames. The server may batch several of them into one frame, so inbound
//! text is split on newlines and each line decoded on its own; lines that do
//! not decode are skipped.

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::trace;

/// Prefix that marks a variable as a cloud variable on the wire.
pub const CLOUD_PREFIX: &str = "☁ ";

/// Maximum length of a variable value.
pub const MAX_VALUE_LENGTH: usize = 256;

/// Add the cloud prefix to `name` unless it already has it.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    if name.starts_with(CLOUD_PREFIX) {
        name.to_string()
    } else {
        format!("{CLOUD_PREFIX}{name}")
    }
}

/// Strip the cloud prefix, if present.
#[must_use]
pub fn display_name(name: &str) -> &str {
    name.strip_prefix(CLOUD_PREFIX).unwrap_or(name)
}

/// Values travel as strings, but some servers send bare numbers.
fn value_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(D::Error::custom(format!("unsupported variable value: {other}"))),
    }
}

/// A cloud packet, tagged by its `method` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Packet {
    /// Opens a session for a project.
    Handshake { user: String, project_id: String },

    /// Set a variable. Inbound notifications may omit `user`/`project_id`.
    Set {
        name: String,
        #[serde(deserialize_with = "value_string")]
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },

    /// Create a variable with an initial value.
    Create {
        name: String,
        #[serde(deserialize_with = "value_string")]
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },

    /// Delete a variable.
    Delete {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
}

impl Packet {
    #[must_use]
    pub fn handshake(user: impl Into<String>, project_id: impl Into<String>) -> Self {
        Packet::Handshake {
            user: user.into(),
            project_id: project_id.into(),
        }
    }

    #[must_use]
    pub fn set(name: &str, value: impl Into<String>, user: &str, project_id: &str) -> Self {
        Packet::Set {
            name: normalize_name(name),
            value: value.into(),
            user: Some(user.to_string()),
            project_id: Some(project_id.to_string()),
        }
    }

    #[must_use]
    pub fn create(name: &str, value: impl Into<String>, user: &str, project_id: &str) -> Self {
        Packet::Create {
            name: normalize_name(name),
            value: value.into(),
            user: Some(user.to_string()),
            project_id: Some(project_id.to_string()),
        }
    }

    #[must_use]
    pub fn delete(name: &str, user: &str, project_id: &str) -> Self {
        Packet::Delete {
            name: normalize_name(name),
            user: Some(user.to_string()),
            project_id: Some(project_id.to_string()),
        }
    }

    /// The `method` tag.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Packet::Handshake { .. } => "handshake",
            Packet::Set { .. } => "set",
            Packet::Create { .. } => "create",
            Packet::Delete { .. } => "delete",
        }
    }

    /// The variable this packet targets, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Packet::Handshake { .. } => None,
            Packet::Set { name, .. } | Packet::Create { name, .. } | Packet::Delete { name, .. } => {
                Some(name.as_str())
            }
        }
    }

    /// Serialize as one newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode every well-formed packet in a newline-delimited batch.
    #[must_use]
    pub fn parse_batch(text: &str) -> Vec<Packet> {
        parse_lines(text)
    }
}

/// One `name`/`value` pair from the handshake reply.
///
/// Reply lines may or may not carry a `method`; any extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariableEntry {
    pub name: String,
    #[serde(deserialize_with = "value_string")]
    pub value: String,
}

/// Decode the variables listed in a handshake reply.
#[must_use]
pub fn parse_entries(text: &str) -> Vec<VariableEntry> {
    parse_lines(text)
}

fn parse_lines<T: DeserializeOwned>(text: &str) -> Vec<T> {
    text.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(item) => Some(item),
            Err(e) => {
                trace!(error = %e, line, "Skipping undecodable packet line");
                None
            }
        })
        .collect()
}
