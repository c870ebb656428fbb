//! Session events.

use cloudlink_protocol::Packet;
use std::fmt;

use crate::variable::CloudVariable;

/// Event names a session emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The handshake packet was sent.
    Handshake,
    /// The initial variable list was loaded.
    Connect,
    /// The server pushed a value.
    Set,
    Create,
    /// Any value change, local or remote.
    Change,
    Delete,
    /// A mutation packet was written.
    Outgoing,
    /// The connection dropped.
    Disconnect,
    /// A dropped connection was re-established.
    Reconnect,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Handshake => "handshake",
            EventKind::Connect => "connect",
            EventKind::Set => "set",
            EventKind::Create => "create",
            EventKind::Change => "change",
            EventKind::Delete => "delete",
            EventKind::Outgoing => "outgoing",
            EventKind::Disconnect => "disconnect",
            EventKind::Reconnect => "reconnect",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload handed to event handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudEvent {
    Handshake,
    Connect,
    Set(CloudVariable),
    Create(CloudVariable),
    Change(CloudVariable),
    /// Name of the deleted variable as the caller gave it.
    Delete(String),
    Outgoing(Packet),
    /// Why the connection dropped.
    Disconnect(String),
    Reconnect,
}

impl CloudEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            CloudEvent::Handshake => EventKind::Handshake,
            CloudEvent::Connect => EventKind::Connect,
            CloudEvent::Set(_) => EventKind::Set,
            CloudEvent::Create(_) => EventKind::Create,
            CloudEvent::Change(_) => EventKind::Change,
            CloudEvent::Delete(_) => EventKind::Delete,
            CloudEvent::Outgoing(_) => EventKind::Outgoing,
            CloudEvent::Disconnect(_) => EventKind::Disconnect,
            CloudEvent::Reconnect => EventKind::Reconnect,
        }
    }

    /// The variable carried by `set`, `create` and `change` events.
    #[must_use]
    pub fn variable(&self) -> Option<&CloudVariable> {
        match self {
            CloudEvent::Set(v) | CloudEvent::Create(v) | CloudEvent::Change(v) => Some(v),
            _ => None,
        }
    }
}
