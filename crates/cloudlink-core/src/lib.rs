//! # cloudlink-core
//!
//! Cloud variable synchronization on top of the cloudlink transport.
//!
//! - **Session** - connect, handshake, rate-limited mutations, inbound
//!   dispatch and reconnection
//! - **Store** - the session-local view of every variable
//! - **Emitter** - named-event handlers for session activity
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  set/create/delete  ┌──────────────┐     ┌────────────┐
//! │ Application │────────────────────▶│ CloudSession │────▶│ Connection │
//! └─────────────┘                     └──────────────┘     └────────────┘
//!        ▲                             │        ▲                │
//!        │        ┌──────────────┐     │        │  receive loop  │
//!        └────────│ EventEmitter │◀────┘        └────────────────┘
//!                 └──────────────┘
//! ```
//!
//! ```rust,ignore
//! use cloudlink_core::{CloudSession, EventKind, Handler, Identity, SessionConfig};
//!
//! let identity = Identity::new("alice", "1234").with_session_id(session_id);
//! let session = CloudSession::new(identity, SessionConfig::default());
//! session.on(EventKind::Change, Handler::sync(|event| println!("{event:?}")));
//! session.connect().await?;
//! session.set("score", 42).await?;
//! ```

pub mod config;
pub mod emitter;
pub mod event;
pub mod rate_limit;
pub mod session;
pub mod variable;

pub use config::{Identity, ReconnectMode, ReconnectPolicy, SessionConfig};
pub use emitter::{EventEmitter, Handler, Subscription};
pub use event::{CloudEvent, EventKind};
pub use rate_limit::{RateLimiter, MIN_MUTATION_INTERVAL};
pub use session::{CloudSession, SessionError, SessionState, WeakCloudSession};
pub use variable::{validate_value, CloudVariable, ValidationError, VariableStore};
