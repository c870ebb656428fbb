//! Cloud variable synchronization session.
//!
//! A [`CloudSession`] owns one connection to a cloud server for one project.
//! After [`CloudSession::connect`] a background task reads server pushes into
//! the local store and re-establishes the connection whenever it drops, until
//! [`CloudSession::close`] is called.

use cloudlink_protocol::{
    normalize_name, packet::parse_entries, CloseCode, Headers, Packet, WsUrl,
};
use cloudlink_transport::{
    ConnectionReader, ConnectionSender, Dialer, Message, TcpDialer, TransportError,
    WebSocketConfig, WebSocketConnection,
};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::config::{Identity, ReconnectMode, SessionConfig, OFFICIAL_CLOUD_HOST};
use crate::emitter::{EventEmitter, Handler, Subscription};
use crate::event::{CloudEvent, EventKind};
use crate::rate_limit::RateLimiter;
use crate::variable::{
    validate_value, CloudVariable, RemoteUpdate, ValidationError, VariableStore,
};

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake, framing or socket failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The value was refused before anything was sent.
    #[error("Invalid value: {0}")]
    Validation(#[from] ValidationError),

    #[error("Variable '{0}' is not in this project")]
    NotFound(String),

    /// No open connection to send on.
    #[error("Session is not connected")]
    NotConnected,

    /// The host requires a logged-in identity.
    #[error("You need to be logged in to connect to {0}")]
    Unauthorized(String),

    #[error("Failed to encode packet: {0}")]
    Encode(#[from] serde_json::Error),

    /// The task finishing a mutation panicked, usually inside an event handler.
    #[error("Mutation task failed: {0}")]
    Task(#[from] JoinError),
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    /// Connection and handshake in progress.
    Handshaking = 1,
    /// Initial variable list loaded; mutations are accepted.
    Synced = 2,
    /// Shut down by [`CloudSession::close`].
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Disconnected,
            1 => SessionState::Handshaking,
            2 => SessionState::Synced,
            _ => SessionState::Closed,
        }
    }
}

struct Inner {
    identity: Identity,
    config: SessionConfig,
    dialer: Arc<dyn Dialer>,
    store: Mutex<VariableStore>,
    events: EventEmitter<EventKind, CloudEvent>,
    limiter: RateLimiter,
    sender: RwLock<Option<ConnectionSender>>,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes `connect` and `close`.
    lifecycle: tokio::sync::Mutex<()>,
}

/// A cloud variable session. Clones share the same session.
#[derive(Clone)]
pub struct CloudSession {
    inner: Arc<Inner>,
}

impl CloudSession {
    /// Create a session that dials over TCP (TLS for `wss`).
    #[must_use]
    pub fn new(identity: Identity, config: SessionConfig) -> Self {
        Self::with_dialer(identity, config, Arc::new(TcpDialer::new()))
    }

    /// Create a session that opens its streams through `dialer`.
    #[must_use]
    pub fn with_dialer(identity: Identity, config: SessionConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                limiter: RateLimiter::new(config.mutation_interval),
                identity,
                config,
                dialer,
                store: Mutex::new(VariableStore::new()),
                events: EventEmitter::new(),
                sender: RwLock::new(None),
                state: AtomicU8::new(SessionState::Disconnected as u8),
                shutdown,
                receive_task: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Connect, handshake, load the initial variables and start receiving.
    ///
    /// Emits `handshake` once the handshake packet is sent and `connect` once
    /// the reply is loaded. Calling this while the session is already running
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Unauthorized`] without touching the network if
    /// the official host is targeted without a session id, or
    /// [`SessionError::Transport`] if the connection or handshake fails.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.receive_task_running() {
            debug!(project = %self.inner.identity.project_id, "Session already connected");
            return Ok(());
        }

        self.inner.shutdown.send_replace(false);
        let reader = self.inner.establish(ReconnectMode::Replace).await?;

        let task = tokio::spawn(Arc::clone(&self.inner).receive_loop(reader));
        *lock(&self.inner.receive_task) = Some(task);
        Ok(())
    }

    /// Current value of a variable; `name` may be bare or prefixed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the variable is not in the store.
    pub fn get(&self, name: &str) -> Result<String, SessionError> {
        self.inner
            .store()
            .get(name)
            .map(str::to_string)
            .ok_or_else(|| SessionError::NotFound(normalize_name(name)))
    }

    /// Set a variable.
    ///
    /// The value is validated first, then the call waits its turn behind the
    /// rate limiter. The local store is updated as soon as the packet is
    /// written. Emits `outgoing` then `change`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] for a value that is not 1 to 256
    /// ASCII digits, [`SessionError::NotConnected`] while disconnected, or
    /// [`SessionError::Transport`] if the write fails.
    pub async fn set(&self, name: &str, value: impl fmt::Display) -> Result<(), SessionError> {
        let value = value.to_string();
        validate_value(&value)?;

        let identity = &self.inner.identity;
        let packet = Packet::set(name, value.clone(), &identity.username, &identity.project_id);
        let variable = CloudVariable::new(name, value);

        self.inner
            .mutate(packet, move |store| {
                store.upsert(&variable.name, variable.value.clone());
                vec![CloudEvent::Change(variable)]
            })
            .await
    }

    /// Create a variable, overwriting any local value of the same name.
    ///
    /// Emits `outgoing`, `create`, then `change`.
    ///
    /// # Errors
    ///
    /// Same as [`CloudSession::set`].
    pub async fn create(&self, name: &str, value: impl fmt::Display) -> Result<(), SessionError> {
        let value = value.to_string();
        validate_value(&value)?;

        let identity = &self.inner.identity;
        let packet = Packet::create(name, value.clone(), &identity.username, &identity.project_id);
        let variable = CloudVariable::new(name, value);

        self.inner
            .mutate(packet, move |store| {
                store.upsert(&variable.name, variable.value.clone());
                vec![
                    CloudEvent::Create(variable.clone()),
                    CloudEvent::Change(variable),
                ]
            })
            .await
    }

    /// Delete a variable. Emits `outgoing` then `delete`.
    ///
    /// The `delete` event carries `name` exactly as given, prefixed or not.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] while disconnected, or
    /// [`SessionError::Transport`] if the write fails.
    pub async fn delete(&self, name: &str) -> Result<(), SessionError> {
        let identity = &self.inner.identity;
        let packet = Packet::delete(name, &identity.username, &identity.project_id);
        let requested = name.to_string();

        self.inner
            .mutate(packet, move |store| {
                store.remove(&requested);
                vec![CloudEvent::Delete(requested)]
            })
            .await
    }

    /// Stop the receive loop and close the connection with status 1000.
    ///
    /// Closing an already-closed session does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] if the close frame cannot be
    /// written; the session is closed regardless.
    pub async fn close(&self) -> Result<(), SessionError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.state() == SessionState::Closed {
            return Ok(());
        }
        self.inner.shutdown.send_replace(true);

        let task = lock(&self.inner.receive_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Receive loop ended abnormally");
            }
        }

        self.inner.set_state(SessionState::Closed);
        let sender = self.inner.take_sender();
        if let Some(sender) = sender {
            sender.close(CloseCode::NORMAL, "").await?;
        }

        info!(project = %self.inner.identity.project_id, "Cloud session closed");
        Ok(())
    }

    /// Register a handler for `kind`.
    pub fn on(&self, kind: EventKind, handler: Handler<CloudEvent>) -> Subscription<EventKind> {
        self.inner.events.on(kind, handler)
    }

    /// Register a handler for the next `kind` event only.
    pub fn once(&self, kind: EventKind, handler: Handler<CloudEvent>) -> Subscription<EventKind> {
        self.inner.events.once(kind, handler)
    }

    /// Remove every registration of `handler` for `kind`.
    pub fn off(&self, kind: EventKind, handler: &Handler<CloudEvent>) -> usize {
        self.inner.events.off(&kind, handler)
    }

    /// The session's event registry.
    #[must_use]
    pub fn events(&self) -> &EventEmitter<EventKind, CloudEvent> {
        &self.inner.events
    }

    /// Snapshot of every variable in insertion order.
    #[must_use]
    pub fn variables(&self) -> Vec<CloudVariable> {
        self.inner.store().snapshot()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.store().contains(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.store().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.store().is_empty()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state() == SessionState::Synced
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// A handle that does not keep the session alive, for handlers
    /// registered on the session itself.
    #[must_use]
    pub fn downgrade(&self) -> WeakCloudSession {
        WeakCloudSession {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning reference to a [`CloudSession`].
#[derive(Clone)]
pub struct WeakCloudSession {
    inner: Weak<Inner>,
}

impl WeakCloudSession {
    /// The session, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<CloudSession> {
        self.inner.upgrade().map(|inner| CloudSession { inner })
    }
}

impl fmt::Debug for CloudSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudSession")
            .field("project_id", &self.inner.identity.project_id)
            .field("url", &self.inner.config.url)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn store(&self) -> MutexGuard<'_, VariableStore> {
        lock(&self.store)
    }

    fn current_sender(&self) -> Option<ConnectionSender> {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_sender(&self, sender: ConnectionSender) {
        *self.sender.write().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    fn take_sender(&self) -> Option<ConnectionSender> {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn receive_task_running(&self) -> bool {
        lock(&self.receive_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn emit(&self, event: CloudEvent) {
        self.events.emit(&event.kind(), event);
    }

    /// Handshake headers: default origin, the session cookie for the
    /// official host, then the configured headers on top.
    fn handshake_headers(&self, url: &WsUrl) -> Result<Headers, SessionError> {
        let mut headers = Headers::new().with("Origin", self.config.origin.clone());

        if url.host.eq_ignore_ascii_case(OFFICIAL_CLOUD_HOST) {
            match self.identity.session_id.as_deref() {
                Some(id) if !id.is_empty() => {
                    headers.insert("Cookie", format!("scratchsessionsid={id};"));
                }
                _ => return Err(SessionError::Unauthorized(url.host.clone())),
            }
        }

        headers.merge(&self.config.headers);
        Ok(headers)
    }

    async fn establish(&self, mode: ReconnectMode) -> Result<ConnectionReader, SessionError> {
        let url = WsUrl::parse(&self.config.url).map_err(TransportError::from)?;
        let headers = self.handshake_headers(&url)?;

        self.set_state(SessionState::Handshaking);
        let result = self.open(&url, &headers, mode).await;
        if result.is_err() {
            self.set_state(SessionState::Disconnected);
        }
        result
    }

    async fn open(
        &self,
        url: &WsUrl,
        headers: &Headers,
        mode: ReconnectMode,
    ) -> Result<ConnectionReader, SessionError> {
        let ws_config = WebSocketConfig {
            max_frame_size: self.config.max_frame_size,
        };
        let connection =
            WebSocketConnection::connect_with(self.dialer.as_ref(), url, headers, &ws_config).await?;
        let (mut reader, sender) = connection.split();

        let handshake = Packet::handshake(&self.identity.username, &self.identity.project_id);
        sender.send_text(&handshake.to_line()?).await?;
        self.limiter.touch().await;
        self.emit(CloudEvent::Handshake);

        let reply = match reader.recv().await? {
            Message::Text(text) => text,
            Message::Binary(data) => {
                warn!(bytes = data.len(), "Binary handshake reply, starting with no variables");
                String::new()
            }
        };
        let fresh = VariableStore::from_entries(parse_entries(&reply));
        let count = fresh.len();
        {
            let mut store = self.store();
            match mode {
                ReconnectMode::Replace => store.replace(fresh),
                ReconnectMode::Merge => store.merge(fresh),
            }
        }

        self.set_sender(sender);
        self.set_state(SessionState::Synced);
        info!(
            connection = %reader.id(),
            url = %url,
            project = %self.identity.project_id,
            variables = count,
            "Cloud session connected"
        );
        self.emit(CloudEvent::Connect);

        Ok(reader)
    }

    /// Send one mutation in rate-limited FIFO order, then apply it locally.
    ///
    /// The permit is held until the local events have been emitted, so event
    /// order matches wire order. Once the caller's turn comes, sending and
    /// applying run on their own task: a caller that stops waiting still gets
    /// a whole packet on the wire and a store that reflects it.
    async fn mutate<F>(self: &Arc<Self>, packet: Packet, apply: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut VariableStore) -> Vec<CloudEvent> + Send + 'static,
    {
        let line = packet.to_line()?;
        if self.current_sender().is_none() {
            return Err(SessionError::NotConnected);
        }

        let mut permit = self.limiter.acquire().await;
        let sender = self.current_sender().ok_or(SessionError::NotConnected)?;

        let inner = Arc::clone(self);
        let commit = tokio::spawn(async move {
            sender.send_text(&line).await?;
            permit.commit();

            trace!(method = packet.method(), variable = ?packet.name(), "Mutation sent");

            let events = apply(&mut *inner.store());
            inner.emit(CloudEvent::Outgoing(packet));
            for event in events {
                inner.emit(event);
            }
            drop(permit);

            Ok::<(), SessionError>(())
        });

        commit.await?
    }

    /// Apply every `set` in a batch of server packets.
    fn dispatch(&self, text: &str) {
        for packet in Packet::parse_batch(text) {
            match packet {
                Packet::Set { name, value, .. } => {
                    let update = self.store().apply_remote(&name, value.clone());
                    let variable = CloudVariable::new(&name, value);
                    debug!(variable = %variable.name, value = %variable.value, ?update, "Remote set");

                    if update == RemoteUpdate::Created {
                        self.emit(CloudEvent::Create(variable.clone()));
                    }
                    self.emit(CloudEvent::Set(variable.clone()));
                    self.emit(CloudEvent::Change(variable));
                }
                other => trace!(method = other.method(), "Ignoring inbound packet"),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut reader: ConnectionReader) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let result = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => break,
                result = reader.recv() => result,
            };

            match result {
                Ok(Message::Text(text)) => self.dispatch(&text),
                Ok(Message::Binary(data)) => {
                    trace!(bytes = data.len(), "Ignoring binary message");
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(connection = %reader.id(), error = %e, "Cloud connection lost");
                    self.take_sender();
                    self.set_state(SessionState::Disconnected);
                    self.emit(CloudEvent::Disconnect(e.to_string()));

                    match self.reconnect(&mut shutdown).await {
                        Some(fresh) => reader = fresh,
                        None => break,
                    }
                }
            }
        }

        debug!(project = %self.identity.project_id, "Receive loop stopped");
    }

    /// Retry [`Inner::establish`] with backoff until it succeeds or the
    /// session is closed.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<ConnectionReader> {
        let mut failures = 0u32;

        loop {
            let delay = self.config.reconnect.delay(failures);
            if !delay.is_zero() {
                tokio::select! {
                    _ = shutdown.wait_for(|closed| *closed) => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            info!(attempt = failures + 1, project = %self.identity.project_id, "Reconnecting");
            let attempt = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return None,
                attempt = self.establish(self.config.reconnect_mode) => attempt,
            };

            match attempt {
                Ok(reader) => {
                    self.emit(CloudEvent::Reconnect);
                    return Some(reader);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %e, failures, "Reconnect attempt failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cloudlink_transport::BoxedStream;
    use std::sync::atomic::AtomicUsize;

    /// Counts dial attempts and always fails.
    #[derive(Default)]
    struct RefusingDialer {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, _url: &WsUrl) -> Result<BoxedStream, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Io(std::io::ErrorKind::ConnectionRefused.into()))
        }

        fn name(&self) -> &'static str {
            "refusing"
        }
    }

    fn session_with(config: SessionConfig, identity: Identity) -> (CloudSession, Arc<RefusingDialer>) {
        let dialer = Arc::new(RefusingDialer::default());
        let session = CloudSession::with_dialer(identity, config, dialer.clone());
        (session, dialer)
    }

    #[tokio::test]
    async fn test_official_host_requires_login() {
        let (session, dialer) = session_with(SessionConfig::default(), Identity::new("alice", "1"));

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Unauthorized(ref host) if host == OFFICIAL_CLOUD_HOST));
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_transport_error() {
        let (session, dialer) = session_with(
            SessionConfig::with_url("ws://cloud.test"),
            Identity::new("alice", "1"),
        );

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::Io(_))));
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let (session, _) = session_with(SessionConfig::with_url("http://nope"), Identity::new("a", "1"));
        assert!(matches!(
            session.connect().await,
            Err(SessionError::Transport(TransportError::Handshake(_)))
        ));
    }

    #[tokio::test]
    async fn test_mutations_require_connection() {
        let (session, _) = session_with(SessionConfig::default(), Identity::new("alice", "1"));

        assert!(matches!(session.set("x", 1).await, Err(SessionError::NotConnected)));
        assert!(matches!(session.delete("x").await, Err(SessionError::NotConnected)));
        assert!(!session.contains("x"));
    }

    #[tokio::test]
    async fn test_validation_runs_before_connection_check() {
        let (session, _) = session_with(SessionConfig::default(), Identity::new("alice", "1"));

        assert!(matches!(
            session.set("x", "12a").await,
            Err(SessionError::Validation(ValidationError::NotNumeric(_)))
        ));
        assert!(matches!(
            session.create("x", "1".repeat(257)).await,
            Err(SessionError::Validation(ValidationError::TooLong(257)))
        ));
    }

    #[test]
    fn test_get_unknown_variable() {
        let (session, _) = session_with(SessionConfig::default(), Identity::new("alice", "1"));
        match session.get("ghost") {
            Err(SessionError::NotFound(name)) => assert_eq!(name, "☁ ghost"),
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_handshake_headers() {
        let identity = Identity::new("alice", "1").with_session_id("sid");
        let mut config = SessionConfig::default();
        config.headers.insert("origin", "https://example.org");
        let (session, _) = session_with(config, identity);

        let url = WsUrl::parse("wss://clouddata.scratch.mit.edu").unwrap();
        let headers = session.inner.handshake_headers(&url).unwrap();
        assert_eq!(headers.get("Cookie"), Some("scratchsessionsid=sid;"));
        assert_eq!(headers.get("Origin"), Some("https://example.org"));

        let other = WsUrl::parse("wss://cloud.example.org").unwrap();
        let headers = session.inner.handshake_headers(&other).unwrap();
        assert_eq!(headers.get("Cookie"), None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_without_connect() {
        let (session, _) = session_with(SessionConfig::default(), Identity::new("alice", "1"));
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
