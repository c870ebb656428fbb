//! Named-event subscription registry.
//!
//! Handlers are kept per event key in registration order. Synchronous
//! handlers run inline during [`EventEmitter::emit`]; asynchronous handlers
//! are spawned onto the current tokio runtime and not awaited.

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

type SyncFn<A> = dyn Fn(&A) + Send + Sync;
type AsyncFn<A> = dyn Fn(A) -> BoxFuture<'static, ()> + Send + Sync;

/// An event handler.
///
/// Clones share identity, so a clone can be passed to [`EventEmitter::off`]
/// to remove the original.
pub enum Handler<A> {
    /// Runs to completion before the next handler is invoked.
    Sync(Arc<SyncFn<A>>),
    /// Spawned as a task; emission does not wait for it.
    Async(Arc<AsyncFn<A>>),
}

impl<A> Handler<A> {
    /// Wrap a synchronous closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    /// Wrap a closure returning a future.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Handler::Async(Arc::new(move |arg| -> BoxFuture<'static, ()> { Box::pin(f(arg)) }))
    }

    /// True if both refer to the same registered closure.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Handler::Sync(a), Handler::Sync(b)) => Arc::ptr_eq(a, b),
            (Handler::Async(a), Handler::Async(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<A> Clone for Handler<A> {
    fn clone(&self) -> Self {
        match self {
            Handler::Sync(f) => Handler::Sync(Arc::clone(f)),
            Handler::Async(f) => Handler::Async(Arc::clone(f)),
        }
    }
}

impl<A> fmt::Debug for Handler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Token returned by registration, used to remove exactly that registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription<K> {
    key: K,
    id: u64,
}

impl<K> Subscription<K> {
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }
}

struct Registration<A> {
    id: u64,
    handler: Handler<A>,
    once: bool,
}

/// Publish/subscribe registry keyed by event name.
pub struct EventEmitter<K, A> {
    handlers: DashMap<K, Vec<Registration<A>>>,
    next_id: AtomicU64,
}

impl<K, A> EventEmitter<K, A>
where
    K: Eq + Hash + Clone + fmt::Debug,
    A: Clone + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a handler for every emission of `key`.
    pub fn on(&self, key: K, handler: Handler<A>) -> Subscription<K> {
        self.register(key, handler, false)
    }

    /// Register a handler that is removed after its first invocation.
    pub fn once(&self, key: K, handler: Handler<A>) -> Subscription<K> {
        self.register(key, handler, true)
    }

    fn register(&self, key: K, handler: Handler<A>, once: bool) -> Subscription<K> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(event = ?key, id, once, "Handler registered");
        self.handlers.entry(key.clone()).or_default().push(Registration {
            id,
            handler,
            once,
        });
        Subscription { key, id }
    }

    /// Remove every registration of `handler` under `key`.
    ///
    /// Returns the number of registrations removed.
    pub fn off(&self, key: &K, handler: &Handler<A>) -> usize {
        let Some(mut entry) = self.handlers.get_mut(key) else {
            return 0;
        };
        let before = entry.len();
        entry.retain(|r| !r.handler.same(handler));
        before - entry.len()
    }

    /// Remove the registration behind `subscription`.
    ///
    /// Returns `false` if it was already removed.
    pub fn unsubscribe(&self, subscription: &Subscription<K>) -> bool {
        let Some(mut entry) = self.handlers.get_mut(&subscription.key) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|r| r.id != subscription.id);
        before != entry.len()
    }

    /// Invoke every handler registered for `key`, in registration order.
    ///
    /// Returns the number of handlers invoked. Events with no handlers are
    /// dropped.
    pub fn emit(&self, key: &K, arg: A) -> usize {
        // Snapshot, then release the shard lock so handlers may register or
        // remove handlers themselves.
        let handlers: Vec<Handler<A>> = match self.handlers.get_mut(key) {
            Some(mut entry) => {
                let snapshot = entry.iter().map(|r| r.handler.clone()).collect();
                entry.retain(|r| !r.once);
                snapshot
            }
            None => Vec::new(),
        };

        trace!(event = ?key, handlers = handlers.len(), "Emitting");

        for handler in &handlers {
            match handler {
                Handler::Sync(f) => f(&arg),
                Handler::Async(f) => match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(f(arg.clone()));
                    }
                    Err(_) => warn!(event = ?key, "No tokio runtime, async handler skipped"),
                },
            }
        }

        handlers.len()
    }

    /// Number of handlers registered for `key`.
    #[must_use]
    pub fn listener_count(&self, key: &K) -> usize {
        self.handlers.get(key).map(|e| e.len()).unwrap_or(0)
    }

    /// Remove all handlers for all keys.
    pub fn clear(&self) {
        self.handlers.clear();
    }
}

impl<K, A> Default for EventEmitter<K, A>
where
    K: Eq + Hash + Clone + fmt::Debug,
    A: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, A> fmt::Debug for EventEmitter<K, A>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("keys", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Handler<u32>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let make = move |tag: &str| {
            let log = Arc::clone(&log2);
            let tag = tag.to_string();
            Handler::sync(move |n: &u32| log.lock().unwrap().push(format!("{tag}:{n}")))
        };
        (log, make)
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let emitter = EventEmitter::<&str, u32>::new();
        let (log, make) = recorder();

        emitter.on("change", make("a"));
        emitter.on("change", make("b"));
        emitter.on("other", make("x"));

        assert_eq!(emitter.emit(&"change", 1), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_emit_without_handlers() {
        let emitter = EventEmitter::<&str, u32>::new();
        assert_eq!(emitter.emit(&"nobody", 1), 0);
    }

    #[test]
    fn test_once_handler_fires_once() {
        let emitter = EventEmitter::<&str, u32>::new();
        let (log, make) = recorder();

        emitter.once("connect", make("once"));
        emitter.on("connect", make("always"));

        emitter.emit(&"connect", 1);
        emitter.emit(&"connect", 2);

        assert_eq!(*log.lock().unwrap(), vec!["once:1", "always:1", "always:2"]);
        assert_eq!(emitter.listener_count(&"connect"), 1);
    }

    #[test]
    fn test_off_removes_every_registration_of_handler() {
        let emitter = EventEmitter::<&str, u32>::new();
        let (log, make) = recorder();

        let handler = make("dup");
        emitter.on("set", handler.clone());
        emitter.on("set", make("keep"));
        emitter.on("set", handler.clone());

        assert_eq!(emitter.off(&"set", &handler), 2);
        emitter.emit(&"set", 5);
        assert_eq!(*log.lock().unwrap(), vec!["keep:5"]);

        assert_eq!(emitter.off(&"missing", &handler), 0);
    }

    #[test]
    fn test_unsubscribe_by_token() {
        let emitter = EventEmitter::<&str, u32>::new();
        let (log, make) = recorder();

        let handler = make("h");
        let first = emitter.on("set", handler.clone());
        emitter.on("set", handler);

        assert!(emitter.unsubscribe(&first));
        assert!(!emitter.unsubscribe(&first));
        assert_eq!(first.key(), &"set");

        emitter.emit(&"set", 3);
        assert_eq!(*log.lock().unwrap(), vec!["h:3"]);
    }

    #[test]
    fn test_handler_may_register_during_emit() {
        let emitter = Arc::new(EventEmitter::<&str, u32>::new());
        let inner = Arc::clone(&emitter);

        emitter.on(
            "connect",
            Handler::sync(move |_| {
                inner.on("change", Handler::sync(|_| {}));
            }),
        );

        emitter.emit(&"connect", 0);
        assert_eq!(emitter.listener_count(&"change"), 1);
    }

    #[tokio::test]
    async fn test_async_handler_is_spawned() {
        let emitter = EventEmitter::<&str, u32>::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        emitter.on(
            "change",
            Handler::future(move |n: u32| {
                let tx = tx.clone();
                async move {
                    tokio::task::yield_now().await;
                    tx.send(n).unwrap();
                }
            }),
        );

        assert_eq!(emitter.emit(&"change", 9), 1);
        assert_eq!(rx.recv().await, Some(9));
    }

    #[test]
    fn test_handler_identity() {
        let a = Handler::<u32>::sync(|_| {});
        let b = Handler::<u32>::sync(|_| {});
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }
}
