//! Minimum spacing between outbound mutations.
//!
//! One [`RateLimiter`] per session. [`RateLimiter::acquire`] queues on a fair
//! mutex, so waiting callers are served in the order they arrived, then
//! sleeps until the interval since the last committed send has passed. The
//! returned [`Permit`] keeps the queue blocked until it is committed or
//! dropped, so no other call can slip a packet in between the check and the
//! write.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::trace;

/// Default minimum interval between two mutations.
pub const MIN_MUTATION_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_send: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_send: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for this caller's turn and for the interval to elapse.
    ///
    /// The permit owns its place in the queue, so it can be moved into
    /// another task.
    pub async fn acquire(&self) -> Permit {
        let last_send = Arc::clone(&self.last_send).lock_owned().await;

        loop {
            let Some(last) = *last_send else { break };
            let ready_at = last + self.interval;
            if Instant::now() >= ready_at {
                break;
            }
            trace!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "Rate limited");
            tokio::time::sleep_until(ready_at).await;
        }

        Permit { last_send }
    }

    /// Record a send that bypassed [`RateLimiter::acquire`], such as the
    /// session handshake.
    pub async fn touch(&self) {
        *self.last_send.lock().await = Some(Instant::now());
    }

    /// Forget the last send time.
    pub async fn reset(&self) {
        *self.last_send.lock().await = None;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MIN_MUTATION_INTERVAL)
    }
}

/// Exclusive right to send one mutation.
///
/// Dropping the permit without committing leaves the timer unchanged.
#[must_use = "a permit only spaces sends once it is committed"]
pub struct Permit {
    last_send: OwnedMutexGuard<Option<Instant>>,
}

impl Permit {
    /// Mark the mutation as sent now.
    pub fn commit(&mut self) {
        *self.last_send = Some(Instant::now());
    }
}
