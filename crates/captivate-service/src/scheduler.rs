//! Keyed, cancellable delays and a leading-edge throttle.
//!
//! Bursts of notifications from the remote application are turned into a single unit of work
//! with [`Scheduler::schedule`]: every call re-arms the timer of its key, so only the last call of
//! a burst ever runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct ScheduledEntry {
    handle: JoinHandle<()>,
    token: u64,
}

#[derive(Default)]
struct SchedulerState {
    scheduled: HashMap<String, ScheduledEntry>,
    seq: u64,
}

/// Runs actions after a delay, with at most one pending action per key.
///
/// Cloning yields another handle to the same set of pending actions.
#[derive(Clone, Default)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.state.lock().scheduled.len())
            .finish()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `action` once `delay` has passed, unless `key` is scheduled again or cancelled first.
    ///
    /// A pending action under the same key is cancelled. An action that already started running
    /// is not affected.
    pub fn schedule<F, Fut>(&self, key: impl Into<String>, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut state = self.state.lock();

        if let Some(existing) = state.scheduled.remove(&key) {
            existing.handle.abort();
            tracing::trace!(key = %key, "Re-armed scheduled action");
        }
        state.seq = state.seq.wrapping_add(1);
        let token = state.seq;

        let shared = Arc::clone(&self.state);
        let fire_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                // An aborted timer may already be past its sleep, only the latest one may fire.
                let mut state = shared.lock();
                match state.scheduled.get(&fire_key) {
                    Some(entry) if entry.token == token => {
                        state.scheduled.remove(&fire_key);
                    }
                    _ => return,
                }
            }

            tracing::trace!(key = %fire_key, "Running scheduled action");
            action().await;
        });

        state.scheduled.insert(key, ScheduledEntry { handle, token });
    }

    /// Cancels the pending action under `key`. No-op if there is none.
    pub fn cancel(&self, key: &str) {
        if let Some(entry) = self.state.lock().scheduled.remove(key) {
            entry.handle.abort();
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.state.lock().scheduled.contains_key(key)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    /// Cancels every pending action.
    pub fn cancel_all(&self) {
        let scheduled = std::mem::take(&mut self.state.lock().scheduled);
        for (key, entry) in scheduled {
            tracing::trace!(key = %key, "Cancelled scheduled action");
            entry.handle.abort();
        }
    }
}

/// Drops repeated notifications for the same key that arrive within a fixed window.
///
/// The first notification of a key is always admitted and opens the window. Windows are measured
/// on the tokio clock.
#[derive(Debug)]
pub struct ChangeThrottle {
    window: Duration,
    recent: Mutex<HashMap<String, Instant>>,
}

impl ChangeThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: Default::default(),
        }
    }

    /// Whether a notification for `key` should be handled right now.
    pub fn admit(&self, key: &str) -> bool {
        if self.window.is_zero() {
            return true;
        }

        let now = Instant::now();
        let mut recent = self.recent.lock();
        recent.retain(|_, admitted| now.duration_since(*admitted) < self.window);

        if recent.contains_key(key) {
            return false;
        }
        recent.insert(key.to_owned(), now);
        true
    }
}
