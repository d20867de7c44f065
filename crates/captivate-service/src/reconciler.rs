//! Retries of keys the control surface asked for but could not get.
//!
//! A key ends up pending when its lookup failed, or when the remote application announced a
//! change without sending the new state along. A reconciliation pass looks all of them up again
//! at once and tells the listeners which ones now have a value, so the surface can re-poll them.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::caching::{CacheEntry, CacheKey, Coalescer, LogicalId, OptionSet};
use crate::utils::defer::defer;

/// A key waiting to be looked up again, with everything needed to query it.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingKey {
    pub key: CacheKey,
    pub logical_id: LogicalId,
    pub options: OptionSet,
}

/// Called with the keys that a reconciliation pass resolved.
pub type ResolvedListener = Arc<dyn Fn(&[CacheKey]) + Send + Sync>;

pub struct MissReconciler<T> {
    coalescer: Coalescer<T>,
    pending: Mutex<IndexMap<CacheKey, PendingKey>>,
    running: AtomicBool,
    listeners: Mutex<Vec<ResolvedListener>>,
}

impl<T> std::fmt::Debug for MissReconciler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissReconciler")
            .field("pending", &self.pending.lock().len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> MissReconciler<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(coalescer: Coalescer<T>) -> Self {
        Self {
            coalescer,
            pending: Default::default(),
            running: AtomicBool::new(false),
            listeners: Default::default(),
        }
    }

    /// Remembers `pending` for the next pass. Marking a key twice keeps its first position.
    pub fn mark_pending(&self, pending: PendingKey) {
        tracing::trace!(key = %pending.key, "Marking key as pending");
        self.pending
            .lock()
            .entry(pending.key.clone())
            .or_insert(pending);
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Registers a listener for the keys resolved by each pass.
    pub fn on_resolved(&self, listener: ResolvedListener) {
        self.listeners.lock().push(listener);
    }

    /// Calls every listener with `keys`.
    pub fn notify(&self, keys: &[CacheKey]) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(keys);
        }
    }

    /// Looks up all pending keys concurrently, using `fetch` for the ones that are neither stored
    /// nor already in flight.
    ///
    /// Successes are stored with the default TTL as they settle, and announced to the listeners in
    /// one batch at the end. Failures are dropped, a key only becomes pending again if it is
    /// marked again. If another pass is still running, this returns right away without doing
    /// anything.
    pub async fn reconcile<F, Fut>(&self, fetch: F) -> Vec<CacheKey>
    where
        F: Fn(&PendingKey) -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("Reconciliation pass already running");
            return Vec::new();
        }
        let _running = defer(|| self.running.store(false, Ordering::Release));

        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return Vec::new();
        }
        metric!(gauge("reconciler.pending") = pending.len() as u64);
        tracing::debug!(keys = pending.len(), "Reconciling pending keys");

        let store = self.coalescer.store();
        let ttl = self.coalescer.default_ttl();
        // Stored as each lookup settles, not when the whole pass is done.
        let lookups = pending.into_values().map(|entry| {
            let lookup = self
                .coalescer
                .resolve_uncached(entry.key.clone(), || fetch(&entry));
            async move {
                let result = lookup.await;
                if let Ok(value) = &result {
                    store.store(entry.key.clone(), value.clone(), ttl);
                }
                (entry, result)
            }
        });
        let results = future::join_all(lookups).await;

        let mut resolved = Vec::new();
        for (entry, result) in results {
            match result {
                Ok(_) => resolved.push(entry.key),
                Err(err) => {
                    metric!(counter("reconciler.dropped") += 1, "error" => err.metrics_tag());
                    tracing::debug!(
                        key = %entry.key,
                        error = &err as &dyn std::error::Error,
                        "Dropping unresolved key"
                    );
                }
            }
        }

        if !resolved.is_empty() {
            self.notify(&resolved);
        }
        resolved
    }
}
