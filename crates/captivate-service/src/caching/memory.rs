use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared, TryFutureExt};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};

use super::{CacheEntry, CacheError, CacheKey, TtlStore};
use crate::utils::defer::defer;

type ComputationChannel<T> = Shared<oneshot::Receiver<CacheEntry<T>>>;
type ComputationMap<T> = Arc<Mutex<BTreeMap<CacheKey, ComputationChannel<T>>>>;

/// Who writes a successful lookup into the [`TtlStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorePolicy {
    /// The coalescer stores the value with its default TTL before releasing the key.
    Auto,
    /// The caller stores the value itself.
    Caller,
}

/// Deduplicates concurrent lookups of the same [`CacheKey`] in front of a [`TtlStore`].
///
/// Each lookup that is not served by the store runs as its own task on the current runtime, so it
/// completes even when every caller stops waiting for it.
#[derive(Clone)]
pub struct Coalescer<T> {
    store: TtlStore<T>,
    default_ttl: Duration,

    /// Used for deduplicating lookups.
    current_computations: ComputationMap<T>,
}

impl<T> std::fmt::Debug for Coalescer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("store", &self.store)
            .field("default_ttl", &self.default_ttl)
            .field("in_flight", &self.current_computations.lock().len())
            .finish()
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(store: TtlStore<T>, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            current_computations: Default::default(),
        }
    }

    pub fn store(&self) -> &TtlStore<T> {
        &self.store
    }

    /// The lifetime of values stored under [`StorePolicy::Auto`].
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// The number of lookups currently in flight.
    pub fn in_flight(&self) -> usize {
        self.current_computations.lock().len()
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.current_computations.lock().contains_key(key)
    }

    /// Returns the value for `key`, calling `fetch` only if it is neither stored nor in flight.
    ///
    /// A successful result is stored with the default TTL. Failures are handed to every waiting
    /// caller and then forgotten.
    pub fn resolve<F, Fut>(&self, key: CacheKey, fetch: F) -> BoxFuture<'static, CacheEntry<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        self.resolve_with(key, StorePolicy::Auto, fetch)
    }

    /// Like [`resolve`](Self::resolve), but leaves storing the result to the caller.
    pub fn resolve_uncached<F, Fut>(
        &self,
        key: CacheKey,
        fetch: F,
    ) -> BoxFuture<'static, CacheEntry<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        self.resolve_with(key, StorePolicy::Caller, fetch)
    }

    /// Looks up `key` in the store, joins a running lookup, or spawns a new one.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the lookup
    /// on the runtime, even if you don't explicitly `await` its result.
    pub fn resolve_with<F, Fut>(
        &self,
        key: CacheKey,
        policy: StorePolicy,
        fetch: F,
    ) -> BoxFuture<'static, CacheEntry<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        metric!(counter("caches.access") += 1);

        if let Some(value) = self.store.get(key.as_str()) {
            metric!(counter("caches.memory.hit") += 1);
            return Box::pin(future::ready(Ok(value)));
        }

        let channel = {
            let mut current_computations = self.current_computations.lock();
            if let Some(channel) = current_computations.get(&key) {
                // A concurrent lookup was deduplicated.
                metric!(counter("caches.channel.hit") += 1);
                channel.clone()
            } else if let Some(value) = self.store.get(key.as_str()) {
                // The lookup we missed above settled in the meantime.
                metric!(counter("caches.memory.hit") += 1);
                return Box::pin(future::ready(Ok(value)));
            } else {
                metric!(counter("caches.computation") += 1);
                let channel = self.create_channel(key.clone(), fetch(), policy);
                let evicted = current_computations.insert(key.clone(), channel.clone());
                debug_assert!(evicted.is_none());
                channel
            }
        };

        let future = channel.unwrap_or_else(move |_cancelled| {
            tracing::error!(%key, "Feedback lookup was dropped before completing");
            Err(CacheError::InternalError)
        });

        Box::pin(future)
    }

    /// Spawns `computation` and returns a shareable channel for its result.
    fn create_channel<F>(
        &self,
        key: CacheKey,
        computation: F,
        policy: StorePolicy,
    ) -> ComputationChannel<T>
    where
        F: Future<Output = CacheEntry<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let current_computations = Arc::clone(&self.current_computations);
        let remove_key = key.clone();
        let remove_computation_token = defer(move || {
            current_computations.lock().remove(&remove_key);
        });

        let store = self.store.clone();
        let ttl = self.default_ttl;

        tracing::trace!(%key, "Spawning coalesced feedback lookup");

        let channel = async move {
            let start_time = Instant::now();
            let result = computation.await;
            metric!(timer("caches.computation.duration") = start_time.elapsed());
            if let (StorePolicy::Auto, Ok(value)) = (policy, &result) {
                store.store(key, value.clone(), ttl);
            }
            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or find the stored value.
            drop(remove_computation_token);
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(channel);

        receiver.shared()
    }
}
