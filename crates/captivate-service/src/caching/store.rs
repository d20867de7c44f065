use std::time::{Duration, Instant};

use super::CacheKey;

type InMemoryCache<T> = moka::sync::Cache<CacheKey, StoredEntry<T>>;

/// A value together with the time it was stored and how long it stays fresh.
#[derive(Debug, Clone)]
pub struct StoredEntry<T> {
    pub value: T,
    pub stored_at: Instant,
    /// A zero `max_age` never expires.
    pub max_age: Duration,
}

impl<T> StoredEntry<T> {
    pub fn new(value: T, max_age: Duration) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            max_age,
        }
    }

    /// Whether this entry is older than its `max_age` at the given instant.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        !self.max_age.is_zero() && now.saturating_duration_since(self.stored_at) > self.max_age
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

/// A [`moka::Expiry`] that lets moka reclaim entries once their own `max_age` has passed.
///
/// moka expires at the deadline itself, whereas [`StoredEntry::is_expired_at`] only considers an
/// entry expired strictly after it. Reads check the predicate again, so both agree.
struct EntryExpiration;

fn time_to_live(current_time: Instant, stored_at: Instant, max_age: Duration) -> Option<Duration> {
    if max_age.is_zero() {
        return None;
    }
    let deadline = stored_at + max_age;
    Some(
        deadline
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl<T> moka::Expiry<CacheKey, StoredEntry<T>> for EntryExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &StoredEntry<T>,
        current_time: Instant,
    ) -> Option<Duration> {
        time_to_live(current_time, value.stored_at, value.max_age)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &StoredEntry<T>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        time_to_live(current_time, value.stored_at, value.max_age)
    }
}

/// Short-lived storage of resolved values, keyed by [`CacheKey`].
///
/// There is no capacity bound. Entries leave the store when they expire, are replaced, or are
/// removed explicitly. Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct TtlStore<T> {
    cache: InMemoryCache<T>,
}

impl<T> std::fmt::Debug for TtlStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlStore").finish_non_exhaustive()
    }
}

impl<T> Default for TtlStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TtlStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let cache = InMemoryCache::builder()
            .name("feedback")
            .expire_after(EntryExpiration)
            .build();
        Self { cache }
    }

    /// Stores `value` under `key`, replacing any previous entry and restarting its lifetime.
    pub fn store(&self, key: CacheKey, value: T, max_age: Duration) {
        tracing::trace!(%key, ?max_age, "Storing cache entry");
        self.cache.insert(key, StoredEntry::new(value, max_age));
    }

    /// Returns the value stored under `key`, unless it has expired.
    ///
    /// Reads never remove anything. Expired entries are reclaimed by moka's expiry policy, so a
    /// concurrent [`store`](Self::store) of the same key cannot be lost.
    pub fn get(&self, key: &str) -> Option<T> {
        self.cache
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value)
    }

    /// Whether a fresh entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    /// Removes every entry whose key starts with `prefix`, returning how many were removed.
    ///
    /// This is how all option variants of one feedback type are dropped at once.
    pub fn remove_by_prefix(&self, prefix: &str) -> usize {
        let doomed: Vec<_> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();

        for key in &doomed {
            self.cache.invalidate(key.as_str());
        }
        tracing::debug!(prefix, removed = doomed.len(), "Removed cache entries by prefix");
        doomed.len()
    }

    /// All keys with a fresh entry, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let now = Instant::now();
        let mut keys: Vec<_> = self
            .cache
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, _)| CacheKey::clone(&key))
            .collect();
        keys.sort();
        keys
    }

    /// The number of fresh entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.cache
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
