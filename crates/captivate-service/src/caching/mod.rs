//! # Feedback caching
//!
//! The control surface asks for the state of every visible button many times per second, while
//! each answer from the remote application is a slow round-trip. This module keeps the two apart.
//!
//! ## Layers
//!
//! - A [`TtlStore`] holding resolved values for a short time (250ms by default), so repaint bursts
//!   are served locally. Expiry is checked lazily on read.
//! - A [`Coalescer`] in front of it, which makes sure that concurrent lookups of the same
//!   [`CacheKey`] share one single remote query instead of issuing one each.
//!
//! A lookup goes through the following steps:
//! - A fresh entry in the store is returned right away.
//! - Otherwise, if a query for the same key is already running, the caller joins it.
//! - Otherwise, a new query is spawned and registered. Once it settles successfully, its value is
//!   written to the store *before* the registration is removed, so a caller arriving in between
//!   either joins the query or finds the stored value.
//!
//! Failures are never cached. The next lookup of a failed key simply tries again.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the store.
//! - `caches.channel.hit`: Accesses that joined a query already in flight.
//! - `caches.computation`: Remote queries actually started.

mod cache_error;
mod cache_key;
mod memory;
mod store;

pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, LogicalId, OptionSet, derive_key};
pub use memory::{Coalescer, StorePolicy};
pub use store::{StoredEntry, TtlStore};
