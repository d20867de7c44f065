//! Feedback state caching for a Companion-style control surface.
//!
//! The remote application answers state queries slowly, while the control surface repaints its
//! buttons many times per second. Everything in this crate exists to keep those two sides apart:
//! short-lived [`caching`] of resolved states, coalescing of concurrent lookups, an [`images`]
//! cache for button artwork, and [`scheduler`]-driven retries of keys that could not be resolved.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod feedback;
pub mod images;
pub mod logging;
pub mod reconciler;
pub mod remote;
pub mod scheduler;
pub mod utils;
