//! Feedback states as the control surface sees them.
//!
//! The remote application answers state queries with loosely structured [`StateRecord`]s.
//! A [`StateTransformer`] resolves the images those records refer to and reduces them to a
//! [`DisplayPayload`], and a [`FeedbackSession`] ties the transformation to the caches, the
//! change notifications and the background reconciliation of one connection.
//!
//! [`StateRecord`]: crate::remote::StateRecord

mod payload;
mod session;
mod transform;

pub use payload::{DisplayPayload, is_truthy};
pub use session::FeedbackSession;
pub use transform::{StateTransformer, select_overlay_variant};
