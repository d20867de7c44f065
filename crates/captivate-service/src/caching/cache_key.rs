use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// The options a feedback was configured with, in the order they were presented.
pub type OptionSet = Map<String, Value>;

const ID_SEPARATOR: char = '~';
const HASH_SEPARATOR: char = '+';

/// Number of leading SHA-256 bytes that make it into a [`CacheKey`].
const HASH_BYTES: usize = 16;

/// Identifies one feedback type of one actor, formatted as `<actorId>~<feedbackId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalId(Arc<str>);

impl LogicalId {
    /// Joins an actor and feedback id. If either one is empty, the other one is used alone.
    pub fn new(actor_id: &str, feedback_id: &str) -> Self {
        let id = match (actor_id.is_empty(), feedback_id.is_empty()) {
            (false, false) => format!("{actor_id}{ID_SEPARATOR}{feedback_id}"),
            (true, _) => feedback_id.to_owned(),
            (false, true) => actor_id.to_owned(),
        };
        Self(id.into())
    }

    /// Wraps an already joined id.
    pub fn from_full_id(full_id: &str) -> Self {
        Self(full_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the id at the first `~` into `(actorId, feedbackId)`.
    ///
    /// An id without separator is all actor, with an empty feedback id.
    pub fn split(&self) -> (&str, &str) {
        self.0
            .split_once(ID_SEPARATOR)
            .unwrap_or((self.as_str(), ""))
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The key under which a resolved feedback state is cached.
///
/// Equality and hashing are those of the underlying string, so a key can be looked up by `&str`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

/// Derives the [`CacheKey`] for a feedback and its options.
///
/// Without options, the key is the logical id itself. Otherwise the compact JSON of the options
/// is hashed and appended as `<logicalId>+<hash>`. The hash depends on the order of the options,
/// so the same set presented in a different order yields a different key.
pub fn derive_key(logical_id: &LogicalId, options: &OptionSet) -> CacheKey {
    if options.is_empty() {
        return CacheKey(Arc::clone(&logical_id.0));
    }

    let mut hasher = Sha256::new();
    serde_json::to_writer(&mut hasher, options).expect("writing JSON into a hasher cannot fail");
    let hash = hasher.finalize();

    let key = format!(
        "{logical_id}{HASH_SEPARATOR}{}",
        hex::encode(&hash[..HASH_BYTES])
    );
    CacheKey(key.into())
}
