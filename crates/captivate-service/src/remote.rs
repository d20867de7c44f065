//! The interface to the remote titling application.
//!
//! The transport itself lives outside of this crate. Anything that can answer the three queries
//! of [`Remote`] can back a [`FeedbackSession`](crate::feedback::FeedbackSession).

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::caching::{LogicalId, OptionSet};

/// The raw JSON object the remote application returns for one feedback.
pub type StateRecord = Map<String, Value>;

/// A failed request to the remote application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote application disconnected")]
    Disconnected,
}

/// Whether an overlay layer is currently playing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    Running,
    Paused,
    /// Missing or not one of the known states.
    #[default]
    #[serde(other)]
    Unknown,
}

/// The entry of one layer in the play state namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerState {
    #[serde(default)]
    pub play_state: PlayState,
}

/// A pushed notification that the state of one feedback changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedbackChange {
    pub actor_id: String,
    pub feedback_id: String,
    pub options: OptionSet,
    /// The new state, if the remote application sent one along.
    pub state: Option<StateRecord>,
}

impl FeedbackChange {
    pub fn logical_id(&self) -> LogicalId {
        LogicalId::new(&self.actor_id, &self.feedback_id)
    }
}

#[async_trait]
pub trait Remote: Send + Sync {
    /// Queries the current state of one feedback.
    ///
    /// Returns the raw JSON text of a [`StateRecord`]. An empty string stands for an empty record.
    async fn query_feedback_state(
        &self,
        actor_id: &str,
        feedback_id: &str,
        options: &OptionSet,
    ) -> Result<String, RemoteError>;

    /// Reads the play state of every overlay layer from a key-value namespace.
    async fn get_play_states(
        &self,
        namespace: &str,
    ) -> Result<HashMap<String, LayerState>, RemoteError>;

    /// Fetches a named set of images as base64 PNG data, keyed by image name.
    async fn get_image_set(&self, group: &str) -> Result<BTreeMap<String, String>, RemoteError>;
}
