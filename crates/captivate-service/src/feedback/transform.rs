use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::DisplayPayload;
use crate::images::ImageCache;
use crate::remote::{LayerState, PlayState, Remote, StateRecord};

const OVERLAY_QUERY_KEY: &str = "overlayQueryKey";
const OVERLAY_IMAGE_NAME: &str = "overlayImageName";
const OVERLAY_RUNNING: &str = "overlayImageName_running";
const OVERLAY_PAUSED: &str = "overlayImageName_paused";
const IMAGE_NAME: &str = "imageName";
const PNG64: &str = "png64";

/// Fallbacks for a missing `png64`, in order of preference.
const IMAGE_REFERENCES: [&str; 3] = ["imageName", "imageUrl", "imagePath"];

/// Returns the field as a string if it is truthy.
///
/// Non-string values are stringified, so a numeric image name still works.
fn truthy_str(record: &StateRecord, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        value if super::payload::is_truthy(value) => Some(value.to_string()),
        _ => None,
    }
}

/// Picks the overlay variant matching `play_state`.
///
/// The variant fields and the query key are removed in any case. Without a matching variant, an
/// existing `overlayImageName` stays as it is.
pub fn select_overlay_variant(record: &mut StateRecord, play_state: PlayState) {
    let running = record.remove(OVERLAY_RUNNING);
    let paused = record.remove(OVERLAY_PAUSED);
    record.remove(OVERLAY_QUERY_KEY);

    let selected = match play_state {
        PlayState::Running => running,
        PlayState::Paused => paused,
        PlayState::Unknown => None,
    };
    if let Some(name) = selected {
        record.insert(OVERLAY_IMAGE_NAME.to_owned(), name);
    }
}

/// Turns raw state records into [`DisplayPayload`]s, resolving the images they refer to.
#[derive(Clone)]
pub struct StateTransformer {
    remote: Arc<dyn Remote>,
    images: ImageCache,
    play_state_namespace: String,
}

impl std::fmt::Debug for StateTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTransformer")
            .field("images", &self.images)
            .field("play_state_namespace", &self.play_state_namespace)
            .finish_non_exhaustive()
    }
}

impl StateTransformer {
    pub fn new(
        remote: Arc<dyn Remote>,
        images: ImageCache,
        play_state_namespace: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            images,
            play_state_namespace: play_state_namespace.into(),
        }
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    /// Applies play state selection, overlay compositing and the field whitelist to `record`.
    pub async fn transform(&self, mut record: StateRecord) -> DisplayPayload {
        if record.contains_key(OVERLAY_QUERY_KEY) {
            let play_state = self.play_state_for(&record).await;
            select_overlay_variant(&mut record, play_state);
        }

        self.apply_overlay_image(&mut record).await;
        self.adapt(record).await
    }

    async fn play_state_for(&self, record: &StateRecord) -> PlayState {
        let play_states: HashMap<String, LayerState> =
            match self.remote.get_play_states(&self.play_state_namespace).await {
                Ok(play_states) => play_states,
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        namespace = %self.play_state_namespace,
                        "Failed to query layer play states"
                    );
                    return PlayState::Unknown;
                }
            };

        record
            .get(OVERLAY_QUERY_KEY)
            .and_then(Value::as_str)
            .and_then(|layer| play_states.get(layer))
            .map(|state| state.play_state)
            .unwrap_or_default()
    }

    /// Resolves `overlayImageName` or `imageName` into `png64`.
    async fn apply_overlay_image(&self, record: &mut StateRecord) {
        if let Some(name) = truthy_str(record, OVERLAY_IMAGE_NAME) {
            record.remove(OVERLAY_IMAGE_NAME);

            let Some(layer) = self.images.get_image(&name).await else {
                tracing::debug!(image = %name, "Overlay image is not available");
                return;
            };

            let base = record.get(PNG64).and_then(Value::as_str).map(str::to_owned);
            let png64 = match base {
                Some(base) => match self.images.composite(base, layer).await {
                    Ok(composite) => composite,
                    Err(err) => {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            image = %name,
                            "Failed to composite overlay image"
                        );
                        return;
                    }
                },
                None => layer.to_string(),
            };
            record.insert(PNG64.to_owned(), Value::String(png64));
        } else if let Some(name) = truthy_str(record, IMAGE_NAME) {
            record.remove(IMAGE_NAME);
            if let Some(image) = self.images.get_image(&name).await {
                record.insert(PNG64.to_owned(), Value::String(image.to_string()));
            }
        }
    }

    /// Copies the whitelisted fields and fills in a missing bitmap from the image fallbacks.
    async fn adapt(&self, record: StateRecord) -> DisplayPayload {
        let mut payload = DisplayPayload::from_record(&record);

        if !payload.has_png() {
            if let Some(image64) = truthy_str(&record, "image64") {
                payload.png64 = Some(image64);
            }
        }

        if !payload.has_png() {
            let reference = IMAGE_REFERENCES
                .iter()
                .find_map(|key| truthy_str(&record, key));
            if let Some(reference) = reference {
                if let Some(image) = self.images.get_image(&reference).await {
                    payload.png64 = Some(image.to_string());
                }
            }
        }

        payload
    }
}
