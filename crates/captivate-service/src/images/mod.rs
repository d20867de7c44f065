//! Button artwork.
//!
//! The [`ImageCache`] turns image references (URLs, files, inline data) into base64 PNG data of
//! the canonical button footprint, and [`compositor`] draws overlays on top of such images.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode, header};
use thiserror::Error;

use crate::config::ImageDownloadConfig;

pub mod compositor;

/// The user agent sent along with image downloads.
pub const USER_AGENT: &str = concat!("captivate/", env!("CARGO_PKG_VERSION"));

/// Base64 PNG data, shared between the cache and its callers.
pub type EncodedImage = Arc<str>;

/// A failure to produce or process an image. These are logged, never returned to the surface.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to download image")]
    Download(#[from] reqwest::Error),
    #[error("image download failed with status {0}")]
    Status(StatusCode),
    #[error("failed to read image file")]
    Io(#[from] std::io::Error),
    #[error("invalid base64 image data")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid data URL")]
    DataUrl,
    #[error("failed to decode image")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image")]
    Encode(#[source] image::ImageError),
    #[error("image processing task failed")]
    Internal,
}

/// Creates the HTTP client used for image downloads.
pub fn create_client(config: &ImageDownloadConfig) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.download_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// Shortens long references (inline data mostly) for log output.
fn display_reference(reference: &str) -> &str {
    match reference.char_indices().nth(64) {
        Some((end, _)) => &reference[..end],
        None => reference,
    }
}

/// Process-wide cache of normalized button images, keyed by their source reference.
///
/// Successful loads stay cached for the lifetime of the cache. Failures are not cached, the next
/// request for the same reference tries again. Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct ImageCache {
    cache: moka::sync::Cache<String, EncodedImage>,
    client: Client,
    size: u32,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl ImageCache {
    /// Creates an empty cache producing `size`×`size` images.
    pub fn new(client: Client, size: u32) -> Self {
        let cache = moka::sync::Cache::builder().name("images").build();
        Self {
            cache,
            client,
            size,
        }
    }

    /// Edge length of the square footprint every image is normalized to.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns the base64 PNG for `reference`, loading and normalizing it on first use.
    ///
    /// The reference may be an `http(s)` URL, a `data:` URL, a path to a local file, or raw base64
    /// data, tried in that order. Any failure is logged and yields `None`.
    pub async fn get_image(&self, reference: &str) -> Option<EncodedImage> {
        if let Some(image) = self.cache.get(reference) {
            metric!(counter("images.access") += 1, "hit" => "true");
            return Some(image);
        }
        metric!(counter("images.access") += 1, "hit" => "false");

        match self.load(reference).await {
            Ok(image) => {
                let image = EncodedImage::from(image);
                self.cache.insert(reference.to_owned(), Arc::clone(&image));
                Some(image)
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    reference = display_reference(reference),
                    "Failed to load image"
                );
                None
            }
        }
    }

    /// Puts already normalized base64 PNG data into the cache under `name`.
    pub fn set_image(&self, name: impl Into<String>, data: impl Into<EncodedImage>) {
        self.cache.insert(name.into(), data.into());
    }

    /// Seeds the cache with a whole set of named images.
    pub fn seed(&self, images: BTreeMap<String, String>) {
        for (name, data) in images {
            tracing::debug!(name = %name, "Caching image data");
            self.set_image(name, data);
        }
    }

    pub fn remove(&self, reference: &str) {
        self.cache.invalidate(reference);
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.cache.contains_key(reference)
    }

    /// Draws `overlay` on top of `base` on the blocking pool.
    ///
    /// See [`compositor::composite`].
    pub async fn composite(
        &self,
        base: impl Into<String>,
        overlay: EncodedImage,
    ) -> Result<String, ImageError> {
        let base = base.into();
        let size = self.size;
        tokio::task::spawn_blocking(move || compositor::composite(&base, &overlay, size))
            .await
            .map_err(|_| ImageError::Internal)?
    }

    async fn load(&self, reference: &str) -> Result<String, ImageError> {
        let bytes = self.fetch_source(reference).await?;
        let size = self.size;
        tokio::task::spawn_blocking(move || compositor::normalize(&bytes, size))
            .await
            .map_err(|_| ImageError::Internal)?
    }

    async fn fetch_source(&self, reference: &str) -> Result<Vec<u8>, ImageError> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return self.download(reference).await;
        }
        if reference.starts_with("data:") {
            return compositor::decode_inline(reference);
        }
        if tokio::fs::try_exists(reference).await.unwrap_or(false) {
            tracing::trace!(path = reference, "Reading image from disk");
            return Ok(tokio::fs::read(reference).await?);
        }
        compositor::decode_inline(reference)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ImageError> {
        tracing::debug!("Fetching image from `{}`", url);

        let response = self
            .client
            .get(url)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::Status(status));
        }

        Ok(response.bytes().await?.to_vec())
    }
}
