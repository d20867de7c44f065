//! Pure, synchronous bitmap operations.
//!
//! Everything in here is CPU bound and is expected to run on the blocking pool.

use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use data_url::DataUrl;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbaImage};

use super::ImageError;

/// Decodes inline image data, either a `data:` URL or plain base64.
pub fn decode_inline(data: &str) -> Result<Vec<u8>, ImageError> {
    let data = data.trim();
    if data.starts_with("data:") {
        let url = DataUrl::process(data).map_err(|_| ImageError::DataUrl)?;
        let (bytes, _fragment) = url.decode_to_vec().map_err(|_| ImageError::DataUrl)?;
        return Ok(bytes);
    }
    Ok(STANDARD.decode(data)?)
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    image::load_from_memory(bytes).map_err(ImageError::Decode)
}

/// Scales `image` to cover a `size`×`size` square and crops the overflow around the center.
pub fn cover(image: &DynamicImage, size: u32) -> RgbaImage {
    image
        .resize_to_fill(size, size, FilterType::Triangle)
        .to_rgba8()
}

/// A fully transparent `size`×`size` bitmap.
pub fn blank(size: u32) -> RgbaImage {
    RgbaImage::new(size, size)
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, ImageError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(ImageError::Encode)?;
    Ok(bytes)
}

pub fn encode_png_base64(image: &RgbaImage) -> Result<String, ImageError> {
    Ok(STANDARD.encode(encode_png(image)?))
}

/// Turns arbitrary image bytes into the canonical base64 PNG of the given footprint.
pub fn normalize(bytes: &[u8], size: u32) -> Result<String, ImageError> {
    let image = decode(bytes)?;
    encode_png_base64(&cover(&image, size))
}

/// Decodes one layer of a composite, substituting a blank one if that fails.
fn decode_layer(data: &str, size: u32, layer: &str) -> RgbaImage {
    match decode_inline(data).and_then(|bytes| decode(&bytes)) {
        Ok(image) => image.to_rgba8(),
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                layer,
                "Could not decode composite layer, using a blank one"
            );
            blank(size)
        }
    }
}

/// Resizes `image` to `width`, keeping its aspect ratio.
fn fit_width(image: RgbaImage, width: u32) -> RgbaImage {
    if image.width() == width || image.width() == 0 {
        return image;
    }
    let height = (u64::from(image.height()) * u64::from(width) + u64::from(image.width()) / 2)
        / u64::from(image.width());
    let height = u32::try_from(height).unwrap_or(u32::MAX).max(1);
    imageops::resize(&image, width, height, FilterType::Triangle)
}

/// Draws `overlay` on top of `base` and returns the result as base64 PNG.
///
/// The overlay is scaled to the width of the base and anchored at the top left corner. Either
/// layer may fail to decode, in which case a transparent `size`×`size` layer takes its place.
/// The output only depends on the inputs.
pub fn composite(base: &str, overlay: &str, size: u32) -> Result<String, ImageError> {
    let mut base = decode_layer(base, size, "base");
    let overlay = fit_width(decode_layer(overlay, size, "overlay"), base.width());

    imageops::overlay(&mut base, &overlay, 0, 0);
    encode_png_base64(&base)
}
