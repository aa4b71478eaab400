//! Raster helpers shared by capture, patching and compositing.

use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;

use crate::error::{PipelineError, Result};
use crate::region::Region;
use crate::transform::PixelRect;

pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    Ok(image::load_from_memory(bytes)?)
}

pub fn guess_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

pub fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    Ok(decode(bytes)?.dimensions())
}

/// Encodes `image` as `format`. Formats without an alpha channel get an RGB
/// copy first.
pub fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    match format {
        ImageFormat::Jpeg | ImageFormat::Bmp => {
            DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut cursor, format)?
        }
        _ => image.write_to(&mut cursor, format)?,
    }
    Ok(bytes)
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    encode(image, ImageFormat::Png)
}

/// Returns PNG bytes, re-encoding only when the input is another format.
pub fn ensure_png(bytes: Vec<u8>) -> Result<Vec<u8>> {
    if guess_format(&bytes) == Some(ImageFormat::Png) {
        return Ok(bytes);
    }
    encode_png(&decode(&bytes)?)
}

/// Crops the bounding box of a natural-space region out of a page raster and
/// returns it as PNG. The parts of the box outside the page are dropped.
pub fn crop_region(page_bytes: &[u8], region: &Region) -> Result<Vec<u8>> {
    region.validate()?;
    let page = decode(page_bytes)?;
    let (width, height) = page.dimensions();
    let rect = PixelRect::from_bounds(&region.bounds());
    let (x, y, w, h) = rect.clamp_to(width, height).ok_or_else(|| {
        PipelineError::Geometry(format!(
            "region {}x{} at ({}, {}) lies outside the {}x{} page",
            rect.width, rect.height, rect.x, rect.y, width, height
        ))
    })?;
    encode_png(&page.crop_imm(x, y, w, h))
}
