use image::imageops::{self, FilterType};
use image::{GenericImageView, ImageFormat};
use tracing::{debug, warn};

use super::{CollaboratorFuture, CompositeRequest, Compositor};
use crate::capture::{decode, encode, guess_format};
use crate::error::{PipelineError, Result};

/// In-process compositor with the backend's merge behavior: each overlay is
/// optionally resized to its placement size, alpha blended at `(x, y)`, and
/// the result is encoded in the base image's format. Overlays that do not
/// fit entirely inside the base image are skipped, not clipped.
#[derive(Debug, Clone, Default)]
pub struct LocalCompositor;

impl LocalCompositor {
    pub fn new() -> Self {
        Self
    }
}

impl Compositor for LocalCompositor {
    fn composite(&self, request: CompositeRequest) -> CollaboratorFuture<Vec<u8>> {
        Box::pin(async move {
            tokio::task::spawn_blocking(move || composite_blocking(request))
                .await
                .map_err(|err| PipelineError::unavailable("compositor", err))?
        })
    }
}

fn composite_blocking(request: CompositeRequest) -> Result<Vec<u8>> {
    let format = guess_format(&request.base_image).unwrap_or(ImageFormat::Png);
    let base = decode(&request.base_image)?;
    let (width, height) = base.dimensions();
    let mut canvas = base.to_rgba8();

    let mut applied = 0usize;
    for (index, overlay) in request.overlays.iter().enumerate() {
        let mut patch = decode(&overlay.image)?.to_rgba8();
        if let (Some(w), Some(h)) = (overlay.width, overlay.height)
            && w > 0
            && h > 0
            && (w, h) != patch.dimensions()
        {
            patch = imageops::resize(&patch, w, h, FilterType::Lanczos3);
        }
        let (patch_w, patch_h) = patch.dimensions();
        if overlay.x < 0
            || overlay.y < 0
            || overlay.x + patch_w as i64 > width as i64
            || overlay.y + patch_h as i64 > height as i64
        {
            warn!(
                "compositor: skipping {}x{} patch {} at ({}, {}) outside {}x{} page",
                patch_w, patch_h, index, overlay.x, overlay.y, width, height
            );
            continue;
        }
        imageops::overlay(&mut canvas, &patch, overlay.x, overlay.y);
        applied += 1;
    }
    debug!(
        "compositor: applied {}/{} patches",
        applied,
        request.overlays.len()
    );

    encode(&image::DynamicImage::ImageRgba8(canvas), format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::PatchOverlay;
    use crate::test_util::{pixel_at, solid_png};

    #[tokio::test]
    async fn patch_is_blended_at_its_placement() {
        let request = CompositeRequest {
            base_image: solid_png(100, 100, [255, 255, 255, 255]),
            overlays: vec![PatchOverlay {
                image: solid_png(10, 10, [255, 0, 0, 255]),
                x: 50,
                y: 50,
                width: Some(20),
                height: Some(10),
            }],
        };
        let merged = LocalCompositor::new().composite(request).await.expect("merge");
        assert_eq!(pixel_at(&merged, 50, 50), [255, 0, 0, 255]);
        assert_eq!(pixel_at(&merged, 69, 59), [255, 0, 0, 255]);
        assert_eq!(pixel_at(&merged, 70, 50), [255, 255, 255, 255]);
        assert_eq!(pixel_at(&merged, 49, 50), [255, 255, 255, 255]);
    }

    #[tokio::test]
    async fn transparent_pixels_keep_page_art() {
        let request = CompositeRequest {
            base_image: solid_png(20, 20, [0, 0, 255, 255]),
            overlays: vec![PatchOverlay {
                image: solid_png(10, 10, [255, 0, 0, 0]),
                x: 0,
                y: 0,
                width: None,
                height: None,
            }],
        };
        let merged = LocalCompositor::new().composite(request).await.expect("merge");
        assert_eq!(pixel_at(&merged, 5, 5), [0, 0, 255, 255]);
    }

    #[tokio::test]
    async fn out_of_bounds_patch_is_skipped() {
        let base = solid_png(20, 20, [0, 0, 0, 255]);
        let request = CompositeRequest {
            base_image: base.clone(),
            overlays: vec![PatchOverlay {
                image: solid_png(5, 5, [255, 255, 255, 255]),
                x: 25,
                y: 0,
                width: None,
                height: None,
            }],
        };
        let merged = LocalCompositor::new().composite(request).await.expect("merge");
        assert_eq!(pixel_at(&merged, 19, 0), [0, 0, 0, 255]);
    }

    #[tokio::test]
    async fn patch_overhanging_the_edge_is_skipped_not_clipped() {
        let request = CompositeRequest {
            base_image: solid_png(20, 20, [0, 0, 0, 255]),
            overlays: vec![
                PatchOverlay {
                    image: solid_png(5, 5, [255, 255, 255, 255]),
                    x: 18,
                    y: 0,
                    width: None,
                    height: None,
                },
                PatchOverlay {
                    image: solid_png(2, 2, [255, 0, 0, 255]),
                    x: 0,
                    y: 10,
                    width: Some(10),
                    height: Some(11),
                },
                PatchOverlay {
                    image: solid_png(5, 5, [0, 255, 0, 255]),
                    x: 15,
                    y: 15,
                    width: None,
                    height: None,
                },
            ],
        };
        let merged = LocalCompositor::new().composite(request).await.expect("merge");
        assert_eq!(pixel_at(&merged, 19, 0), [0, 0, 0, 255]);
        assert_eq!(pixel_at(&merged, 0, 10), [0, 0, 0, 255]);
        assert_eq!(pixel_at(&merged, 19, 19), [0, 255, 0, 255]);
    }

    #[tokio::test]
    async fn undecodable_patch_fails_the_merge() {
        let request = CompositeRequest {
            base_image: solid_png(20, 20, [0, 0, 0, 255]),
            overlays: vec![PatchOverlay {
                image: b"not an image".to_vec(),
                x: 0,
                y: 0,
                width: None,
                height: None,
            }],
        };
        assert!(LocalCompositor::new().composite(request).await.is_err());
    }
}
