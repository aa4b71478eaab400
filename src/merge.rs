//! Bakes every patch of a page into its raster in one compositing pass.
//!
//! The page file is the only thing written before the captions are retired.
//! Anything failing up to and including that write leaves the page, its
//! captions and its patch files exactly as they were.

use serde::Serialize;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::caption::CaptionStore;
use crate::capture::{decode, encode, guess_format};
use crate::collaborators::{CompositeRequest, Compositor, PatchOverlay};
use crate::error::{PipelineError, Result};
use crate::paths::{PageLayout, lock_exclusive, write_atomic};
use crate::transform::PixelRect;

/// Per-page advisory lock files under one directory. They serialize merges
/// of a page across tasks and across processes sharing the data directory.
#[derive(Debug, Clone)]
pub struct PageLocks {
    dir: PathBuf,
}

/// Releases its page when dropped.
#[derive(Debug)]
pub struct PageGuard {
    _file: File,
}

impl PageLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn lock(&self, page_id: u64) -> Result<PageGuard> {
        let path = self.dir.join(format!("page-{}.lock", page_id));
        debug!("merge: waiting for {}", path.display());
        let file = tokio::task::spawn_blocking(move || lock_exclusive(&path))
            .await
            .map_err(|err| PipelineError::Store(format!("page lock task failed: {}", err)))??;
        Ok(PageGuard { _file: file })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub page_id: u64,
    pub page_slug: String,
    pub merged_patches: usize,
    pub deleted_captions: usize,
    pub image_path: PathBuf,
}

pub struct MergeEngine {
    store: Arc<dyn CaptionStore>,
    compositor: Arc<dyn Compositor>,
    layout: PageLayout,
    locks: PageLocks,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn CaptionStore>, compositor: Arc<dyn Compositor>, layout: PageLayout) -> Self {
        Self {
            store,
            compositor,
            locks: PageLocks::new(layout.locks_dir()),
            layout,
        }
    }

    pub async fn merge_page(&self, page_slug: &str) -> Result<MergeOutcome> {
        let page = self
            .store
            .find_page(page_slug)?
            .ok_or_else(|| PipelineError::not_found("page", page_slug))?;

        let _guard = self.locks.lock(page.id).await?;
        let captions = self.store.find_by_page(page.id)?;
        let patched: Vec<_> = captions.iter().filter(|caption| caption.has_patch()).collect();
        if patched.is_empty() {
            return Err(PipelineError::MergeAborted(format!(
                "no patches to merge on page {}",
                page.slug
            )));
        }
        info!(
            "merge: page {} with {} patches ({} captions)",
            page.slug,
            patched.len(),
            captions.len()
        );

        let base_image = std::fs::read(&page.image_path)
            .map_err(|err| PipelineError::io(&page.image_path, err))?;

        let mut overlays = Vec::with_capacity(patched.len());
        for caption in &patched {
            let Some(path) = caption.patch_image_path.as_deref() else {
                continue;
            };
            if caption.patch_stale {
                warn!("merge: patch of caption {} predates its text", caption.slug);
            }
            let image = std::fs::read(path).map_err(|err| {
                PipelineError::MergeAborted(format!(
                    "patch of caption {} is unreadable at {}: {}",
                    caption.slug, path, err
                ))
            })?;
            let rect = PixelRect::from_bounds(&caption.region.bounds());
            overlays.push(PatchOverlay {
                image,
                x: rect.x,
                y: rect.y,
                width: Some(rect.width),
                height: Some(rect.height),
            });
        }
        let merged_patches = overlays.len();

        let merged = self
            .compositor
            .composite(CompositeRequest {
                base_image: base_image.clone(),
                overlays,
            })
            .await?;
        let merged = match_format(&base_image, merged)?;
        write_atomic(&page.image_path, &merged)?;

        let deleted_captions = self.store.delete_by_page(page.id)?;
        let patch_dir = self.layout.patch_dir(&page);
        match std::fs::remove_dir_all(&patch_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("merge: failed to remove {}: {}", patch_dir.display(), err),
        }
        info!(
            "merge: page {} done, {} captions retired",
            page.slug, deleted_captions
        );

        Ok(MergeOutcome {
            page_id: page.id,
            page_slug: page.slug,
            merged_patches,
            deleted_captions,
            image_path: page.image_path,
        })
    }
}

/// Keeps the page file's encoding stable across merges.
fn match_format(base: &[u8], merged: Vec<u8>) -> Result<Vec<u8>> {
    let Some(format) = guess_format(base) else {
        return Ok(merged);
    };
    if guess_format(&merged) == Some(format) {
        return Ok(merged);
    }
    encode(&decode(&merged)?, format)
}
