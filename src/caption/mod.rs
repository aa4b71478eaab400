mod store;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{PipelineError, Result};
use crate::region::Region;

pub use store::{CaptionStore, JsonStore, TextUpdate};

/// Where a caption is in its workflow. Stored explicitly so that
/// "translation skipped" and "translation pending" stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionStatus {
    Captured,
    Extracted,
    Translated,
    TranslationSkipped,
    Patched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caption {
    pub id: u64,
    pub slug: String,
    pub page_id: u64,
    /// Natural page-pixel space.
    pub region: Region,
    /// Base64 raster captured when the region was drawn.
    pub captured_image: String,
    pub raw_text: Option<String>,
    pub translated_text: Option<String>,
    pub status: CaptionStatus,
    pub patch_image_path: Option<String>,
    pub patch_generated_at: Option<String>,
    pub patch_generated_by: Option<String>,
    /// Text changed after the current patch was rendered.
    #[serde(default)]
    pub patch_stale: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Caption {
    pub fn has_patch(&self) -> bool {
        self.patch_image_path.is_some()
    }

    pub fn captured_image_bytes(&self) -> Result<Vec<u8>> {
        BASE64.decode(self.captured_image.as_bytes()).map_err(|err| {
            PipelineError::Store(format!(
                "caption {} has an undecodable captured image: {}",
                self.slug, err
            ))
        })
    }

    fn derive_status(&self, translation_skipped: bool) -> CaptionStatus {
        if self.patch_image_path.is_some() {
            CaptionStatus::Patched
        } else if self.translated_text.is_some() {
            CaptionStatus::Translated
        } else if translation_skipped {
            CaptionStatus::TranslationSkipped
        } else if self.raw_text.is_some() {
            CaptionStatus::Extracted
        } else {
            CaptionStatus::Captured
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: u64,
    pub slug: String,
    /// The page's natural-resolution raster, overwritten by merge.
    pub image_path: PathBuf,
}

/// Captions resolve by numeric id or by slug; both address the same row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptionKey {
    Id(u64),
    Slug(String),
}

impl CaptionKey {
    /// Numeric input is an id, anything else a slug.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match value.parse::<u64>() {
            Ok(id) => CaptionKey::Id(id),
            Err(_) => CaptionKey::Slug(value.to_string()),
        }
    }

    pub fn matches(&self, caption: &Caption) -> bool {
        match self {
            CaptionKey::Id(id) => caption.id == *id,
            CaptionKey::Slug(slug) => caption.slug == *slug,
        }
    }
}

impl From<u64> for CaptionKey {
    fn from(id: u64) -> Self {
        CaptionKey::Id(id)
    }
}

impl From<&str> for CaptionKey {
    fn from(slug: &str) -> Self {
        CaptionKey::Slug(slug.to_string())
    }
}

impl From<&Caption> for CaptionKey {
    fn from(caption: &Caption) -> Self {
        CaptionKey::Id(caption.id)
    }
}

impl fmt::Display for CaptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptionKey::Id(id) => write!(f, "#{}", id),
            CaptionKey::Slug(slug) => write!(f, "{}", slug),
        }
    }
}
