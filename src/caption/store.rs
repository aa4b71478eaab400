use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::fs::File;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use super::{Caption, CaptionKey, CaptionStatus, Page};
use crate::error::{PipelineError, Result};
use crate::paths::{lock_exclusive, write_atomic};
use crate::region::Region;

const SLUG_LEN: usize = 10;

/// Text fields to overwrite. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextUpdate {
    pub raw_text: Option<String>,
    pub translated_text: Option<String>,
    /// No translator was configured or it declined the text.
    pub translation_skipped: bool,
}

impl TextUpdate {
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            raw_text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn translated(text: impl Into<String>) -> Self {
        Self {
            translated_text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            translation_skipped: true,
            ..Self::default()
        }
    }
}

/// Persistence for pages and captions.
///
/// Lookups and mutations of a missing caption return `Ok(None)` so callers
/// composing several steps can tell a caption that vanished concurrently
/// apart from a failing store.
pub trait CaptionStore: Send + Sync {
    fn register_page(&self, slug: &str, image_path: &Path) -> Result<Page>;
    fn find_page(&self, slug: &str) -> Result<Option<Page>>;
    fn find_page_by_id(&self, id: u64) -> Result<Option<Page>>;

    /// Persists a new caption together with its initial text in one write.
    fn create_with_text(
        &self,
        page_id: u64,
        region: Region,
        captured_image: &[u8],
        text: TextUpdate,
    ) -> Result<Caption>;

    fn create(&self, page_id: u64, region: Region, captured_image: &[u8]) -> Result<Caption> {
        self.create_with_text(page_id, region, captured_image, TextUpdate::default())
    }

    fn get(&self, key: &CaptionKey) -> Result<Option<Caption>>;
    fn update_text(&self, key: &CaptionKey, update: TextUpdate) -> Result<Option<Caption>>;
    fn attach_patch(
        &self,
        key: &CaptionKey,
        path: &str,
        generated_by: &str,
    ) -> Result<Option<Caption>>;
    fn clear_patch(&self, key: &CaptionKey) -> Result<Option<Caption>>;
    fn delete(&self, key: &CaptionKey) -> Result<Option<Caption>>;
    fn find_by_page(&self, page_id: u64) -> Result<Vec<Caption>>;
    fn delete_by_page(&self, page_id: u64) -> Result<usize>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreData {
    next_page_id: u64,
    next_caption_id: u64,
    #[serde(default)]
    pages: Vec<Page>,
    #[serde(default)]
    captions: Vec<Caption>,
}

impl StoreData {
    fn caption_mut(&mut self, key: &CaptionKey) -> Option<&mut Caption> {
        self.captions.iter_mut().find(|caption| key.matches(caption))
    }
}

/// Store backed by a single JSON document, rewritten atomically on every
/// mutation. Without a path it only lives in memory.
///
/// Several processes may share one file: every operation reloads the
/// document, and mutations do so while holding an exclusive lock on a
/// sibling `.lock` file.
pub struct JsonStore {
    path: Option<PathBuf>,
    data: Mutex<StoreData>,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = load(&path)?;
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StoreData::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreData>> {
        self.data
            .lock()
            .map_err(|_| PipelineError::Store("caption store lock poisoned".to_string()))
    }

    fn read<T>(&self, f: impl FnOnce(&StoreData) -> T) -> Result<T> {
        let mut guard = self.lock()?;
        if let Some(path) = self.path.as_ref() {
            *guard = load(path)?;
        }
        Ok(f(&guard))
    }

    /// Applies `f` to the latest document and swaps it in only after it was
    /// persisted.
    fn write<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let _file_lock = self.lock_file()?;
        let mut next = match self.path.as_ref() {
            Some(path) => load(path)?,
            None => guard.clone(),
        };
        let value = f(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(value)
    }

    fn lock_file(&self) -> Result<Option<File>> {
        let Some(path) = self.path.as_ref() else {
            return Ok(None);
        };
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        lock_exclusive(Path::new(&lock_path)).map(Some)
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(data)
            .map_err(|err| PipelineError::Store(format!("failed to encode store: {}", err)))?;
        write_atomic(path, &content)
    }
}

impl CaptionStore for JsonStore {
    fn register_page(&self, slug: &str, image_path: &Path) -> Result<Page> {
        let slug = slug.trim();
        if slug.is_empty() {
            return Err(PipelineError::InvalidInput("page slug is empty".to_string()));
        }
        self.write(|data| {
            if let Some(page) = data.pages.iter_mut().find(|page| page.slug == slug) {
                page.image_path = image_path.to_path_buf();
                return Ok(page.clone());
            }
            data.next_page_id += 1;
            let page = Page {
                id: data.next_page_id,
                slug: slug.to_string(),
                image_path: image_path.to_path_buf(),
            };
            data.pages.push(page.clone());
            Ok(page)
        })
    }

    fn find_page(&self, slug: &str) -> Result<Option<Page>> {
        self.read(|data| data.pages.iter().find(|page| page.slug == slug).cloned())
    }

    fn find_page_by_id(&self, id: u64) -> Result<Option<Page>> {
        self.read(|data| data.pages.iter().find(|page| page.id == id).cloned())
    }

    fn create_with_text(
        &self,
        page_id: u64,
        region: Region,
        captured_image: &[u8],
        text: TextUpdate,
    ) -> Result<Caption> {
        region.validate()?;
        let encoded = BASE64.encode(captured_image);
        self.write(|data| {
            if !data.pages.iter().any(|page| page.id == page_id) {
                return Err(PipelineError::not_found("page", page_id));
            }
            data.next_caption_id += 1;
            let id = data.next_caption_id;
            let slug = unique_slug(data, &slug_seed(page_id, id));
            let now = now_rfc3339();
            let mut caption = Caption {
                id,
                slug,
                page_id,
                region,
                captured_image: encoded,
                raw_text: None,
                translated_text: None,
                status: CaptionStatus::Captured,
                patch_image_path: None,
                patch_generated_at: None,
                patch_generated_by: None,
                patch_stale: false,
                created_at: now.clone(),
                updated_at: now,
            };
            apply_text(&mut caption, text);
            debug!("store: created caption {} on page {}", caption.slug, page_id);
            data.captions.push(caption.clone());
            Ok(caption)
        })
    }

    fn get(&self, key: &CaptionKey) -> Result<Option<Caption>> {
        self.read(|data| data.captions.iter().find(|c| key.matches(c)).cloned())
    }

    fn update_text(&self, key: &CaptionKey, update: TextUpdate) -> Result<Option<Caption>> {
        self.write(|data| {
            let Some(caption) = data.caption_mut(key) else {
                return Ok(None);
            };
            apply_text(caption, update);
            caption.updated_at = now_rfc3339();
            Ok(Some(caption.clone()))
        })
    }

    fn attach_patch(
        &self,
        key: &CaptionKey,
        path: &str,
        generated_by: &str,
    ) -> Result<Option<Caption>> {
        self.write(|data| {
            let Some(caption) = data.caption_mut(key) else {
                return Ok(None);
            };
            let now = now_rfc3339();
            caption.patch_image_path = Some(path.to_string());
            caption.patch_generated_at = Some(now.clone());
            caption.patch_generated_by = Some(generated_by.to_string());
            caption.patch_stale = false;
            caption.status = CaptionStatus::Patched;
            caption.updated_at = now;
            Ok(Some(caption.clone()))
        })
    }

    fn clear_patch(&self, key: &CaptionKey) -> Result<Option<Caption>> {
        self.write(|data| {
            let Some(caption) = data.caption_mut(key) else {
                return Ok(None);
            };
            caption.patch_image_path = None;
            caption.patch_generated_at = None;
            caption.patch_generated_by = None;
            caption.patch_stale = false;
            caption.status = caption.derive_status(false);
            caption.updated_at = now_rfc3339();
            Ok(Some(caption.clone()))
        })
    }

    fn delete(&self, key: &CaptionKey) -> Result<Option<Caption>> {
        self.write(|data| {
            let Some(idx) = data.captions.iter().position(|c| key.matches(c)) else {
                return Ok(None);
            };
            Ok(Some(data.captions.remove(idx)))
        })
    }

    fn find_by_page(&self, page_id: u64) -> Result<Vec<Caption>> {
        self.read(|data| {
            data.captions
                .iter()
                .filter(|caption| caption.page_id == page_id)
                .cloned()
                .collect()
        })
    }

    fn delete_by_page(&self, page_id: u64) -> Result<usize> {
        self.write(|data| {
            let before = data.captions.len();
            data.captions.retain(|caption| caption.page_id != page_id);
            Ok(before - data.captions.len())
        })
    }
}

fn apply_text(caption: &mut Caption, update: TextUpdate) {
    let skipped = update.translation_skipped
        || (caption.status == CaptionStatus::TranslationSkipped
            && update.translated_text.is_none());
    let mut changed = false;
    if let Some(raw) = update.raw_text {
        changed |= caption.raw_text.as_deref() != Some(raw.as_str());
        caption.raw_text = Some(raw);
    }
    if let Some(translated) = update.translated_text {
        changed |= caption.translated_text.as_deref() != Some(translated.as_str());
        caption.translated_text = Some(translated);
    }
    if changed && caption.has_patch() {
        caption.patch_stale = true;
    }
    caption.status = caption.derive_status(skipped);
}

fn load(path: &Path) -> Result<StoreData> {
    if !path.exists() {
        return Ok(StoreData::default());
    }
    let content = fs::read_to_string(path).map_err(|err| PipelineError::io(path, err))?;
    serde_json::from_str(&content)
        .map_err(|err| PipelineError::Store(format!("failed to parse {}: {}", path.display(), err)))
}

fn slug_seed(page_id: u64, id: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_nanos())
        .unwrap_or(0);
    format!("{}:{}:{}", page_id, id, nanos)
}

/// Slugs are never all digits, so `CaptionKey::parse` cannot mistake one
/// for an id.
fn unique_slug(data: &StoreData, seed: &str) -> String {
    let mut salt = 0u32;
    loop {
        let slug = digest_slug(&format!("{}:{}", seed, salt));
        let numeric = slug.bytes().all(|byte| byte.is_ascii_digit());
        if !numeric && !data.captions.iter().any(|caption| caption.slug == slug) {
            return slug;
        }
        salt += 1;
    }
}

fn digest_slug(seed: &str) -> String {
    let digest = format!("{:x}", md5::compute(seed.as_bytes()));
    digest[..SLUG_LEN].to_string()
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}
