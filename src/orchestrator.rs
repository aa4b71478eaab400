//! Drives captured regions through OCR and translation into the store.
//!
//! OCR and translation failures never abort caption creation: the caption is
//! persisted with whatever text was obtained and the failure rides along as a
//! [`Warning`]. The explicit retry operations are different and surface
//! collaborator failures as errors, leaving the caption untouched.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::caption::{Caption, CaptionKey, CaptionStore, Page, TextUpdate};
use crate::capture::{crop_region, image_dimensions};
use crate::collaborators::{Inpainter, RegionDetector, TextExtractor, TextTranslator};
use crate::error::{PipelineError, Result, Stage, Warning};
use crate::mask::build_mask;
use crate::paths::{PageLayout, write_atomic};
use crate::region::{DEFAULT_OUTLINE_POINTS, Region};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptionOutcome {
    pub caption: Caption,
    pub warnings: Vec<Warning>,
}

/// One region of a batch. Without a pre-captured image the region is cropped
/// from the page raster.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub region: Region,
    pub captured_image: Option<Vec<u8>>,
}

impl BatchEntry {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            captured_image: None,
        }
    }

    pub fn with_image(region: Region, image: Vec<u8>) -> Self {
        Self {
            region,
            captured_image: Some(image),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionResult {
    pub success: bool,
    pub caption_id: Option<u64>,
    pub slug: Option<String>,
    pub raw_text: Option<String>,
    pub translated_text: Option<String>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleaningOutcome {
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub results: Vec<RegionResult>,
    pub cleaning: Option<CleaningOutcome>,
}

struct TranslationTarget {
    translator: Arc<dyn TextTranslator>,
    source_lang: String,
    target_lang: String,
}

pub struct Orchestrator {
    store: Arc<dyn CaptionStore>,
    extractor: Arc<dyn TextExtractor>,
    translation: Option<TranslationTarget>,
    inpainter: Option<Arc<dyn Inpainter>>,
    detector: Option<Arc<dyn RegionDetector>>,
    layout: PageLayout,
    outline_points: usize,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn CaptionStore>, extractor: Arc<dyn TextExtractor>, layout: PageLayout) -> Self {
        Self {
            store,
            extractor,
            translation: None,
            inpainter: None,
            detector: None,
            layout,
            outline_points: DEFAULT_OUTLINE_POINTS,
        }
    }

    pub fn with_translator(
        mut self,
        translator: Arc<dyn TextTranslator>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        self.translation = Some(TranslationTarget {
            translator,
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
        });
        self
    }

    pub fn with_inpainter(mut self, inpainter: Arc<dyn Inpainter>) -> Self {
        self.inpainter = Some(inpainter);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn RegionDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_outline_points(mut self, points: usize) -> Self {
        self.outline_points = points.max(3);
        self
    }

    /// Extracts, translates and persists one caption for a natural-space
    /// region and its already captured sub-image.
    pub async fn create_caption(
        &self,
        page_id: u64,
        region: Region,
        captured_image: Vec<u8>,
    ) -> Result<CaptionOutcome> {
        self.page(page_id)?;
        region.validate()?;
        let mut warnings = Vec::new();

        let raw_text = match self.extractor.extract(captured_image.clone()).await {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                warn!("ocr: extraction failed for page {}: {}", page_id, err);
                warnings.push(Warning::new(Stage::Ocr, &err));
                String::new()
            }
        };

        let mut update = TextUpdate::raw(raw_text.clone());
        if !raw_text.is_empty() {
            match self.translate(&raw_text).await {
                Ok(Some(translated)) => update.translated_text = Some(translated),
                Ok(None) => update.translation_skipped = true,
                Err(err) => {
                    warn!("translate: failed for page {}: {}", page_id, err);
                    warnings.push(Warning::new(Stage::Translate, &err));
                }
            }
        }

        let caption = self
            .store
            .create_with_text(page_id, region, &captured_image, update)?;
        info!(
            "caption: created {} on page {} ({} warnings)",
            caption.slug,
            page_id,
            warnings.len()
        );
        Ok(CaptionOutcome { caption, warnings })
    }

    /// Processes regions of one page in order. A failing region is reported
    /// in its result and does not stop the batch.
    pub async fn process_batch(
        &self,
        page_id: u64,
        entries: Vec<BatchEntry>,
        with_cleaning: bool,
    ) -> Result<BatchOutcome> {
        let page = self.page(page_id)?;
        let needs_page = with_cleaning || entries.iter().any(|entry| entry.captured_image.is_none());
        let page_bytes = if needs_page {
            Some(read_page(&page)?)
        } else {
            None
        };

        let mut results = Vec::with_capacity(entries.len());
        let mut created = Vec::new();
        for entry in entries {
            let captured = match entry.captured_image {
                Some(image) => image,
                None => {
                    let cropped = page_bytes
                        .as_deref()
                        .ok_or_else(|| PipelineError::Store("page raster not loaded".to_string()))
                        .and_then(|bytes| crop_region(bytes, &entry.region));
                    match cropped {
                        Ok(image) => image,
                        Err(err) => {
                            results.push(RegionResult {
                                warning: Some(Warning::new(Stage::Capture, err).to_string()),
                                ..RegionResult::default()
                            });
                            continue;
                        }
                    }
                }
            };
            match self.create_caption(page_id, entry.region.clone(), captured).await {
                Ok(outcome) => {
                    created.push(entry.region);
                    results.push(region_result(outcome));
                }
                Err(err) => results.push(RegionResult {
                    warning: Some(err.to_string()),
                    ..RegionResult::default()
                }),
            }
        }
        info!(
            "batch: page {} created {}/{} captions",
            page.slug,
            created.len(),
            results.len()
        );

        let cleaning = if with_cleaning && !created.is_empty() {
            Some(self.clean(&page, page_bytes.as_deref(), &created).await)
        } else {
            None
        };
        Ok(BatchOutcome { results, cleaning })
    }

    /// Best effort: failures are reported, never returned.
    async fn clean(&self, page: &Page, page_bytes: Option<&[u8]>, regions: &[Region]) -> CleaningOutcome {
        let Some(inpainter) = self.inpainter.as_ref() else {
            return CleaningOutcome::failed("no inpainter configured");
        };
        let Some(page_bytes) = page_bytes else {
            return CleaningOutcome::failed("page raster not loaded");
        };
        let mask = image_dimensions(page_bytes)
            .and_then(|(width, height)| build_mask(width, height, regions, self.outline_points));
        let mask = match mask {
            Ok(mask) => mask,
            Err(err) => return CleaningOutcome::failed(err),
        };
        let cleaned = match inpainter.inpaint(page_bytes.to_vec(), mask).await {
            Ok(cleaned) => cleaned,
            Err(err) => {
                warn!("cleaning: page {} failed: {}", page.slug, err);
                return CleaningOutcome::failed(err);
            }
        };
        let output_path = self.layout.cleaned_path(page);
        match write_atomic(&output_path, &cleaned) {
            Ok(()) => {
                info!("cleaning: wrote {}", output_path.display());
                CleaningOutcome {
                    success: true,
                    output_path: Some(output_path),
                    warning: None,
                }
            }
            Err(err) => CleaningOutcome::failed(err),
        }
    }

    /// Re-runs OCR against the stored captured image. Only `rawText` changes.
    pub async fn retry_extract(&self, key: &CaptionKey) -> Result<Caption> {
        let caption = self.caption(key)?;
        let image = caption.captured_image_bytes()?;
        let text = self.extractor.extract(image).await?;
        self.store
            .update_text(key, TextUpdate::raw(text.trim()))?
            .ok_or_else(|| PipelineError::not_found("caption", key))
    }

    /// Re-runs translation of the stored raw text. Only `translatedText`
    /// changes.
    pub async fn retry_translate(&self, key: &CaptionKey) -> Result<Caption> {
        let caption = self.caption(key)?;
        let raw_text = caption.raw_text.as_deref().unwrap_or_default().trim();
        if raw_text.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "caption {} has no text to translate",
                caption.slug
            )));
        }
        if self.translation.is_none() {
            return Err(PipelineError::unavailable("translator", "no translator configured"));
        }
        let update = match self.translate(raw_text).await? {
            Some(translated) => TextUpdate::translated(translated),
            None => TextUpdate::skipped(),
        };
        self.store
            .update_text(key, update)?
            .ok_or_else(|| PipelineError::not_found("caption", key))
    }

    /// Detects text regions on the page raster and returns the ones at or
    /// above `min_confidence` as natural-space rectangles.
    pub async fn seed_regions(&self, page_id: u64, min_confidence: f64) -> Result<Vec<Region>> {
        let detector = self
            .detector
            .as_ref()
            .ok_or_else(|| PipelineError::unavailable("detector", "no detector configured"))?;
        let page = self.page(page_id)?;
        let detected = detector.detect(read_page(&page)?).await?;
        let total = detected.len();
        let regions: Vec<Region> = detected
            .into_iter()
            .filter(|region| region.confidence >= min_confidence)
            .map(|region| region.to_region())
            .filter(|region| region.validate().is_ok())
            .collect();
        info!(
            "detect: page {} kept {}/{} regions",
            page.slug,
            regions.len(),
            total
        );
        Ok(regions)
    }

    /// Deletes a caption and its patch file, if any.
    pub fn discard(&self, key: &CaptionKey) -> Result<Caption> {
        let caption = self
            .store
            .delete(key)?
            .ok_or_else(|| PipelineError::not_found("caption", key))?;
        if let Some(path) = caption.patch_image_path.as_deref() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("caption: failed to remove patch {}: {}", path, err),
            }
        }
        Ok(caption)
    }

    async fn translate(&self, text: &str) -> Result<Option<String>> {
        let Some(target) = self.translation.as_ref() else {
            return Ok(None);
        };
        target
            .translator
            .translate(
                text.to_string(),
                target.source_lang.clone(),
                target.target_lang.clone(),
            )
            .await
    }

    fn page(&self, page_id: u64) -> Result<Page> {
        self.store
            .find_page_by_id(page_id)?
            .ok_or_else(|| PipelineError::not_found("page", page_id))
    }

    fn caption(&self, key: &CaptionKey) -> Result<Caption> {
        self.store
            .get(key)?
            .ok_or_else(|| PipelineError::not_found("caption", key))
    }
}

impl CleaningOutcome {
    fn failed(err: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            output_path: None,
            warning: Some(Warning::new(Stage::Cleaning, err).to_string()),
        }
    }
}

fn region_result(outcome: CaptionOutcome) -> RegionResult {
    let warning = if outcome.warnings.is_empty() {
        None
    } else {
        Some(
            outcome
                .warnings
                .iter()
                .map(|warning| warning.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )
    };
    RegionResult {
        success: true,
        caption_id: Some(outcome.caption.id),
        slug: Some(outcome.caption.slug),
        raw_text: outcome.caption.raw_text,
        translated_text: outcome.caption.translated_text,
        warning,
    }
}

fn read_page(page: &Page) -> Result<Vec<u8>> {
    std::fs::read(&page.image_path).map_err(|err| PipelineError::io(&page.image_path, err))
}
