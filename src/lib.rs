use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub mod caption;
pub mod capture;
pub mod collaborators;
pub mod error;
pub mod logging;
pub mod mask;
pub mod merge;
pub mod orchestrator;
pub mod patch;
pub mod paths;
pub mod region;
pub mod settings;
pub mod transform;

#[cfg(test)]
mod test_util;

pub use caption::{Caption, CaptionKey, CaptionStatus, CaptionStore, JsonStore, Page, TextUpdate};
pub use error::{PipelineError, Stage, Warning};
pub use merge::{MergeEngine, MergeOutcome, PageGuard, PageLocks};
pub use orchestrator::{BatchEntry, BatchOutcome, CaptionOutcome, Orchestrator};
pub use patch::{PatchGenerator, PatchStyle};
pub use region::{BoundingBox, Point, Region};
pub use settings::Settings;

use collaborators::{
    BackendHealth, BackendStatus, Compositor, FileDropConfig, FileDropOcr, LocalCompositor, MangaOcrClient,
    OpenAiTranslator, TextExtractor,
};
use paths::PageLayout;
use settings::{CompositorKind, OcrTransport};
use transform::{Dimensions, region_to_natural};

/// The caption pipeline wired from settings: one store, one backend client
/// and the components built on top of them.
pub struct Pipeline {
    settings: Settings,
    store: Arc<JsonStore>,
    backend: MangaOcrClient,
    orchestrator: Orchestrator,
    patches: PatchGenerator,
    merge: MergeEngine,
}

impl Pipeline {
    /// Must be called inside a tokio runtime when the file-drop transport is
    /// configured, since its results watcher is spawned here.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let layout = PageLayout::new(&settings.data_dir);
        let store = Arc::new(
            JsonStore::open(layout.store_path())
                .with_context(|| format!("failed to open store in {}", layout.root().display()))?,
        );
        let backend = MangaOcrClient::new(&settings.ocr.base_url, settings.ocr.timeout)?;

        let extractor: Arc<dyn TextExtractor> = match settings.ocr.transport {
            OcrTransport::Http => Arc::new(backend.clone()),
            OcrTransport::FileDrop => Arc::new(
                FileDropOcr::start(FileDropConfig {
                    drop_dir: settings.drop_dir(),
                    results_file: settings.results_file(),
                    timeout: settings.ocr.timeout,
                    poll_interval: settings.ocr.poll_interval,
                })
                .with_context(|| "failed to start file-drop OCR")?,
            ),
        };

        let mut orchestrator = Orchestrator::new(store.clone(), extractor, layout.clone())
            .with_inpainter(Arc::new(backend.clone()))
            .with_detector(Arc::new(backend.clone()))
            .with_outline_points(settings.patch.outline_points);
        if settings.translation.enabled {
            match translator(&settings) {
                Some(translator) => {
                    orchestrator = orchestrator.with_translator(
                        Arc::new(translator),
                        settings.translation.source_lang.clone(),
                        settings.translation.target_lang.clone(),
                    );
                }
                None => warn!("translate: OPENAI_API_KEY is not set; translation is skipped"),
            }
        }

        let compositor: Arc<dyn Compositor> = match settings.compositor {
            CompositorKind::Remote => Arc::new(backend.clone()),
            CompositorKind::Local => Arc::new(LocalCompositor::new()),
        };
        let patches = PatchGenerator::new(store.clone(), Arc::new(backend.clone()), layout.clone());
        let merge = MergeEngine::new(store.clone(), compositor, layout);
        info!(
            "pipeline: data in {}, ocr via {:?}",
            settings.data_dir.display(),
            settings.ocr.transport
        );

        Ok(Self {
            settings,
            store,
            backend,
            orchestrator,
            patches,
            merge,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<JsonStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn patches(&self) -> &PatchGenerator {
        &self.patches
    }

    pub fn merge(&self) -> &MergeEngine {
        &self.merge
    }

    pub fn page(&self, slug: &str) -> Result<Page> {
        Ok(self
            .store
            .find_page(slug)?
            .ok_or_else(|| PipelineError::not_found("page", slug))?)
    }

    /// Captures a region drawn on the page and runs it through OCR and
    /// translation. With `displayed` the region is in viewport space and is
    /// scaled to the page's natural size before cropping.
    pub async fn capture(
        &self,
        page_slug: &str,
        region: Region,
        displayed: Option<Dimensions>,
    ) -> Result<CaptionOutcome> {
        let page = self.page(page_slug)?;
        let page_bytes = std::fs::read(&page.image_path)
            .with_context(|| format!("failed to read page {}", page.image_path.display()))?;
        let region = match displayed {
            Some(displayed) => {
                let natural = Dimensions::from(capture::image_dimensions(&page_bytes)?);
                region_to_natural(&region, displayed, natural)?
            }
            None => region,
        };
        let cropped = capture::crop_region(&page_bytes, &region)?;
        Ok(self
            .orchestrator
            .create_caption(page.id, region, cropped)
            .await?)
    }

    pub async fn backend_status(&self) -> Result<(BackendHealth, BackendStatus)> {
        let url = self.backend.base_url();
        let health = self
            .backend
            .health()
            .await
            .with_context(|| format!("backend at {} is not healthy", url))?;
        let status = self
            .backend
            .status()
            .await
            .with_context(|| format!("backend at {} did not report status", url))?;
        Ok((health, status))
    }
}

fn translator(settings: &Settings) -> Option<OpenAiTranslator> {
    let mut translator = OpenAiTranslator::from_env()?.with_timeout(settings.translation.timeout);
    if let Some(model) = settings.translation.model.as_deref() {
        translator = translator.with_model(model);
    }
    if let Some(url) = settings.translation.base_url.as_deref() {
        translator = translator.with_base_url(url);
    }
    Some(translator)
}
