use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::caption::{Caption, CaptionKey, CaptionStore};
use crate::capture::ensure_png;
use crate::collaborators::{FontStyle, PatchRenderRequest, PatchRenderer};
use crate::error::{PipelineError, Result};
use crate::paths::{PageLayout, write_atomic};
use crate::region::DEFAULT_OUTLINE_POINTS;

/// Rendering options for one patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchStyle {
    pub font_size: u32,
    pub font_style: FontStyle,
    pub text_color: String,
    pub stroke_color: Option<String>,
    pub stroke_width: u32,
    pub cleaner_threshold: Option<u8>,
    pub transparent_background: bool,
    pub outline_points: usize,
}

impl Default for PatchStyle {
    fn default() -> Self {
        Self {
            font_size: 24,
            font_style: FontStyle::Regular,
            text_color: "#000000".to_string(),
            stroke_color: None,
            stroke_width: 0,
            cleaner_threshold: Some(200),
            transparent_background: false,
            outline_points: DEFAULT_OUTLINE_POINTS,
        }
    }
}

pub struct PatchGenerator {
    store: Arc<dyn CaptionStore>,
    renderer: Arc<dyn PatchRenderer>,
    layout: PageLayout,
}

impl PatchGenerator {
    pub fn new(store: Arc<dyn CaptionStore>, renderer: Arc<dyn PatchRenderer>, layout: PageLayout) -> Self {
        Self {
            store,
            renderer,
            layout,
        }
    }

    /// Renders a patch for the caption and stores it at the caption's stable
    /// patch path. Without explicit `lines` the translated text (or, failing
    /// that, the raw text) is split on newlines.
    ///
    /// When rendering fails nothing is written and the caption keeps its
    /// previous patch.
    pub async fn generate(
        &self,
        key: &CaptionKey,
        lines: Option<Vec<String>>,
        style: &PatchStyle,
        generated_by: &str,
    ) -> Result<Caption> {
        let caption = self
            .store
            .get(key)?
            .ok_or_else(|| PipelineError::not_found("caption", key))?;
        let page = self
            .store
            .find_page_by_id(caption.page_id)?
            .ok_or_else(|| PipelineError::not_found("page", caption.page_id))?;
        let lines = match lines {
            Some(lines) => lines,
            None => default_lines(&caption),
        };
        if lines.iter().all(|line| line.trim().is_empty()) {
            return Err(PipelineError::InvalidInput(format!(
                "caption {} has no text for a patch",
                caption.slug
            )));
        }

        let request = PatchRenderRequest {
            cropped_image: caption.captured_image_bytes()?,
            lines,
            font_size: style.font_size,
            font_style: style.font_style,
            text_color: style.text_color.clone(),
            stroke_color: style.stroke_color.clone(),
            stroke_width: style.stroke_width,
            outline_points: caption.region.relative_outline(style.outline_points),
            cleaner_threshold: style.cleaner_threshold,
            transparent_background: style.transparent_background,
        };
        let rendered = self.renderer.render(request).await?;
        let rendered = ensure_png(rendered)?;

        let path = self.layout.patch_path(&page, &caption.slug);
        write_atomic(&path, &rendered)?;
        info!("patch: wrote {} ({} bytes)", path.display(), rendered.len());

        let path = path.to_string_lossy().into_owned();
        self.store
            .attach_patch(key, &path, generated_by)?
            .ok_or_else(|| PipelineError::not_found("caption", key))
    }

    /// Detaches the patch from the caption and removes its file.
    pub fn clear(&self, key: &CaptionKey) -> Result<Caption> {
        let caption = self
            .store
            .get(key)?
            .ok_or_else(|| PipelineError::not_found("caption", key))?;
        if let Some(path) = caption.patch_image_path.as_deref() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(PipelineError::io(path, err)),
            }
        }
        self.store
            .clear_patch(key)?
            .ok_or_else(|| PipelineError::not_found("caption", key))
    }
}

fn default_lines(caption: &Caption) -> Vec<String> {
    let text = caption
        .translated_text
        .as_deref()
        .filter(|text| !text.trim().is_empty())
        .or(caption.raw_text.as_deref())
        .unwrap_or_default();
    text.lines().map(|line| line.trim().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caption::{CaptionStatus, JsonStore, Page, TextUpdate};
    use crate::capture::image_dimensions;
    use crate::region::{BoundingBox, Point, Region};
    use crate::test_util::{TestRenderer, solid_png};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<JsonStore>,
        layout: PageLayout,
        page: Page,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(JsonStore::in_memory());
        let page = store
            .register_page("p1", &dir.path().join("page.png"))
            .expect("page");
        let layout = PageLayout::new(dir.path());
        Fixture {
            _dir: dir,
            store,
            layout,
            page,
        }
    }

    fn caption_with_text(fx: &Fixture, region: Region) -> Caption {
        let caption = fx
            .store
            .create(1, region, &solid_png(40, 20, [255, 255, 255, 255]))
            .expect("create");
        fx.store
            .update_text(
                &CaptionKey::from(&caption),
                TextUpdate {
                    raw_text: Some("元".to_string()),
                    translated_text: Some("Hello\nthere".to_string()),
                    translation_skipped: false,
                },
            )
            .expect("update")
            .expect("caption")
    }

    #[tokio::test]
    async fn generate_writes_stable_path_and_metadata() {
        let fx = fixture();
        let caption = caption_with_text(
            &fx,
            Region::rectangle(BoundingBox::new(10.0, 10.0, 40.0, 20.0)),
        );
        let renderer = Arc::new(TestRenderer::new([0, 0, 0, 255]));
        let generator = PatchGenerator::new(fx.store.clone(), renderer.clone(), fx.layout.clone());
        let key = CaptionKey::from(caption.slug.as_str());

        let patched = generator
            .generate(&key, None, &PatchStyle::default(), "tester")
            .await
            .expect("generate");
        let expected = fx.layout.patch_path(&fx.page, &caption.slug);
        assert_eq!(
            patched.patch_image_path.as_deref(),
            Some(expected.to_string_lossy().as_ref())
        );
        assert_eq!(patched.patch_generated_by.as_deref(), Some("tester"));
        assert_eq!(patched.status, CaptionStatus::Patched);
        assert_eq!(image_dimensions(&std::fs::read(&expected).expect("read")).expect("dims"), (40, 20));

        let requests = renderer.requests.lock().expect("requests");
        assert_eq!(requests[0].lines, vec!["Hello", "there"]);
        assert_eq!(requests[0].outline_points, None);
        assert_eq!(requests[0].font_size, 24);
    }

    #[tokio::test]
    async fn polygon_outline_is_relative_to_crop() {
        let fx = fixture();
        let region = Region::polygon(vec![
            Point::new(100.0, 50.0),
            Point::new(140.0, 50.0),
            Point::new(120.0, 70.0),
        ])
        .expect("polygon");
        let caption = caption_with_text(&fx, region);
        let renderer = Arc::new(TestRenderer::new([0, 0, 0, 255]));
        let generator = PatchGenerator::new(fx.store.clone(), renderer.clone(), fx.layout.clone());
        generator
            .generate(
                &CaptionKey::from(&caption),
                Some(vec!["Hi".to_string()]),
                &PatchStyle::default(),
                "tester",
            )
            .await
            .expect("generate");

        let requests = renderer.requests.lock().expect("requests");
        assert_eq!(
            requests[0].outline_points,
            Some(vec![
                Point::new(0.0, 0.0),
                Point::new(40.0, 0.0),
                Point::new(20.0, 20.0),
            ])
        );
    }

    #[tokio::test]
    async fn render_failure_keeps_previous_patch() {
        let fx = fixture();
        let caption = caption_with_text(
            &fx,
            Region::rectangle(BoundingBox::new(0.0, 0.0, 40.0, 20.0)),
        );
        let key = CaptionKey::from(&caption);
        let ok = PatchGenerator::new(
            fx.store.clone(),
            Arc::new(TestRenderer::new([1, 2, 3, 255])),
            fx.layout.clone(),
        );
        let first = ok
            .generate(&key, None, &PatchStyle::default(), "first")
            .await
            .expect("generate");
        let before = std::fs::read(first.patch_image_path.as_deref().expect("path")).expect("read");

        let failing = PatchGenerator::new(
            fx.store.clone(),
            Arc::new(TestRenderer::failing()),
            fx.layout.clone(),
        );
        let err = failing
            .generate(&key, None, &PatchStyle::default(), "second")
            .await
            .expect_err("renderer down");
        assert!(matches!(err, PipelineError::CollaboratorUnavailable { .. }));

        let stored = fx.store.get(&key).expect("get").expect("caption");
        assert_eq!(stored.patch_generated_by.as_deref(), Some("first"));
        let after = std::fs::read(stored.patch_image_path.as_deref().expect("path")).expect("read");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn clear_removes_file_and_metadata() {
        let fx = fixture();
        let caption = caption_with_text(
            &fx,
            Region::rectangle(BoundingBox::new(0.0, 0.0, 40.0, 20.0)),
        );
        let key = CaptionKey::from(&caption);
        let generator = PatchGenerator::new(
            fx.store.clone(),
            Arc::new(TestRenderer::new([0, 0, 0, 255])),
            fx.layout.clone(),
        );
        let patched = generator
            .generate(&key, None, &PatchStyle::default(), "tester")
            .await
            .expect("generate");
        let path = std::path::PathBuf::from(patched.patch_image_path.expect("path"));

        let cleared = generator.clear(&key).expect("clear");
        assert!(!path.exists());
        assert_eq!(cleared.patch_image_path, None);
        assert_eq!(cleared.status, CaptionStatus::Translated);
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_rendering() {
        let fx = fixture();
        let caption = fx
            .store
            .create(
                1,
                Region::rectangle(BoundingBox::new(0.0, 0.0, 4.0, 4.0)),
                &solid_png(4, 4, [0, 0, 0, 255]),
            )
            .expect("create");
        let renderer = Arc::new(TestRenderer::new([0, 0, 0, 255]));
        let generator = PatchGenerator::new(fx.store.clone(), renderer.clone(), fx.layout.clone());
        let err = generator
            .generate(&CaptionKey::from(&caption), None, &PatchStyle::default(), "t")
            .await
            .expect_err("no text");
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert!(renderer.requests.lock().expect("requests").is_empty());
    }
}
