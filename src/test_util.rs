use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use std::sync::{Arc, Mutex};

use crate::collaborators::{
    CollaboratorFuture, CompositeRequest, Compositor, DetectedRegion, Inpainter, PatchRenderRequest,
    PatchRenderer, RegionDetector, TextExtractor, TextTranslator,
};
use crate::error::PipelineError;

pub(crate) fn with_temp_base_dir<F, R>(func: F) -> R
where
    F: FnOnce(&std::path::Path) -> R,
{
    static BASE_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
    let _guard = BASE_MUTEX.lock().unwrap_or_else(|err| err.into_inner());
    let dir = tempfile::tempdir().expect("tempdir");
    let old = std::env::var("MANGA_CAPTION_DIR").ok();
    // SAFETY: tests touching the environment serialize on BASE_MUTEX.
    unsafe { std::env::set_var("MANGA_CAPTION_DIR", dir.path()) };
    let result = func(dir.path());
    match old {
        Some(old) => unsafe { std::env::set_var("MANGA_CAPTION_DIR", old) },
        None => unsafe { std::env::remove_var("MANGA_CAPTION_DIR") },
    }
    result
}

pub(crate) fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba(rgba));
    crate::capture::encode_png(&DynamicImage::ImageRgba8(image)).expect("encode png")
}

pub(crate) fn pixel_at(bytes: &[u8], x: u32, y: u32) -> [u8; 4] {
    let image = image::load_from_memory(bytes).expect("decode");
    assert!(x < image.width() && y < image.height(), "pixel out of range");
    image.get_pixel(x, y).0
}

fn unavailable(service: &'static str) -> PipelineError {
    PipelineError::unavailable(service, "test double configured to fail")
}

/// OCR double: `None` fails every call.
pub(crate) struct TestExtractor {
    pub text: Option<String>,
    pub calls: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestExtractor {
    pub fn returning(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            calls: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            text: None,
            calls: Arc::default(),
        }
    }
}

impl TextExtractor for TestExtractor {
    fn extract(&self, image: Vec<u8>) -> CollaboratorFuture<String> {
        self.calls.lock().expect("calls").push(image);
        let text = self.text.clone();
        Box::pin(async move { text.ok_or_else(|| unavailable("ocr")) })
    }
}

/// Translation double prefixing its input; `fail` makes every call error.
pub(crate) struct TestTranslator {
    pub prefix: String,
    pub fail: bool,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl TestTranslator {
    pub fn prefixing(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            fail: false,
            calls: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            prefix: String::new(),
            fail: true,
            calls: Arc::default(),
        }
    }
}

impl TextTranslator for TestTranslator {
    fn translate(
        &self,
        text: String,
        _source_lang: String,
        _target_lang: String,
    ) -> CollaboratorFuture<Option<String>> {
        self.calls.lock().expect("calls").push(text.clone());
        let result = if self.fail {
            Err(unavailable("translator"))
        } else {
            Ok(Some(format!("{}{}", self.prefix, text)))
        };
        Box::pin(async move { result })
    }
}

/// Renders a solid patch the size of the cropped image.
pub(crate) struct TestRenderer {
    pub fail: bool,
    pub color: [u8; 4],
    pub requests: Arc<Mutex<Vec<PatchRenderRequest>>>,
}

impl TestRenderer {
    pub fn new(color: [u8; 4]) -> Self {
        Self {
            fail: false,
            color,
            requests: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            color: [0, 0, 0, 0],
            requests: Arc::default(),
        }
    }
}

impl PatchRenderer for TestRenderer {
    fn render(&self, request: PatchRenderRequest) -> CollaboratorFuture<Vec<u8>> {
        let fail = self.fail;
        let color = self.color;
        let size = image::load_from_memory(&request.cropped_image)
            .map(|image| image.dimensions())
            .unwrap_or((1, 1));
        self.requests.lock().expect("requests").push(request);
        Box::pin(async move {
            if fail {
                return Err(unavailable("patch renderer"));
            }
            Ok(solid_png(size.0.max(1), size.1.max(1), color))
        })
    }
}

/// Records composite requests and returns a fixed result.
pub(crate) struct TestCompositor {
    pub output: Option<Vec<u8>>,
    pub requests: Arc<Mutex<Vec<CompositeRequest>>>,
}

impl TestCompositor {
    pub fn returning(output: Vec<u8>) -> Self {
        Self {
            output: Some(output),
            requests: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            output: None,
            requests: Arc::default(),
        }
    }
}

impl Compositor for TestCompositor {
    fn composite(&self, request: CompositeRequest) -> CollaboratorFuture<Vec<u8>> {
        self.requests.lock().expect("requests").push(request);
        let output = self.output.clone();
        Box::pin(async move { output.ok_or_else(|| unavailable("compositor")) })
    }
}

pub(crate) struct TestInpainter {
    pub fail: bool,
    pub masks: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestInpainter {
    pub fn new(fail: bool) -> Self {
        Self {
            fail,
            masks: Arc::default(),
        }
    }
}

impl Inpainter for TestInpainter {
    fn inpaint(&self, image: Vec<u8>, mask: Vec<u8>) -> CollaboratorFuture<Vec<u8>> {
        self.masks.lock().expect("masks").push(mask);
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                Err(unavailable("inpainter"))
            } else {
                Ok(image)
            }
        })
    }
}

pub(crate) struct TestDetector {
    pub regions: Vec<DetectedRegion>,
}

impl RegionDetector for TestDetector {
    fn detect(&self, _image: Vec<u8>) -> CollaboratorFuture<Vec<DetectedRegion>> {
        let regions = self.regions.clone();
        Box::pin(async move { Ok(regions) })
    }
}
