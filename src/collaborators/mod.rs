use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use crate::error::Result;
use crate::region::{BoundingBox, Point, Region};

mod file_drop;
mod local;
mod manga_ocr;
mod openai;
mod retry;

pub use file_drop::{FileDropConfig, FileDropOcr};
pub use local::LocalCompositor;
pub(crate) use manga_ocr::DEFAULT_BASE_URL as DEFAULT_OCR_URL;
pub use manga_ocr::{BackendHealth, BackendStatus, MangaOcrClient, ModelStatus};
pub use openai::OpenAiTranslator;

pub type CollaboratorFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// OCR: captured image bytes in, raw text out.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, image: Vec<u8>) -> CollaboratorFuture<String>;
}

pub trait RegionDetector: Send + Sync {
    fn detect(&self, image: Vec<u8>) -> CollaboratorFuture<Vec<DetectedRegion>>;
}

/// `Ok(None)` means the service had nothing to do for this text.
pub trait TextTranslator: Send + Sync {
    fn translate(
        &self,
        text: String,
        source_lang: String,
        target_lang: String,
    ) -> CollaboratorFuture<Option<String>>;
}

pub trait PatchRenderer: Send + Sync {
    fn render(&self, request: PatchRenderRequest) -> CollaboratorFuture<Vec<u8>>;
}

pub trait Compositor: Send + Sync {
    fn composite(&self, request: CompositeRequest) -> CollaboratorFuture<Vec<u8>>;
}

/// Mask pixels: white is filled, black is preserved.
pub trait Inpainter: Send + Sync {
    fn inpaint(&self, image: Vec<u8>, mask: Vec<u8>) -> CollaboratorFuture<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedRegion {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub confidence: f64,
}

impl DetectedRegion {
    pub fn to_region(&self) -> Region {
        let x = self.x1.min(self.x2);
        let y = self.y1.min(self.y2);
        Region::rectangle(BoundingBox::new(
            x,
            y,
            (self.x2 - self.x1).abs(),
            (self.y2 - self.y1).abs(),
        ))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontStyle {
    #[default]
    Regular,
    Bold,
    Italic,
}

impl FontStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            FontStyle::Regular => "regular",
            FontStyle::Bold => "bold",
            FontStyle::Italic => "italic",
        }
    }
}

impl FromStr for FontStyle {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "regular" => Ok(FontStyle::Regular),
            "bold" => Ok(FontStyle::Bold),
            "italic" => Ok(FontStyle::Italic),
            other => Err(format!(
                "unknown font style '{}' (expected regular, bold or italic)",
                other
            )),
        }
    }
}

impl fmt::Display for FontStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchRenderRequest {
    pub cropped_image: Vec<u8>,
    pub lines: Vec<String>,
    pub font_size: u32,
    pub font_style: FontStyle,
    pub text_color: String,
    pub stroke_color: Option<String>,
    pub stroke_width: u32,
    /// Relative to the crop's top-left; `None` for rectangles.
    pub outline_points: Option<Vec<Point>>,
    pub cleaner_threshold: Option<u8>,
    pub transparent_background: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchOverlay {
    pub image: Vec<u8>,
    pub x: i64,
    pub y: i64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRequest {
    pub base_image: Vec<u8>,
    pub overlays: Vec<PatchOverlay>,
}
