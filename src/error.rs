use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced by the caption pipeline.
///
/// Degraded OCR or translation is never an error here: those stages attach a
/// [`Warning`] to an otherwise successful outcome instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Degenerate geometry, e.g. a zero-sized displayed image.
    #[error("geometry error: {0}")]
    Geometry(String),

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// An external service (OCR, translation, rendering, compositing,
    /// inpainting) could not be reached or answered with a failure.
    #[error("{service} unavailable: {message}")]
    CollaboratorUnavailable {
        service: &'static str,
        message: String,
    },

    /// Merge stopped before touching the page raster.
    #[error("merge aborted: {0}")]
    MergeAborted(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl PipelineError {
    pub fn not_found(kind: &'static str, key: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn unavailable(service: &'static str, message: impl fmt::Display) -> Self {
        Self::CollaboratorUnavailable {
            service,
            message: message.to_string(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Capture,
    Ocr,
    Translate,
    Cleaning,
}

/// A stage that failed without failing the surrounding operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub stage: Stage,
    pub message: String,
}

impl Warning {
    pub fn new(stage: Stage, message: impl fmt::Display) -> Self {
        Self {
            stage,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            Stage::Capture => "capture",
            Stage::Ocr => "ocr",
            Stage::Translate => "translate",
            Stage::Cleaning => "cleaning",
        };
        write!(f, "{} failed: {}", stage, self.message)
    }
}
