//! Client for the OCR / patch-rendering / inpainting backend.
//!
//! One HTTP service answers every image-side collaborator contract, so a
//! single client implements all of those traits.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    CollaboratorFuture, CompositeRequest, Compositor, DetectedRegion, Inpainter, PatchRenderRequest,
    PatchRenderer, RegionDetector, TextExtractor,
};
use crate::error::PipelineError;
use crate::region::Point;

pub(crate) const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8710";

#[derive(Debug, Clone)]
pub struct MangaOcrClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendHealth {
    pub status: String,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub build_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub ready: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendStatus {
    pub models: BTreeMap<String, ModelStatus>,
}

impl BackendStatus {
    pub fn is_ready(&self, model: &str) -> bool {
        self.models.get(model).map(|m| m.ready).unwrap_or(false)
    }
}

impl MangaOcrClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .with_context(|| "failed to build OCR backend client")?;
        let base_url = base_url.into();
        let base_url = base_url.trim().trim_end_matches('/');
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<BackendHealth> {
        self.get_json("/health").await
    }

    /// Readiness of each backend model, loaded independently.
    pub async fn status(&self) -> Result<BackendStatus> {
        self.get_json("/status").await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        decode_response(response, path).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        decode_response(response, path).await
    }

    async fn scan(self, image: Vec<u8>) -> Result<String> {
        let body = ImageRequest {
            image: BASE64.encode(&image),
            format: "auto",
        };
        let response: ScanResponse = self.post_json("/scan", &body).await?;
        debug!(
            "ocr: scanned {}x{} image",
            response.image_size.0, response.image_size.1
        );
        Ok(response.text)
    }

    async fn predict_regions(self, image: Vec<u8>) -> Result<Vec<DetectedRegion>> {
        let body = ImageRequest {
            image: BASE64.encode(&image),
            format: "auto",
        };
        let response: PredictRegionsResponse = self.post_json("/predict-regions", &body).await?;
        info!("ocr: detected {} regions", response.regions.len());
        Ok(response.regions)
    }

    async fn generate_patch(self, request: PatchRenderRequest) -> Result<Vec<u8>> {
        let body = PatchPayload::from(&request);
        let response: PatchResponse = self.post_json("/generate-patch", &body).await?;
        debug!(
            "ocr: rendered patch {}",
            response
                .size
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("x")
        );
        decode_base64(&response.patch_image, "patch image")
    }

    async fn merge_patches(self, request: CompositeRequest) -> Result<Vec<u8>> {
        let body = MergePayload::from(&request);
        info!("ocr: merging {} patches", body.patches.len());
        let response: MergeResponse = self.post_json("/merge-patches", &body).await?;
        decode_base64(&response.merged_image, "merged image")
    }

    async fn inpaint_mask(self, image: Vec<u8>, mask: Vec<u8>) -> Result<Vec<u8>> {
        let url = format!("{}/inpaint-mask", self.base_url);
        let form = reqwest::multipart::Form::new()
            .part(
                "image_file",
                reqwest::multipart::Part::bytes(image).file_name("image.png"),
            )
            .part(
                "mask_file",
                reqwest::multipart::Part::bytes(mask).file_name("mask.png"),
            );
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        let response: InpaintResponse = decode_response(response, "/inpaint-mask").await?;
        decode_base64(&response.cleaned_image, "cleaned image")
    }
}

async fn decode_response<T: DeserializeOwned>(response: reqwest::Response, path: &str) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .with_context(|| format!("failed to read {} response", path))?;
    if !status.is_success() {
        return Err(anyhow!("{} returned {}: {}", path, status, error_detail(&body)));
    }
    serde_json::from_str(&body).with_context(|| format!("failed to parse {} response", path))
}

fn error_detail(body: &str) -> String {
    #[derive(Deserialize)]
    struct Detail {
        detail: String,
    }
    serde_json::from_str::<Detail>(body)
        .map(|d| d.detail)
        .unwrap_or_else(|_| body.trim().to_string())
}

fn decode_base64(value: &str, what: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value.trim().as_bytes())
        .with_context(|| format!("backend returned invalid base64 {}", what))
}

fn unavailable(service: &'static str) -> impl FnOnce(anyhow::Error) -> PipelineError {
    move |err| PipelineError::unavailable(service, format!("{:#}", err))
}

impl TextExtractor for MangaOcrClient {
    fn extract(&self, image: Vec<u8>) -> CollaboratorFuture<String> {
        let client = self.clone();
        Box::pin(async move { client.scan(image).await.map_err(unavailable("ocr")) })
    }
}

impl RegionDetector for MangaOcrClient {
    fn detect(&self, image: Vec<u8>) -> CollaboratorFuture<Vec<DetectedRegion>> {
        let client = self.clone();
        Box::pin(async move {
            client
                .predict_regions(image)
                .await
                .map_err(unavailable("detector"))
        })
    }
}

impl PatchRenderer for MangaOcrClient {
    fn render(&self, request: PatchRenderRequest) -> CollaboratorFuture<Vec<u8>> {
        let client = self.clone();
        Box::pin(async move {
            client
                .generate_patch(request)
                .await
                .map_err(unavailable("patch renderer"))
        })
    }
}

impl Compositor for MangaOcrClient {
    fn composite(&self, request: CompositeRequest) -> CollaboratorFuture<Vec<u8>> {
        let client = self.clone();
        Box::pin(async move {
            client
                .merge_patches(request)
                .await
                .map_err(unavailable("compositor"))
        })
    }
}

impl Inpainter for MangaOcrClient {
    fn inpaint(&self, image: Vec<u8>, mask: Vec<u8>) -> CollaboratorFuture<Vec<u8>> {
        let client = self.clone();
        Box::pin(async move {
            client
                .inpaint_mask(image, mask)
                .await
                .map_err(unavailable("inpainter"))
        })
    }
}

#[derive(Serialize)]
struct ImageRequest {
    image: String,
    format: &'static str,
}

#[derive(Deserialize)]
struct ScanResponse {
    text: String,
    #[serde(default)]
    image_size: (u32, u32),
}

#[derive(Deserialize)]
struct PredictRegionsResponse {
    #[serde(default)]
    regions: Vec<DetectedRegion>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PatchPayload {
    captured_image: String,
    translated_text: Vec<String>,
    font_size: u32,
    font_type: &'static str,
    text_color: String,
    stroke_color: Option<String>,
    stroke_width: u32,
    polygon_points: Option<Vec<Point>>,
    alpha_background: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cleaner_threshold: Option<u8>,
}

impl From<&PatchRenderRequest> for PatchPayload {
    fn from(request: &PatchRenderRequest) -> Self {
        Self {
            captured_image: BASE64.encode(&request.cropped_image),
            translated_text: request.lines.clone(),
            font_size: request.font_size,
            font_type: request.font_style.as_str(),
            text_color: request.text_color.clone(),
            stroke_color: request.stroke_color.clone(),
            stroke_width: request.stroke_width,
            polygon_points: request
                .outline_points
                .clone()
                .filter(|points| points.len() >= 3),
            alpha_background: request.transparent_background,
            cleaner_threshold: request.cleaner_threshold,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchResponse {
    patch_image: String,
    #[serde(default)]
    size: Vec<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MergePayload {
    page_image_base64: String,
    patches: Vec<OverlayPayload>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OverlayPayload {
    patch_image_base64: String,
    x: i64,
    y: i64,
    width: Option<u32>,
    height: Option<u32>,
}

impl From<&CompositeRequest> for MergePayload {
    fn from(request: &CompositeRequest) -> Self {
        Self {
            page_image_base64: BASE64.encode(&request.base_image),
            patches: request
                .overlays
                .iter()
                .map(|overlay| OverlayPayload {
                    patch_image_base64: BASE64.encode(&overlay.image),
                    x: overlay.x,
                    y: overlay.y,
                    width: overlay.width,
                    height: overlay.height,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeResponse {
    merged_image: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InpaintResponse {
    cleaned_image: String,
}
