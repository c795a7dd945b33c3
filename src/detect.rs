//! Table region detection.
//!
//! A detection backend reports candidate boxes in its own inference
//! resolution. This module filters them by confidence, collapses overlapping
//! candidates with greedy IoU non-max suppression, rescales the survivors to
//! the page's native pixel space, and assigns 1-based per-page region indices
//! in confidence-descending order.
//!
//! Detection failures are page-local: the caller records them and moves on,
//! and the failed page contributes zero regions.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DetectionConfig;
use crate::models::{BoundingBox, DetectedRegion, PageImage};
use crate::raster::encode_png;

/// One box straight from the detection backend, in inference space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Backend output for one page: the resolution the model saw, plus its boxes.
#[derive(Debug, Clone)]
pub struct DetectionOutput {
    pub inference_width: u32,
    pub inference_height: u32,
    pub detections: Vec<RawDetection>,
}

/// Trait for table-detection backends.
#[async_trait]
pub trait RegionDetector: Send + Sync {
    /// Detect candidate table regions on one rendered page.
    async fn detect(&self, page: &PageImage) -> Result<DetectionOutput>;
}

/// Post-process one page's raw detections into final [`DetectedRegion`]s:
/// confidence filter, then NMS, then rescale into the page's pixel space.
pub fn resolve_regions(
    output: DetectionOutput,
    page_number: u32,
    page_width: u32,
    page_height: u32,
    config: &DetectionConfig,
) -> Result<Vec<DetectedRegion>> {
    if output.inference_width == 0 || output.inference_height == 0 {
        bail!(
            "Detection backend reported a zero inference resolution ({}x{})",
            output.inference_width,
            output.inference_height
        );
    }

    let confident = filter_confident(output.detections, config.confidence_threshold);
    let kept = non_max_suppress(confident, config.iou_threshold);

    let sx = page_width as f32 / output.inference_width as f32;
    let sy = page_height as f32 / output.inference_height as f32;

    Ok(kept
        .into_iter()
        .enumerate()
        .map(|(i, det)| DetectedRegion {
            page_number,
            region_index: i as u32 + 1,
            bbox: det.bbox.scale(sx, sy),
            confidence: det.confidence,
        })
        .collect())
}

/// Drop detections below the confidence threshold (boundary values survive).
pub fn filter_confident(detections: Vec<RawDetection>, threshold: f32) -> Vec<RawDetection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= threshold)
        .collect()
}

/// Greedy IoU non-max suppression. Candidates are visited in
/// confidence-descending order; a candidate survives only if its IoU with
/// every already-kept box stays below the threshold. Output preserves that
/// order, and re-running on its own output changes nothing.
pub fn non_max_suppress(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.bbox.iou(&candidate.bbox) >= iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

// ============ Disabled Detector ============

/// Detector used when `detection.provider = "disabled"`; always errors.
pub struct DisabledDetector;

#[async_trait]
impl RegionDetector for DisabledDetector {
    async fn detect(&self, _page: &PageImage) -> Result<DetectionOutput> {
        bail!("Detection provider is disabled; set detection.provider = \"http\"")
    }
}

// ============ HTTP Detector ============

/// Detector backed by a remote inference service.
///
/// Sends the rendered page as a PNG body to `POST {endpoint}/detect` and
/// expects `{"width", "height", "boxes": [[x0, y0, x1, y1, confidence], ..]}`
/// in the service's inference resolution.
pub struct HttpRegionDetector {
    client: reqwest::Client,
    endpoint: String,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    width: u32,
    height: u32,
    boxes: Vec<[f32; 5]>,
}

impl HttpRegionDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            bail!("detection.endpoint required for the http provider");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl RegionDetector for HttpRegionDetector {
    async fn detect(&self, page: &PageImage) -> Result<DetectionOutput> {
        let png = encode_png(&page.image)?;
        let url = format!("{}/detect", self.endpoint);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Content-Type", "image/png")
                .body(png.clone())
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: DetectResponse = response.json().await?;
                        return Ok(DetectionOutput {
                            inference_width: parsed.width,
                            inference_height: parsed.height,
                            detections: parsed
                                .boxes
                                .into_iter()
                                .map(|[x0, y0, x1, y1, confidence]| RawDetection {
                                    bbox: BoundingBox::new(x0, y0, x1, y1),
                                    confidence,
                                })
                                .collect(),
                        });
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Detection service error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Detection service error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Detection failed after retries")))
    }
}

/// Create the configured [`RegionDetector`].
pub fn create_detector(config: &DetectionConfig) -> Result<Arc<dyn RegionDetector>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledDetector)),
        "http" => Ok(Arc::new(HttpRegionDetector::new(config)?)),
        other => bail!("Unknown detection provider: {}", other),
    }
}
