//! Visual table summarization over a bounded worker pool.
//!
//! Each crop goes to a multimodal model as a PNG data URL. A semaphore caps
//! in-flight calls, a `JoinSet` collects results as they land, and outcomes
//! are slotted back into submission order so downstream indexing is
//! deterministic regardless of completion order. A failed region never aborts
//! the batch: it is recorded as a failed outcome and counted.
//!
//! Cancellation and the optional ingestion deadline stop new work from being
//! scheduled; tasks already in flight drain normally and their results are
//! kept. Every input crop yields exactly one outcome.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::SummarizerConfig;
use crate::error::StageError;
use crate::models::{CroppedImage, SummaryOutcome};
use crate::openrouter::{chat_content, OpenRouterClient};

const SUMMARY_PROMPT: &str = r#"Analyze this image of a financial table. Output a comprehensive text summary of the data it contains, including column headers and key row values, so that it can be retrieved via search. Do not include Markdown formatting like ```json or ```text, just the clean summary."#;

/// Cooperative cancellation flag shared between an ingestion run and its
/// caller. Cancelling stops new summarization tasks from being scheduled.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Trait for visual summarization backends.
#[async_trait]
pub trait VisionSummarizer: Send + Sync {
    /// Summarize one crop. Retries and backoff live inside the
    /// implementation; an `Err` here means the region is exhausted.
    async fn summarize(&self, crop: &CroppedImage) -> Result<String>;
}

/// Summarize every crop with at most `pool_size` calls in flight.
///
/// Returns one [`SummaryOutcome`] per input crop, in input order.
pub async fn summarize_all(
    summarizer: Arc<dyn VisionSummarizer>,
    crops: Vec<CroppedImage>,
    pool_size: usize,
    cancel: CancelToken,
    deadline: Option<Instant>,
) -> Vec<SummaryOutcome> {
    let total = crops.len();
    let fallback: Vec<CroppedImage> = crops.clone();
    let mut ordered: Vec<Option<SummaryOutcome>> = Vec::with_capacity(total);
    ordered.resize_with(total, || None);

    let semaphore = Arc::new(Semaphore::new(pool_size.max(1)));
    let mut join_set = JoinSet::new();
    let mut scheduled = 0usize;

    for (idx, crop) in crops.into_iter().enumerate() {
        if let Some(reason) = abandon_reason(&cancel, deadline) {
            ordered[idx] = Some(failed_outcome(crop, reason));
            continue;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                ordered[idx] = Some(failed_outcome(crop, "summarizer pool closed"));
                continue;
            }
        };

        // The permit wait can outlast a cancellation or the deadline.
        if let Some(reason) = abandon_reason(&cancel, deadline) {
            ordered[idx] = Some(failed_outcome(crop, reason));
            continue;
        }

        let summarizer = Arc::clone(&summarizer);
        scheduled += 1;
        join_set.spawn(async move {
            let _permit = permit;
            let result = summarizer.summarize(&crop).await;
            (idx, crop, result)
        });
    }

    // Join barrier: in-flight tasks drain here even after cancellation.
    let mut completed = 0usize;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((idx, crop, result)) => {
                if idx >= total {
                    warn!(idx, total, "summarization result for unknown slot");
                    continue;
                }
                if ordered[idx].is_some() {
                    warn!(idx, "duplicate summarization result ignored");
                    continue;
                }
                let outcome = match result {
                    Ok(text) => {
                        debug!(
                            page = crop.region.page_number,
                            region = crop.region.region_index,
                            "region summarized"
                        );
                        SummaryOutcome {
                            crop,
                            text: Some(text),
                            error: None,
                        }
                    }
                    Err(e) => {
                        let err = StageError::Summarization {
                            page: crop.region.page_number,
                            region: crop.region.region_index,
                            message: e.to_string(),
                        };
                        warn!(error = %err, "region summarization failed");
                        failed_outcome(crop, &err.to_string())
                    }
                };
                ordered[idx] = Some(outcome);
                completed += 1;
            }
            Err(join_err) => {
                warn!(error = %join_err, "summarization task did not complete");
            }
        }
    }

    if completed != scheduled {
        warn!(
            completed,
            scheduled, "some summarization tasks never reported back"
        );
    }

    ordered
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.unwrap_or_else(|| {
                failed_outcome(fallback[idx].clone(), "summarization task panicked")
            })
        })
        .collect()
}

fn abandon_reason(cancel: &CancelToken, deadline: Option<Instant>) -> Option<&'static str> {
    if cancel.is_cancelled() {
        return Some("cancelled before scheduling");
    }
    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            return Some("ingestion deadline exceeded before scheduling");
        }
    }
    None
}

fn failed_outcome(crop: CroppedImage, message: &str) -> SummaryOutcome {
    SummaryOutcome {
        crop,
        text: None,
        error: Some(message.to_string()),
    }
}

// ============ Disabled Summarizer ============

/// Summarizer used when `summarizer.provider = "disabled"`; always errors.
pub struct DisabledSummarizer;

#[async_trait]
impl VisionSummarizer for DisabledSummarizer {
    async fn summarize(&self, _crop: &CroppedImage) -> Result<String> {
        bail!("Summarizer provider is disabled; set summarizer.provider = \"openrouter\"")
    }
}

// ============ OpenRouter Summarizer ============

/// Multimodal summarizer backed by OpenRouter chat completions.
///
/// The crop is inlined as a `data:image/png;base64,...` image part next to
/// the summary prompt.
pub struct OpenRouterSummarizer {
    model: String,
    max_retries: u32,
    client: OpenRouterClient,
}

impl OpenRouterSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self> {
        let client =
            OpenRouterClient::new(&config.base_url, &config.api_key_env, config.timeout_secs)?;
        Ok(Self {
            model: config.model.clone(),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl VisionSummarizer for OpenRouterSummarizer {
    async fn summarize(&self, crop: &CroppedImage) -> Result<String> {
        let png = tokio::fs::read(&crop.path)
            .await
            .with_context(|| format!("Failed to read crop {}", crop.path))?;
        let data_url = format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(&png)
        );

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": SUMMARY_PROMPT},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ],
            }],
        });

        let json = self
            .client
            .post_json("/chat/completions", &body, self.max_retries)
            .await?;
        let text = chat_content(&json)?;
        if text.is_empty() {
            bail!("Summarizer returned empty content");
        }
        Ok(text)
    }
}

/// Create the configured [`VisionSummarizer`].
pub fn create_summarizer(config: &SummarizerConfig) -> Result<Arc<dyn VisionSummarizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledSummarizer)),
        "openrouter" => Ok(Arc::new(OpenRouterSummarizer::new(config)?)),
        other => bail!("Unknown summarizer provider: {}", other),
    }
}
