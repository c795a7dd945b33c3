//! Ingestion pipeline orchestration.
//!
//! Coordinates the full document flow: rasterization → region detection →
//! cropping → visual summarization → index build. Each stage advances a
//! persisted status (`uploaded` → `rasterized` → `detected` → `cropped` →
//! `summarized` → `indexed` → `ready`); unrecoverable failures land in
//! `failed` with the reason recorded on the document row.
//!
//! Failure handling is scoped per stage: a page whose detection call fails
//! is skipped, a region whose crop or summary fails is counted and skipped,
//! while rasterization failures, index-build failures, and a batch where
//! every region summary failed abort the run. A failed index build leaves
//! the previous index untouched.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::crop;
use crate::detect::{self, create_detector, RegionDetector};
use crate::document;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::StageError;
use crate::index::{self, NewEntry};
use crate::models::{Answer, ChatTurn, DocumentRecord, DocumentStatus};
use crate::progress::{IngestProgressEvent, IngestProgressReporter};
use crate::query;
use crate::raster::{PageRasterizer, PdfiumRasterizer};
use crate::summarize::{create_summarizer, summarize_all, CancelToken, VisionSummarizer};
use crate::synthesis::{create_synthesizer, Synthesizer};

/// Serializes ingestion runs per document id. A second run for the same
/// document waits until the first finishes; different documents proceed
/// independently.
#[derive(Clone, Default)]
pub struct DocumentLocks {
    inner: Arc<std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DocumentLocks {
    pub async fn acquire(&self, document_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(document_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Counts reported after a completed ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub pages: usize,
    pub regions_detected: usize,
    pub regions_summarized: usize,
    pub regions_failed: usize,
    pub entries_indexed: usize,
}

/// The assembled pipeline: configuration plus the pluggable stage backends.
///
/// Cheap to clone; all backends are shared behind `Arc`.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    pool: SqlitePool,
    rasterizer: Arc<dyn PageRasterizer>,
    detector: Arc<dyn RegionDetector>,
    summarizer: Arc<dyn VisionSummarizer>,
    embedder: Arc<dyn EmbeddingProvider>,
    synthesizer: Arc<dyn Synthesizer>,
    locks: DocumentLocks,
}

impl Pipeline {
    /// Build a pipeline with explicit stage backends. Used by tests and by
    /// embedding hosts that bring their own implementations.
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        rasterizer: Arc<dyn PageRasterizer>,
        detector: Arc<dyn RegionDetector>,
        summarizer: Arc<dyn VisionSummarizer>,
        embedder: Arc<dyn EmbeddingProvider>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            config,
            pool,
            rasterizer,
            detector,
            summarizer,
            embedder,
            synthesizer,
            locks: DocumentLocks::default(),
        }
    }

    /// Build a pipeline from configuration, wiring up the configured
    /// providers for every stage.
    pub fn from_config(config: Arc<Config>, pool: SqlitePool) -> Result<Self> {
        let detector = create_detector(&config.detection)?;
        let summarizer = create_summarizer(&config.summarizer)?;
        let embedder = create_provider(&config.embedding)?;
        let synthesizer = create_synthesizer(&config.synthesis)?;
        Ok(Self::new(
            config,
            pool,
            Arc::new(PdfiumRasterizer),
            detector,
            summarizer,
            embedder,
            synthesizer,
        ))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a document by path. Re-registering the same path reuses the
    /// id and resets the document to `uploaded`.
    pub async fn upload(&self, path: &Path) -> Result<DocumentRecord> {
        document::register_document(&self.pool, path).await
    }

    /// Run the full ingestion pipeline for a registered document.
    ///
    /// Holds the per-document lock for the whole run. Returns the final
    /// counts on success; on failure the document is marked `failed` with
    /// the reason recorded.
    pub async fn ingest(
        &self,
        document_id: &str,
        cancel: CancelToken,
        progress: &dyn IngestProgressReporter,
    ) -> Result<IngestOutcome> {
        let _guard = self.locks.acquire(document_id).await;

        let doc = document::get_document(&self.pool, document_id)
            .await?
            .ok_or_else(|| anyhow!("Unknown document: {}", document_id))?;

        // Rasterize. Failure to open or render the PDF is fatal.
        let pages = match self
            .rasterizer
            .rasterize(Path::new(&doc.path), self.config.raster.zoom)
            .await
        {
            Ok(pages) if pages.is_empty() => {
                let err = StageError::DocumentLoad("document has no pages".to_string());
                return Err(self.fail_document(document_id, progress, err.into()).await);
            }
            Ok(pages) => pages,
            Err(e) => {
                let err = StageError::DocumentLoad(e.to_string());
                return Err(self.fail_document(document_id, progress, err.into()).await);
            }
        };
        document::set_page_count(&self.pool, document_id, pages.len() as i64).await?;
        self.advance(document_id, progress, DocumentStatus::Rasterized)
            .await?;

        // Page text is supplementary; extraction failure only loses the
        // text entries, never the run.
        let page_texts = if self.config.indexing.include_page_text {
            match extract_page_texts(&doc.path).await {
                Ok(texts) => texts,
                Err(e) => {
                    warn!(document_id, error = %e, "page text extraction failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        // Detect regions page by page. A failing page is skipped.
        let total_pages = pages.len() as u64;
        let mut regions = Vec::new();
        for page in &pages {
            if cancel.is_cancelled() {
                return Err(self
                    .fail_document(document_id, progress, anyhow!("ingestion cancelled"))
                    .await);
            }
            progress.report(IngestProgressEvent::Detecting {
                document_id: document_id.to_string(),
                page: page.page_number as u64,
                total_pages,
            });
            let resolved = match self.detector.detect(page).await {
                Ok(output) => detect::resolve_regions(
                    output,
                    page.page_number,
                    page.width(),
                    page.height(),
                    &self.config.detection,
                ),
                Err(e) => Err(e),
            };
            match resolved {
                Ok(mut page_regions) => regions.append(&mut page_regions),
                Err(e) => {
                    let err = StageError::Detection {
                        page: page.page_number,
                        message: e.to_string(),
                    };
                    warn!(document_id, error = %err, "skipping page");
                }
            }
        }
        let regions_detected = regions.len();
        document::set_region_counters(&self.pool, document_id, regions_detected as i64, 0, 0)
            .await?;
        self.advance(document_id, progress, DocumentStatus::Detected)
            .await?;

        // Crop each region out of its page. A failing region is counted
        // and skipped; it never reaches summarization. Crops are derived
        // state, so a rebuild starts from an empty directory.
        let crops_dir = self.config.storage.crops_dir(document_id);
        reset_dir(&crops_dir)
            .await
            .with_context(|| format!("Failed to reset crop directory {}", crops_dir.display()))?;

        let mut crops = Vec::new();
        let mut regions_failed = 0usize;
        for region in &regions {
            let page = region
                .page_number
                .checked_sub(1)
                .and_then(|i| pages.get(i as usize));
            let cropped = match page {
                Some(page) => crop::crop_region(page, region, &crops_dir),
                None => Err(anyhow!("region references a missing page")),
            };
            match cropped {
                Ok(cropped) => crops.push(cropped),
                Err(e) => {
                    let err = StageError::Crop {
                        page: region.page_number,
                        region: region.region_index,
                        message: e.to_string(),
                    };
                    warn!(document_id, error = %err, "skipping region");
                    regions_failed += 1;
                }
            }
        }
        document::set_region_counters(
            &self.pool,
            document_id,
            regions_detected as i64,
            0,
            regions_failed as i64,
        )
        .await?;
        self.advance(document_id, progress, DocumentStatus::Cropped)
            .await?;

        // Summarize crops with the bounded pool. Individual failures are
        // tolerated; the batch result is deterministic and ordered.
        let deadline = self
            .config
            .ingest
            .deadline_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let total_crops = crops.len();
        let outcomes = summarize_all(
            self.summarizer.clone(),
            crops,
            self.config.summarizer.pool_size,
            cancel.clone(),
            deadline,
        )
        .await;
        if cancel.is_cancelled() {
            return Err(self
                .fail_document(document_id, progress, anyhow!("ingestion cancelled"))
                .await);
        }

        let regions_summarized = outcomes.iter().filter(|o| o.succeeded()).count();
        regions_failed += total_crops - regions_summarized;
        progress.report(IngestProgressEvent::Summarizing {
            document_id: document_id.to_string(),
            completed: regions_summarized as u64,
            total: total_crops as u64,
        });
        document::set_region_counters(
            &self.pool,
            document_id,
            regions_detected as i64,
            regions_summarized as i64,
            regions_failed as i64,
        )
        .await?;
        if total_crops > 0 && regions_summarized == 0 {
            let err = StageError::AllSummarizationsFailed {
                regions: total_crops,
            };
            return Err(self.fail_document(document_id, progress, err.into()).await);
        }
        self.advance(document_id, progress, DocumentStatus::Summarized)
            .await?;

        // Assemble index entries: table summaries first, then page text.
        let mut entries: Vec<NewEntry> = index::entries_from_outcomes(&outcomes);
        for (i, text) in page_texts.iter().enumerate() {
            for chunk in chunk_text(
                text,
                self.config.indexing.chunk_tokens,
                self.config.indexing.chunk_overlap,
            ) {
                entries.push(index::entry_from_chunk(i as u32 + 1, chunk));
            }
        }

        let entries_indexed =
            match index::build_index(&self.pool, self.embedder.as_ref(), document_id, entries)
                .await
            {
                Ok(count) => count,
                Err(e) => {
                    let err = StageError::IndexBuild(e.to_string());
                    return Err(self.fail_document(document_id, progress, err.into()).await);
                }
            };
        self.advance(document_id, progress, DocumentStatus::Indexed)
            .await?;
        self.advance(document_id, progress, DocumentStatus::Ready)
            .await?;

        debug!(
            document_id,
            pages = pages.len(),
            regions_detected,
            regions_summarized,
            regions_failed,
            entries_indexed,
            "ingestion complete"
        );
        Ok(IngestOutcome {
            document_id: document_id.to_string(),
            pages: pages.len(),
            regions_detected,
            regions_summarized,
            regions_failed,
            entries_indexed,
        })
    }

    /// Answer a question against a `ready` document.
    pub async fn answer(
        &self,
        document_id: &str,
        question: &str,
        history: &[ChatTurn],
    ) -> Result<Answer> {
        query::answer_question(
            &self.pool,
            self.embedder.as_ref(),
            self.synthesizer.as_ref(),
            document_id,
            question,
            history,
            self.config.retrieval.top_k,
        )
        .await
    }

    async fn advance(
        &self,
        document_id: &str,
        progress: &dyn IngestProgressReporter,
        status: DocumentStatus,
    ) -> Result<()> {
        document::update_status(&self.pool, document_id, status).await?;
        progress.report(IngestProgressEvent::StageChanged {
            document_id: document_id.to_string(),
            status,
        });
        Ok(())
    }

    /// Record a terminal failure on the document row and hand the error
    /// back for propagation.
    async fn fail_document(
        &self,
        document_id: &str,
        progress: &dyn IngestProgressReporter,
        err: anyhow::Error,
    ) -> anyhow::Error {
        let reason = err.to_string();
        if let Err(db_err) = document::mark_failed(&self.pool, document_id, &reason).await {
            warn!(document_id, error = %db_err, "failed to record failure reason");
        }
        progress.report(IngestProgressEvent::Failed {
            document_id: document_id.to_string(),
            reason,
        });
        err
    }
}

/// Recreate `dir` empty, removing whatever a prior run left there.
async fn reset_dir(dir: &std::path::Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

/// Extract per-page text from the PDF, split on form feeds. Runs on a
/// blocking thread.
async fn extract_page_texts(path: &str) -> Result<Vec<String>> {
    let path = path.to_string();
    tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read document at {}", path))?;
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| anyhow!("Failed to extract text: {}", e))?;
        Ok(text.split('\x0C').map(str::to_string).collect())
    })
    .await?
}
