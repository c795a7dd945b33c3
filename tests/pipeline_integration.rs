//! End-to-end tests for the ingestion pipeline and query engine.
//!
//! These tests run the real orchestration, storage, and index code with
//! scripted stage backends (rasterizer, detector, summarizer, embedder,
//! synthesizer) so every lifecycle path is exercised without a PDF renderer
//! or any model endpoint.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use image::DynamicImage;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use tablelens::config::Config;
use tablelens::detect::{DetectionOutput, RawDetection, RegionDetector};
use tablelens::document;
use tablelens::embedding::EmbeddingProvider;
use tablelens::error::StageError;
use tablelens::models::{BoundingBox, ChatTurn, CroppedImage, DocumentStatus, PageImage};
use tablelens::pipeline::Pipeline;
use tablelens::progress::NoProgress;
use tablelens::query;
use tablelens::raster::PageRasterizer;
use tablelens::summarize::{CancelToken, VisionSummarizer};
use tablelens::synthesis::Synthesizer;
use tablelens::{db, migrate};

// ─── Scripted stage backends ────────────────────────────────────────

/// Produces blank pages of a fixed size, standing in for the PDF renderer.
struct SyntheticRasterizer {
    pages: u32,
    width: u32,
    height: u32,
}

#[async_trait]
impl PageRasterizer for SyntheticRasterizer {
    async fn rasterize(&self, _path: &Path, _zoom: f32) -> Result<Vec<PageImage>> {
        Ok((1..=self.pages)
            .map(|page_number| PageImage {
                page_number,
                image: DynamicImage::new_rgba8(self.width, self.height),
            })
            .collect())
    }
}

/// Rasterizer that always fails, as a broken or unreadable PDF would.
struct FailingRasterizer;

#[async_trait]
impl PageRasterizer for FailingRasterizer {
    async fn rasterize(&self, _path: &Path, _zoom: f32) -> Result<Vec<PageImage>> {
        Err(anyhow!("could not open document"))
    }
}

/// Returns a fixed set of detections per page, reported in an inference
/// space at half the page resolution so the rescale path is exercised.
struct ScriptedDetector {
    per_page: HashMap<u32, Vec<RawDetection>>,
}

impl ScriptedDetector {
    fn new(per_page: HashMap<u32, Vec<RawDetection>>) -> Self {
        Self { per_page }
    }

    /// `regions` boxes per page on `pages` pages, at staggered positions.
    fn uniform(pages: u32, regions: usize) -> Self {
        let mut per_page = HashMap::new();
        for page in 1..=pages {
            per_page.insert(page, (0..regions).map(slot_detection).collect());
        }
        Self { per_page }
    }
}

/// Non-overlapping detection boxes in inference space, highest confidence
/// first so slot order matches the final region index order.
fn slot_detection(slot: usize) -> RawDetection {
    let y0 = 10.0 + 70.0 * slot as f32;
    RawDetection {
        bbox: BoundingBox::new(10.0, y0, 110.0, y0 + 50.0),
        confidence: 0.9 - 0.05 * slot as f32,
    }
}

#[async_trait]
impl RegionDetector for ScriptedDetector {
    async fn detect(&self, page: &PageImage) -> Result<DetectionOutput> {
        Ok(DetectionOutput {
            inference_width: page.width() / 2,
            inference_height: page.height() / 2,
            detections: self
                .per_page
                .get(&page.page_number)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// Summarizes by script: fixed text per (page, region), with an optional
/// failure list.
struct ScriptedSummarizer {
    fail: HashSet<(u32, u32)>,
    texts: HashMap<(u32, u32), String>,
}

impl ScriptedSummarizer {
    fn new() -> Self {
        Self {
            fail: HashSet::new(),
            texts: HashMap::new(),
        }
    }

    fn failing_on(fail: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self {
            fail: fail.into_iter().collect(),
            texts: HashMap::new(),
        }
    }

    fn with_text(mut self, page: u32, region: u32, text: &str) -> Self {
        self.texts.insert((page, region), text.to_string());
        self
    }
}

#[async_trait]
impl VisionSummarizer for ScriptedSummarizer {
    async fn summarize(&self, crop: &CroppedImage) -> Result<String> {
        let key = (crop.region.page_number, crop.region.region_index);
        if self.fail.contains(&key) {
            bail!("scripted failure for page {} region {}", key.0, key.1);
        }
        Ok(self.texts.get(&key).cloned().unwrap_or_else(|| {
            format!(
                "Table on page {} region {} lists operating figures.",
                key.0, key.1
            )
        }))
    }
}

/// Embedder whose axes are keyword indicators, so a question ranks the
/// entry sharing its keyword first. Deterministic and instant.
struct KeywordEmbedder;

const KEYWORDS: [&str; 3] = ["revenue", "margin", "headcount"];

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "fake-keyword"
    }

    fn dims(&self) -> usize {
        KEYWORDS.len() + 1
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                let mut v: Vec<f32> = KEYWORDS
                    .iter()
                    .map(|k| if lower.contains(k) { 1.0 } else { 0.0 })
                    .collect();
                v.push(0.1);
                v
            })
            .collect())
    }
}

/// Embedder that always fails, to force an index build failure.
struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn model_name(&self) -> &str {
        "fake-failing"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(anyhow!("embedding endpoint unreachable"))
    }
}

/// Echoes the grounding context back, so assertions can check that the
/// answer was built from retrieved entries only.
struct TemplateSynthesizer;

#[async_trait]
impl Synthesizer for TemplateSynthesizer {
    async fn synthesize(
        &self,
        question: &str,
        context: &str,
        _history: &[ChatTurn],
    ) -> Result<String> {
        Ok(format!("Answer to '{}' based on: {}", question, context))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir) -> Config {
    let content = format!(
        "[storage]\nroot = {:?}\n\n[indexing]\ninclude_page_text = false\n",
        tmp.path()
    );
    toml::from_str(&content).unwrap()
}

fn build_pipeline(
    config: Config,
    pool: sqlx::SqlitePool,
    rasterizer: Arc<dyn PageRasterizer>,
    detector: Arc<dyn RegionDetector>,
    summarizer: Arc<dyn VisionSummarizer>,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Pipeline {
    Pipeline::new(
        Arc::new(config),
        pool,
        rasterizer,
        detector,
        summarizer,
        embedder,
        Arc::new(TemplateSynthesizer),
    )
}

async fn setup(tmp: &TempDir) -> (Config, sqlx::SqlitePool, std::path::PathBuf) {
    let config = test_config(tmp);
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let pdf = tmp.path().join("report.pdf");
    std::fs::write(&pdf, b"%PDF-1.4 synthetic fixture").unwrap();
    (config, pool, pdf)
}

async fn entry_count(pool: &sqlx::SqlitePool, document_id: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM index_entries WHERE document_id = ?")
        .bind(document_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

// ─── Tests ──────────────────────────────────────────────────────────

/// A clean run walks the whole lifecycle and lands on `ready` with crops
/// on disk and one index entry per region.
#[tokio::test]
async fn test_full_ingestion_reaches_ready() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let pipeline = build_pipeline(
        config.clone(),
        pool.clone(),
        Arc::new(SyntheticRasterizer {
            pages: 2,
            width: 640,
            height: 480,
        }),
        Arc::new(ScriptedDetector::uniform(2, 2)),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    let outcome = pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();

    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.regions_detected, 4);
    assert_eq!(outcome.regions_summarized, 4);
    assert_eq!(outcome.regions_failed, 0);
    assert_eq!(outcome.entries_indexed, 4);

    let doc = document::get_document(&pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Ready);
    assert_eq!(doc.page_count, 2);
    assert_eq!(doc.regions_detected, 4);
    assert_eq!(doc.regions_summarized, 4);
    assert_eq!(doc.regions_failed, 0);

    let crops_dir = config.storage.crops_dir(&doc.id);
    for page in 1..=2 {
        for region in 1..=2 {
            let crop = crops_dir.join(format!("p{}_table_{}.png", page, region));
            assert!(crop.exists(), "missing crop {}", crop.display());
        }
    }
}

/// The saved crop's pixel size equals the detection box rescaled from
/// inference space into the page's coordinate space.
#[tokio::test]
async fn test_crop_dimensions_match_rescaled_box() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    // Page 640x480, inference 320x240, so both axes scale by 2.
    let mut per_page = HashMap::new();
    per_page.insert(
        1,
        vec![RawDetection {
            bbox: BoundingBox::new(10.0, 10.0, 110.0, 60.0),
            confidence: 0.9,
        }],
    );
    let pipeline = build_pipeline(
        config.clone(),
        pool.clone(),
        Arc::new(SyntheticRasterizer {
            pages: 1,
            width: 640,
            height: 480,
        }),
        Arc::new(ScriptedDetector::new(per_page)),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();

    let crop_path = config.storage.crops_dir(&doc.id).join("p1_table_1.png");
    let saved = image::open(&crop_path).unwrap();
    // (10,10)-(110,60) scaled by 2 is (20,20)-(220,120): 200x100 pixels.
    assert_eq!(saved.width(), 200);
    assert_eq!(saved.height(), 100);
}

/// Region-local summarization failures are absorbed: the batch finishes,
/// the document becomes `ready`, and only the successes are indexed.
#[tokio::test]
async fn test_partial_summary_failures_still_ready() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let failures = [(1u32, 1u32), (3, 2), (5, 1)];
    let pipeline = build_pipeline(
        config,
        pool.clone(),
        Arc::new(SyntheticRasterizer {
            pages: 5,
            width: 640,
            height: 480,
        }),
        Arc::new(ScriptedDetector::uniform(5, 2)),
        Arc::new(ScriptedSummarizer::failing_on(failures)),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    let outcome = pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();

    assert_eq!(outcome.regions_detected, 10);
    assert_eq!(outcome.regions_summarized, 7);
    assert_eq!(outcome.regions_failed, 3);
    assert_eq!(outcome.entries_indexed, 7);

    let doc = document::get_document(&pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Ready);
    assert_eq!(doc.regions_summarized, 7);
    assert_eq!(doc.regions_failed, 3);

    // Failed regions have no entries, so they can never be cited.
    let answer = pipeline
        .answer(&doc.id, "What figures are listed?", &[])
        .await
        .unwrap();
    for citation in &answer.citations {
        for (page, region) in failures {
            assert!(!citation
                .image_path
                .ends_with(&format!("p{}_table_{}.png", page, region)));
        }
    }
}

/// When regions were detected but every summary fails, the run aborts and
/// the document lands in `failed` with the counters recorded.
#[tokio::test]
async fn test_total_summary_failure_marks_failed() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let all: Vec<(u32, u32)> = (1..=2).flat_map(|p| [(p, 1), (p, 2)]).collect();
    let pipeline = build_pipeline(
        config,
        pool.clone(),
        Arc::new(SyntheticRasterizer {
            pages: 2,
            width: 640,
            height: 480,
        }),
        Arc::new(ScriptedDetector::uniform(2, 2)),
        Arc::new(ScriptedSummarizer::failing_on(all)),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    let err = pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StageError>(),
        Some(StageError::AllSummarizationsFailed { regions: 4 })
    ));

    let doc = document::get_document(&pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert_eq!(doc.regions_detected, 4);
    assert_eq!(doc.regions_summarized, 0);
    assert_eq!(doc.regions_failed, 4);

    // A failed document rejects queries instead of degrading.
    let err = pipeline
        .answer(&doc.id, "What was revenue?", &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StageError>(),
        Some(StageError::NotReady { .. })
    ));
}

/// A document with no detected regions still becomes `ready`; querying its
/// empty index reports that instead of returning an empty answer.
#[tokio::test]
async fn test_no_regions_yields_empty_index_error() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let pipeline = build_pipeline(
        config,
        pool.clone(),
        Arc::new(SyntheticRasterizer {
            pages: 2,
            width: 640,
            height: 480,
        }),
        Arc::new(ScriptedDetector::new(HashMap::new())),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    let outcome = pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(outcome.regions_detected, 0);
    assert_eq!(outcome.entries_indexed, 0);

    let doc = document::get_document(&pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Ready);

    let err = pipeline
        .answer(&doc.id, "What was revenue?", &[])
        .await
        .unwrap_err();
    match err.downcast_ref::<StageError>() {
        Some(StageError::EmptyIndex(id)) => assert_eq!(id, &doc.id),
        other => panic!("expected EmptyIndex, got {:?}", other),
    }
}

/// Every citation in an answer points at a crop file that exists on disk.
#[tokio::test]
async fn test_citations_resolve_on_disk() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let pipeline = build_pipeline(
        config,
        pool,
        Arc::new(SyntheticRasterizer {
            pages: 3,
            width: 640,
            height: 480,
        }),
        Arc::new(ScriptedDetector::uniform(3, 1)),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();

    let answer = pipeline
        .answer(&doc.id, "What do the tables show?", &[])
        .await
        .unwrap();
    assert!(!answer.citations.is_empty());
    for citation in &answer.citations {
        assert!(
            Path::new(&citation.image_path).exists(),
            "citation does not resolve: {}",
            citation.image_path
        );
    }
}

/// Citations are a subset of the retrieved entries; nothing outside the
/// retrieval result is ever cited.
#[tokio::test]
async fn test_citations_subset_of_retrieved() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let top_k = config.retrieval.top_k;
    let pipeline = build_pipeline(
        config,
        pool.clone(),
        Arc::new(SyntheticRasterizer {
            pages: 5,
            width: 640,
            height: 480,
        }),
        Arc::new(ScriptedDetector::uniform(5, 2)),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    let outcome = pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(outcome.entries_indexed, 10);

    let question = "What figures are listed?";
    let retrieved = query::retrieve(&pool, &KeywordEmbedder, &doc.id, question, top_k)
        .await
        .unwrap();
    let retrieved_ids: HashSet<String> =
        retrieved.iter().map(|r| r.entry.id.clone()).collect();

    let answer = pipeline.answer(&doc.id, question, &[]).await.unwrap();
    assert!(answer.citations.len() <= retrieved.len());
    for citation in &answer.citations {
        assert!(
            retrieved_ids.contains(&citation.entry_id),
            "citation {} not in the retrieved set",
            citation.entry_id
        );
    }
}

/// Re-ingesting a document replaces its index rather than appending to it.
#[tokio::test]
async fn test_reingestion_replaces_index() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let pipeline = build_pipeline(
        config,
        pool.clone(),
        Arc::new(SyntheticRasterizer {
            pages: 3,
            width: 640,
            height: 480,
        }),
        Arc::new(ScriptedDetector::uniform(3, 1)),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(entry_count(&pool, &doc.id).await, 3);

    // Same path registers to the same id and re-runs the pipeline.
    let doc2 = pipeline.upload(&pdf).await.unwrap();
    assert_eq!(doc2.id, doc.id);
    pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(entry_count(&pool, &doc.id).await, 3);
}

/// Crops are derived state: re-ingesting with fewer detections leaves no
/// orphaned crop files from the prior run in the document's directory.
#[tokio::test]
async fn test_reingestion_discards_prior_crops() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let rasterizer = Arc::new(SyntheticRasterizer {
        pages: 1,
        width: 640,
        height: 480,
    });

    let first = build_pipeline(
        config.clone(),
        pool.clone(),
        rasterizer.clone(),
        Arc::new(ScriptedDetector::uniform(1, 2)),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );
    let doc = first.upload(&pdf).await.unwrap();
    first
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();

    let crops_dir = config.storage.crops_dir(&doc.id);
    assert!(crops_dir.join("p1_table_1.png").exists());
    assert!(crops_dir.join("p1_table_2.png").exists());

    // Second run detects only one region on the same page.
    let second = build_pipeline(
        config.clone(),
        pool.clone(),
        rasterizer,
        Arc::new(ScriptedDetector::uniform(1, 1)),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );
    second.upload(&pdf).await.unwrap();
    second
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();

    assert!(crops_dir.join("p1_table_1.png").exists());
    assert!(
        !crops_dir.join("p1_table_2.png").exists(),
        "crop from the prior ingestion survived the rebuild"
    );
    assert_eq!(entry_count(&pool, &doc.id).await, 1);
}

/// The headline flow: ask about revenue, get the revenue figure back, with
/// the first citation pointing at the exact crop of the revenue table.
#[tokio::test]
async fn test_revenue_question_cites_revenue_table() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let summarizer = ScriptedSummarizer::new()
        .with_text(1, 1, "Gross margin held near 44 percent across segments.")
        .with_text(
            2,
            1,
            "Revenue table: total revenue was 385.6B in FY2024 and 383.3B in FY2023.",
        )
        .with_text(3, 1, "Headcount by region grew modestly year over year.");
    let pipeline = build_pipeline(
        config,
        pool,
        Arc::new(SyntheticRasterizer {
            pages: 3,
            width: 640,
            height: 480,
        }),
        Arc::new(ScriptedDetector::uniform(3, 1)),
        Arc::new(summarizer),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();

    let answer = pipeline
        .answer(&doc.id, "What was total revenue in FY2024?", &[])
        .await
        .unwrap();

    assert!(answer.text.contains("385.6B"), "answer: {}", answer.text);
    assert_eq!(answer.citations[0].page_number, 2);
    assert!(answer.citations[0].image_path.ends_with("p2_table_1.png"));
}

/// A document that cannot be rasterized fails fatally with the reason
/// recorded on the row.
#[tokio::test]
async fn test_failed_rasterization_marks_failed() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let pipeline = build_pipeline(
        config,
        pool.clone(),
        Arc::new(FailingRasterizer),
        Arc::new(ScriptedDetector::uniform(1, 1)),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    let err = pipeline
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StageError>(),
        Some(StageError::DocumentLoad(_))
    ));

    let doc = document::get_document(&pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    let reason = doc.status_reason.unwrap();
    assert!(reason.contains("could not open document"), "{}", reason);
}

/// A failed index build marks the document failed but leaves the previous
/// index intact.
#[tokio::test]
async fn test_failed_index_build_retains_prior_index() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let rasterizer = Arc::new(SyntheticRasterizer {
        pages: 3,
        width: 640,
        height: 480,
    });
    let detector = Arc::new(ScriptedDetector::uniform(3, 1));

    let good = build_pipeline(
        config.clone(),
        pool.clone(),
        rasterizer.clone(),
        detector.clone(),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );
    let doc = good.upload(&pdf).await.unwrap();
    good.ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(entry_count(&pool, &doc.id).await, 3);

    let broken = build_pipeline(
        config,
        pool.clone(),
        rasterizer,
        detector,
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(FailingEmbedder),
    );
    broken.upload(&pdf).await.unwrap();
    let err = broken
        .ingest(&doc.id, CancelToken::new(), &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StageError>(),
        Some(StageError::IndexBuild(_))
    ));

    let record = document::get_document(&pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(record.status, DocumentStatus::Failed);
    assert_eq!(entry_count(&pool, &doc.id).await, 3);
}

/// Cancelling before the run aborts ingestion and records the reason.
#[tokio::test]
async fn test_cancelled_ingestion_marks_failed() {
    let tmp = TempDir::new().unwrap();
    let (config, pool, pdf) = setup(&tmp).await;
    let pipeline = build_pipeline(
        config,
        pool.clone(),
        Arc::new(SyntheticRasterizer {
            pages: 2,
            width: 640,
            height: 480,
        }),
        Arc::new(ScriptedDetector::uniform(2, 1)),
        Arc::new(ScriptedSummarizer::new()),
        Arc::new(KeywordEmbedder),
    );

    let doc = pipeline.upload(&pdf).await.unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = pipeline
        .ingest(&doc.id, cancel, &NoProgress)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "ingestion cancelled");

    let doc = document::get_document(&pool, &doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert_eq!(doc.status_reason.as_deref(), Some("ingestion cancelled"));
}
