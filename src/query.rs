//! Query engine.
//!
//! Embeds the question with the same provider used at build time, ranks the
//! document's entries by cosine similarity, and synthesizes an answer from
//! the top matches only. Citations come straight from the retrieved table
//! entries (deduplicated by image path, retrieval order preserved), so every
//! citation resolves to a crop the retrieval step actually saw.

use anyhow::{anyhow, Result};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::document;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, EmbeddingProvider};
use crate::error::StageError;
use crate::models::{
    Answer, ChatTurn, Citation, DocumentStatus, EntryKind, IndexEntry, RetrievedEntry,
};
use crate::synthesis::Synthesizer;

/// Retrieve the `top_k` entries most similar to the question.
///
/// Fails with [`StageError::EmptyIndex`] before spending an embedding call
/// when the document has no entries at all.
pub async fn retrieve(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    document_id: &str,
    question: &str,
    top_k: i64,
) -> Result<Vec<RetrievedEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT e.id, e.document_id, e.kind, e.page_number, e.region_index,
               e.text, e.image_path, e.confidence, v.embedding
        FROM index_entries e
        JOIN index_vectors v ON v.entry_id = e.id
        WHERE e.document_id = ?
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Err(StageError::EmptyIndex(document_id.to_string()).into());
    }

    let query_vec = embed_query(embedder, question).await?;

    let mut scored: Vec<RetrievedEntry> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            RetrievedEntry {
                entry: row_to_entry(row),
                score: cosine_similarity(&query_vec, &vector) as f64,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(top_k.max(0) as usize);

    debug!(
        document_id,
        retrieved = scored.len(),
        "retrieval complete"
    );
    Ok(scored)
}

/// Grounding context assembled from the retrieved entries, in rank order.
pub fn build_context(retrieved: &[RetrievedEntry]) -> String {
    let mut context = String::new();
    for r in retrieved {
        context.push_str("\n--- Source ---\n");
        context.push_str(&r.entry.text);
        context.push('\n');
    }
    context
}

/// Citations for the retrieved table entries, deduplicated by image path
/// with retrieval order preserved. Text entries carry no citation.
pub fn citations_from(retrieved: &[RetrievedEntry]) -> Vec<Citation> {
    let mut seen = std::collections::HashSet::new();
    let mut citations = Vec::new();

    for r in retrieved {
        let entry = &r.entry;
        if entry.kind != EntryKind::Table {
            continue;
        }
        let (path, confidence) = match (&entry.image_path, entry.confidence) {
            (Some(path), Some(confidence)) => (path, confidence),
            _ => continue,
        };
        if !seen.insert(path.clone()) {
            continue;
        }
        citations.push(Citation {
            entry_id: entry.id.clone(),
            page_number: entry.page_number,
            image_path: path.clone(),
            confidence,
        });
    }

    citations
}

/// Answer a question against one document's index.
///
/// Only `ready` documents accept queries; everything else gets a typed
/// rejection. The answer's citations are a subset of the retrieved set.
#[allow(clippy::too_many_arguments)]
pub async fn answer_question(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    synthesizer: &dyn Synthesizer,
    document_id: &str,
    question: &str,
    history: &[ChatTurn],
    top_k: i64,
) -> Result<Answer> {
    let doc = document::get_document(pool, document_id)
        .await?
        .ok_or_else(|| anyhow!("Unknown document: {}", document_id))?;
    if doc.status != DocumentStatus::Ready {
        return Err(StageError::NotReady {
            id: doc.id,
            status: doc.status.to_string(),
        }
        .into());
    }

    let retrieved = retrieve(pool, embedder, document_id, question, top_k).await?;
    let context = build_context(&retrieved);
    let citations = citations_from(&retrieved);

    let text = synthesizer
        .synthesize(question, &context, history)
        .await
        .map_err(|e| StageError::Synthesis(e.to_string()))?;

    Ok(Answer { text, citations })
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> IndexEntry {
    let kind_str: String = row.get("kind");
    IndexEntry {
        id: row.get("id"),
        document_id: row.get("document_id"),
        kind: EntryKind::parse(&kind_str).unwrap_or(EntryKind::Text),
        page_number: row.get("page_number"),
        region_index: row.get("region_index"),
        text: row.get("text"),
        image_path: row.get("image_path"),
        confidence: row.get("confidence"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::index::{self, NewEntry};
    use crate::{db, migrate};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Embedder whose axes are keyword indicators, making similarity between
    /// a question and the entry sharing its keyword maximal.
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

    struct EchoSynthesizer;

    #[async_trait]
    impl Synthesizer for EchoSynthesizer {
        async fn synthesize(
            &self,
            question: &str,
            context: &str,
            _history: &[ChatTurn],
        ) -> Result<String> {
            Ok(format!("Q: {} / sources: {}", question, context.matches("--- Source ---").count()))
        }
    }

    async fn test_pool(dir: &TempDir) -> SqlitePool {
        let config: Config =
            toml::from_str(&format!("[storage]\nroot = {:?}\n", dir.path())).unwrap();
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO documents (
                id, file_name, path, sha256, status, created_at, updated_at
            )
            VALUES ('doc-1', 'doc-1.pdf', '/tmp/doc-1.pdf', 'sha-doc-1', 'ready', ?, ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn table_entry(page: i64, region: i64, text: &str, image_path: &str) -> NewEntry {
        NewEntry {
            kind: EntryKind::Table,
            page_number: page,
            region_index: Some(region),
            text: text.to_string(),
            image_path: Some(image_path.to_string()),
            confidence: Some(0.9),
        }
    }

    #[tokio::test]
    async fn test_empty_index_is_a_typed_error() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;

        let err = retrieve(&pool, &KeywordEmbedder, "doc-1", "revenue?", 5)
            .await
            .unwrap_err();
        match err.downcast_ref::<StageError>() {
            Some(StageError::EmptyIndex(id)) => assert_eq!(id, "doc-1"),
            other => panic!("expected EmptyIndex, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retrieval_ranks_matching_entry_first() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        index::build_index(
            &pool,
            &KeywordEmbedder,
            "doc-1",
            vec![
                table_entry(1, 1, "Total revenue by segment", "/c/p1_table_1.png"),
                table_entry(2, 1, "Gross margin by quarter", "/c/p2_table_1.png"),
                table_entry(3, 1, "Headcount by region", "/c/p3_table_1.png"),
            ],
        )
        .await
        .unwrap();

        let top = retrieve(&pool, &KeywordEmbedder, "doc-1", "What was the margin?", 2)
            .await
            .unwrap();
        assert_eq!(top.len(), 2);
        assert!(top[0].entry.text.contains("margin"));
        assert!(top[0].score > top[1].score);
    }

    #[tokio::test]
    async fn test_top_k_truncates() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let entries: Vec<NewEntry> = (1..=6)
            .map(|i| table_entry(i, 1, "revenue everywhere", &format!("/c/p{}_table_1.png", i)))
            .collect();
        index::build_index(&pool, &KeywordEmbedder, "doc-1", entries)
            .await
            .unwrap();

        let top = retrieve(&pool, &KeywordEmbedder, "doc-1", "revenue", 3)
            .await
            .unwrap();
        assert_eq!(top.len(), 3);
    }

    #[test]
    fn test_context_blocks_in_rank_order() {
        let retrieved = vec![
            RetrievedEntry {
                entry: IndexEntry {
                    id: "e1".into(),
                    document_id: "d".into(),
                    kind: EntryKind::Table,
                    page_number: 1,
                    region_index: Some(1),
                    text: "First block".into(),
                    image_path: Some("/c/a.png".into()),
                    confidence: Some(0.9),
                },
                score: 0.9,
            },
            RetrievedEntry {
                entry: IndexEntry {
                    id: "e2".into(),
                    document_id: "d".into(),
                    kind: EntryKind::Text,
                    page_number: 2,
                    region_index: None,
                    text: "Second block".into(),
                    image_path: None,
                    confidence: None,
                },
                score: 0.5,
            },
        ];

        let context = build_context(&retrieved);
        assert_eq!(context.matches("--- Source ---").count(), 2);
        let first = context.find("First block").unwrap();
        let second = context.find("Second block").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_citations_dedup_and_skip_text_entries() {
        let entry = |id: &str, kind: EntryKind, path: Option<&str>| RetrievedEntry {
            entry: IndexEntry {
                id: id.into(),
                document_id: "d".into(),
                kind,
                page_number: 1,
                region_index: Some(1),
                text: "t".into(),
                image_path: path.map(str::to_string),
                confidence: path.map(|_| 0.8),
            },
            score: 0.5,
        };

        let retrieved = vec![
            entry("e1", EntryKind::Table, Some("/c/p1_table_1.png")),
            entry("e2", EntryKind::Text, None),
            entry("e3", EntryKind::Table, Some("/c/p1_table_1.png")), // duplicate path
            entry("e4", EntryKind::Table, Some("/c/p2_table_1.png")),
        ];

        let citations = citations_from(&retrieved);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].entry_id, "e1");
        assert_eq!(citations[1].image_path, "/c/p2_table_1.png");

        // Soundness: every citation points at a retrieved entry.
        for citation in &citations {
            assert!(retrieved.iter().any(|r| r.entry.id == citation.entry_id));
        }
    }

    #[tokio::test]
    async fn test_non_ready_document_rejected() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"pdf bytes").unwrap();
        let doc = document::register_document(&pool, &path).await.unwrap();

        let err = answer_question(
            &pool,
            &KeywordEmbedder,
            &EchoSynthesizer,
            &doc.id,
            "revenue?",
            &[],
            5,
        )
        .await
        .unwrap_err();

        match err.downcast_ref::<StageError>() {
            Some(StageError::NotReady { status, .. }) => assert_eq!(status, "uploaded"),
            other => panic!("expected NotReady, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ready_document_answers_with_citations() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"pdf bytes").unwrap();
        let doc = document::register_document(&pool, &path).await.unwrap();

        index::build_index(
            &pool,
            &KeywordEmbedder,
            &doc.id,
            vec![table_entry(1, 1, "Total revenue table", "/c/p1_table_1.png")],
        )
        .await
        .unwrap();
        document::update_status(&pool, &doc.id, DocumentStatus::Ready)
            .await
            .unwrap();

        let answer = answer_question(
            &pool,
            &KeywordEmbedder,
            &EchoSynthesizer,
            &doc.id,
            "What was revenue?",
            &[],
            5,
        )
        .await
        .unwrap();

        assert!(answer.text.contains("sources: 1"));
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].page_number, 1);
    }
}
