//! Index building.
//!
//! Embeds the batch of summaries and text chunks, then writes entries and
//! vectors in a single transaction that first clears the document's prior
//! entries. The write is all-or-nothing: embedding happens before the
//! transaction opens, so any failure (embedding or SQL) leaves the previous
//! index authoritative. Failed summaries never become entries.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::embedding::{vec_to_blob, EmbeddingProvider};
use crate::models::{EntryKind, SummaryOutcome};

/// An entry ready for embedding and insertion.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub kind: EntryKind,
    pub page_number: i64,
    pub region_index: Option<i64>,
    pub text: String,
    pub image_path: Option<String>,
    pub confidence: Option<f64>,
}

/// Table entries for the successful outcomes, preserving (page, region) order.
pub fn entries_from_outcomes(outcomes: &[SummaryOutcome]) -> Vec<NewEntry> {
    outcomes
        .iter()
        .filter_map(|outcome| {
            let text = outcome.text.as_ref()?;
            Some(NewEntry {
                kind: EntryKind::Table,
                page_number: outcome.crop.region.page_number as i64,
                region_index: Some(outcome.crop.region.region_index as i64),
                text: text.clone(),
                image_path: Some(outcome.crop.path.clone()),
                confidence: Some(outcome.crop.region.confidence as f64),
            })
        })
        .collect()
}

/// Text entry for one chunk of a page's digital text layer.
pub fn entry_from_chunk(page_number: u32, text: String) -> NewEntry {
    NewEntry {
        kind: EntryKind::Text,
        page_number: page_number as i64,
        region_index: None,
        text,
        image_path: None,
        confidence: None,
    }
}

/// Replace the document's index with `entries`, returning how many were
/// written. An empty batch still clears the prior index (re-ingestion
/// discards derived state); on error the prior index is untouched.
pub async fn build_index(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    document_id: &str,
    entries: Vec<NewEntry>,
) -> Result<usize> {
    let texts: Vec<String> = entries.iter().map(|e| e.text.clone()).collect();
    let vectors = if texts.is_empty() {
        Vec::new()
    } else {
        embedder
            .embed(&texts)
            .await
            .context("Failed to embed index entries")?
    };
    if vectors.len() != entries.len() {
        bail!(
            "Embedder returned {} vectors for {} entries",
            vectors.len(),
            entries.len()
        );
    }

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        DELETE FROM index_vectors
        WHERE entry_id IN (SELECT id FROM index_entries WHERE document_id = ?)
        "#,
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (entry, vector) in entries.iter().zip(vectors.iter()) {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO index_entries (
                id, document_id, kind, page_number, region_index,
                text, image_path, confidence, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(document_id)
        .bind(entry.kind.as_str())
        .bind(entry.page_number)
        .bind(entry.region_index)
        .bind(&entry.text)
        .bind(&entry.image_path)
        .bind(entry.confidence)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO index_vectors (entry_id, model, dims, embedding) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(embedder.model_name())
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(entries.len())
}
