//! Document registry.
//!
//! Documents are registered by path with a SHA-256 content hash and a stable
//! UUID. Re-registering the same path reuses the id, resets the status to
//! `uploaded`, and clears prior derived state so re-ingestion starts from a
//! clean slate. Status, failure reason, page count, and the region counters
//! live on the document row.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

use crate::models::{DocumentRecord, DocumentStatus};

/// Register a document by path, hashing its current content. Reuses the
/// existing row (and id) when the path was registered before.
pub async fn register_document(pool: &SqlitePool, path: &Path) -> Result<DocumentRecord> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read document {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = format!("{:x}", hasher.finalize());

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let path_str = path.to_string_lossy().into_owned();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO documents (
            id, file_name, path, sha256, page_count, status, status_reason,
            regions_detected, regions_summarized, regions_failed,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, 0, ?, NULL, 0, 0, 0, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            file_name = excluded.file_name,
            sha256 = excluded.sha256,
            page_count = 0,
            status = excluded.status,
            status_reason = NULL,
            regions_detected = 0,
            regions_summarized = 0,
            regions_failed = 0,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&file_name)
    .bind(&path_str)
    .bind(&sha256)
    .bind(DocumentStatus::Uploaded.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_document_by_path(pool, &path_str)
        .await?
        .context("Document row missing after registration")
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<DocumentRecord>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| row_to_document(&r)))
}

pub async fn get_document_by_path(
    pool: &SqlitePool,
    path: &str,
) -> Result<Option<DocumentRecord>> {
    let row = sqlx::query("SELECT * FROM documents WHERE path = ?")
        .bind(path)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| row_to_document(&r)))
}

pub async fn list_documents(pool: &SqlitePool) -> Result<Vec<DocumentRecord>> {
    let rows = sqlx::query("SELECT * FROM documents ORDER BY updated_at DESC, id")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_document).collect())
}

/// Advance the lifecycle state, clearing any stale failure reason.
pub async fn update_status(pool: &SqlitePool, id: &str, status: DocumentStatus) -> Result<()> {
    sqlx::query("UPDATE documents SET status = ?, status_reason = NULL, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Move the document to the terminal `failed` state with a reason.
pub async fn mark_failed(pool: &SqlitePool, id: &str, reason: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET status = ?, status_reason = ?, updated_at = ? WHERE id = ?")
        .bind(DocumentStatus::Failed.as_str())
        .bind(reason)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_page_count(pool: &SqlitePool, id: &str, page_count: i64) -> Result<()> {
    sqlx::query("UPDATE documents SET page_count = ?, updated_at = ? WHERE id = ?")
        .bind(page_count)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_region_counters(
    pool: &SqlitePool,
    id: &str,
    detected: i64,
    summarized: i64,
    failed: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE documents
        SET regions_detected = ?, regions_summarized = ?, regions_failed = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(detected)
    .bind(summarized)
    .bind(failed)
    .bind(chrono::Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> DocumentRecord {
    let status_str: String = row.get("status");
    DocumentRecord {
        id: row.get("id"),
        file_name: row.get("file_name"),
        path: row.get("path"),
        sha256: row.get("sha256"),
        page_count: row.get("page_count"),
        status: DocumentStatus::parse(&status_str).unwrap_or(DocumentStatus::Failed),
        status_reason: row.get("status_reason"),
        regions_detected: row.get("regions_detected"),
        regions_summarized: row.get("regions_summarized"),
        regions_failed: row.get("regions_failed"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
