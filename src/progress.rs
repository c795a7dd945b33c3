//! Ingestion progress reporting.
//!
//! Reports observable progress while a document moves through the pipeline
//! so operators see which stage is running, how many pages or regions are
//! left, and when the document is queryable. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::models::DocumentStatus;

/// A single progress event for document ingestion.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// Document entered a new lifecycle stage.
    StageChanged {
        document_id: String,
        status: DocumentStatus,
    },
    /// Detection progress: pages scanned out of the page count.
    Detecting {
        document_id: String,
        page: u64,
        total_pages: u64,
    },
    /// Summarization progress: regions completed out of the batch size.
    Summarizing {
        document_id: String,
        completed: u64,
        total: u64,
    },
    /// Terminal failure with the recorded reason.
    Failed {
        document_id: String,
        reason: String,
    },
}

/// Reports ingestion progress. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the ingestion pipeline.
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "ingest <id>  detecting  12 / 120 pages".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::StageChanged {
                document_id,
                status,
            } => {
                format!("ingest {}  {}\n", document_id, status)
            }
            IngestProgressEvent::Detecting {
                document_id,
                page,
                total_pages,
            } => {
                format!(
                    "ingest {}  detecting  {} / {} pages\n",
                    document_id,
                    format_number(*page),
                    format_number(*total_pages)
                )
            }
            IngestProgressEvent::Summarizing {
                document_id,
                completed,
                total,
            } => {
                format!(
                    "ingest {}  summarizing  {} / {} regions\n",
                    document_id,
                    format_number(*completed),
                    format_number(*total)
                )
            }
            IngestProgressEvent::Failed {
                document_id,
                reason,
            } => {
                format!("ingest {}  failed: {}\n", document_id, reason)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::StageChanged {
                document_id,
                status,
            } => serde_json::json!({
                "event": "progress",
                "document": document_id,
                "phase": status.as_str()
            }),
            IngestProgressEvent::Detecting {
                document_id,
                page,
                total_pages,
            } => serde_json::json!({
                "event": "progress",
                "document": document_id,
                "phase": "detecting",
                "page": page,
                "total_pages": total_pages
            }),
            IngestProgressEvent::Summarizing {
                document_id,
                completed,
                total,
            } => serde_json::json!({
                "event": "progress",
                "document": document_id,
                "phase": "summarizing",
                "completed": completed,
                "total": total
            }),
            IngestProgressEvent::Failed {
                document_id,
                reason,
            } => serde_json::json!({
                "event": "progress",
                "document": document_id,
                "phase": "failed",
                "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}
