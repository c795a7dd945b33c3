//! Typed pipeline errors with their blast radius.
//!
//! Stage internals use `anyhow` freely; failures that cross a stage boundary
//! are wrapped in [`StageError`] so callers can tell a fatal document problem
//! from an absorbable page- or region-local one.

/// Failure raised by one pipeline stage or by the query path.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The document could not be opened or rendered at all.
    #[error("document load failed: {0}")]
    DocumentLoad(String),

    /// Detection failed for one page; the page contributes zero regions.
    #[error("detection failed on page {page}: {message}")]
    Detection { page: u32, message: String },

    /// One region's crop could not be produced or written.
    #[error("crop failed on page {page}, region {region}: {message}")]
    Crop { page: u32, region: u32, message: String },

    /// One region's summary failed after retry exhaustion.
    #[error("summarization failed on page {page}, region {region}: {message}")]
    Summarization { page: u32, region: u32, message: String },

    /// Every region's summary failed; with regions present this aborts the run.
    #[error("summarization failed for all {regions} regions")]
    AllSummarizationsFailed { regions: usize },

    /// The index transaction failed; the prior index remains authoritative.
    #[error("index build failed: {0}")]
    IndexBuild(String),

    /// The document has no index entries to retrieve from.
    #[error("index for document {0} is empty")]
    EmptyIndex(String),

    /// The answer model failed after retries; the index is unaffected.
    #[error("answer synthesis failed: {0}")]
    Synthesis(String),

    /// The document is not in a queryable state.
    #[error("document {id} is not ready for queries (status: {status})")]
    NotReady { id: String, status: String },
}

/// How far a [`StageError`] reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Aborts the whole ingestion run.
    Fatal,
    /// Absorbed; the affected page yields no regions.
    Page,
    /// Absorbed; the affected region is counted as failed.
    Region,
    /// Aborts index building; prior index entries survive.
    Batch,
    /// Fails the current query only.
    Query,
}

impl StageError {
    pub fn scope(&self) -> ErrorScope {
        match self {
            StageError::DocumentLoad(_) | StageError::AllSummarizationsFailed { .. } => {
                ErrorScope::Fatal
            }
            StageError::Detection { .. } => ErrorScope::Page,
            StageError::Crop { .. } | StageError::Summarization { .. } => ErrorScope::Region,
            StageError::IndexBuild(_) => ErrorScope::Batch,
            StageError::EmptyIndex(_) | StageError::Synthesis(_) | StageError::NotReady { .. } => {
                ErrorScope::Query
            }
        }
    }
}
