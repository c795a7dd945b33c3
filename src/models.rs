//! Core data models used throughout tablelens.
//!
//! These types represent the pages, detected regions, crops, summaries, and
//! index entries that flow through the ingestion and retrieval pipeline.

use image::DynamicImage;

/// Axis-aligned box in pixel coordinates, `(x0, y0)` top-left inclusive,
/// `(x1, y1)` bottom-right exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Area of the overlap between two boxes, zero when disjoint.
    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let w = (self.x1.min(other.x1) - self.x0.max(other.x0)).max(0.0);
        let h = (self.y1.min(other.y1) - self.y0.max(other.y0)).max(0.0);
        w * h
    }

    /// Intersection-over-union in `[0, 1]`; zero when the union is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Rescale by independent horizontal/vertical factors (model space →
    /// native page pixel space).
    pub fn scale(&self, sx: f32, sy: f32) -> BoundingBox {
        BoundingBox {
            x0: self.x0 * sx,
            y0: self.y0 * sy,
            x1: self.x1 * sx,
            y1: self.y1 * sy,
        }
    }
}

/// One rasterized PDF page held in memory for the duration of an ingestion run.
pub struct PageImage {
    /// 1-based page number.
    pub page_number: u32,
    pub image: DynamicImage,
}

impl PageImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// A candidate table region that survived confidence filtering and
/// non-max suppression, in the page's native pixel space.
#[derive(Debug, Clone)]
pub struct DetectedRegion {
    /// 1-based page number.
    pub page_number: u32,
    /// 1-based index within the page, assigned confidence-descending.
    pub region_index: u32,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// A persisted crop of one detected region.
#[derive(Debug, Clone)]
pub struct CroppedImage {
    pub region: DetectedRegion,
    /// Absolute path of the PNG under the per-document crops directory.
    pub path: String,
    pub width: u32,
    pub height: u32,
}

/// Result of summarizing one crop: exactly one of `text` or `error` is set.
#[derive(Debug, Clone)]
pub struct SummaryOutcome {
    pub crop: CroppedImage,
    pub text: Option<String>,
    pub error: Option<String>,
}

impl SummaryOutcome {
    pub fn succeeded(&self) -> bool {
        self.text.is_some()
    }
}

/// Kind discriminator for index entries: visual table summaries carry a crop
/// citation, page-text chunks carry only a page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Table,
    Text,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Table => "table",
            EntryKind::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<EntryKind> {
        match s {
            "table" => Some(EntryKind::Table),
            "text" => Some(EntryKind::Text),
            _ => None,
        }
    }
}

/// Embedded, searchable unit stored in SQLite together with its vector.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: String,
    pub document_id: String,
    pub kind: EntryKind,
    /// 1-based page number the entry came from.
    pub page_number: i64,
    /// 1-based region index for table entries, absent for text chunks.
    pub region_index: Option<i64>,
    pub text: String,
    pub image_path: Option<String>,
    pub confidence: Option<f64>,
}

/// One ranked match from the retrieval step.
#[derive(Debug, Clone)]
pub struct RetrievedEntry {
    pub entry: IndexEntry,
    pub score: f64,
}

/// Pointer from an answer back to the source table image.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Citation {
    pub entry_id: String,
    pub page_number: i64,
    pub image_path: String,
    pub confidence: f64,
}

/// Synthesized response to one query.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
}

/// A prior conversation turn passed along with a query.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ChatTurn {
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
}

/// Ingestion lifecycle state. `Ready` is the only state that accepts queries;
/// `Failed` is terminal until the document is re-ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Uploaded,
    Rasterized,
    Detected,
    Cropped,
    Summarized,
    Indexed,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Rasterized => "rasterized",
            DocumentStatus::Detected => "detected",
            DocumentStatus::Cropped => "cropped",
            DocumentStatus::Summarized => "summarized",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<DocumentStatus> {
        match s {
            "uploaded" => Some(DocumentStatus::Uploaded),
            "rasterized" => Some(DocumentStatus::Rasterized),
            "detected" => Some(DocumentStatus::Detected),
            "cropped" => Some(DocumentStatus::Cropped),
            "summarized" => Some(DocumentStatus::Summarized),
            "indexed" => Some(DocumentStatus::Indexed),
            "ready" => Some(DocumentStatus::Ready),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered document row stored in SQLite.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub file_name: String,
    pub path: String,
    pub sha256: String,
    pub page_count: i64,
    pub status: DocumentStatus,
    /// Failure reason when `status` is `Failed`.
    pub status_reason: Option<String>,
    pub regions_detected: i64,
    pub regions_summarized: i64,
    pub regions_failed: i64,
    pub created_at: i64,
    pub updated_at: i64,
}
