//! Crop extraction.
//!
//! Writes one PNG per accepted region under the per-document crops directory.
//! Region boxes arrive as floats in the page's pixel space; they are snapped
//! outward to whole pixels (floor the origin, ceil the far corner) and clamped
//! to the page. A box that collapses to an empty rect after clamping is a
//! region-local failure: the region is dropped and logged, never retried.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::models::{BoundingBox, CroppedImage, DetectedRegion, PageImage};
use crate::raster::encode_png;

/// Integer crop rect in page pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Snap a float box outward to whole pixels and clamp it to the page.
pub fn pixel_rect(bbox: &BoundingBox, page_width: u32, page_height: u32) -> Result<PixelRect> {
    if page_width == 0 || page_height == 0 {
        bail!("Page has zero dimensions");
    }

    let x0 = (bbox.x0.floor().max(0.0) as u32).min(page_width);
    let y0 = (bbox.y0.floor().max(0.0) as u32).min(page_height);
    let x1 = (bbox.x1.ceil().max(0.0) as u32).min(page_width);
    let y1 = (bbox.y1.ceil().max(0.0) as u32).min(page_height);

    if x1 <= x0 || y1 <= y0 {
        bail!(
            "Region box [{:.1}, {:.1}, {:.1}, {:.1}] collapses to an empty rect on a {}x{} page",
            bbox.x0,
            bbox.y0,
            bbox.x1,
            bbox.y1,
            page_width,
            page_height
        );
    }

    Ok(PixelRect {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

/// File name for one region's crop, unique within a document.
pub fn crop_file_name(page_number: u32, region_index: u32) -> String {
    format!("p{}_table_{}.png", page_number, region_index)
}

/// Crop one detected region out of its page and persist it as a PNG.
pub fn crop_region(
    page: &PageImage,
    region: &DetectedRegion,
    crops_dir: &Path,
) -> Result<CroppedImage> {
    let rect = pixel_rect(&region.bbox, page.width(), page.height())?;
    let cropped = page
        .image
        .crop_imm(rect.x, rect.y, rect.width, rect.height);

    let path = crops_dir.join(crop_file_name(region.page_number, region.region_index));
    let png = encode_png(&cropped)?;
    std::fs::write(&path, png)
        .with_context(|| format!("Failed to write crop {}", path.display()))?;

    Ok(CroppedImage {
        region: region.clone(),
        path: path.to_string_lossy().into_owned(),
        width: rect.width,
        height: rect.height,
    })
}
