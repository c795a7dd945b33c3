//! PDF page rasterization.
//!
//! Renders every page of a document to an in-memory raster image at a fixed
//! zoom factor (2.0 ≈ 144 DPI) via Pdfium. Rendering happens on a blocking
//! thread; the resulting [`PageImage`]s feed detection and cropping, both of
//! which work in this native pixel space.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::{PdfRenderConfig, Pdfium, PdfiumError};
use std::path::{Path, PathBuf};

use crate::models::PageImage;

/// Trait for page rasterizers.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Render every page of the document at the given zoom factor, in page
    /// order. Failure here is fatal to ingestion.
    async fn rasterize(&self, path: &Path, zoom: f32) -> Result<Vec<PageImage>>;
}

/// Rasterizer backed by the Pdfium library.
pub struct PdfiumRasterizer;

#[async_trait]
impl PageRasterizer for PdfiumRasterizer {
    async fn rasterize(&self, path: &Path, zoom: f32) -> Result<Vec<PageImage>> {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || render_all_pages(&path, zoom)).await?
    }
}

fn load_pdfium() -> Result<Pdfium, PdfiumError> {
    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
}

fn render_all_pages(path: &Path, zoom: f32) -> Result<Vec<PageImage>> {
    let pdfium =
        load_pdfium().map_err(|e| anyhow!("Failed to bind the Pdfium library: {:?}", e))?;

    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| anyhow!("Failed to open PDF {}: {:?}", path.display(), e))?;

    let render_config = PdfRenderConfig::new().scale_page_by_factor(zoom);
    let mut pages = Vec::new();

    for (i, page) in document.pages().iter().enumerate() {
        let page_number = i as u32 + 1;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| anyhow!("Failed to render page {}: {:?}", page_number, e))?;
        let image = bitmap.as_image();
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("Page {} rendered with zero dimensions", page_number));
        }
        pages.push(PageImage { page_number, image });
    }

    Ok(pages)
}

/// Encode an image as PNG bytes (detector uploads and crop files).
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes: Vec<u8> = Vec::new();
    image.write_to(
        &mut std::io::Cursor::new(&mut bytes),
        image::ImageFormat::Png,
    )?;
    Ok(bytes)
}
