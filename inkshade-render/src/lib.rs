//! Pdfium-backed document collaborator for `inkshade-core`.

#[cfg(feature = "pdf")]
mod pdfium;

#[cfg(feature = "pdf")]
pub use pdfium::{PdfiumDocument, PdfiumRenderFactory};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("page {page_index} is out of range (document has {page_count} pages)")]
    PageOutOfRange { page_index: usize, page_count: usize },
    #[error("failed to bind a Pdfium library: {0}")]
    Bind(String),
}
