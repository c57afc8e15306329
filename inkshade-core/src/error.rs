use thiserror::Error;

/// A page bitmap could not be produced. Scoped to one page; the rest of the
/// window keeps working.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("failed to render page {page_index}: {message}")]
pub struct RenderError {
    pub page_index: usize,
    pub message: String,
}

impl RenderError {
    pub fn new(page_index: usize, err: &anyhow::Error) -> Self {
        Self {
            page_index,
            message: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("page {page_index} out of range (document has {page_count} pages)")]
    PageOutOfRange { page_index: usize, page_count: usize },
    #[error("document has no pages")]
    NoDocument,
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("view state unavailable: {0}")]
    State(String),
}
