use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod export;
pub mod geometry;
pub mod link_layer;
pub mod page;
pub mod search;
pub mod selection;
pub mod state;
pub mod text_layer;
pub mod viewer;
pub mod viewport;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ViewerConfig;
pub use error::{RenderError, ViewerError};
pub use export::{ExportMessage, TextExportWorker};
pub use geometry::{Point, Rect};
pub use link_layer::{LinkAction, LinkDefinition, LinkDestination, LinkKind, LinkLayer};
pub use page::{BitmapCache, Element, PageModel};
pub use search::{ChunkedSearch, SearchMessage, SearchProgress, SearchResult, SearchResults, SearchWorker};
pub use selection::{PageSelection, SelectionAnchor, SelectionManager, SelectionState};
pub use state::{FileStateStore, MemoryStateStore, PersistedViewState, StateStore};
pub use text_layer::{BlockInfo, CharacterInfo, LineInfo, PageTextLayer};
pub use viewer::{Command, PointerOutcome, Viewer, ViewerEvent};
pub use viewport::{
    NullSurface, PageArena, PageLayout, PagePlacement, PageSurface, ReconcileOutcome,
    ReconcilePhase, ScrollEvent, ScrollInbox, ViewportManager, WindowChange,
};
pub use worker::{CancellationToken, WorkerHandle};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0c6a52-8d1e-5b7a-9c44-1e2f7d6a9b10").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

/// Page dimensions in page-space points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    pub zoom: f32,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            zoom: 1.0,
        }
    }
}

/// An RGBA8 bitmap produced by the rendering backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RenderImage {
    /// Inverts the colour channels in place, leaving alpha untouched.
    pub fn invert(&mut self) {
        for chunk in self.pixels.chunks_exact_mut(4) {
            chunk[0] = 255 - chunk[0];
            chunk[1] = 255 - chunk[1];
            chunk[2] = 255 - chunk[2];
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FontInfo {
    pub name: Arc<str>,
    pub size: f32,
    pub color: u32,
}

impl Default for FontInfo {
    fn default() -> Self {
        Self {
            name: Arc::from(""),
            size: 12.0,
            color: 0,
        }
    }
}

/// One glyph as reported by the backend, already in reading order.
#[derive(Debug, Clone, PartialEq)]
pub struct Glyph {
    pub ch: char,
    pub bbox: Rect,
    pub origin: Point,
    pub block: usize,
    pub line: usize,
    pub span: usize,
    pub font: FontInfo,
}

pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;

    fn page_count(&self) -> usize {
        self.info().page_count
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize>;
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage>;
    fn page_glyphs(&self, page_index: usize) -> Result<Vec<Glyph>>;
    fn page_links(&self, page_index: usize) -> Result<Vec<LinkDefinition>>;
    /// Occurrences of `query` on a page. Each entry holds the rectangles of
    /// one match, which may span several lines.
    fn search_page(&self, page_index: usize, query: &str) -> Result<Vec<Vec<Rect>>>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::testing::FakeProvider;

    #[test]
    fn document_id_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sample.pdf");
        std::fs::write(&file_path, b"dummy").unwrap();

        let first = document_id_for_path(&file_path);
        let second = document_id_for_path(&file_path);

        assert_eq!(first, second);
    }

    #[test]
    fn invert_keeps_alpha() {
        let mut image = RenderImage {
            width: 1,
            height: 2,
            pixels: vec![0, 10, 255, 200, 255, 255, 255, 255],
        };
        image.invert();
        assert_eq!(image.pixels, vec![255, 245, 0, 200, 0, 0, 0, 255]);
    }

    #[tokio::test]
    async fn provider_opens_backend_with_page_count() {
        let provider = FakeProvider::new(12);
        let backend = provider.open(Path::new("/tmp/fake.pdf")).await.unwrap();
        assert_eq!(backend.page_count(), 12);
        assert_eq!(backend.info().id, document_id_for_path(Path::new("/tmp/fake.pdf")));
    }
}
