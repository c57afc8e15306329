use std::convert::TryFrom;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use inkshade_core::{
    document_id_for_path, DocumentBackend, DocumentInfo, DocumentMetadata, DocumentProvider,
    FontInfo, Glyph, LinkAction, LinkDefinition, LinkDestination, PageSize, Point, Rect,
    RenderImage, RenderRequest,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

use crate::BackendError;

/// Opens documents through a single bound Pdfium instance.
pub struct PdfiumRenderFactory {
    pdfium: Arc<Pdfium>,
}

impl PdfiumRenderFactory {
    /// Binds Pdfium from `library_path` when given, otherwise from the working
    /// directory and then the system library path.
    pub fn new(library_path: Option<&Path>) -> Result<Self> {
        let pdfium = match library_path.and_then(bind_pdfium_at) {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumRenderFactory {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let info = build_document_info(&self.pdfium, &absolute)?;
        debug!(path = %absolute.display(), pages = info.page_count, "opened document");
        Ok(Arc::new(PdfiumDocument::new(
            Arc::clone(&self.pdfium),
            absolute,
            info,
        )))
    }
}

pub struct PdfiumDocument {
    // Declared before `pdfium` so it is dropped first.
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
    path: PathBuf,
    info: DocumentInfo,
}

impl PdfiumDocument {
    fn new(pdfium: Arc<Pdfium>, path: PathBuf, info: DocumentInfo) -> Self {
        Self {
            document: Mutex::new(None),
            pdfium,
            path,
            info,
        }
    }

    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, None)
            .with_context(|| format!("failed to open {:?}", self.path))?;
        // SAFETY: the document borrows the bindings owned by `self.pdfium`. It
        // is only ever stored in `self.document`, which drops before `pdfium`.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_page<R, F>(&self, page_index: usize, f: F) -> Result<R>
    where
        F: FnOnce(&PdfPage<'_>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        let document = match guard.take() {
            Some(document) => document,
            None => self.open_document()?,
        };
        let result = self.page_of(&document, page_index).and_then(|page| f(&page));
        *guard = Some(document);
        result
    }

    fn page_of<'a>(&self, document: &'a PdfDocument<'static>, page_index: usize) -> Result<PdfPage<'a>> {
        let out_of_range = || BackendError::PageOutOfRange {
            page_index,
            page_count: self.info.page_count,
        };
        let index = PdfPageIndex::try_from(page_index).map_err(|_| out_of_range())?;
        document
            .pages()
            .get(index)
            .map_err(|_| anyhow!(out_of_range()))
    }
}

impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize> {
        self.with_page(page_index, |page| {
            Ok(PageSize {
                width: page.width().value,
                height: page.height().value,
            })
        })
    }

    #[instrument(skip(self), fields(page = request.page_index, zoom = request.zoom))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        self.with_page(request.page_index, |page| {
            let config = PdfRenderConfig::new().scale_page_by_factor(request.zoom.max(0.05));
            let bitmap = page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", request.page_index))?;
            let image = bitmap.as_image().to_rgba8();
            let (width, height) = image.dimensions();
            Ok(RenderImage {
                width,
                height,
                pixels: image.into_raw(),
            })
        })
    }

    #[instrument(skip(self))]
    fn page_glyphs(&self, page_index: usize) -> Result<Vec<Glyph>> {
        self.with_page(page_index, |page| {
            let page_height = page.height().value;
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            let mut builder = GlyphBuilder::default();
            for character in text.chars().iter() {
                let Some(ch) = character.unicode_char() else {
                    continue;
                };
                if ch == '\r' || ch == '\n' {
                    builder.break_line();
                    continue;
                }
                let Ok(bounds) = character.loose_bounds() else {
                    continue;
                };
                let bbox = Rect::new(
                    bounds.left().value,
                    page_height - bounds.top().value,
                    bounds.right().value,
                    page_height - bounds.bottom().value,
                )
                .normalized();
                let origin = match (character.origin_x(), character.origin_y()) {
                    (Ok(x), Ok(y)) => Point::new(x.value, page_height - y.value),
                    _ => Point::new(bbox.x0, bbox.y1),
                };
                let color = character
                    .fill_color()
                    .map(|c| (c.red() as u32) << 16 | (c.green() as u32) << 8 | c.blue() as u32)
                    .unwrap_or(0);
                let font = FontInfo {
                    name: Arc::from(character.font_name().as_str()),
                    size: character.scaled_font_size().value,
                    color,
                };
                builder.push(ch, bbox, origin, font);
            }
            Ok(builder.finish())
        })
    }

    fn page_links(&self, page_index: usize) -> Result<Vec<LinkDefinition>> {
        self.with_page(page_index, |page| {
            let page_height = page.height().value;
            let mut definitions = Vec::new();
            for link in page.links().iter() {
                let rect = match link.rect() {
                    Ok(rect) => rect,
                    Err(err) => {
                        warn!(?err, page = page_index, path = %self.path.display(), "failed to resolve link rectangle");
                        continue;
                    }
                };
                let bbox = Rect::new(
                    rect.left().value,
                    page_height - rect.top().value,
                    rect.right().value,
                    page_height - rect.bottom().value,
                )
                .normalized();
                if !bbox.is_valid() {
                    continue;
                }
                definitions.push(LinkDefinition {
                    bbox,
                    action: link_action(&link),
                });
            }
            Ok(definitions)
        })
    }

    fn search_page(&self, page_index: usize, query: &str) -> Result<Vec<Vec<Rect>>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.with_page(page_index, |page| {
            let page_height = page.height().value;
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            let search = text
                .search(query, &PdfSearchOptions::new())
                .with_context(|| format!("failed to perform search on page {}", page_index))?;

            let mut hits = Vec::new();
            while let Some(segments) = search.find_next() {
                let rects: Vec<Rect> = segments
                    .iter()
                    .map(|segment| {
                        let bounds = segment.bounds();
                        Rect::new(
                            bounds.left().value,
                            page_height - bounds.top().value,
                            bounds.right().value,
                            page_height - bounds.bottom().value,
                        )
                        .normalized()
                    })
                    .filter(Rect::is_valid)
                    .collect();
                if !rects.is_empty() {
                    hits.push(rects);
                }
            }
            Ok(hits)
        })
    }
}

/// Pdfium reports a flat character stream. Lines are split at generated line
/// breaks and baseline jumps, blocks at large vertical gaps, spans at font
/// changes.
#[derive(Default)]
struct GlyphBuilder {
    glyphs: Vec<Glyph>,
    block: usize,
    line: usize,
    span: usize,
    pending_break: bool,
    line_baseline: Option<f32>,
    line_bottom: f32,
    last_font: Option<(Arc<str>, f32)>,
}

impl GlyphBuilder {
    fn break_line(&mut self) {
        self.pending_break = true;
    }

    fn push(&mut self, ch: char, bbox: Rect, origin: Point, font: FontInfo) {
        let size = font.size.max(1.0);
        if let Some(baseline) = self.line_baseline {
            let jumped = (origin.y - baseline).abs() > size * 0.5;
            if self.pending_break || jumped {
                if bbox.y0 - self.line_bottom > size * 1.5 {
                    self.block += 1;
                    self.line = 0;
                } else {
                    self.line += 1;
                }
                self.span = 0;
                self.line_baseline = Some(origin.y);
                self.last_font = None;
            }
        } else {
            self.line_baseline = Some(origin.y);
        }
        self.pending_break = false;

        let key = (Arc::clone(&font.name), font.size);
        if let Some(last) = &self.last_font {
            if last.0 != key.0 || (last.1 - key.1).abs() > f32::EPSILON {
                self.span += 1;
            }
        }
        self.last_font = Some(key);
        self.line_bottom = bbox.y1;

        self.glyphs.push(Glyph {
            ch,
            bbox,
            origin,
            block: self.block,
            line: self.line,
            span: self.span,
            font,
        });
    }

    fn finish(self) -> Vec<Glyph> {
        self.glyphs
    }
}

fn link_action(link: &PdfLink<'_>) -> LinkAction {
    if let Some(action) = link.action() {
        match action.action_type() {
            PdfActionType::GoToDestinationInSameDocument => {
                if let Some(page) = action
                    .as_local_destination_action()
                    .and_then(|local| local.destination().ok())
                    .and_then(|destination| destination.page_index().ok())
                {
                    return LinkAction::GoTo {
                        destination: LinkDestination::page(page as usize),
                    };
                }
            }
            PdfActionType::Uri => {
                if let Some(uri) = action.as_uri_action().and_then(|uri| uri.uri().ok()) {
                    return LinkAction::Uri { uri };
                }
            }
            PdfActionType::GoToDestinationInRemoteDocument => {
                return LinkAction::GoToRemote {
                    file: String::new(),
                    destination: None,
                };
            }
            PdfActionType::Launch => {
                return LinkAction::Launch {
                    file: String::new(),
                };
            }
            _ => {}
        }
    }

    if let Some(page) = link
        .destination()
        .and_then(|destination| destination.page_index().ok())
    {
        return LinkAction::GoTo {
            destination: LinkDestination::page(page as usize),
        };
    }
    LinkAction::Unknown
}

fn build_document_info(pdfium: &Pdfium, path: &Path) -> Result<DocumentInfo> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .with_context(|| format!("failed to open {:?}", path))?;
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let metadata = document.metadata();

    let title = metadata
        .get(PdfDocumentMetadataTagType::Title)
        .map(|t| t.value().to_owned());
    let author = metadata
        .get(PdfDocumentMetadataTagType::Author)
        .map(|t| t.value().to_owned());
    let keywords = metadata
        .get(PdfDocumentMetadataTagType::Keywords)
        .map(|t| t.value().split(',').map(|s| s.trim().to_owned()).collect())
        .unwrap_or_default();

    Ok(DocumentInfo {
        id: document_id_for_path(path),
        path: path.to_path_buf(),
        page_count,
        metadata: DocumentMetadata {
            title,
            author,
            keywords,
        },
    })
}

fn bind_pdfium_at(path: &Path) -> Option<Pdfium> {
    match Pdfium::bind_to_library(path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to load configured Pdfium library");
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(BackendError::Bind(errors.join(", ")).into())
        }
    }
}
