use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::{
    document_id_for_path, DocumentBackend, DocumentInfo, DocumentMetadata, DocumentProvider,
    FontInfo, Glyph, LinkAction, LinkDefinition, PageSize, Point, Rect, RenderImage,
    RenderRequest,
};

pub const GLYPH_WIDTH: f32 = 6.0;
pub const GLYPH_HEIGHT: f32 = 12.0;
pub const LINE_PITCH: f32 = 16.0;
pub const LEFT_MARGIN: f32 = 10.0;
pub const TOP_MARGIN: f32 = 10.0;

pub fn glyph(ch: char, bbox: Rect, block: usize, line: usize) -> Glyph {
    Glyph {
        ch,
        bbox,
        origin: Point::new(bbox.x0, bbox.y1),
        block,
        line,
        span: 0,
        font: FontInfo::default(),
    }
}

/// One glyph per character, each line below the previous one, all in block 0.
pub fn page_glyphs(lines: &[&str]) -> Vec<Glyph> {
    let mut glyphs = Vec::new();
    for (line_index, text) in lines.iter().enumerate() {
        let y0 = TOP_MARGIN + line_index as f32 * LINE_PITCH;
        for (column, ch) in text.chars().enumerate() {
            let x0 = LEFT_MARGIN + column as f32 * GLYPH_WIDTH;
            glyphs.push(glyph(
                ch,
                Rect::new(x0, y0, x0 + GLYPH_WIDTH, y0 + GLYPH_HEIGHT),
                0,
                line_index,
            ));
        }
    }
    glyphs
}

/// Page-space centre of the glyph at `(line, column)` as laid out by
/// [`page_glyphs`].
pub fn glyph_center(line: usize, column: usize) -> Point {
    Point::new(
        LEFT_MARGIN + column as f32 * GLYPH_WIDTH + GLYPH_WIDTH / 2.0,
        TOP_MARGIN + line as f32 * LINE_PITCH + GLYPH_HEIGHT / 2.0,
    )
}

pub fn default_lines(page_index: usize) -> Vec<String> {
    vec![format!("page {page_index} top"), "shared footer".to_string()]
}

pub struct FakeBackend {
    info: DocumentInfo,
    size: PageSize,
    lines: HashMap<usize, Vec<String>>,
    glyphs: HashMap<usize, Vec<Glyph>>,
    links: HashMap<usize, Vec<LinkDefinition>>,
    failing_renders: HashSet<usize>,
    failing_glyphs: HashSet<usize>,
    render_calls: AtomicUsize,
    glyph_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(page_count: usize) -> Self {
        let path = PathBuf::from("/tmp/fake.pdf");
        Self {
            info: DocumentInfo {
                id: document_id_for_path(&path),
                path,
                page_count,
                metadata: DocumentMetadata::default(),
            },
            size: PageSize {
                width: 100.0,
                height: 140.0,
            },
            lines: HashMap::new(),
            glyphs: HashMap::new(),
            links: HashMap::new(),
            failing_renders: HashSet::new(),
            failing_glyphs: HashSet::new(),
            render_calls: AtomicUsize::new(0),
            glyph_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_lines(mut self, page_index: usize, lines: &[&str]) -> Self {
        self.lines
            .insert(page_index, lines.iter().map(|line| line.to_string()).collect());
        self
    }

    /// Overrides the generated layout of one page with explicit glyphs.
    pub fn with_glyphs(mut self, page_index: usize, glyphs: Vec<Glyph>) -> Self {
        self.glyphs.insert(page_index, glyphs);
        self
    }

    pub fn with_link(mut self, page_index: usize, bbox: Rect, action: LinkAction) -> Self {
        self.links
            .entry(page_index)
            .or_default()
            .push(LinkDefinition { bbox, action });
        self
    }

    pub fn with_failing_render(mut self, page_index: usize) -> Self {
        self.failing_renders.insert(page_index);
        self
    }

    pub fn with_failing_glyphs(mut self, page_index: usize) -> Self {
        self.failing_glyphs.insert(page_index);
        self
    }

    pub fn render_calls(&self) -> usize {
        self.render_calls.load(Ordering::SeqCst)
    }

    pub fn glyph_calls(&self) -> usize {
        self.glyph_calls.load(Ordering::SeqCst)
    }

    fn lines_for(&self, page_index: usize) -> Vec<String> {
        self.lines
            .get(&page_index)
            .cloned()
            .unwrap_or_else(|| default_lines(page_index))
    }

    fn check_page(&self, page_index: usize) -> Result<()> {
        if page_index >= self.info.page_count {
            return Err(anyhow!("page {} out of range", page_index));
        }
        Ok(())
    }
}

impl DocumentBackend for FakeBackend {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize> {
        self.check_page(page_index)?;
        Ok(self.size)
    }

    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        self.check_page(request.page_index)?;
        self.render_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_renders.contains(&request.page_index) {
            return Err(anyhow!("render of page {} failed", request.page_index));
        }
        let width = (self.size.width * request.zoom).round() as u32;
        let height = (self.size.height * request.zoom).round() as u32;
        let mut pixels = vec![255u8; (width * height * 4) as usize];
        if let Some(first) = pixels.first_mut() {
            *first = request.page_index as u8;
        }
        Ok(RenderImage {
            width,
            height,
            pixels,
        })
    }

    fn page_glyphs(&self, page_index: usize) -> Result<Vec<Glyph>> {
        self.check_page(page_index)?;
        self.glyph_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_glyphs.contains(&page_index) {
            return Err(anyhow!("glyph extraction failed for page {}", page_index));
        }
        if let Some(glyphs) = self.glyphs.get(&page_index) {
            return Ok(glyphs.clone());
        }
        let lines = self.lines_for(page_index);
        let borrowed: Vec<&str> = lines.iter().map(String::as_str).collect();
        Ok(page_glyphs(&borrowed))
    }

    fn page_links(&self, page_index: usize) -> Result<Vec<LinkDefinition>> {
        self.check_page(page_index)?;
        Ok(self.links.get(&page_index).cloned().unwrap_or_default())
    }

    fn search_page(&self, page_index: usize, query: &str) -> Result<Vec<Vec<Rect>>> {
        self.check_page(page_index)?;
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let needle: Vec<char> = query.chars().collect();
        let mut rects = Vec::new();
        for (line_index, line) in self.lines_for(page_index).iter().enumerate() {
            let haystack: Vec<char> = line.chars().collect();
            if haystack.len() < needle.len() {
                continue;
            }
            for start in 0..=haystack.len() - needle.len() {
                if haystack[start..start + needle.len()] == needle[..] {
                    let x0 = LEFT_MARGIN + start as f32 * GLYPH_WIDTH;
                    let y0 = TOP_MARGIN + line_index as f32 * LINE_PITCH;
                    rects.push(vec![Rect::new(
                        x0,
                        y0,
                        x0 + needle.len() as f32 * GLYPH_WIDTH,
                        y0 + GLYPH_HEIGHT,
                    )]);
                }
            }
        }
        Ok(rects)
    }
}

pub struct FakeProvider {
    page_count: usize,
}

impl FakeProvider {
    pub fn new(page_count: usize) -> Self {
        Self { page_count }
    }
}

#[async_trait::async_trait]
impl DocumentProvider for FakeProvider {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        let mut backend = FakeBackend::new(self.page_count);
        backend.info.id = document_id_for_path(path);
        backend.info.path = path.to_path_buf();
        Ok(Arc::new(backend))
    }
}
