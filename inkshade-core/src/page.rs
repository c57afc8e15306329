//! Per-page resources: lazily built text and link layers plus a small bitmap
//! cache. A [`PageModel`] is the single entry point for "what is at this
//! point" on a page.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use once_cell::unsync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::error::RenderError;
use crate::geometry::Rect;
use crate::link_layer::{LinkDefinition, LinkLayer};
use crate::text_layer::{CharacterInfo, PageTextLayer};
use crate::{DocumentBackend, PageSize, RenderImage, RenderRequest};

pub const DEFAULT_BITMAP_CACHE_CAPACITY: usize = 3;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct CacheKey {
    zoom_milli: u32,
    dark_mode: bool,
}

impl CacheKey {
    fn new(zoom: f32, dark_mode: bool) -> Self {
        Self {
            zoom_milli: quantize_zoom(zoom),
            dark_mode,
        }
    }
}

fn quantize_zoom(zoom: f32) -> u32 {
    let scaled = (zoom * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

/// Least-recently-used cache of rendered bitmaps keyed by zoom and theme.
#[derive(Debug)]
pub struct BitmapCache {
    capacity: usize,
    // Front is the least recently used entry.
    entries: VecDeque<(CacheKey, Arc<RenderImage>)>,
}

impl BitmapCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn get(&mut self, zoom: f32, dark_mode: bool) -> Option<Arc<RenderImage>> {
        let key = CacheKey::new(zoom, dark_mode);
        let position = self.entries.iter().position(|(k, _)| *k == key)?;
        let entry = self.entries.remove(position)?;
        let image = Arc::clone(&entry.1);
        self.entries.push_back(entry);
        Some(image)
    }

    pub fn contains(&self, zoom: f32, dark_mode: bool) -> bool {
        let key = CacheKey::new(zoom, dark_mode);
        self.entries.iter().any(|(k, _)| *k == key)
    }

    pub fn insert(&mut self, zoom: f32, dark_mode: bool, image: Arc<RenderImage>) {
        let key = CacheKey::new(zoom, dark_mode);
        self.entries.retain(|(k, _)| *k != key);
        while self.entries.len() >= self.capacity {
            if let Some((evicted, _)) = self.entries.pop_front() {
                debug!(zoom_milli = evicted.zoom_milli, dark = evicted.dark_mode, "evicted bitmap");
            }
        }
        self.entries.push_back((key, image));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for BitmapCache {
    fn default() -> Self {
        Self::new(DEFAULT_BITMAP_CACHE_CAPACITY)
    }
}

/// What sits under a point on a page. Links shadow the text beneath them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element<'a> {
    None,
    Link(&'a LinkDefinition),
    Text(&'a CharacterInfo),
}

impl Element<'_> {
    pub fn is_interactive(&self) -> bool {
        !matches!(self, Element::None)
    }
}

fn effective_zoom(zoom: f32) -> f32 {
    if zoom.is_finite() && zoom > 0.0 {
        zoom
    } else {
        1.0
    }
}

pub struct PageModel {
    page_index: usize,
    backend: Arc<dyn DocumentBackend>,
    size: OnceCell<PageSize>,
    text_layer: OnceCell<PageTextLayer>,
    link_layer: OnceCell<LinkLayer>,
    bitmaps: BitmapCache,
}

impl PageModel {
    pub fn new(backend: Arc<dyn DocumentBackend>, page_index: usize, cache_capacity: usize) -> Self {
        Self {
            page_index,
            backend,
            size: OnceCell::new(),
            text_layer: OnceCell::new(),
            link_layer: OnceCell::new(),
            bitmaps: BitmapCache::new(cache_capacity),
        }
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    /// Page dimensions; opens the page handle on first use.
    pub fn size(&self) -> Result<PageSize> {
        self.size
            .get_or_try_init(|| self.backend.page_size(self.page_index))
            .copied()
    }

    pub fn text_layer(&self) -> &PageTextLayer {
        self.text_layer
            .get_or_init(|| PageTextLayer::from_backend(self.backend.as_ref(), self.page_index))
    }

    pub fn link_layer(&self) -> &LinkLayer {
        self.link_layer
            .get_or_init(|| LinkLayer::from_backend(self.backend.as_ref(), self.page_index))
    }

    pub fn text_layer_loaded(&self) -> bool {
        self.text_layer.get().is_some()
    }

    pub fn preload_layers(&self) {
        self.text_layer();
        self.link_layer();
    }

    /// Returns the bitmap for `(zoom, dark_mode)`, rendering it on a miss.
    #[instrument(skip(self), fields(page = self.page_index))]
    pub fn render(&mut self, zoom: f32, dark_mode: bool) -> Result<Arc<RenderImage>, RenderError> {
        if let Some(image) = self.bitmaps.get(zoom, dark_mode) {
            debug!("bitmap cache hit");
            return Ok(image);
        }

        let request = RenderRequest {
            page_index: self.page_index,
            zoom,
        };
        let mut image = self.backend.render_page(request).map_err(|err| {
            warn!(?err, "page render failed");
            RenderError::new(self.page_index, &err)
        })?;
        if dark_mode {
            image.invert();
        }

        let image = Arc::new(image);
        self.bitmaps.insert(zoom, dark_mode, Arc::clone(&image));
        Ok(image)
    }

    pub fn bitmap_cache(&self) -> &BitmapCache {
        &self.bitmaps
    }

    /// Resolves a screen-space point at `zoom` to the element beneath it.
    pub fn element_at(&self, x: f32, y: f32, zoom: f32) -> Element<'_> {
        let zoom = effective_zoom(zoom);
        let (px, py) = (x / zoom, y / zoom);

        if let Some(link) = self.link_layer().link_at(px, py) {
            return Element::Link(link);
        }
        if let Some(character) = self.text_layer().char_at(px, py) {
            return Element::Text(character);
        }
        Element::None
    }

    /// Nearest character within `max_distance` screen pixels.
    pub fn nearest_text(&self, x: f32, y: f32, zoom: f32, max_distance: f32) -> Option<&CharacterInfo> {
        let zoom = effective_zoom(zoom);
        self.text_layer()
            .nearest_char(x / zoom, y / zoom, max_distance / zoom)
    }

    /// Text inside a screen-space rectangle.
    pub fn text_in_rect(&self, rect: Rect, zoom: f32) -> String {
        let zoom = effective_zoom(zoom);
        let layer = self.text_layer();
        let chars = layer.chars_in_rect(rect.scale(1.0 / zoom));
        PageTextLayer::text_of(chars)
    }

    pub fn links_at(&self, x: f32, y: f32, zoom: f32) -> Vec<&LinkDefinition> {
        let zoom = effective_zoom(zoom);
        self.link_layer().links_at(x / zoom, y / zoom)
    }

    pub fn has_text(&self) -> bool {
        !self.text_layer().is_empty()
    }

    pub fn has_links(&self) -> bool {
        !self.link_layer().is_empty()
    }

    pub fn clear_cache(&mut self) {
        self.bitmaps.clear();
    }

    /// Drops every resource the page holds. Safe to call repeatedly; the
    /// layers are rebuilt on next access.
    pub fn unload(&mut self) {
        self.text_layer.take();
        self.link_layer.take();
        self.size.take();
        self.bitmaps.clear();
    }

    pub fn is_unloaded(&self) -> bool {
        self.text_layer.get().is_none()
            && self.link_layer.get().is_none()
            && self.size.get().is_none()
            && self.bitmaps.is_empty()
    }
}

impl std::fmt::Debug for PageModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageModel")
            .field("page_index", &self.page_index)
            .field("text_layer_loaded", &self.text_layer_loaded())
            .field("cached_bitmaps", &self.bitmaps.len())
            .finish()
    }
}
