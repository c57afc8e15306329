//! Page virtualization.
//!
//! [`ViewportManager`] keeps a symmetric window of pages around the current
//! scroll position materialized as [`PageModel`]s inside a [`PageArena`], and
//! tells a [`PageSurface`] where to draw them. All state changes happen on the
//! caller's thread; time enters only through the `Instant`s handed to
//! [`ViewportManager::on_scroll`] and [`ViewportManager::poll_settle`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace, warn};

use crate::config::ViewerConfig;
use crate::error::{RenderError, ViewerError};
use crate::page::PageModel;
use crate::{DocumentBackend, RenderImage};

/// Materialized pages keyed by index.
#[derive(Debug, Default)]
pub struct PageArena {
    pages: BTreeMap<usize, PageModel>,
}

impl PageArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, page_index: usize) -> Option<&PageModel> {
        self.pages.get(&page_index)
    }

    pub fn get_mut(&mut self, page_index: usize) -> Option<&mut PageModel> {
        self.pages.get_mut(&page_index)
    }

    pub fn contains(&self, page_index: usize) -> bool {
        self.pages.contains_key(&page_index)
    }

    /// Resident indices in ascending order.
    pub fn indices(&self) -> Vec<usize> {
        self.pages.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &PageModel)> + '_ {
        self.pages.iter().map(|(index, page)| (*index, page))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn insert(&mut self, page: PageModel) {
        self.pages.insert(page.page_index(), page);
    }

    pub(crate) fn remove(&mut self, page_index: usize) -> Option<PageModel> {
        self.pages.remove(&page_index)
    }
}

/// Vertical geometry of the page column, assuming uniform page height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageLayout {
    pub page_height: f32,
    pub spacing: f32,
    pub page_count: usize,
}

impl PageLayout {
    pub fn pitch(&self) -> f32 {
        self.page_height + self.spacing
    }

    pub fn page_top(&self, page_index: usize) -> f32 {
        page_index as f32 * self.pitch()
    }

    pub fn content_height(&self) -> f32 {
        if self.page_count == 0 {
            return 0.0;
        }
        self.page_count as f32 * self.pitch() - self.spacing
    }

    /// Page whose centre is closest to the viewport centre.
    pub fn current_page(&self, scroll_offset: f32, viewport_height: f32) -> usize {
        if self.page_count == 0 || self.pitch() <= 0.0 {
            return 0;
        }
        let estimate =
            ((scroll_offset + viewport_height / 2.0 - self.page_height / 2.0) / self.pitch()).round();
        clamp_index(estimate, self.page_count)
    }

    /// Splits a scroll offset into the page at the top edge and the distance
    /// below that page's top.
    pub fn scroll_info(&self, scroll_offset: f32) -> (usize, f32) {
        if self.page_count == 0 || self.pitch() <= 0.0 {
            return (0, 0.0);
        }
        let page = clamp_index((scroll_offset / self.pitch()).floor(), self.page_count);
        (page, scroll_offset - self.page_top(page))
    }

    pub fn window(&self, current: usize, buffer: usize) -> RangeInclusive<usize> {
        let last = self.page_count.saturating_sub(1);
        let current = current.min(last);
        current.saturating_sub(buffer)..=current.saturating_add(buffer).min(last)
    }
}

fn clamp_index(value: f32, count: usize) -> usize {
    if !value.is_finite() || value <= 0.0 {
        0
    } else {
        (value as usize).min(count.saturating_sub(1))
    }
}

/// Where a page sits in the scrollable content, in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PagePlacement {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// The presentation layer's side of the window. Implementations may post
/// scroll notifications to a [`ScrollInbox`] from inside these callbacks.
pub trait PageSurface {
    /// Draw (or redraw) a page. A failed render is drawn as a blank page.
    fn present(
        &mut self,
        page_index: usize,
        placement: PagePlacement,
        bitmap: Result<&RenderImage, &RenderError>,
    );

    fn remove(&mut self, page_index: usize);

    fn set_content_height(&mut self, _height: f32) {}

    fn scroll_to(&mut self, _offset: f32) {}
}

/// Surface that draws nothing, for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

impl PageSurface for NullSurface {
    fn present(&mut self, _: usize, _: PagePlacement, _: Result<&RenderImage, &RenderError>) {}

    fn remove(&mut self, _: usize) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilePhase {
    #[default]
    Idle,
    Reconciling,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollEvent {
    pub offset: f32,
    pub viewport_height: f32,
}

#[derive(Debug, Default)]
struct InboxState {
    phase: ReconcilePhase,
    pending: Option<ScrollEvent>,
    dropped: usize,
}

/// Scroll notifications waiting for the manager, plus the reconcile phase
/// they are checked against. Cloning shares the same inbox.
#[derive(Debug, Clone, Default)]
pub struct ScrollInbox {
    inner: Rc<RefCell<InboxState>>,
}

impl ScrollInbox {
    /// Queues a notification. Posting during a reconcile pass drops it and
    /// returns false. A queued event replaces any earlier one.
    pub fn post(&self, event: ScrollEvent) -> bool {
        let mut state = self.inner.borrow_mut();
        if state.phase == ReconcilePhase::Reconciling {
            state.dropped += 1;
            trace!(offset = event.offset, "scroll event during reconcile dropped");
            return false;
        }
        state.pending = Some(event);
        true
    }

    pub fn phase(&self) -> ReconcilePhase {
        self.inner.borrow().phase
    }

    pub fn dropped(&self) -> usize {
        self.inner.borrow().dropped
    }

    pub fn has_pending(&self) -> bool {
        self.inner.borrow().pending.is_some()
    }

    fn take(&self) -> Option<ScrollEvent> {
        self.inner.borrow_mut().pending.take()
    }

    fn begin(&self) -> Option<PhaseGuard> {
        let mut state = self.inner.borrow_mut();
        if state.phase == ReconcilePhase::Reconciling {
            return None;
        }
        state.phase = ReconcilePhase::Reconciling;
        Some(PhaseGuard {
            inbox: self.clone(),
        })
    }

    fn force_idle(&self) {
        self.inner.borrow_mut().phase = ReconcilePhase::Idle;
    }
}

struct PhaseGuard {
    inbox: ScrollInbox,
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        self.inbox.force_idle();
    }
}

/// What a reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowChange {
    pub current_page: usize,
    pub window: Option<RangeInclusive<usize>>,
    pub loaded: Vec<usize>,
    pub evicted: Vec<usize>,
    pub failed: Vec<RenderError>,
}

impl WindowChange {
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.evicted.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied(WindowChange),
    /// Another pass was already running.
    Skipped,
}

impl ReconcileOutcome {
    pub fn change(&self) -> Option<&WindowChange> {
        match self {
            ReconcileOutcome::Applied(change) => Some(change),
            ReconcileOutcome::Skipped => None,
        }
    }
}

pub struct ViewportManager<S> {
    backend: Arc<dyn DocumentBackend>,
    surface: S,
    pages: PageArena,
    placements: BTreeMap<usize, PagePlacement>,
    layout: Option<PageLayout>,
    buffer_pages: usize,
    page_spacing: f32,
    settle_delay: Duration,
    cache_capacity: usize,
    container_width: f32,
    zoom: f32,
    dark_mode: bool,
    scroll_offset: f32,
    viewport_height: f32,
    current_page: usize,
    inbox: ScrollInbox,
    settle_deadline: Option<Instant>,
    failures: Vec<RenderError>,
}

impl<S: PageSurface> ViewportManager<S> {
    pub fn new(backend: Arc<dyn DocumentBackend>, surface: S, config: &ViewerConfig, zoom: f32) -> Self {
        Self {
            backend,
            surface,
            pages: PageArena::new(),
            placements: BTreeMap::new(),
            layout: None,
            buffer_pages: config.buffer_pages,
            page_spacing: config.page_spacing,
            settle_delay: config.settle_delay,
            cache_capacity: config.bitmap_cache_capacity,
            container_width: config.container_width,
            zoom,
            dark_mode: false,
            scroll_offset: 0.0,
            viewport_height: 0.0,
            current_page: 0,
            inbox: ScrollInbox::default(),
            settle_deadline: None,
            failures: Vec::new(),
        }
    }

    pub fn pages(&self) -> &PageArena {
        &self.pages
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    pub fn inbox(&self) -> ScrollInbox {
        self.inbox.clone()
    }

    pub fn layout(&self) -> Option<PageLayout> {
        self.layout
    }

    pub fn page_count(&self) -> usize {
        self.backend.page_count()
    }

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn dark_mode(&self) -> bool {
        self.dark_mode
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn scroll_offset(&self) -> f32 {
        self.scroll_offset
    }

    pub fn viewport_height(&self) -> f32 {
        self.viewport_height
    }

    pub fn materialized(&self) -> Vec<usize> {
        self.pages.indices()
    }

    pub fn placement(&self, page_index: usize) -> Option<PagePlacement> {
        self.placements.get(&page_index).copied()
    }

    pub fn settle_pending(&self) -> bool {
        self.settle_deadline.is_some()
    }

    /// Render failures since the last call, across every kind of pass.
    pub fn take_failures(&mut self) -> Vec<RenderError> {
        std::mem::take(&mut self.failures)
    }

    /// `(page, offset_in_page)` for the current scroll position.
    pub fn scroll_info(&self) -> Option<(usize, f32)> {
        self.layout.map(|layout| layout.scroll_info(self.scroll_offset))
    }

    /// Brings the materialized window in line with the scroll position.
    /// Returns [`ReconcileOutcome::Skipped`] when a pass is already running.
    #[instrument(skip(self), fields(zoom = self.zoom))]
    pub fn reconcile(&mut self, scroll_offset: f32, viewport_height: f32) -> ReconcileOutcome {
        let Some(_guard) = self.inbox.begin() else {
            trace!("reconcile already running; request dropped");
            return ReconcileOutcome::Skipped;
        };
        self.scroll_offset = scroll_offset.max(0.0);
        self.viewport_height = viewport_height.max(0.0);
        ReconcileOutcome::Applied(self.reconcile_window())
    }

    /// Scroll tick from the presentation layer. Re-arms the settle timer.
    pub fn on_scroll(&mut self, event: ScrollEvent, now: Instant) -> ReconcileOutcome {
        self.settle_deadline = Some(now + self.settle_delay);
        self.reconcile(event.offset, event.viewport_height)
    }

    /// Handles the latest queued scroll notification, if any.
    pub fn pump(&mut self, now: Instant) -> Option<ReconcileOutcome> {
        let event = self.inbox.take()?;
        Some(self.on_scroll(event, now))
    }

    /// Runs the settle pass once scrolling has been quiet for the configured
    /// delay. The pass ignores the reconcile phase.
    pub fn poll_settle(&mut self, now: Instant) -> Option<ReconcileOutcome> {
        let deadline = self.settle_deadline?;
        if now < deadline {
            return None;
        }
        self.settle_deadline = None;
        debug!(scroll = self.scroll_offset, "settle pass");
        self.inbox.force_idle();
        Some(self.reconcile(self.scroll_offset, self.viewport_height))
    }

    /// Scrolls so that page-space `y_offset` on `page_index` sits just below
    /// the top edge. Returns the new scroll offset.
    pub fn jump_to(&mut self, page_index: usize, y_offset: f32) -> Result<f32, ViewerError> {
        let page_count = self.page_count();
        if page_count == 0 {
            return Err(ViewerError::NoDocument);
        }
        if page_index >= page_count {
            return Err(ViewerError::PageOutOfRange {
                page_index,
                page_count,
            });
        }

        let layout = match self.layout {
            Some(layout) => layout,
            None => {
                self.current_page = page_index;
                let mut change = WindowChange::default();
                self.bootstrap(page_index, &mut change)?
            }
        };

        let mut target = layout.page_top(page_index);
        if y_offset > 0.0 {
            let margin = (0.1 * self.viewport_height).min(50.0);
            target = (target + y_offset * self.zoom - margin).max(0.0);
        }
        debug!(page = page_index, target, "jump");
        self.surface.scroll_to(target);
        self.reconcile(target, self.viewport_height);
        Ok(self.scroll_offset)
    }

    /// Moves to an absolute scroll offset and reconciles.
    pub fn scroll_to(&mut self, offset: f32) -> ReconcileOutcome {
        let offset = offset.max(0.0);
        self.surface.scroll_to(offset);
        self.reconcile(offset, self.viewport_height)
    }

    /// New viewport height; reconciles at the current offset.
    pub fn resize(&mut self, viewport_height: f32) -> ReconcileOutcome {
        self.reconcile(self.scroll_offset, viewport_height)
    }

    /// Re-renders resident pages at `zoom` and keeps the visual anchor:
    /// the page at the top edge stays put and the offset into it scales by
    /// the zoom ratio. Returns the new scroll offset.
    #[instrument(skip(self))]
    pub fn set_zoom(&mut self, zoom: f32) -> f32 {
        if !(zoom.is_finite() && zoom > 0.0) || (zoom - self.zoom).abs() < f32::EPSILON {
            return self.scroll_offset;
        }
        let ratio = zoom / self.zoom;
        let anchor = self.scroll_info();
        self.zoom = zoom;

        let Some(layout) = self.layout else {
            return self.scroll_offset;
        };
        let layout = self.rerender_in_place(layout, Some(ratio));

        let target = match anchor {
            Some((page, offset)) => layout.page_top(page) + offset * ratio,
            None => self.scroll_offset * ratio,
        };
        self.surface.scroll_to(target);
        self.reconcile(target, self.viewport_height);
        self.scroll_offset
    }

    pub fn set_dark_mode(&mut self, dark_mode: bool) {
        if dark_mode == self.dark_mode {
            return;
        }
        self.dark_mode = dark_mode;
        if let Some(layout) = self.layout {
            self.rerender_in_place(layout, None);
        }
    }

    /// Re-centres resident pages for a new container width.
    pub fn set_container_width(&mut self, width: f32) {
        self.container_width = width.max(0.0);
        for index in self.pages.indices() {
            let Some(mut placement) = self.placements.get(&index).copied() else {
                continue;
            };
            placement.x = self.centered_x(placement.width);
            self.placements.insert(index, placement);
            self.present_page(index, placement);
        }
    }

    /// Evicts every page and forgets the learned layout.
    pub fn clear(&mut self) {
        for index in self.pages.indices() {
            self.evict(index);
        }
        self.layout = None;
        self.scroll_offset = 0.0;
        self.current_page = 0;
        self.settle_deadline = None;
    }

    fn reconcile_window(&mut self) -> WindowChange {
        let mut change = WindowChange::default();
        let page_count = self.page_count();
        if page_count == 0 {
            for index in self.pages.indices() {
                self.evict(index);
                change.evicted.push(index);
            }
            return change;
        }

        let layout = match self.layout {
            Some(layout) => layout,
            None => {
                let target = self.current_page.min(page_count - 1);
                match self.bootstrap(target, &mut change) {
                    Ok(layout) => layout,
                    Err(err) => {
                        warn!(%err, "could not learn page height");
                        return change;
                    }
                }
            }
        };

        let current = layout.current_page(self.scroll_offset, self.viewport_height);
        let window = layout.window(current, self.buffer_pages);
        self.current_page = current;

        for index in self.pages.indices() {
            if !window.contains(&index) {
                self.evict(index);
                change.evicted.push(index);
            }
        }
        for index in window.clone() {
            if !self.pages.contains(index) {
                self.materialize(index, &layout, &mut change);
            }
        }

        if !change.is_empty() {
            debug!(
                current,
                start = *window.start(),
                end = *window.end(),
                loaded = change.loaded.len(),
                evicted = change.evicted.len(),
                "window updated"
            );
        }
        change.current_page = current;
        change.window = Some(window);
        change
    }

    /// Renders `page_index` to learn the page height. A page that cannot be
    /// rendered still yields a layout from page geometry and stays resident
    /// as a blank placement.
    fn bootstrap(
        &mut self,
        page_index: usize,
        change: &mut WindowChange,
    ) -> Result<PageLayout, RenderError> {
        let mut page = PageModel::new(Arc::clone(&self.backend), page_index, self.cache_capacity);
        let rendered = page.render(self.zoom, self.dark_mode);
        let page_height = match &rendered {
            Ok(image) => image.height as f32,
            Err(err) => match self.measured_height(page_index) {
                Some(height) => height,
                None => {
                    self.failures.push(err.clone());
                    change.failed.push(err.clone());
                    return Err(err.clone());
                }
            },
        };
        let layout = PageLayout {
            page_height,
            spacing: self.page_spacing,
            page_count: self.page_count(),
        };
        debug!(page = page_index, height = layout.page_height, "learned page height");
        self.layout = Some(layout);
        self.surface.set_content_height(layout.content_height());

        match rendered {
            Ok(image) => {
                let placement = self.placement_for(page_index, &layout, image.width as f32);
                self.surface.present(page_index, placement, Ok(&image));
                self.placements.insert(page_index, placement);
            }
            Err(err) => {
                let width = self.fallback_width(&page, &layout);
                let placement = self.placement_for(page_index, &layout, width);
                self.surface.present(page_index, placement, Err(&err));
                self.placements.insert(page_index, placement);
                self.failures.push(err.clone());
                change.failed.push(err);
            }
        }
        self.pages.insert(page);
        change.loaded.push(page_index);
        Ok(layout)
    }

    /// Screen height of `page_index` from its page size, falling back to the
    /// nearest later page and then earlier ones.
    fn measured_height(&self, page_index: usize) -> Option<f32> {
        let page_count = self.page_count();
        let zoom = if self.zoom.is_finite() && self.zoom > 0.0 {
            self.zoom
        } else {
            1.0
        };
        std::iter::once(page_index)
            .chain(page_index + 1..page_count)
            .chain((0..page_index).rev())
            .find_map(|index| match self.backend.page_size(index) {
                Ok(size) if size.height > 0.0 && size.height.is_finite() => {
                    Some((size.height * zoom).round())
                }
                _ => None,
            })
    }

    fn materialize(&mut self, page_index: usize, layout: &PageLayout, change: &mut WindowChange) {
        let mut page = PageModel::new(Arc::clone(&self.backend), page_index, self.cache_capacity);
        match page.render(self.zoom, self.dark_mode) {
            Ok(image) => {
                let placement = self.placement_for(page_index, layout, image.width as f32);
                self.surface.present(page_index, placement, Ok(&image));
                self.placements.insert(page_index, placement);
            }
            Err(err) => {
                let width = self.fallback_width(&page, layout);
                let placement = self.placement_for(page_index, layout, width);
                self.surface.present(page_index, placement, Err(&err));
                self.placements.insert(page_index, placement);
                self.failures.push(err.clone());
                change.failed.push(err);
            }
        }
        self.pages.insert(page);
        change.loaded.push(page_index);
    }

    fn evict(&mut self, page_index: usize) {
        if let Some(mut page) = self.pages.remove(page_index) {
            page.unload();
        }
        self.placements.remove(&page_index);
        self.surface.remove(page_index);
    }

    /// Re-renders every resident page at the current zoom and theme, keeping
    /// the models. `ratio` rescales the page height when no page rendered.
    fn rerender_in_place(&mut self, layout: PageLayout, ratio: Option<f32>) -> PageLayout {
        let guard = self.inbox.begin();
        let (zoom, dark_mode) = (self.zoom, self.dark_mode);

        let mut rendered = Vec::new();
        for index in self.pages.indices() {
            if let Some(page) = self.pages.get_mut(index) {
                rendered.push((index, page.render(zoom, dark_mode)));
            }
        }

        let page_height = rendered
            .iter()
            .find_map(|(_, result)| result.as_ref().ok().map(|image| image.height as f32))
            .unwrap_or(layout.page_height * ratio.unwrap_or(1.0));
        let layout = PageLayout {
            page_height,
            ..layout
        };
        self.layout = Some(layout);
        self.surface.set_content_height(layout.content_height());

        for (index, result) in rendered {
            match result {
                Ok(image) => {
                    let placement = self.placement_for(index, &layout, image.width as f32);
                    self.surface.present(index, placement, Ok(&image));
                    self.placements.insert(index, placement);
                }
                Err(err) => {
                    let width = self
                        .pages
                        .get(index)
                        .map(|page| self.fallback_width(page, &layout))
                        .unwrap_or(0.0);
                    let placement = self.placement_for(index, &layout, width);
                    self.surface.present(index, placement, Err(&err));
                    self.placements.insert(index, placement);
                    self.failures.push(err);
                }
            }
        }
        drop(guard);
        layout
    }

    fn present_page(&mut self, page_index: usize, placement: PagePlacement) {
        let (zoom, dark_mode) = (self.zoom, self.dark_mode);
        let Some(page) = self.pages.get_mut(page_index) else {
            return;
        };
        match page.render(zoom, dark_mode) {
            Ok(image) => self.surface.present(page_index, placement, Ok(&image)),
            Err(err) => self.surface.present(page_index, placement, Err(&err)),
        }
    }

    fn placement_for(&self, page_index: usize, layout: &PageLayout, width: f32) -> PagePlacement {
        PagePlacement {
            x: self.centered_x(width),
            y: layout.page_top(page_index),
            width,
            height: layout.page_height,
        }
    }

    fn centered_x(&self, width: f32) -> f32 {
        ((self.container_width - width) / 2.0).max(0.0)
    }

    fn fallback_width(&self, page: &PageModel, layout: &PageLayout) -> f32 {
        match page.size() {
            Ok(size) if size.height > 0.0 => layout.page_height * size.width / size.height,
            _ => 0.0,
        }
    }
}

impl<S> std::fmt::Debug for ViewportManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewportManager")
            .field("zoom", &self.zoom)
            .field("dark_mode", &self.dark_mode)
            .field("current_page", &self.current_page)
            .field("scroll_offset", &self.scroll_offset)
            .field("layout", &self.layout)
            .field("materialized", &self.pages.len())
            .finish()
    }
}
