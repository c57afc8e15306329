//! The interactive core wired together: page window, selection, search
//! highlights and view state behind one command surface.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ViewerConfig;
use crate::error::{RenderError, ViewerError};
use crate::geometry::Rect;
use crate::link_layer::LinkDefinition;
use crate::page::Element;
use crate::search::{ChunkedSearch, SearchProgress, SearchResults};
use crate::selection::{PageSelection, SelectionManager};
use crate::state::{PersistedViewState, StateStore};
use crate::text_layer::CharacterInfo;
use crate::viewport::{PageSurface, ReconcileOutcome, ScrollEvent, ViewportManager};
use crate::DocumentBackend;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GotoPage(usize),
    NextPage,
    PrevPage,
    /// Absolute zoom in percent of the base zoom.
    SetZoom(u32),
    AdjustZoom(i32),
    ToggleDarkMode,
    SelectAll,
    ClearSelection,
    NextSearchResult,
    PrevSearchResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    RedrawNeeded,
    SelectionChanged { pages: Vec<usize> },
    SelectionCleared,
    PageFailed(RenderError),
    /// A link was clicked. Internal links have already been followed.
    LinkActivated(LinkDefinition),
}

/// What a pointer press landed on.
#[derive(Debug, Clone, PartialEq)]
pub enum PointerOutcome {
    Ignored,
    Link(LinkDefinition),
    /// A drag selection started.
    Selecting,
    /// A word or line was selected outright.
    Selected,
}

enum Hit {
    Link(LinkDefinition),
    Text(CharacterInfo),
    Nothing,
}

pub struct Viewer<S> {
    config: ViewerConfig,
    viewport: ViewportManager<S>,
    selection: SelectionManager,
    search: Option<ChunkedSearch>,
    results: SearchResults,
    zoom_percent: u32,
    events: Arc<Mutex<Vec<ViewerEvent>>>,
}

impl<S: PageSurface> Viewer<S> {
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        surface: S,
        config: ViewerConfig,
    ) -> Result<Self, ViewerError> {
        config.validate()?;
        let zoom_percent = config.clamp_zoom_percent(100);
        let viewport = ViewportManager::new(backend, surface, &config, config.zoom_for_percent(zoom_percent));
        Ok(Self {
            config,
            viewport,
            selection: SelectionManager::new(),
            search: None,
            results: SearchResults::default(),
            zoom_percent,
            events: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn viewport(&self) -> &ViewportManager<S> {
        &self.viewport
    }

    pub fn surface_mut(&mut self) -> &mut S {
        self.viewport.surface_mut()
    }

    pub fn selection(&self) -> &SelectionManager {
        &self.selection
    }

    pub fn zoom_percent(&self) -> u32 {
        self.zoom_percent
    }

    pub fn current_page(&self) -> usize {
        self.viewport.current_page()
    }

    pub fn page_count(&self) -> usize {
        self.viewport.page_count()
    }

    /// Shared handle to the event queue.
    pub fn events(&self) -> Arc<Mutex<Vec<ViewerEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn emit(&self, event: ViewerEvent) {
        self.events.lock().push(event);
    }

    pub fn scroll(&mut self, event: ScrollEvent, now: Instant) {
        let outcome = self.viewport.on_scroll(event, now);
        self.after_reconcile(&outcome);
    }

    /// Drives deferred work: queued scroll notifications, the settle pass and
    /// one chunk of any running search.
    pub fn tick(&mut self, now: Instant) -> Option<SearchProgress> {
        if let Some(outcome) = self.viewport.pump(now) {
            self.after_reconcile(&outcome);
        }
        if let Some(outcome) = self.viewport.poll_settle(now) {
            self.after_reconcile(&outcome);
        }
        self.step_search()
    }

    pub fn resize(&mut self, width: f32, height: f32) {
        self.viewport.set_container_width(width);
        let outcome = self.viewport.resize(height);
        self.after_reconcile(&outcome);
    }

    pub fn apply(&mut self, command: Command) -> Result<(), ViewerError> {
        debug!(?command, "apply");
        match command {
            Command::GotoPage(page) => {
                self.viewport.jump_to(page, 0.0)?;
            }
            Command::NextPage => {
                let next = self.top_page() + 1;
                if next < self.page_count() {
                    self.viewport.jump_to(next, 0.0)?;
                }
            }
            Command::PrevPage => {
                if let Some(prev) = self.top_page().checked_sub(1) {
                    self.viewport.jump_to(prev, 0.0)?;
                }
            }
            Command::SetZoom(percent) => self.set_zoom_percent(percent as i64),
            Command::AdjustZoom(delta) => {
                self.set_zoom_percent(self.zoom_percent as i64 + delta as i64)
            }
            Command::ToggleDarkMode => {
                let dark = !self.viewport.dark_mode();
                self.viewport.set_dark_mode(dark);
            }
            Command::SelectAll => {
                let page = self.current_page();
                if self.selection.select_all(self.viewport.pages(), page) {
                    self.emit_selection();
                }
            }
            Command::ClearSelection => {
                if self.selection.clear() {
                    self.emit(ViewerEvent::SelectionCleared);
                }
            }
            Command::NextSearchResult => {
                let target = self.results.next().map(|r| (r.page_index, r.rect.y0));
                if let Some((page, y)) = target {
                    self.viewport.jump_to(page, y)?;
                }
            }
            Command::PrevSearchResult => {
                let target = self.results.previous().map(|r| (r.page_index, r.rect.y0));
                if let Some((page, y)) = target {
                    self.viewport.jump_to(page, y)?;
                }
            }
        }
        self.sync();
        Ok(())
    }

    /// Page at the top edge of the viewport.
    fn top_page(&self) -> usize {
        self.viewport
            .scroll_info()
            .map_or(self.current_page(), |(page, _)| page)
    }

    fn set_zoom_percent(&mut self, percent: i64) {
        let percent = self.config.clamp_zoom_percent(percent);
        if percent == self.zoom_percent {
            return;
        }
        self.zoom_percent = percent;
        self.viewport.set_zoom(self.config.zoom_for_percent(percent));
        info!(percent, "zoom changed");
    }

    /// Pointer down at screen coordinates relative to the page's top-left.
    /// One click follows links or starts a drag; two select a word; three or
    /// more select the line.
    pub fn press(&mut self, page_index: usize, x: f32, y: f32, clicks: u8) -> Result<PointerOutcome, ViewerError> {
        let zoom = self.viewport.zoom();
        let hit = match self.viewport.pages().get(page_index) {
            None => Hit::Nothing,
            Some(page) => match page.element_at(x, y, zoom) {
                Element::Link(link) if clicks <= 1 => Hit::Link(link.clone()),
                _ => page
                    .nearest_text(x, y, zoom, self.config.nearest_max_distance)
                    .cloned()
                    .map_or(Hit::Nothing, Hit::Text),
            },
        };

        let outcome = match hit {
            Hit::Link(link) => {
                if let Some(destination) = link.internal_destination() {
                    self.viewport.jump_to(destination.page, destination.y)?;
                }
                self.emit(ViewerEvent::LinkActivated(link.clone()));
                PointerOutcome::Link(link)
            }
            Hit::Text(character) => {
                let pages = self.viewport.pages();
                match clicks {
                    0 | 1 => {
                        self.selection.start_selection(pages, page_index, &character);
                        self.emit_selection();
                        PointerOutcome::Selecting
                    }
                    2 => {
                        self.selection.select_word_at(pages, page_index, &character);
                        self.emit_selection();
                        PointerOutcome::Selected
                    }
                    _ => {
                        self.selection.select_line_at(pages, page_index, &character);
                        self.emit_selection();
                        PointerOutcome::Selected
                    }
                }
            }
            Hit::Nothing => {
                if self.selection.clear() {
                    self.emit(ViewerEvent::SelectionCleared);
                }
                PointerOutcome::Ignored
            }
        };
        self.sync();
        Ok(outcome)
    }

    /// Pointer moved while held. Returns whether the selection changed.
    pub fn drag(&mut self, page_index: usize, x: f32, y: f32) -> bool {
        if !self.selection.is_selecting() {
            return false;
        }
        let zoom = self.viewport.zoom();
        let pages = self.viewport.pages();
        let Some(character) = pages
            .get(page_index)
            .and_then(|page| page.nearest_text(x, y, zoom, self.config.nearest_max_distance))
        else {
            return false;
        };
        let changed = self
            .selection
            .extend_selection(pages, page_index, character);
        if changed {
            self.emit_selection();
        }
        changed
    }

    pub fn release(&mut self) {
        self.selection.finish_selection();
    }

    pub fn selection_for(&self, page_index: usize) -> Option<&PageSelection> {
        self.selection.selection_for(page_index)
    }

    pub fn selected_text(&self) -> String {
        self.selection.selected_text()
    }

    /// Starts a cooperative search; [`Self::tick`] advances it.
    pub fn begin_search(&mut self, query: &str) {
        self.results = SearchResults::new(query);
        self.search = Some(ChunkedSearch::new(
            Arc::clone(self.viewport.backend()),
            query,
            self.config.search_chunk_size,
        ));
    }

    pub fn cancel_search(&mut self) {
        self.search = None;
    }

    pub fn search_results(&self) -> &SearchResults {
        &self.results
    }

    pub fn search_highlights(&self, page_index: usize) -> (Vec<Rect>, Option<Rect>) {
        self.results.highlights_for_page(page_index)
    }

    fn step_search(&mut self) -> Option<SearchProgress> {
        let search = self.search.as_mut()?;
        let progress = search.step();
        if progress.is_complete() {
            if let Some(search) = self.search.take() {
                self.results = search.into_results();
                info!(query = self.results.query(), hits = self.results.len(), "search finished");
            }
            self.emit(ViewerEvent::RedrawNeeded);
        }
        Some(progress)
    }

    pub fn snapshot(&self) -> PersistedViewState {
        let (current_page, offset_in_page) = self
            .viewport
            .scroll_info()
            .unwrap_or((self.current_page(), 0.0));
        PersistedViewState {
            current_page,
            offset_in_page,
            zoom_percent: self.zoom_percent,
            dark_mode: self.viewport.dark_mode(),
        }
    }

    /// Re-applies a saved view. Out-of-range pages fall back to the last page.
    pub fn restore(&mut self, state: &PersistedViewState) -> Result<(), ViewerError> {
        let page_count = self.page_count();
        if page_count == 0 {
            return Err(ViewerError::NoDocument);
        }
        self.viewport.set_dark_mode(state.dark_mode);
        self.set_zoom_percent(state.zoom_percent as i64);
        let page = state.current_page.min(page_count - 1);
        self.viewport.jump_to(page, 0.0)?;
        if state.offset_in_page > 0.0 {
            if let Some(layout) = self.viewport.layout() {
                let offset = layout.page_top(page) + state.offset_in_page;
                let outcome = self.viewport.scroll_to(offset);
                self.after_reconcile(&outcome);
            }
        }
        self.sync();
        Ok(())
    }

    /// Restores the view saved for this document, or the default view when
    /// none was saved. Returns whether a saved view was found.
    pub fn load_state(&mut self, store: &dyn StateStore) -> Result<bool, ViewerError> {
        let saved = store
            .load(self.viewport.backend().info())
            .map_err(|err| ViewerError::State(format!("{err:#}")))?;
        let found = saved.is_some();
        self.restore(&saved.unwrap_or_default())?;
        Ok(found)
    }

    pub fn save_state(&self, store: &dyn StateStore) -> Result<(), ViewerError> {
        store
            .save(self.viewport.backend().info(), &self.snapshot())
            .map_err(|err| ViewerError::State(format!("{err:#}")))
    }

    fn after_reconcile(&mut self, outcome: &ReconcileOutcome) {
        if let ReconcileOutcome::Applied(change) = outcome {
            if !change.is_empty() {
                self.sync();
            }
        }
    }

    /// Reports render failures, drops selection slices of evicted pages and
    /// asks for a redraw.
    fn sync(&mut self) {
        for failure in self.viewport.take_failures() {
            self.emit(ViewerEvent::PageFailed(failure));
        }
        let before = self.selection.selected_pages();
        self.selection.refresh(self.viewport.pages());
        let after = self.selection.selected_pages();
        if before != after {
            self.emit(ViewerEvent::SelectionChanged { pages: after });
        }
        self.emit(ViewerEvent::RedrawNeeded);
    }

    fn emit_selection(&self) {
        self.emit(ViewerEvent::SelectionChanged {
            pages: self.selection.selected_pages(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::link_layer::{LinkAction, LinkDestination};
    use crate::state::MemoryStateStore;
    use crate::testing::{glyph_center, FakeBackend};
    use crate::viewport::NullSurface;

    // Zoom 100% maps to 1.5, so fake pages are 210 px tall with a 240 px pitch.
    const PITCH: f32 = 240.0;

    fn viewer(backend: FakeBackend) -> Viewer<NullSurface> {
        let mut viewer = Viewer::new(Arc::new(backend), NullSurface, ViewerConfig::default()).unwrap();
        viewer.resize(1000.0, 600.0);
        viewer.drain_events();
        viewer
    }

    fn screen(line: usize, column: usize) -> (f32, f32) {
        let center = glyph_center(line, column);
        (center.x * 1.5, center.y * 1.5)
    }

    #[test]
    fn navigation_commands_move_the_window() {
        let mut viewer = viewer(FakeBackend::new(40));
        viewer.apply(Command::GotoPage(20)).unwrap();
        assert_eq!(viewer.current_page(), 21);
        assert!(viewer.viewport().materialized().contains(&20));

        viewer.apply(Command::PrevPage).unwrap();
        assert_eq!(viewer.viewport().scroll_offset(), 19.0 * PITCH);
        viewer.apply(Command::NextPage).unwrap();
        viewer.apply(Command::NextPage).unwrap();
        assert_eq!(viewer.viewport().scroll_offset(), 21.0 * PITCH);

        assert!(matches!(
            viewer.apply(Command::GotoPage(40)),
            Err(ViewerError::PageOutOfRange { .. })
        ));
        assert!(viewer.drain_events().contains(&ViewerEvent::RedrawNeeded));
    }

    #[test]
    fn zoom_commands_clamp_to_configured_range() {
        let mut viewer = viewer(FakeBackend::new(3));
        viewer.apply(Command::AdjustZoom(1000)).unwrap();
        assert_eq!(viewer.zoom_percent(), 300);
        viewer.apply(Command::SetZoom(5)).unwrap();
        assert_eq!(viewer.zoom_percent(), 20);
        assert!((viewer.viewport().zoom() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn drag_selects_across_lines() {
        let mut viewer = viewer(FakeBackend::new(2).with_lines(0, &["first line", "second"]));
        let (x, y) = screen(0, 6);
        assert_eq!(viewer.press(0, x, y, 1).unwrap(), PointerOutcome::Selecting);
        let (x, y) = screen(1, 2);
        assert!(viewer.drag(0, x, y));
        viewer.release();

        assert_eq!(viewer.selected_text(), "line\nsec");
        assert!(viewer
            .drain_events()
            .contains(&ViewerEvent::SelectionChanged { pages: vec![0] }));
    }

    #[test]
    fn double_and_triple_click() {
        let mut viewer = viewer(FakeBackend::new(1).with_lines(0, &["say Hi there"]));
        let (x, y) = screen(0, 5);
        assert_eq!(viewer.press(0, x, y, 2).unwrap(), PointerOutcome::Selected);
        assert_eq!(viewer.selected_text(), "Hi");
        assert_eq!(viewer.press(0, x, y, 3).unwrap(), PointerOutcome::Selected);
        assert_eq!(viewer.selected_text(), "say Hi there");
    }

    #[test]
    fn clicking_empty_space_clears_selection() {
        let mut viewer = viewer(FakeBackend::new(1));
        viewer.apply(Command::SelectAll).unwrap();
        assert!(viewer.selection().has_selection());
        viewer.drain_events();

        assert_eq!(viewer.press(0, 140.0, 200.0, 1).unwrap(), PointerOutcome::Ignored);
        assert!(!viewer.selection().has_selection());
        assert!(viewer.drain_events().contains(&ViewerEvent::SelectionCleared));
    }

    #[test]
    fn internal_link_jumps_to_destination() {
        let center = glyph_center(0, 1);
        let backend = FakeBackend::new(30).with_link(
            0,
            Rect::new(center.x - 2.0, center.y - 2.0, center.x + 2.0, center.y + 2.0),
            LinkAction::GoTo {
                destination: LinkDestination::page(12),
            },
        );
        let mut viewer = viewer(backend);
        let (x, y) = screen(0, 1);
        match viewer.press(0, x, y, 1).unwrap() {
            PointerOutcome::Link(link) => assert_eq!(link.display_text(), "Go to page 13"),
            other => panic!("expected link, got {other:?}"),
        }
        assert_eq!(viewer.viewport().scroll_offset(), 12.0 * PITCH);
        assert!(viewer
            .drain_events()
            .iter()
            .any(|event| matches!(event, ViewerEvent::LinkActivated(_))));
    }

    #[test]
    fn eviction_drops_selection_slices() {
        let mut viewer = viewer(FakeBackend::new(60));
        viewer.apply(Command::SelectAll).unwrap();
        assert_eq!(viewer.selection().selected_pages(), vec![0]);

        viewer.apply(Command::GotoPage(40)).unwrap();
        assert!(!viewer.viewport().pages().contains(0));
        assert!(viewer.selection_for(0).is_none());
        assert!(viewer.selected_text().is_empty());
        assert!(viewer
            .drain_events()
            .contains(&ViewerEvent::SelectionChanged { pages: vec![] }));
    }

    #[test]
    fn render_failures_become_events() {
        let mut viewer = viewer(FakeBackend::new(20).with_failing_render(12));
        viewer.apply(Command::GotoPage(10)).unwrap();
        let failed: Vec<usize> = viewer
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                ViewerEvent::PageFailed(err) => Some(err.page_index),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![12]);
    }

    #[test]
    fn search_runs_in_chunks_and_navigates() {
        let mut backend = FakeBackend::new(50);
        for page in [5, 30, 45] {
            backend = backend.with_lines(page, &["the target word"]);
        }
        let mut viewer = viewer(backend);
        viewer.begin_search("target");

        let now = Instant::now();
        let first = viewer.tick(now).unwrap();
        assert_eq!(first.pages_done, 20);
        viewer.tick(now);
        let last = viewer.tick(now).unwrap();
        assert!(last.is_complete());
        assert!(viewer.tick(now).is_none());
        assert_eq!(viewer.search_results().pages_with_hits(), vec![5, 30, 45]);

        viewer.apply(Command::NextSearchResult).unwrap();
        assert_eq!(viewer.search_results().current().map(|r| r.page_index), Some(30));
        let (rects, current) = viewer.search_highlights(30);
        assert_eq!(rects.len(), 1);
        assert!(current.is_some());
    }

    #[test]
    fn snapshot_restores_view() {
        let mut original = viewer(FakeBackend::new(30));
        original.apply(Command::SetZoom(200)).unwrap();
        original.apply(Command::ToggleDarkMode).unwrap();
        original.apply(Command::GotoPage(7)).unwrap();
        let state = original.snapshot();
        assert_eq!(state.current_page, 7);
        assert_eq!(state.zoom_percent, 200);
        assert!(state.dark_mode);

        let mut fresh = viewer(FakeBackend::new(30));
        fresh.restore(&PersistedViewState {
            offset_in_page: 25.0,
            ..state.clone()
        })
        .unwrap();
        let restored = fresh.snapshot();
        assert_eq!(restored.current_page, 7);
        assert!((restored.offset_in_page - 25.0).abs() < 1e-3);
        assert_eq!(restored.zoom_percent, 200);
        assert!(restored.dark_mode);
    }

    #[test]
    fn state_store_round_trip() {
        let store = MemoryStateStore::new();
        let mut first = viewer(FakeBackend::new(30));
        assert!(!first.load_state(&store).unwrap());
        assert_eq!(first.snapshot().current_page, 0);
        first.apply(Command::GotoPage(9)).unwrap();
        first.apply(Command::SetZoom(150)).unwrap();
        first.save_state(&store).unwrap();

        let mut second = viewer(FakeBackend::new(30));
        assert!(second.load_state(&store).unwrap());
        let state = second.snapshot();
        assert_eq!(state.current_page, 9);
        assert_eq!(state.zoom_percent, 150);
    }

    struct BrokenStore;

    impl StateStore for BrokenStore {
        fn load(&self, _: &crate::DocumentInfo) -> anyhow::Result<Option<PersistedViewState>> {
            Err(anyhow::anyhow!("disk on fire"))
        }

        fn save(&self, _: &crate::DocumentInfo, _: &PersistedViewState) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("read-only"))
        }
    }

    #[test]
    fn store_failures_surface_as_state_errors() {
        let mut broken = viewer(FakeBackend::new(3));
        match broken.load_state(&BrokenStore) {
            Err(ViewerError::State(message)) => assert!(message.contains("disk on fire")),
            other => panic!("expected state error, got {other:?}"),
        }
        assert!(matches!(broken.save_state(&BrokenStore), Err(ViewerError::State(_))));
    }
}
