//! Text selection across pages.
//!
//! The manager stores only the two selection ends. Per-page slices are
//! recomputed from whatever pages the [`PageArena`] currently holds, so a page
//! that has been evicted simply stops contributing.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use tracing::{debug, trace};

use crate::geometry::Rect;
use crate::text_layer::{CharacterInfo, PageTextLayer};
use crate::viewport::PageArena;

/// Joins the text of consecutive pages.
pub const PAGE_BREAK: &str = "\n\n";

/// One end of a selection. Identity is `(page_index, global_index)`.
#[derive(Debug, Clone)]
pub struct SelectionAnchor {
    pub page_index: usize,
    pub character: CharacterInfo,
}

impl SelectionAnchor {
    pub fn new(page_index: usize, character: &CharacterInfo) -> Self {
        Self {
            page_index,
            character: character.clone(),
        }
    }

    pub fn position(&self) -> (usize, usize) {
        (self.page_index, self.character.global_index)
    }
}

impl PartialEq for SelectionAnchor {
    fn eq(&self, other: &Self) -> bool {
        self.position() == other.position()
    }
}

impl Eq for SelectionAnchor {}

impl Hash for SelectionAnchor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.position().hash(state);
    }
}

/// The selected part of a single page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageSelection {
    pub characters: Vec<CharacterInfo>,
    /// Merged highlight rectangles in page space.
    pub rects: Vec<Rect>,
}

impl PageSelection {
    fn from_chars(chars: &[CharacterInfo]) -> Self {
        Self {
            rects: PageTextLayer::merge_for_paint(chars),
            characters: chars.to_vec(),
        }
    }

    pub fn text(&self) -> String {
        PageTextLayer::text_of(&self.characters)
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SelectionState {
    #[default]
    Idle,
    /// Pointer is down and dragging.
    Active {
        anchor: SelectionAnchor,
        focus: SelectionAnchor,
    },
    /// Drag finished, or a word/line/page was selected outright.
    Fixed {
        anchor: SelectionAnchor,
        focus: SelectionAnchor,
    },
}

impl SelectionState {
    fn ends(&self) -> Option<(&SelectionAnchor, &SelectionAnchor)> {
        match self {
            SelectionState::Idle => None,
            SelectionState::Active { anchor, focus } | SelectionState::Fixed { anchor, focus } => {
                Some((anchor, focus))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SelectionManager {
    state: SelectionState,
    page_selections: BTreeMap<usize, PageSelection>,
}

impl SelectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    pub fn is_selecting(&self) -> bool {
        matches!(self.state, SelectionState::Active { .. })
    }

    pub fn anchor(&self) -> Option<&SelectionAnchor> {
        self.state.ends().map(|(anchor, _)| anchor)
    }

    pub fn focus(&self) -> Option<&SelectionAnchor> {
        self.state.ends().map(|(_, focus)| focus)
    }

    /// Begins a drag at `character`, discarding any previous selection.
    pub fn start_selection(&mut self, pages: &PageArena, page_index: usize, character: &CharacterInfo) {
        self.page_selections.clear();
        let anchor = SelectionAnchor::new(page_index, character);
        self.state = SelectionState::Active {
            focus: anchor.clone(),
            anchor,
        };
        self.refresh(pages);
    }

    /// Moves the focus. Returns false when there is nothing to extend.
    pub fn extend_selection(
        &mut self,
        pages: &PageArena,
        page_index: usize,
        character: &CharacterInfo,
    ) -> bool {
        let focus = SelectionAnchor::new(page_index, character);
        match &mut self.state {
            SelectionState::Idle => return false,
            SelectionState::Active { focus: current, .. }
            | SelectionState::Fixed { focus: current, .. } => {
                if *current == focus {
                    return false;
                }
                *current = focus;
            }
        }
        self.refresh(pages);
        true
    }

    pub fn finish_selection(&mut self) {
        self.state = match std::mem::take(&mut self.state) {
            SelectionState::Active { anchor, focus } => SelectionState::Fixed { anchor, focus },
            other => other,
        };
    }

    /// Returns whether anything was selected.
    pub fn clear(&mut self) -> bool {
        let had_selection = !matches!(self.state, SelectionState::Idle);
        self.state = SelectionState::Idle;
        self.page_selections.clear();
        had_selection
    }

    /// Selects the run of non-whitespace characters around `character` on
    /// its line.
    pub fn select_word_at(
        &mut self,
        pages: &PageArena,
        page_index: usize,
        character: &CharacterInfo,
    ) -> bool {
        let Some(layer) = Self::layer(pages, page_index) else {
            return false;
        };
        if layer.get(character.global_index) != Some(character) {
            return false;
        }

        let chars = layer.characters();
        let line = character.line_index;
        let in_word = |c: &CharacterInfo| !c.is_whitespace() && c.line_index == line;

        let mut start = character.global_index;
        while start > 0 && in_word(&chars[start - 1]) {
            start -= 1;
        }
        let mut end = character.global_index;
        while end + 1 < chars.len() && in_word(&chars[end + 1]) {
            end += 1;
        }

        self.select_fixed(pages, page_index, &chars[start], &chars[end]);
        true
    }

    /// Selects every character on the visual line of `character`.
    pub fn select_line_at(
        &mut self,
        pages: &PageArena,
        page_index: usize,
        character: &CharacterInfo,
    ) -> bool {
        let Some(layer) = Self::layer(pages, page_index) else {
            return false;
        };
        let line = layer.line_chars(character.block_index, character.line_index);
        let (Some(first), Some(last)) = (line.first(), line.last()) else {
            return false;
        };
        self.select_fixed(pages, page_index, first, last);
        true
    }

    pub fn select_all(&mut self, pages: &PageArena, page_index: usize) -> bool {
        let Some(layer) = Self::layer(pages, page_index) else {
            return false;
        };
        let (Some(first), Some(last)) = (layer.first(), layer.last()) else {
            return false;
        };
        self.select_fixed(pages, page_index, first, last);
        true
    }

    fn select_fixed(
        &mut self,
        pages: &PageArena,
        page_index: usize,
        first: &CharacterInfo,
        last: &CharacterInfo,
    ) {
        self.state = SelectionState::Fixed {
            anchor: SelectionAnchor::new(page_index, first),
            focus: SelectionAnchor::new(page_index, last),
        };
        self.refresh(pages);
    }

    /// Recomputes per-page slices from the resident pages.
    pub fn refresh(&mut self, pages: &PageArena) {
        self.page_selections.clear();
        let Some((anchor, focus)) = self.state.ends() else {
            return;
        };
        let (start, end) = if anchor.position() <= focus.position() {
            (anchor.position(), focus.position())
        } else {
            (focus.position(), anchor.position())
        };
        let ((start_page, start_char), (end_page, end_char)) = (start, end);

        for page_index in start_page..=end_page {
            let Some(layer) = Self::layer(pages, page_index) else {
                trace!(page = page_index, "page not resident; no selection contribution");
                continue;
            };
            if layer.is_empty() {
                continue;
            }
            let last = layer.len() - 1;
            let slice = match (page_index == start_page, page_index == end_page) {
                (true, true) => layer.range_by_index(start_char, end_char),
                (true, false) => layer.range_by_index(start_char, last),
                (false, true) => layer.range_by_index(0, end_char),
                (false, false) => layer.characters(),
            };
            if !slice.is_empty() {
                self.page_selections
                    .insert(page_index, PageSelection::from_chars(slice));
            }
        }

        debug!(
            start_page,
            end_page,
            pages = self.page_selections.len(),
            "selection recomputed"
        );
    }

    fn layer(pages: &PageArena, page_index: usize) -> Option<&PageTextLayer> {
        pages.get(page_index).map(|page| page.text_layer())
    }

    pub fn selection_for(&self, page_index: usize) -> Option<&PageSelection> {
        self.page_selections.get(&page_index)
    }

    pub fn selection_rects(&self, page_index: usize) -> &[Rect] {
        self.page_selections
            .get(&page_index)
            .map(|selection| selection.rects.as_slice())
            .unwrap_or_default()
    }

    pub fn selected_pages(&self) -> Vec<usize> {
        self.page_selections.keys().copied().collect()
    }

    pub fn has_selection(&self) -> bool {
        !self.page_selections.is_empty()
    }

    /// Selected text in page order, pages separated by [`PAGE_BREAK`].
    pub fn selected_text(&self) -> String {
        self.page_selections
            .values()
            .map(PageSelection::text)
            .collect::<Vec<_>>()
            .join(PAGE_BREAK)
    }
}
