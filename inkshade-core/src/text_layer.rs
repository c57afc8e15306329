//! Character-level text index for a single page.
//!
//! A [`PageTextLayer`] is built once from the backend's glyph stream and is
//! immutable afterwards. Characters are stored in reading order; their
//! `global_index` doubles as their position in that order, which every range
//! operation relies on. A uniform grid maps page-space cells to the
//! characters overlapping them so point and rectangle queries only touch a
//! handful of candidates.

use std::collections::{BTreeSet, HashMap};
use std::ops::{Range, RangeInclusive};

use tracing::{debug, warn};

use crate::geometry::{Point, Rect};
use crate::{DocumentBackend, FontInfo, Glyph};

/// Side length of a spatial grid cell, in page units.
pub const GRID_CELL_SIZE: f32 = 50.0;

/// Horizontal gap below which neighbouring glyphs share a paint rectangle.
pub const MERGE_GAP_TOLERANCE: f32 = 3.0;

/// Glyphs spanning more grid cells than this on either axis are kept out of
/// the grid and checked by every query instead.
const MAX_GLYPH_CELL_SPAN: i64 = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct CharacterInfo {
    pub ch: char,
    pub bbox: Rect,
    pub origin: Point,
    pub block_index: usize,
    pub line_index: usize,
    pub span_index: usize,
    pub font: FontInfo,
    pub global_index: usize,
}

impl CharacterInfo {
    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        self.bbox.contains(x, y)
    }

    /// Identifies the visual line this character belongs to.
    pub fn line_key(&self) -> (usize, usize) {
        (self.block_index, self.line_index)
    }

    pub fn is_whitespace(&self) -> bool {
        self.ch.is_whitespace()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineInfo {
    pub block_index: usize,
    pub line_index: usize,
    pub bbox: Rect,
    /// Global indices covered by the line.
    pub range: Range<usize>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub block_index: usize,
    pub bbox: Rect,
    pub lines: Vec<LineInfo>,
}

impl BlockInfo {
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

type CellKey = (i32, i32);

fn cell_coord(value: f32) -> i32 {
    (value / GRID_CELL_SIZE).floor() as i32
}

/// Inclusive row and column extents of the occupied cells.
#[derive(Debug, Clone, Copy)]
struct CellBounds {
    rows: (i32, i32),
    cols: (i32, i32),
}

impl CellBounds {
    fn of<'a>(keys: impl Iterator<Item = &'a CellKey>) -> Option<Self> {
        keys.fold(None, |bounds: Option<Self>, &(row, col)| {
            Some(match bounds {
                None => Self {
                    rows: (row, row),
                    cols: (col, col),
                },
                Some(b) => Self {
                    rows: (b.rows.0.min(row), b.rows.1.max(row)),
                    cols: (b.cols.0.min(col), b.cols.1.max(col)),
                },
            })
        })
    }
}

fn clamp_cells(range: RangeInclusive<i32>, bounds: (i32, i32)) -> RangeInclusive<i32> {
    (*range.start()).max(bounds.0)..=(*range.end()).min(bounds.1)
}

fn cell_span(lo: f32, hi: f32) -> RangeInclusive<i32> {
    cell_coord(lo)..=cell_coord(hi)
}

#[derive(Debug, Clone, Default)]
pub struct PageTextLayer {
    page_index: usize,
    characters: Vec<CharacterInfo>,
    grid: HashMap<CellKey, Vec<usize>>,
    bounds: Option<CellBounds>,
    oversized: Vec<usize>,
}

impl PageTextLayer {
    pub fn empty(page_index: usize) -> Self {
        Self {
            page_index,
            characters: Vec::new(),
            grid: HashMap::new(),
            bounds: None,
            oversized: Vec::new(),
        }
    }

    /// Builds the layer from glyphs that are already in reading order.
    pub fn build(page_index: usize, glyphs: Vec<Glyph>) -> Self {
        let characters: Vec<CharacterInfo> = glyphs
            .into_iter()
            .enumerate()
            .map(|(global_index, glyph)| CharacterInfo {
                ch: glyph.ch,
                bbox: glyph.bbox.normalized(),
                origin: glyph.origin,
                block_index: glyph.block,
                line_index: glyph.line,
                span_index: glyph.span,
                font: glyph.font,
                global_index,
            })
            .collect();

        let mut grid: HashMap<CellKey, Vec<usize>> = HashMap::new();
        let mut oversized = Vec::new();
        for character in &characters {
            let bbox = character.bbox;
            if !bbox.is_valid() {
                continue;
            }
            let rows = cell_span(bbox.y0, bbox.y1);
            let cols = cell_span(bbox.x0, bbox.x1);
            let too_tall = *rows.end() as i64 - *rows.start() as i64 >= MAX_GLYPH_CELL_SPAN;
            let too_wide = *cols.end() as i64 - *cols.start() as i64 >= MAX_GLYPH_CELL_SPAN;
            if too_tall || too_wide {
                oversized.push(character.global_index);
                continue;
            }
            for row in rows {
                for col in cols.clone() {
                    grid.entry((row, col))
                        .or_default()
                        .push(character.global_index);
                }
            }
        }

        debug!(
            page = page_index,
            characters = characters.len(),
            cells = grid.len(),
            oversized = oversized.len(),
            "built text layer"
        );

        Self {
            page_index,
            characters,
            bounds: CellBounds::of(grid.keys()),
            grid,
            oversized,
        }
    }

    /// Extracts glyphs through the backend, degrading to an empty layer when
    /// extraction fails.
    pub fn from_backend(backend: &dyn DocumentBackend, page_index: usize) -> Self {
        match backend.page_glyphs(page_index) {
            Ok(glyphs) => Self::build(page_index, glyphs),
            Err(err) => {
                warn!(?err, page = page_index, "text extraction failed; using empty layer");
                Self::empty(page_index)
            }
        }
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn characters(&self) -> &[CharacterInfo] {
        &self.characters
    }

    pub fn get(&self, global_index: usize) -> Option<&CharacterInfo> {
        self.characters.get(global_index)
    }

    pub fn first(&self) -> Option<&CharacterInfo> {
        self.characters.first()
    }

    pub fn last(&self) -> Option<&CharacterInfo> {
        self.characters.last()
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    fn cell(&self, row: i32, col: i32) -> impl Iterator<Item = &CharacterInfo> + '_ {
        self.grid
            .get(&(row, col))
            .into_iter()
            .flatten()
            .filter_map(|&index| self.characters.get(index))
    }

    /// Characters filed under the given cells, clamped to the occupied part
    /// of the grid, followed by every oversized glyph.
    fn candidates(
        &self,
        rows: RangeInclusive<i32>,
        cols: RangeInclusive<i32>,
    ) -> impl Iterator<Item = &CharacterInfo> + '_ {
        let (rows, cols) = match self.bounds {
            Some(bounds) => (clamp_cells(rows, bounds.rows), clamp_cells(cols, bounds.cols)),
            None => (1..=0, 1..=0),
        };
        rows.flat_map(move |row| cols.clone().map(move |col| (row, col)))
            .flat_map(move |(row, col)| self.cell(row, col))
            .chain(
                self.oversized
                    .iter()
                    .filter_map(move |&index| self.characters.get(index)),
            )
    }

    /// Returns the first character whose box contains the point.
    pub fn char_at(&self, x: f32, y: f32) -> Option<&CharacterInfo> {
        let (row, col) = (cell_coord(y), cell_coord(x));
        self.candidates(row..=row, col..=col)
            .find(|character| character.contains_point(x, y))
    }

    /// Exact hit if there is one, otherwise the character whose box centre is
    /// closest to the point and no further than `max_distance`.
    pub fn nearest_char(&self, x: f32, y: f32, max_distance: f32) -> Option<&CharacterInfo> {
        if let Some(hit) = self.char_at(x, y) {
            return Some(hit);
        }

        let center_row = cell_coord(y);
        let center_col = cell_coord(x);
        let radius = ((max_distance.max(0.0) / GRID_CELL_SIZE).ceil() as i32).saturating_add(1);
        let rows = center_row.saturating_sub(radius)..=center_row.saturating_add(radius);
        let cols = center_col.saturating_sub(radius)..=center_col.saturating_add(radius);

        let mut best: Option<(&CharacterInfo, f32)> = None;
        for character in self.candidates(rows, cols) {
            let center = character.bbox.center();
            let distance = ((x - center.x).powi(2) + (y - center.y).powi(2)).sqrt();
            if distance > max_distance {
                continue;
            }
            if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                best = Some((character, distance));
            }
        }

        best.map(|(character, _)| character)
    }

    /// Inclusive reading-order slice between two characters, in either order.
    pub fn chars_in_range(&self, a: &CharacterInfo, b: &CharacterInfo) -> &[CharacterInfo] {
        self.range_by_index(a.global_index, b.global_index)
    }

    /// Index-based form of [`Self::chars_in_range`]. Indices past the end are
    /// clamped to the last character.
    pub fn range_by_index(&self, a: usize, b: usize) -> &[CharacterInfo] {
        let (start, end) = if a > b { (b, a) } else { (a, b) };
        if start >= self.characters.len() {
            return &[];
        }
        let end = end.min(self.characters.len() - 1);
        &self.characters[start..=end]
    }

    /// Characters whose boxes intersect `rect`, sorted by `global_index`.
    pub fn chars_in_rect(&self, rect: Rect) -> Vec<&CharacterInfo> {
        let rect = rect.normalized();
        let mut hits = BTreeSet::new();
        for character in self.candidates(cell_span(rect.y0, rect.y1), cell_span(rect.x0, rect.x1)) {
            if character.bbox.intersects(&rect) {
                hits.insert(character.global_index);
            }
        }
        hits.into_iter()
            .filter_map(|index| self.characters.get(index))
            .collect()
    }

    /// Characters on the given visual line, in reading order.
    pub fn line_chars(&self, block_index: usize, line_index: usize) -> Vec<&CharacterInfo> {
        let mut chars: Vec<&CharacterInfo> = self
            .characters
            .iter()
            .filter(|c| c.block_index == block_index && c.line_index == line_index)
            .collect();
        chars.sort_by_key(|c| c.global_index);
        chars
    }

    /// Minimal set of paint rectangles covering the given characters.
    ///
    /// Characters are grouped per line and swept left to right; a character
    /// joins the current run when its left edge is within
    /// [`MERGE_GAP_TOLERANCE`] of the run's right edge.
    pub fn merge_for_paint<'a, I>(chars: I) -> Vec<Rect>
    where
        I: IntoIterator<Item = &'a CharacterInfo>,
    {
        let mut order: Vec<(usize, usize)> = Vec::new();
        let mut lines: HashMap<(usize, usize), Vec<&CharacterInfo>> = HashMap::new();
        for character in chars {
            let key = character.line_key();
            lines
                .entry(key)
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(character);
        }

        let mut rects = Vec::new();
        for key in order {
            let Some(mut line) = lines.remove(&key) else {
                continue;
            };
            line.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));

            let mut current: Option<Rect> = None;
            for character in line {
                let bbox = character.bbox;
                current = match current {
                    Some(run) if bbox.x0 - run.x1 < MERGE_GAP_TOLERANCE => Some(run.union(&bbox)),
                    Some(run) => {
                        rects.push(run);
                        Some(bbox)
                    }
                    None => Some(bbox),
                };
            }
            if let Some(run) = current {
                rects.push(run);
            }
        }
        rects
    }

    /// Reconstructs text: characters in reading order, one line per
    /// `(block, line)` run, lines joined with `\n`.
    pub fn text_of<'a, I>(chars: I) -> String
    where
        I: IntoIterator<Item = &'a CharacterInfo>,
    {
        let mut sorted: Vec<&CharacterInfo> = chars.into_iter().collect();
        sorted.sort_by_key(|c| c.global_index);

        let mut text = String::new();
        let mut last_key = None;
        for character in sorted {
            let key = character.line_key();
            if last_key.is_some_and(|last| last != key) {
                text.push('\n');
            }
            text.push(character.ch);
            last_key = Some(key);
        }
        text
    }

    pub fn full_text(&self) -> String {
        Self::text_of(&self.characters)
    }

    /// Groups the characters into contiguous lines.
    pub fn lines(&self) -> Vec<LineInfo> {
        let mut lines: Vec<LineInfo> = Vec::new();
        for character in &self.characters {
            match lines.last_mut() {
                Some(line)
                    if (line.block_index, line.line_index) == character.line_key()
                        && line.range.end == character.global_index =>
                {
                    line.bbox = line.bbox.union(&character.bbox);
                    line.range.end = character.global_index + 1;
                    line.text.push(character.ch);
                }
                _ => lines.push(LineInfo {
                    block_index: character.block_index,
                    line_index: character.line_index,
                    bbox: character.bbox,
                    range: character.global_index..character.global_index + 1,
                    text: character.ch.to_string(),
                }),
            }
        }
        lines
    }

    pub fn blocks(&self) -> Vec<BlockInfo> {
        let mut blocks: Vec<BlockInfo> = Vec::new();
        for line in self.lines() {
            match blocks.last_mut() {
                Some(block) if block.block_index == line.block_index => {
                    block.bbox = block.bbox.union(&line.bbox);
                    block.lines.push(line);
                }
                _ => blocks.push(BlockInfo {
                    block_index: line.block_index,
                    bbox: line.bbox,
                    lines: vec![line],
                }),
            }
        }
        blocks
    }
}
