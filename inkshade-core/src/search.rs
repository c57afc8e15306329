//! Whole-document text search.
//!
//! Two drivers share the per-page logic: [`ChunkedSearch`] runs on the
//! interactive thread a bounded number of pages at a time, and
//! [`SearchWorker`] runs on a background thread and reports through
//! [`SearchMessage`]s.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geometry::Rect;
use crate::worker::{WorkerContext, WorkerHandle};
use crate::DocumentBackend;

/// Largest vertical gap between rectangles of one match that still merge.
pub const SEARCH_Y_TOLERANCE: f32 = 3.0;
/// Merged match rectangles never grow taller than this.
pub const SEARCH_MAX_HEIGHT: f32 = 18.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub page_index: usize,
    pub rect: Rect,
    pub text: String,
}

/// Collapses the rectangles of one match into line-sized boxes: sorted top to
/// bottom, a rectangle joins the running box when the vertical gap is at most
/// [`SEARCH_Y_TOLERANCE`] and the result stays within [`SEARCH_MAX_HEIGHT`].
pub fn merge_search_rects(rects: &[Rect]) -> Vec<Rect> {
    let mut sorted = rects.to_vec();
    sorted.sort_by(|a, b| a.y0.total_cmp(&b.y0).then(a.x0.total_cmp(&b.x0)));

    let mut merged = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut current) = iter.next() else {
        return merged;
    };
    for rect in iter {
        let vertical_gap = rect.y0 - current.y1;
        let projected_height = rect.y1.max(current.y1) - current.y0;
        if vertical_gap <= SEARCH_Y_TOLERANCE && projected_height <= SEARCH_MAX_HEIGHT {
            current = current.union(&rect);
        } else {
            merged.push(current);
            current = rect;
        }
    }
    merged.push(current);
    merged
}

/// Searches one page and returns its results in match order.
pub fn search_page(
    backend: &dyn DocumentBackend,
    page_index: usize,
    query: &str,
) -> Result<Vec<SearchResult>> {
    let hits = backend.search_page(page_index, query)?;
    Ok(hits
        .iter()
        .flat_map(|hit| merge_search_rects(hit))
        .map(|rect| SearchResult {
            page_index,
            rect,
            text: query.to_string(),
        })
        .collect())
}

/// Results of one query with a wrap-around cursor.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    query: String,
    results: Vec<SearchResult>,
    current: Option<usize>,
}

impl SearchResults {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// The first result becomes current.
    pub fn push(&mut self, result: SearchResult) {
        self.results.push(result);
        if self.current.is_none() {
            self.current = Some(0);
        }
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = SearchResult>) {
        for result in results {
            self.push(result);
        }
    }

    pub fn results(&self) -> &[SearchResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&SearchResult> {
        self.current.and_then(|index| self.results.get(index))
    }

    pub fn next(&mut self) -> Option<&SearchResult> {
        let len = self.results.len();
        if len == 0 {
            return None;
        }
        self.current = Some(self.current.map_or(0, |index| (index + 1) % len));
        self.current()
    }

    pub fn previous(&mut self) -> Option<&SearchResult> {
        let len = self.results.len();
        if len == 0 {
            return None;
        }
        self.current = Some(self.current.map_or(len - 1, |index| (index + len - 1) % len));
        self.current()
    }

    /// Highlight boxes for a page, plus the current result's box when it is
    /// on that page.
    pub fn highlights_for_page(&self, page_index: usize) -> (Vec<Rect>, Option<Rect>) {
        let rects = self
            .results
            .iter()
            .filter(|result| result.page_index == page_index)
            .map(|result| result.rect)
            .collect();
        let current = self
            .current()
            .filter(|result| result.page_index == page_index)
            .map(|result| result.rect);
        (rects, current)
    }

    pub fn pages_with_hits(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.results.iter().map(|r| r.page_index).collect();
        pages.dedup();
        pages
    }

    pub fn clear(&mut self) {
        self.results.clear();
        self.current = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchProgress {
    pub pages_done: usize,
    pub page_count: usize,
    pub results: usize,
}

impl SearchProgress {
    pub fn is_complete(&self) -> bool {
        self.pages_done >= self.page_count
    }
}

/// Cooperative search on the interactive thread. Each [`Self::step`] covers at
/// most `chunk_size` pages and then returns control to the caller.
pub struct ChunkedSearch {
    backend: Arc<dyn DocumentBackend>,
    chunk_size: usize,
    next_page: usize,
    results: SearchResults,
}

impl ChunkedSearch {
    pub fn new(backend: Arc<dyn DocumentBackend>, query: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            backend,
            chunk_size: chunk_size.max(1),
            next_page: 0,
            results: SearchResults::new(query),
        }
    }

    pub fn step(&mut self) -> SearchProgress {
        let page_count = self.backend.page_count();
        if self.results.query().is_empty() {
            self.next_page = page_count;
        }
        let end = (self.next_page + self.chunk_size).min(page_count);
        for page_index in self.next_page..end {
            match search_page(self.backend.as_ref(), page_index, self.results.query()) {
                Ok(found) => self.results.extend(found),
                Err(err) => warn!(?err, page = page_index, "search failed on page; skipping"),
            }
        }
        self.next_page = end.max(self.next_page);
        debug!(done = self.next_page, page_count, "search chunk finished");
        self.progress()
    }

    pub fn progress(&self) -> SearchProgress {
        SearchProgress {
            pages_done: self.next_page,
            page_count: self.backend.page_count(),
            results: self.results.len(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.progress().is_complete()
    }

    pub fn results(&self) -> &SearchResults {
        &self.results
    }

    pub fn into_results(self) -> SearchResults {
        self.results
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchMessage {
    /// `page` is 1-based: the page about to be searched.
    Progress { page: usize, page_count: usize },
    Found(SearchResult),
    Finished { total: usize },
}

/// Background search over every page.
pub struct SearchWorker {
    handle: WorkerHandle<SearchMessage>,
}

impl SearchWorker {
    pub fn spawn(backend: Arc<dyn DocumentBackend>, query: impl Into<String>) -> std::io::Result<Self> {
        let query = query.into();
        let handle = WorkerHandle::spawn("inkshade-search", move |ctx| {
            run_search(backend.as_ref(), &query, &ctx)
        })?;
        Ok(Self { handle })
    }

    pub fn poll(&mut self) -> Vec<SearchMessage> {
        self.handle.poll()
    }

    pub async fn next(&mut self) -> Option<SearchMessage> {
        self.handle.next().await
    }

    pub fn blocking_next(&mut self) -> Option<SearchMessage> {
        self.handle.blocking_next()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn run_search(backend: &dyn DocumentBackend, query: &str, ctx: &WorkerContext<SearchMessage>) {
    let page_count = backend.page_count();
    let mut total = 0;
    if !query.is_empty() {
        for page_index in 0..page_count {
            if ctx.is_cancelled() {
                debug!(page = page_index, "search cancelled");
                break;
            }
            ctx.send(SearchMessage::Progress {
                page: page_index + 1,
                page_count,
            });
            match search_page(backend, page_index, query) {
                Ok(found) => {
                    for result in found {
                        total += 1;
                        ctx.send(SearchMessage::Found(result));
                    }
                }
                Err(err) => warn!(?err, page = page_index, "search failed on page; skipping"),
            }
        }
    }
    ctx.send(SearchMessage::Finished { total });
}
