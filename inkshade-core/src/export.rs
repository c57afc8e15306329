use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::selection::PAGE_BREAK;
use crate::text_layer::PageTextLayer;
use crate::worker::{WorkerContext, WorkerHandle};
use crate::DocumentBackend;

#[derive(Debug, Clone, PartialEq)]
pub enum ExportMessage {
    Progress { page: usize, page_count: usize },
    Finished { path: PathBuf, pages: usize },
    Cancelled,
    Failed(String),
}

/// Writes the text of every page to a file on a background thread.
pub struct TextExportWorker {
    handle: WorkerHandle<ExportMessage>,
}

impl TextExportWorker {
    pub fn spawn(backend: Arc<dyn DocumentBackend>, output: PathBuf) -> std::io::Result<Self> {
        let handle = WorkerHandle::spawn("inkshade-export", move |ctx| {
            let message = match export_text(backend.as_ref(), &output, &ctx) {
                Ok(Some(pages)) => {
                    info!(path = %output.display(), pages, "text export finished");
                    ExportMessage::Finished {
                        path: output,
                        pages,
                    }
                }
                Ok(None) => ExportMessage::Cancelled,
                Err(err) => {
                    warn!(?err, "text export failed");
                    ExportMessage::Failed(format!("{err:#}"))
                }
            };
            ctx.send(message);
        })?;
        Ok(Self { handle })
    }

    pub fn poll(&mut self) -> Vec<ExportMessage> {
        self.handle.poll()
    }

    pub async fn next(&mut self) -> Option<ExportMessage> {
        self.handle.next().await
    }

    pub fn blocking_next(&mut self) -> Option<ExportMessage> {
        self.handle.blocking_next()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Returns the number of pages written, or `None` when cancelled. A cancelled
/// export leaves no file behind.
fn export_text(
    backend: &dyn DocumentBackend,
    output: &Path,
    ctx: &WorkerContext<ExportMessage>,
) -> Result<Option<usize>> {
    let page_count = backend.page_count();
    let mut pages = Vec::with_capacity(page_count);
    for page_index in 0..page_count {
        if ctx.is_cancelled() {
            debug!(page = page_index, "text export cancelled");
            return Ok(None);
        }
        ctx.send(ExportMessage::Progress {
            page: page_index + 1,
            page_count,
        });
        pages.push(PageTextLayer::from_backend(backend, page_index).full_text());
    }

    let tmp = output.with_extension("txt.tmp");
    let mut file =
        File::create(&tmp).with_context(|| format!("failed to create export file {:?}", tmp))?;
    file.write_all(pages.join(PAGE_BREAK).as_bytes())
        .with_context(|| format!("failed to write export file {:?}", tmp))?;
    file.flush()?;
    fs::rename(&tmp, output)
        .with_context(|| format!("failed to move export into place at {:?}", output))?;
    Ok(Some(page_count))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::testing::FakeBackend;

    fn drain(worker: &mut TextExportWorker) -> Vec<ExportMessage> {
        let mut messages = Vec::new();
        while let Some(message) = worker.blocking_next() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn exports_pages_separated_by_page_breaks() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.txt");
        let backend = FakeBackend::new(3).with_lines(1, &["middle", "page"]);
        let mut worker = TextExportWorker::spawn(Arc::new(backend), output.clone()).unwrap();

        let messages = drain(&mut worker);
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages.last(),
            Some(&ExportMessage::Finished {
                path: output.clone(),
                pages: 3
            })
        );

        let text = std::fs::read_to_string(&output).unwrap();
        assert_eq!(
            text,
            "page 0 top\nshared footer\n\nmiddle\npage\n\npage 2 top\nshared footer"
        );
        assert!(!output.with_extension("txt.tmp").exists());
    }

    #[test]
    fn pages_without_text_export_as_empty() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.txt");
        let backend = FakeBackend::new(2).with_failing_glyphs(0);
        let mut worker = TextExportWorker::spawn(Arc::new(backend), output.clone()).unwrap();
        drain(&mut worker);
        let text = std::fs::read_to_string(&output).unwrap();
        assert_eq!(text, "\n\npage 1 top\nshared footer");
    }

    #[test]
    fn unwritable_destination_reports_failure() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("missing").join("out.txt");
        let mut worker = TextExportWorker::spawn(Arc::new(FakeBackend::new(1)), output).unwrap();
        match drain(&mut worker).pop() {
            Some(ExportMessage::Failed(message)) => {
                assert!(message.contains("failed to create export file"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
