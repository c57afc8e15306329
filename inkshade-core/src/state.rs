use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{DocumentId, DocumentInfo};

/// Where the reader left off in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedViewState {
    pub current_page: usize,
    /// Scroll distance below the top of `current_page`, in screen pixels at
    /// `zoom_percent`.
    pub offset_in_page: f32,
    pub zoom_percent: u32,
    pub dark_mode: bool,
}

impl Default for PersistedViewState {
    fn default() -> Self {
        Self {
            current_page: 0,
            offset_in_page: 0.0,
            zoom_percent: 100,
            dark_mode: false,
        }
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>>;
    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<()>;
}

/// One JSON file per document, named by the document id.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn state_path(&self, doc: &DocumentInfo) -> PathBuf {
        self.root.join(format!("{}.json", doc.id))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>> {
        let path = self.state_path(doc);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read state file {:?}", path))?;
        let state = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode state file {:?}", path))?;
        Ok(Some(state))
    }

    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<()> {
        let path = self.state_path(doc);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp state file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move state into place at {:?}", path))?;
        debug!(document = %doc.id, page = state.current_page, "saved view state");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<DocumentId, PersistedViewState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedViewState>> {
        Ok(self.inner.lock().get(&doc.id).cloned())
    }

    fn save(&self, doc: &DocumentInfo, state: &PersistedViewState) -> Result<()> {
        self.inner.lock().insert(doc.id, state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::{document_id_for_path, DocumentMetadata};

    fn info_for(path: PathBuf) -> DocumentInfo {
        DocumentInfo {
            id: document_id_for_path(&path),
            path,
            page_count: 12,
            metadata: DocumentMetadata::default(),
        }
    }

    #[test]
    fn file_store_round_trips_view_state() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("paper.pdf");
        std::fs::write(&file_path, b"dummy").unwrap();
        let info = info_for(file_path);

        let store = FileStateStore::new(dir.path().join("state")).unwrap();
        assert!(store.load(&info).unwrap().is_none());

        let state = PersistedViewState {
            current_page: 7,
            offset_in_page: 42.5,
            zoom_percent: 150,
            dark_mode: true,
        };
        store.save(&info, &state).unwrap();

        assert_eq!(store.load(&info).unwrap(), Some(state));
        assert!(!dir
            .path()
            .join("state")
            .join(format!("{}.json.tmp", info.id))
            .exists());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let info = info_for(dir.path().join("old.pdf"));
        let store = FileStateStore::new(dir.path().to_path_buf()).unwrap();
        std::fs::write(
            dir.path().join(format!("{}.json", info.id)),
            r#"{ "current_page": 3 }"#,
        )
        .unwrap();

        let restored = store.load(&info).unwrap().unwrap();
        assert_eq!(restored.current_page, 3);
        assert_eq!(restored.zoom_percent, 100);
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let dir = tempdir().unwrap();
        let info = info_for(dir.path().join("bad.pdf"));
        let store = FileStateStore::new(dir.path().to_path_buf()).unwrap();
        std::fs::write(dir.path().join(format!("{}.json", info.id)), "{ nope").unwrap();

        let err = store.load(&info).unwrap_err();
        assert!(format!("{err:#}").contains("failed to decode state file"));
    }

    #[test]
    fn memory_store_keys_by_document() {
        let store = MemoryStateStore::new();
        let a = info_for(PathBuf::from("/docs/a.pdf"));
        let b = info_for(PathBuf::from("/docs/b.pdf"));
        store
            .save(
                &a,
                &PersistedViewState {
                    current_page: 2,
                    ..PersistedViewState::default()
                },
            )
            .unwrap();
        assert_eq!(store.load(&a).unwrap().map(|s| s.current_page), Some(2));
        assert!(store.load(&b).unwrap().is_none());
    }
}
