// src/state/store.rs

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::errors::{MarathonError, Result};
use crate::fs::{FileSystem, RealFileSystem, write_atomic};
use crate::state::model::DurableMarathonState;

/// Durable key/value store of marathon states, keyed by marathon id.
///
/// `save` returns errors so operator commands can report them; the executor
/// path goes through [`SharedState`](crate::state::SharedState), which logs
/// and swallows them.
pub trait StateStore: Send + Sync + Debug {
    fn save(&self, state: &DurableMarathonState) -> Result<()>;
    /// `Ok(None)` when no marathon with that id was ever saved.
    fn load(&self, id: &str) -> Result<Option<DurableMarathonState>>;
    fn list_ids(&self) -> Result<Vec<String>>;

    /// Like [`load`](Self::load), but a missing id is an error.
    fn load_existing(&self, id: &str) -> Result<DurableMarathonState> {
        self.load(id)?
            .ok_or_else(|| MarathonError::MarathonNotFound(id.to_string()))
    }
}

/// One pretty-printed JSON document per marathon: `<dir>/<id>.json`.
///
/// Every save is a temp-file write followed by a rename, so a crash mid-save
/// leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            dir: dir.into(),
            fs,
        }
    }

    /// Store on the real filesystem.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, Arc::new(RealFileSystem))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl StateStore for FileStateStore {
    fn save(&self, state: &DurableMarathonState) -> Result<()> {
        let path = self.path_for(&state.id);
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(self.fs.as_ref(), &path, &json)?;
        trace!(marathon = %state.id, path = ?path, bytes = json.len(), "state saved");
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<DurableMarathonState>> {
        let path = self.path_for(id);
        if !self.fs.exists(&path) {
            return Ok(None);
        }
        let text = self.fs.read_to_string(&path)?;
        let state = serde_json::from_str(&text)?;
        Ok(Some(state))
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        if !self.fs.exists(&self.dir) {
            debug!(dir = ?self.dir, "state directory does not exist yet");
            return Ok(Vec::new());
        }

        let mut ids: Vec<String> = self
            .fs
            .read_dir(&self.dir)?
            .into_iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|p| {
                let stem = p.file_stem()?.to_str()?;
                // Leftover temp files start with a dot.
                (!stem.starts_with('.')).then(|| stem.to_string())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::fs::mock::MockFileSystem;
    use crate::plan::{MarathonPlan, Milestone};

    fn sample(id: &str) -> DurableMarathonState {
        let plan = MarathonPlan::new("ship it", vec![Milestone::new("a", "A")]);
        DurableMarathonState::new(id, plan, "/work", &EngineSettings::default())
    }

    #[test]
    fn save_then_load_is_identity() {
        let fs = MockFileSystem::new();
        let store = FileStateStore::new("state", Arc::new(fs));
        let state = sample("m-1");

        store.save(&state).unwrap();
        assert_eq!(store.load("m-1").unwrap(), Some(state));
        assert_eq!(store.load("missing").unwrap(), None);
    }

    #[test]
    fn list_ignores_temp_and_foreign_files() {
        let fs = MockFileSystem::new();
        fs.add_file("state/notes.txt", "x");
        fs.add_file("state/.m-9.json.tmp.1", "partial");
        let store = FileStateStore::new("state", Arc::new(fs));
        store.save(&sample("b")).unwrap();
        store.save(&sample("a")).unwrap();

        assert_eq!(store.list_ids().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn failed_write_keeps_previous_document() {
        let fs = MockFileSystem::new();
        let store = FileStateStore::new("state", Arc::new(fs.clone()));
        let mut state = sample("m-1");
        store.save(&state).unwrap();

        fs.set_fail_writes(true);
        state.crash_count = 7;
        assert!(store.save(&state).is_err());

        fs.set_fail_writes(false);
        assert_eq!(store.load("m-1").unwrap().unwrap().crash_count, 0);
    }

    #[test]
    fn missing_dir_lists_nothing() {
        let store = FileStateStore::new("nowhere", Arc::new(MockFileSystem::new()));
        assert!(store.list_ids().unwrap().is_empty());
        assert!(matches!(
            store.load_existing("x"),
            Err(MarathonError::MarathonNotFound(_))
        ));
    }
}
