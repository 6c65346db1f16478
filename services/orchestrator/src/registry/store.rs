//! Per-instance state snapshot persistence.
//!
//! The snapshot is a flat string map stored as JSON. Writes go to a temp file
//! first and are renamed into place so readers never see a torn record.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Flat key/value record kept in `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot(BTreeMap<String, String>);

impl StateSnapshot {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<String> {
        self.0.remove(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Snapshot file of one workspace.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. A missing file reads as empty.
    pub fn load(&self) -> io::Result<StateSnapshot> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StateSnapshot::default()),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Save the snapshot atomically (write temp, rename).
    pub fn save(&self, snapshot: &StateSnapshot) -> io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), fields = snapshot.0.len(), "Saved snapshot");
        Ok(())
    }

    /// Create an empty snapshot unless one exists.
    pub fn create_if_missing(&self) -> io::Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        self.save(&StateSnapshot::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("state.json"));
        assert!(file.load().unwrap().is_empty());
    }

    #[test]
    fn save_replaces_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("state.json"));

        let mut snapshot = StateSnapshot::default();
        snapshot.insert("port", "1024");
        snapshot.insert("pid", "77");
        file.save(&snapshot).unwrap();

        snapshot.remove("pid");
        file.save(&snapshot).unwrap();

        let loaded = file.load().unwrap();
        assert_eq!(loaded.get("port"), Some("1024"));
        assert_eq!(loaded.get("pid"), None);
        assert!(!dir.path().join("state.tmp").exists());
    }

    #[test]
    fn garbage_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();
        let err = SnapshotFile::new(path).load().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
