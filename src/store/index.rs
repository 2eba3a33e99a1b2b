//! On-disk snapshot index.
//!
//! A single pretty-printed JSON file so changes stay readable in a diff.
//! Writes go to a temp file which is then renamed over the old index. Temp
//! names are unique per write so concurrent writers never share one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::Snapshot;
use crate::error::{Error, Result};

pub const INDEX_FILE: &str = "index.json";
const TEMP_SUFFIX: &str = ".tmp";
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotIndex {
    pub version: u32,
    pub snapshots: Vec<Snapshot>,
}

impl Default for SnapshotIndex {
    fn default() -> Self {
        SnapshotIndex {
            version: INDEX_VERSION,
            snapshots: Vec::new(),
        }
    }
}

impl SnapshotIndex {
    pub fn path(root: &Path) -> PathBuf {
        root.join(INDEX_FILE)
    }

    /// Load the index, or an empty one if the file does not exist yet.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(index_error(&path, e)),
        };

        let index: SnapshotIndex =
            serde_json::from_str(&contents).map_err(|e| index_error(&path, e))?;
        if index.version > INDEX_VERSION {
            return Err(Error::Index {
                path,
                reason: format!(
                    "index version {} is newer than supported version {INDEX_VERSION}",
                    index.version
                ),
            });
        }
        Ok(index)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = Self::path(root);
        let tmp = root.join(format!(
            "{INDEX_FILE}.{}-{}{TEMP_SUFFIX}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));

        let mut json = serde_json::to_string_pretty(self).map_err(|e| index_error(&path, e))?;
        json.push('\n');

        let write = || -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new().write(true).create_new(true).open(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            index_error(&path, e)
        })
    }

    pub fn get(&self, id: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Snapshot> {
        self.snapshots.iter_mut().find(|s| s.id == id)
    }

    /// Insert or replace by id, keeping exactly one record per id.
    pub fn upsert(&mut self, snapshot: Snapshot) {
        match self.get_mut(&snapshot.id) {
            Some(existing) => *existing = snapshot,
            None => self.snapshots.push(snapshot),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Snapshot> {
        let pos = self.snapshots.iter().position(|s| s.id == id)?;
        Some(self.snapshots.remove(pos))
    }
}

/// Remove temp files left by writers that died before their rename.
/// Only safe while holding the store lock.
pub fn remove_stale_temp_files(root: &Path) {
    let Ok(entries) = fs::read_dir(root) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_temp_name(&name) {
            match fs::remove_file(entry.path()) {
                Ok(()) => tracing::info!(path = %entry.path().display(), "removed stale index temp file"),
                Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove stale index temp file"),
            }
        }
    }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with(&format!("{INDEX_FILE}.")) && name.ends_with(TEMP_SUFFIX)
}

fn index_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Index {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
