//! Durable per-agency poll cursors.
//!
//! A cursor only advances after the page it covers was published, so a
//! crash between fetch and publish re-fetches the page. Duplicates are
//! tolerated downstream; losing events is not. Writes are atomic
//! (temp file + rename) so a crash mid-write never corrupts the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CursorsFile {
    pub schema_version: u32,
    /// `agency_id:account_id` -> opaque agency cursor.
    pub cursors: HashMap<String, String>,
}

pub struct CursorStore {
    path: PathBuf,
    cache: Mutex<CursorsFile>,
}

impl CursorStore {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data dir: {:?}", dir))?;
        let path = dir.join("cursors.json");
        let cache = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read cursors file: {:?}", path))?;
            if content.trim().is_empty() {
                CursorsFile { schema_version: 1, ..Default::default() }
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse cursors file: {:?}", path))?
            }
        } else {
            CursorsFile { schema_version: 1, ..Default::default() }
        };
        Ok(Self { path, cache: Mutex::new(cache) })
    }

    pub fn get(&self, agency_id: &str, account_id: &str) -> Option<String> {
        self.cache.lock().cursors.get(&key(agency_id, account_id)).cloned()
    }

    /// Persist the new cursor position. Called only after the page behind
    /// it was successfully published.
    pub fn commit(&self, agency_id: &str, account_id: &str, cursor: String) -> Result<()> {
        let snapshot = {
            let mut cache = self.cache.lock();
            cache.cursors.insert(key(agency_id, account_id), cursor);
            cache.clone()
        };
        let content =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize cursors")?;
        atomic_write(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write cursors file: {:?}", self.path))
    }
}

fn key(agency_id: &str, account_id: &str) -> String {
    format!("{agency_id}:{account_id}")
}

fn atomic_write(dest: &Path, bytes: &[u8]) -> Result<()> {
    let parent = dest.parent().context("Destination path has no parent directory")?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create parent dir: {:?}", parent))?;

    let tmp = dest.with_extension(format!("tmp.{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write temp file: {:?}", tmp))?;

    // Best-effort cleanup on failure.
    if let Err(rename_err) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(rename_err).context("Failed to rename temp file into place");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CursorStore::open(dir.path()).unwrap();
            assert!(store.get("etoll", "a1").is_none());
            store.commit("etoll", "a1", "cursor-42".into()).unwrap();
        }
        let store = CursorStore::open(dir.path()).unwrap();
        assert_eq!(store.get("etoll", "a1").as_deref(), Some("cursor-42"));
    }

    #[test]
    fn accounts_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::open(dir.path()).unwrap();
        store.commit("etoll", "a1", "c1".into()).unwrap();
        store.commit("etoll", "a2", "c2".into()).unwrap();
        store.commit("fasttrack", "a1", "c3".into()).unwrap();
        assert_eq!(store.get("etoll", "a1").as_deref(), Some("c1"));
        assert_eq!(store.get("etoll", "a2").as_deref(), Some("c2"));
        assert_eq!(store.get("fasttrack", "a1").as_deref(), Some("c3"));
    }

    #[test]
    fn empty_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cursors.json"), "").unwrap();
        let store = CursorStore::open(dir.path()).unwrap();
        assert!(store.get("etoll", "a1").is_none());
    }
}
