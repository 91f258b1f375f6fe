//! Auxiliary registry for file-based engines (`registry/{engine}.json`)
//!
//! Maps container names to the database files they manage. The registry
//! outlives container records only long enough to find orphans: entries
//! whose file has disappeared from disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::engine::Engine;
use crate::domain::errors::SpinResult;
use crate::infrastructure::stores::atomic::{load_json, save_json};

/// One registered database file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub file_path: PathBuf,
}

/// Registry store for one file-based engine
#[derive(Debug)]
pub struct FileRegistry {
    engine: Engine,
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileRegistry {
    pub fn new(engine: Engine, path: PathBuf) -> Self {
        Self { engine, path, guard: Mutex::new(()) }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    async fn read(&self) -> SpinResult<BTreeMap<String, FileEntry>> {
        Ok(load_json(&self.path).await?.unwrap_or_default())
    }

    pub async fn list(&self) -> SpinResult<BTreeMap<String, FileEntry>> {
        let _lock = self.guard.lock().await;
        self.read().await
    }

    pub async fn get(&self, name: &str) -> SpinResult<Option<FileEntry>> {
        let _lock = self.guard.lock().await;
        Ok(self.read().await?.remove(name))
    }

    /// Insert or replace one entry
    pub async fn update(&self, name: &str, file_path: &Path) -> SpinResult<()> {
        let _lock = self.guard.lock().await;
        let mut entries = self.read().await?;
        entries.insert(name.to_string(), FileEntry { file_path: file_path.to_path_buf() });
        save_json(&self.path, &entries).await
    }

    /// Remove one entry; absent names are tolerated
    pub async fn remove(&self, name: &str) -> SpinResult<()> {
        let _lock = self.guard.lock().await;
        let mut entries = self.read().await?;
        if entries.remove(name).is_some() {
            save_json(&self.path, &entries).await?;
        }
        Ok(())
    }

    /// Names whose registered file no longer exists on disk
    pub async fn find_orphans(&self) -> SpinResult<Vec<String>> {
        let _lock = self.guard.lock().await;
        Ok(self
            .read()
            .await?
            .into_iter()
            .filter(|(_, entry)| !entry.file_path.is_file())
            .map(|(name, _)| name)
            .collect())
    }

    /// Drop every orphaned entry, returning the removed names
    pub async fn remove_orphans(&self) -> SpinResult<Vec<String>> {
        let _lock = self.guard.lock().await;
        let mut entries = self.read().await?;
        let orphans: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.file_path.is_file())
            .map(|(name, _)| name.clone())
            .collect();
        if !orphans.is_empty() {
            for name in &orphans {
                entries.remove(name);
            }
            save_json(&self.path, &entries).await?;
            info!("🧹 Removed {} orphaned {} registry entries", orphans.len(), self.engine);
        }
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> FileRegistry {
        FileRegistry::new(Engine::Sqlite, dir.join("registry").join("sqlite.json"))
    }

    #[tokio::test]
    async fn test_update_get_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        let file = tmp.path().join("notes.sqlite");

        reg.update("notes", &file).await.unwrap();
        assert_eq!(reg.get("notes").await.unwrap().unwrap().file_path, file);

        reg.remove("notes").await.unwrap();
        assert!(reg.get("notes").await.unwrap().is_none());
        // Removing twice is fine
        reg.remove("notes").await.unwrap();
    }

    #[tokio::test]
    async fn test_orphan_detection() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());

        let live = tmp.path().join("live.sqlite");
        tokio::fs::write(&live, b"").await.unwrap();
        reg.update("live", &live).await.unwrap();
        reg.update("ghost", &tmp.path().join("gone.sqlite")).await.unwrap();

        assert_eq!(reg.find_orphans().await.unwrap(), vec!["ghost".to_string()]);
        assert_eq!(reg.remove_orphans().await.unwrap(), vec!["ghost".to_string()]);
        assert!(reg.find_orphans().await.unwrap().is_empty());
        assert!(reg.get("live").await.unwrap().is_some());
    }
}
