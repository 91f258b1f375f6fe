//! Container catalog - one JSON record per container under `containers/`
//!
//! The catalog owns every container record and is the single authority for
//! name uniqueness. Each mutation is a load-mutate-save step under an
//! in-process lock; each record file is replaced atomically.

use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::container::Container;
use crate::domain::errors::{SpinError, SpinResult};
use crate::infrastructure::stores::atomic::{load_json, save_json};

/// On-disk container catalog
#[derive(Debug)]
pub struct Catalog {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl Catalog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, guard: Mutex::new(()) }
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.file(name).is_file()
    }

    /// Load one container record, `NotFound` when absent
    pub async fn get(&self, name: &str) -> SpinResult<Container> {
        load_json::<Container>(&self.file(name))
            .await?
            .ok_or_else(|| SpinError::NotFound { name: name.to_string() })
    }

    /// Every container in the catalog, sorted by name
    pub async fn list(&self) -> SpinResult<Vec<Container>> {
        let _lock = self.guard.lock().await;
        let mut containers = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(containers),
            Err(e) => return Err(SpinError::io(format!("read {}", self.dir.display()), e)),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(container) = load_json::<Container>(&path).await? {
                    containers.push(container);
                }
            }
        }
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    /// Insert a new record; `NameConflict` when the name is taken
    pub async fn insert(&self, container: &Container) -> SpinResult<()> {
        let _lock = self.guard.lock().await;
        let path = self.file(&container.name);
        if path.is_file() {
            return Err(SpinError::NameConflict { name: container.name.clone() });
        }
        debug!("📒 Catalog insert: {}", container.name);
        save_json(&path, container).await
    }

    /// Replace an existing record in full
    pub async fn put(&self, container: &Container) -> SpinResult<()> {
        let _lock = self.guard.lock().await;
        save_json(&self.file(&container.name), container).await
    }

    /// Load-mutate-save one record as a single exclusive step
    pub async fn update<F>(&self, name: &str, mutate: F) -> SpinResult<Container>
    where
        F: FnOnce(&mut Container),
    {
        let _lock = self.guard.lock().await;
        let path = self.file(name);
        let mut container = load_json::<Container>(&path)
            .await?
            .ok_or_else(|| SpinError::NotFound { name: name.to_string() })?;
        mutate(&mut container);
        save_json(&path, &container).await?;
        Ok(container)
    }

    /// Remove a record; missing files are tolerated
    pub async fn remove(&self, name: &str) -> SpinResult<()> {
        let _lock = self.guard.lock().await;
        match tokio::fs::remove_file(self.file(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpinError::io(format!("remove catalog entry {name}"), e)),
        }
    }

    /// Containers currently referencing an (engine, version) installation
    pub async fn referencing_installation(
        &self,
        engine: crate::domain::engine::Engine,
        version: &str,
    ) -> SpinResult<Vec<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.engine == engine && c.version == version)
            .map(|c| c.name)
            .collect())
    }
}
