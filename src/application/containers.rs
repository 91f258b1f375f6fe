//! Container manager - catalog CRUD and lifecycle bookkeeping
//!
//! All catalog mutations pass through here. The manager enforces name and
//! port uniqueness, serializes operations per container through name-keyed
//! locks, and drives the multi-step operations (rename, clone, delete,
//! attach/detach) with transactional rollback.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::application::transaction::Transaction;
use crate::domain::container::{
    Container, ContainerStatus, validate_container_name, validate_database_name,
};
use crate::domain::engine::{Engine, EngineKind};
use crate::domain::errors::{SpinError, SpinResult};
use crate::domain::version::resolve_version;
use crate::infrastructure::fsutil::{copy_recursive, move_path, remove_recursive};
use crate::infrastructure::paths::SpinPaths;
use crate::infrastructure::ports::find_available_port;
use crate::infrastructure::process::{ProcessManager, StopSpec};
use crate::infrastructure::stores::catalog::Catalog;
use crate::infrastructure::stores::file_registry::FileRegistry;

/// Options for `create`
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub engine: Engine,
    pub version: String,
    /// Preferred port; `None` picks the engine default then scans
    pub port: Option<u16>,
    /// Primary database name; for file-based engines the absolute file path
    pub database: Option<String>,
}

/// Options for `delete`
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Stop a running container instead of refusing
    pub force: bool,
    /// File-based engines: also delete the database file (default true)
    pub delete_file: Option<bool>,
}

/// Catalog CRUD and container bookkeeping
pub struct ContainerManager {
    paths: SpinPaths,
    catalog: Arc<Catalog>,
    process: ProcessManager,
    registries: Mutex<HashMap<Engine, Arc<FileRegistry>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ContainerManager {
    pub fn new(paths: SpinPaths, catalog: Arc<Catalog>, process: ProcessManager) -> Self {
        Self {
            paths,
            catalog,
            process,
            registries: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Per-container operation lock. Lifecycle operations for one name are
    /// serialized; different containers proceed independently.
    pub async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Registry store for a file-based engine
    pub async fn registry(&self, engine: Engine) -> Arc<FileRegistry> {
        let mut registries = self.registries.lock().await;
        Arc::clone(registries.entry(engine).or_insert_with(|| {
            Arc::new(FileRegistry::new(engine, self.paths.registry_file(engine)))
        }))
    }

    pub async fn list(&self) -> SpinResult<Vec<Container>> {
        self.catalog.list().await
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.catalog.exists(name).await
    }

    pub async fn get_config(&self, name: &str) -> SpinResult<Container> {
        self.catalog.get(name).await
    }

    pub async fn update_config<F>(&self, name: &str, mutate: F) -> SpinResult<Container>
    where
        F: FnOnce(&mut Container),
    {
        self.catalog.update(name, mutate).await
    }

    pub async fn set_status(&self, name: &str, status: ContainerStatus) -> SpinResult<()> {
        self.catalog.update(name, |c| c.status = status).await?;
        Ok(())
    }

    /// Ports currently claimed by running server containers
    pub async fn running_ports(&self) -> SpinResult<HashSet<u16>> {
        Ok(self
            .catalog
            .list()
            .await?
            .into_iter()
            .filter(|c| c.is_running() && !c.engine.is_file_based())
            .map(|c| c.port)
            .collect())
    }

    /// Create a new container in status `created`.
    ///
    /// Validates the name, resolves the version, and claims a free port
    /// for server engines (the preferred port must not collide with a
    /// running container). File-based engines record the absolute file
    /// path and register it in the engine's file registry.
    pub async fn create(&self, name: &str, opts: CreateOptions) -> SpinResult<Container> {
        validate_container_name(name)?;
        if self.catalog.exists(name).await {
            return Err(SpinError::NameConflict { name: name.to_string() });
        }
        let version = resolve_version(opts.engine, &opts.version)?;

        let container = if opts.engine.kind() == EngineKind::File {
            let file_path = opts.database.clone().ok_or_else(|| {
                SpinError::precondition(format!(
                    "{} containers need a database file path",
                    opts.engine.display_name()
                ))
            })?;
            if !Path::new(&file_path).is_absolute() {
                return Err(SpinError::precondition(format!(
                    "database file path must be absolute: {file_path}"
                )));
            }
            Container::new(name, opts.engine, &version, 0, &file_path)
        } else {
            let database = opts.database.unwrap_or_else(|| name.to_string());
            validate_database_name(&database)?;
            let owned = self.running_ports().await?;
            let port = find_available_port(
                opts.port.or(Some(opts.engine.default_port())),
                opts.engine.port_range(),
                &owned,
            )
            .await?;
            Container::new(name, opts.engine, &version, port, &database)
        };

        self.catalog.insert(&container).await?;
        if container.engine.is_file_based() {
            self.registry(container.engine)
                .await
                .update(name, Path::new(&container.database))
                .await?;
        }
        info!("✨ Created container '{}' ({} {})", name, container.engine, container.version);
        Ok(container)
    }

    /// Track an additional database on a container (idempotent)
    pub async fn add_database(&self, name: &str, db: &str) -> SpinResult<()> {
        validate_database_name(db)?;
        self.catalog.update(name, |c| c.add_database(db)).await?;
        Ok(())
    }

    /// Stop tracking a database on a container (idempotent)
    pub async fn remove_database(&self, name: &str, db: &str) -> SpinResult<()> {
        self.catalog.update(name, |c| c.remove_database(db)).await?;
        Ok(())
    }

    /// Rename a container: move its data/log/pid paths and rewrite the
    /// catalog entry, rolling the moves back if any step fails.
    pub async fn rename(&self, old_name: &str, new_name: &str) -> SpinResult<Container> {
        validate_container_name(new_name)?;
        let guard = self.lock_for(old_name).await;
        let _lock = guard.lock().await;

        let container = self.catalog.get(old_name).await?;
        if self.catalog.exists(new_name).await {
            return Err(SpinError::NameConflict { name: new_name.to_string() });
        }
        if container.is_running() && !container.engine.is_file_based() {
            return Err(SpinError::precondition(format!(
                "Stop container '{old_name}' before renaming it"
            )));
        }

        let engine = container.engine;
        let moves = [
            (self.paths.data_dir(engine, old_name), self.paths.data_dir(engine, new_name)),
            (self.paths.log_file(engine, old_name), self.paths.log_file(engine, new_name)),
            (self.paths.pid_file(engine, old_name), self.paths.pid_file(engine, new_name)),
        ];

        let mut tx = Transaction::new();
        let outcome = async {
            for (src, dest) in &moves {
                if !src.exists() {
                    continue;
                }
                move_path(src, dest).await?;
                let (src, dest) = (src.clone(), dest.clone());
                tx.add_rollback(format!("move {} back", dest.display()), move || async move {
                    move_path(&dest, &src).await
                });
            }

            let mut renamed = container.clone();
            renamed.name = new_name.to_string();
            self.catalog.insert(&renamed).await?;
            {
                let new_name = new_name.to_string();
                let catalog = Arc::clone(&self.catalog);
                tx.add_rollback("remove new catalog entry", move || async move {
                    catalog.remove(&new_name).await
                });
            }
            self.catalog.remove(old_name).await?;

            if engine.is_file_based() {
                let registry = self.registry(engine).await;
                registry.update(new_name, Path::new(&renamed.database)).await?;
                registry.remove(old_name).await?;
            }
            Ok(renamed)
        }
        .await;

        match outcome {
            Ok(renamed) => {
                tx.commit();
                info!("🏷️ Renamed container '{}' -> '{}'", old_name, new_name);
                Ok(renamed)
            }
            Err(err) => {
                tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Clone a stopped container's data into a new catalog entry.
    ///
    /// Server engines get a fresh port and land in status `stopped`;
    /// file-based engines copy the database file next to the original
    /// with the target name.
    pub async fn clone_container(&self, source: &str, target: &str) -> SpinResult<Container> {
        validate_container_name(target)?;
        let guard = self.lock_for(source).await;
        let _lock = guard.lock().await;

        let src = self.catalog.get(source).await?;
        if self.catalog.exists(target).await {
            return Err(SpinError::NameConflict { name: target.to_string() });
        }
        if src.is_running() && !src.engine.is_file_based() {
            return Err(SpinError::precondition(format!(
                "Stop container '{source}' first, then clone it"
            )));
        }

        let mut tx = Transaction::new();
        let outcome = async {
            let mut cloned = src.clone();
            cloned.name = target.to_string();
            cloned.created_at = chrono::Utc::now();

            if src.engine.is_file_based() {
                let src_file = PathBuf::from(&src.database);
                let target_file = cloned_file_path(&src_file, target);
                copy_recursive(&src_file, &target_file).await?;
                {
                    let target_file = target_file.clone();
                    tx.add_rollback("remove cloned file", move || async move {
                        remove_recursive(&target_file).await
                    });
                }
                cloned.database = target_file.display().to_string();
                cloned.databases = vec![cloned.database.clone()];
                cloned.status =
                    if target_file.is_file() { ContainerStatus::Running } else { ContainerStatus::Stopped };
            } else {
                let src_data = self.paths.data_dir(src.engine, source);
                let target_data = self.paths.data_dir(src.engine, target);
                if src_data.exists() {
                    copy_recursive(&src_data, &target_data).await?;
                    let target_data = target_data.clone();
                    tx.add_rollback("remove cloned data dir", move || async move {
                        remove_recursive(&target_data).await
                    });
                }
                let owned = self.running_ports().await?;
                cloned.port = find_available_port(None, src.engine.port_range(), &owned).await?;
                cloned.status = ContainerStatus::Stopped;
            }

            self.catalog.insert(&cloned).await?;
            if cloned.engine.is_file_based() {
                self.registry(cloned.engine)
                    .await
                    .update(target, Path::new(&cloned.database))
                    .await?;
            }
            Ok(cloned)
        }
        .await;

        match outcome {
            Ok(cloned) => {
                tx.commit();
                info!("🧬 Cloned container '{}' -> '{}'", source, target);
                Ok(cloned)
            }
            Err(err) => {
                tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Delete a container and every path it owns.
    ///
    /// Running containers are refused unless `force`, in which case the
    /// process is stopped signal-only first. For file-based engines the
    /// database file is deleted by default; `delete_file: Some(false)`
    /// detaches instead (file kept).
    pub async fn delete(&self, name: &str, opts: DeleteOptions) -> SpinResult<()> {
        let guard = self.lock_for(name).await;
        let _lock = guard.lock().await;

        let container = self.catalog.get(name).await?;
        let engine = container.engine;

        if !engine.is_file_based() {
            let pid_file = self.paths.pid_file(engine, name);
            if self.process.is_running(&pid_file).await {
                if !opts.force {
                    return Err(SpinError::precondition(format!(
                        "Container '{name}' is running; stop it first or delete with force"
                    )));
                }
                warn!("⚡ Force-stopping '{}' before delete", name);
                self.process
                    .stop(&StopSpec {
                        engine,
                        container: name.to_string(),
                        pid_file,
                        graceful: None,
                        ping: None,
                    })
                    .await?;
            }
        }

        if engine.is_file_based() {
            if opts.delete_file.unwrap_or(true) {
                remove_recursive(Path::new(&container.database)).await?;
            }
            self.registry(engine).await.remove(name).await?;
        } else {
            remove_recursive(&self.paths.data_dir(engine, name)).await?;
            remove_recursive(&self.paths.log_file(engine, name)).await?;
            remove_recursive(&self.paths.pid_file(engine, name)).await?;
            remove_recursive(&self.paths.socket_file(engine, name)).await?;
        }
        self.catalog.remove(name).await?;
        info!("🗑️ Deleted container '{}'", name);
        Ok(())
    }

    /// Register an existing database file as a container (file engines).
    /// Status reflects file existence at attach time.
    pub async fn attach(&self, file_path: &Path, name: &str, engine: Engine) -> SpinResult<Container> {
        if !engine.is_file_based() {
            return Err(SpinError::precondition(format!(
                "attach only applies to file-based engines, not {}",
                engine.display_name()
            )));
        }
        validate_container_name(name)?;
        if !file_path.is_absolute() {
            return Err(SpinError::precondition(format!(
                "database file path must be absolute: {}",
                file_path.display()
            )));
        }
        if self.catalog.exists(name).await {
            return Err(SpinError::NameConflict { name: name.to_string() });
        }

        let version = resolve_version(engine, &latest_known(engine))?;
        let mut container =
            Container::new(name, engine, &version, 0, &file_path.display().to_string());
        container.status =
            if file_path.is_file() { ContainerStatus::Running } else { ContainerStatus::Stopped };
        self.catalog.insert(&container).await?;
        self.registry(engine).await.update(name, file_path).await?;
        info!("🔗 Attached {} file {} as '{}'", engine, file_path.display(), name);
        Ok(container)
    }

    /// Remove a file-based container from the catalog and registry while
    /// keeping its file on disk
    pub async fn detach(&self, name: &str) -> SpinResult<PathBuf> {
        let guard = self.lock_for(name).await;
        let _lock = guard.lock().await;

        let container = self.catalog.get(name).await?;
        if !container.engine.is_file_based() {
            return Err(SpinError::precondition(format!(
                "detach only applies to file-based engines, not {}",
                container.engine.display_name()
            )));
        }
        let file = PathBuf::from(&container.database);
        self.registry(container.engine).await.remove(name).await?;
        self.catalog.remove(name).await?;
        info!("✂️ Detached '{}' (file kept at {})", name, file.display());
        Ok(file)
    }

    /// Refresh a file-based container's status from file existence
    pub async fn refresh_file_status(&self, name: &str) -> SpinResult<ContainerStatus> {
        let container = self.catalog.get(name).await?;
        if !container.engine.is_file_based() {
            return Ok(container.status);
        }
        let status = if Path::new(&container.database).is_file() {
            ContainerStatus::Running
        } else {
            ContainerStatus::Stopped
        };
        if status != container.status {
            self.set_status(name, status).await?;
        }
        Ok(status)
    }
}

/// Sibling path for a cloned database file: `{dir}/{target}{ext}`
fn cloned_file_path(src_file: &Path, target: &str) -> PathBuf {
    let dir = src_file.parent().unwrap_or_else(|| Path::new("/"));
    let ext = src_file.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
    dir.join(format!("{target}{ext}"))
}

fn latest_known(engine: Engine) -> String {
    crate::domain::version::version_map(engine)
        .first()
        .map(|(_, full)| (*full).to_string())
        .unwrap_or_else(|| "0.0.0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::platform::PlatformService;

    fn manager(root: &Path) -> ContainerManager {
        let paths = SpinPaths::new(root);
        let catalog = Arc::new(Catalog::new(paths.containers_dir()));
        ContainerManager::new(paths, catalog, ProcessManager::new(PlatformService::new()))
    }

    fn pg_options() -> CreateOptions {
        CreateOptions {
            engine: Engine::Postgresql,
            version: "16".to_string(),
            port: None,
            database: Some("app".to_string()),
        }
    }

    #[tokio::test]
    async fn test_create_normalizes_version() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        let c = m.create("pgdev", pg_options()).await.unwrap();
        assert_eq!(c.version, "16.4.0");
        assert_eq!(c.status, ContainerStatus::Created);
        assert_eq!(c.databases, vec!["app"]);
    }

    #[tokio::test]
    async fn test_create_twice_is_name_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        m.create("pgdev", pg_options()).await.unwrap();
        let err = m.create("pgdev", pg_options()).await.unwrap_err();
        assert!(matches!(err, SpinError::NameConflict { .. }));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_names() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        assert!(matches!(
            m.create("9bad", pg_options()).await.unwrap_err(),
            SpinError::InvalidName { .. }
        ));
        let mut opts = pg_options();
        opts.database = Some("bad-db".to_string());
        assert!(matches!(
            m.create("ok", opts).await.unwrap_err(),
            SpinError::InvalidDatabaseName { .. }
        ));
    }

    #[tokio::test]
    async fn test_file_based_create_requires_absolute_path() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        let err = m
            .create(
                "notes",
                CreateOptions {
                    engine: Engine::Sqlite,
                    version: "3.46.1".to_string(),
                    port: None,
                    database: Some("relative.sqlite".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SpinError::Precondition { .. }));
    }

    #[tokio::test]
    async fn test_file_based_create_registers_file() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        let file = tmp.path().join("notes.sqlite");
        let c = m
            .create(
                "notes",
                CreateOptions {
                    engine: Engine::Sqlite,
                    version: "3.46.1".to_string(),
                    port: None,
                    database: Some(file.display().to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(c.port, 0);
        let entry = m.registry(Engine::Sqlite).await.get("notes").await.unwrap().unwrap();
        assert_eq!(entry.file_path, file);
    }

    #[tokio::test]
    async fn test_clone_refuses_running_server() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        m.create("app", pg_options()).await.unwrap();
        m.set_status("app", ContainerStatus::Running).await.unwrap();

        let err = m.clone_container("app", "app-copy").await.unwrap_err();
        assert!(err.to_string().contains("Stop container"));
    }

    #[tokio::test]
    async fn test_clone_copies_data_and_assigns_new_port() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        let src = m.create("app", pg_options()).await.unwrap();
        let data = m.paths.data_dir(Engine::Postgresql, "app");
        tokio::fs::create_dir_all(&data).await.unwrap();
        tokio::fs::write(data.join("PG_VERSION"), b"16\n").await.unwrap();

        let cloned = m.clone_container("app", "app-copy").await.unwrap();
        assert_eq!(cloned.status, ContainerStatus::Stopped);
        assert_ne!(cloned.port, src.port);
        let copied = m.paths.data_dir(Engine::Postgresql, "app-copy").join("PG_VERSION");
        assert_eq!(tokio::fs::read(copied).await.unwrap(), b"16\n");
    }

    #[tokio::test]
    async fn test_clone_into_existing_name_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        m.create("app", pg_options()).await.unwrap();
        let mut other = pg_options();
        other.port = Some(5440);
        m.create("app-copy", other).await.unwrap();

        let err = m.clone_container("app", "app-copy").await.unwrap_err();
        assert!(matches!(err, SpinError::NameConflict { .. }));
    }

    #[tokio::test]
    async fn test_rename_moves_paths_and_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        m.create("old", pg_options()).await.unwrap();
        let data = m.paths.data_dir(Engine::Postgresql, "old");
        tokio::fs::create_dir_all(&data).await.unwrap();
        tokio::fs::write(data.join("marker"), b"x").await.unwrap();

        let renamed = m.rename("old", "new").await.unwrap();
        assert_eq!(renamed.name, "new");
        assert!(!m.exists("old").await);
        assert!(m.paths.data_dir(Engine::Postgresql, "new").join("marker").is_file());
        assert!(!data.exists());
    }

    #[tokio::test]
    async fn test_rename_to_taken_name_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        m.create("a", pg_options()).await.unwrap();
        let mut other = pg_options();
        other.port = Some(5441);
        m.create("b", other).await.unwrap();
        assert!(matches!(
            m.rename("a", "b").await.unwrap_err(),
            SpinError::NameConflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_owned_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        m.create("gone", pg_options()).await.unwrap();
        let data = m.paths.data_dir(Engine::Postgresql, "gone");
        tokio::fs::create_dir_all(&data).await.unwrap();

        m.delete("gone", DeleteOptions::default()).await.unwrap();
        assert!(!m.exists("gone").await);
        assert!(!data.exists());
    }

    #[tokio::test]
    async fn test_detach_keeps_file_attach_restores() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        let file = tmp.path().join("notes.sqlite");
        tokio::fs::write(&file, b"sqlite data").await.unwrap();
        m.create(
            "notes",
            CreateOptions {
                engine: Engine::Sqlite,
                version: "3.46.1".to_string(),
                port: None,
                database: Some(file.display().to_string()),
            },
        )
        .await
        .unwrap();

        let kept = m.detach("notes").await.unwrap();
        assert_eq!(kept, file);
        assert!(file.is_file());
        assert!(!m.exists("notes").await);
        assert!(m.registry(Engine::Sqlite).await.get("notes").await.unwrap().is_none());

        let attached = m.attach(&file, "notes", Engine::Sqlite).await.unwrap();
        assert_eq!(attached.status, ContainerStatus::Running);
        assert!(m.registry(Engine::Sqlite).await.get("notes").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_add_remove_database_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path());
        m.create("app", pg_options()).await.unwrap();
        m.add_database("app", "analytics").await.unwrap();
        m.add_database("app", "analytics").await.unwrap();
        assert_eq!(m.get_config("app").await.unwrap().databases, vec!["app", "analytics"]);
        m.remove_database("app", "analytics").await.unwrap();
        assert_eq!(m.get_config("app").await.unwrap().databases, vec!["app"]);
    }
}
