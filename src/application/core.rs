//! SpinDb - the constructed core aggregate
//!
//! Owns the stores and managers and exposes the high-level operations the
//! UI collaborator drives: container lifecycle, engine installs, the
//! backup/restore pipeline, and pulls. Tests build one over a temp root;
//! nothing in here is a process-wide singleton.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::application::containers::{ContainerManager, CreateOptions, DeleteOptions};
use crate::application::pull::{PullOutcome, PullPipeline, PullRequest};
use crate::application::updates::UpdateChecker;
use crate::domain::container::{Container, ContainerStatus};
use crate::domain::engine::{Engine, EngineKind};
use crate::domain::errors::{SpinError, SpinResult};
use crate::engines::adapter::{
    BackupOptions, BackupOutcome, CreateUserRequest, EngineAdapter, EngineContext, InitOptions,
    QueryOptions, QueryResult, RestoreOptions, RestoreOutcome, ScriptOptions, ScriptOutcome,
    ScriptSource, StartOutcome, UserCredentials,
};
use crate::engines::format::{BackupFormatInfo, detect_backup_format};
use crate::engines::registry::adapter_for;
use crate::infrastructure::binaries::BinaryManager;
use crate::infrastructure::http::{DownloadClient, ProgressFn};
use crate::infrastructure::paths::SpinPaths;
use crate::infrastructure::platform::PlatformService;
use crate::infrastructure::ports::{find_available_port, is_port_available};
use crate::infrastructure::process::ProcessManager;
use crate::infrastructure::stores::catalog::Catalog;
use crate::infrastructure::stores::config_store::ConfigStore;

/// The core aggregate: every manager, constructed over one root directory
pub struct SpinDb {
    paths: SpinPaths,
    platform: PlatformService,
    process: ProcessManager,
    config: Arc<ConfigStore>,
    containers: Arc<ContainerManager>,
    binaries: BinaryManager,
    pull_pipeline: PullPipeline,
    updates: UpdateChecker,
}

impl SpinDb {
    /// Build a core over `~/.spindb`
    pub fn new() -> SpinResult<Self> {
        Self::with_root_paths(SpinPaths::default_root()?)
    }

    /// Build a core over an explicit root (tests use a temp dir)
    pub fn with_root(root: impl Into<PathBuf>) -> SpinResult<Self> {
        Self::with_root_paths(SpinPaths::new(root))
    }

    fn with_root_paths(paths: SpinPaths) -> SpinResult<Self> {
        let platform = PlatformService::new();
        let process = ProcessManager::new(platform.clone());
        let config = Arc::new(ConfigStore::new(paths.config_file()));
        let catalog = Arc::new(Catalog::new(paths.containers_dir()));
        let containers =
            Arc::new(ContainerManager::new(paths.clone(), catalog, process.clone()));
        let client = DownloadClient::with_defaults()?;
        let binaries = BinaryManager::new(
            paths.clone(),
            platform.clone(),
            client.clone(),
            Arc::clone(&config),
        );
        let pull_pipeline = PullPipeline::new(paths.clone(), Arc::clone(&containers));
        let updates = UpdateChecker::new(Arc::clone(&config), client);
        Ok(Self { paths, platform, process, config, containers, binaries, pull_pipeline, updates })
    }

    pub fn paths(&self) -> &SpinPaths {
        &self.paths
    }

    pub fn platform(&self) -> &PlatformService {
        &self.platform
    }

    pub fn containers(&self) -> &Arc<ContainerManager> {
        &self.containers
    }

    pub fn binaries(&self) -> &BinaryManager {
        &self.binaries
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn updates(&self) -> &UpdateChecker {
        &self.updates
    }

    fn adapter(&self, engine: Engine) -> Arc<dyn EngineAdapter> {
        adapter_for(engine, self.process.clone())
    }

    /// Snapshot everything an adapter needs for one operation
    pub async fn context(&self, container: &Container) -> SpinResult<EngineContext> {
        let info = self.platform.info();
        let exact =
            self.paths.install_dir(container.engine, &container.version, info.os, info.arch);
        let install_dir = if exact.is_dir() {
            exact
        } else {
            let major = crate::domain::version::Version::parse(&container.version)?.major;
            self.paths
                .find_installed_binary_for_major(container.engine, major, info.os, info.arch)
                .unwrap_or(exact)
        };
        let recorded_tools = self
            .config
            .load()
            .await?
            .binaries
            .into_iter()
            .map(|(name, entry)| (name, entry.path))
            .collect();
        Ok(EngineContext {
            container: container.clone(),
            install_dir,
            data_dir: self.paths.data_dir(container.engine, &container.name),
            log_file: self.paths.log_file(container.engine, &container.name),
            pid_file: self.paths.pid_file(container.engine, &container.name),
            socket_file: self.paths.socket_file(container.engine, &container.name),
            platform: self.platform.clone(),
            recorded_tools,
        })
    }

    async fn context_for(&self, name: &str) -> SpinResult<(Arc<dyn EngineAdapter>, EngineContext)> {
        let container = self.containers.get_config(name).await?;
        let ctx = self.context(&container).await?;
        Ok((self.adapter(container.engine), ctx))
    }

    /// Create a container record (binaries install lazily on first start)
    pub async fn create_container(&self, name: &str, opts: CreateOptions) -> SpinResult<Container> {
        let mut container = self.containers.create(name, opts).await?;
        if container.engine.is_file_based() {
            // Materialize the file right away so status reflects reality
            let ctx = self.context(&container).await?;
            self.adapter(container.engine).init_data_dir(&ctx, InitOptions::default()).await?;
            self.containers.refresh_file_status(name).await?;
            container = self.containers.get_config(name).await?;
        }
        Ok(container)
    }

    /// Ensure binaries, initialize the data directory, and start the
    /// engine. A busy port is reassigned and recorded in the catalog
    /// before the engine spawns.
    pub async fn start_container(
        &self,
        name: &str,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> SpinResult<StartOutcome> {
        let guard = self.containers.lock_for(name).await;
        let _lock = guard.lock().await;

        let mut container = self.containers.get_config(name).await?;
        if container.engine.kind() == EngineKind::File {
            let status = self.containers.refresh_file_status(name).await?;
            let ctx = self.context(&container).await?;
            if status != ContainerStatus::Running {
                return Err(SpinError::precondition(format!(
                    "Database file for '{name}' is missing: {}",
                    container.database
                )));
            }
            return self.adapter(container.engine).start(&ctx).await;
        }

        self.binaries
            .ensure_installed(container.engine, &container.version, cancel, progress)
            .await?;

        // Re-probe the claimed port; record any reassignment before spawn
        let owned: HashSet<u16> = self
            .containers
            .running_ports()
            .await?
            .into_iter()
            .filter(|p| *p != container.port)
            .collect();
        if owned.contains(&container.port) || !is_port_available(container.port).await {
            let new_port =
                find_available_port(None, container.engine.port_range(), &owned).await?;
            info!("🔌 Port {} busy, reassigning '{}' to {}", container.port, name, new_port);
            container = self.containers.update_config(name, |c| c.port = new_port).await?;
        }

        let ctx = self.context(&container).await?;
        let adapter = self.adapter(container.engine);
        adapter.init_data_dir(&ctx, InitOptions::default()).await?;
        let outcome = adapter.start(&ctx).await?;
        self.containers.set_status(name, ContainerStatus::Running).await?;
        Ok(outcome)
    }

    /// Stop the engine and record the status transition
    pub async fn stop_container(&self, name: &str) -> SpinResult<()> {
        let guard = self.containers.lock_for(name).await;
        let _lock = guard.lock().await;

        let (adapter, ctx) = self.context_for(name).await?;
        if ctx.engine().kind() == EngineKind::File {
            return Ok(());
        }
        adapter.stop(&ctx).await?;
        self.containers.set_status(name, ContainerStatus::Stopped).await?;
        Ok(())
    }

    /// Live running state: PID liveness for servers, file existence for
    /// file-based engines
    pub async fn is_running(&self, name: &str) -> SpinResult<bool> {
        let container = self.containers.get_config(name).await?;
        if container.engine.is_file_based() {
            return Ok(Path::new(&container.database).is_file());
        }
        Ok(self
            .process
            .is_running(&self.paths.pid_file(container.engine, &container.name))
            .await)
    }

    /// Delete an engine installation, refusing while containers use it
    pub async fn delete_engine(&self, engine: Engine, version: &str) -> SpinResult<()> {
        let full = self.binaries.resolve_version(engine, version)?;
        let users = self.containers.catalog().referencing_installation(engine, &full).await?;
        if !users.is_empty() {
            return Err(SpinError::precondition(format!(
                "Cannot delete: {} container(s) are using {} {}",
                users.len(),
                engine.tag(),
                full
            )));
        }
        self.binaries.delete(engine, &full).await
    }

    pub async fn backup(
        &self,
        name: &str,
        output: &Path,
        opts: BackupOptions,
    ) -> SpinResult<BackupOutcome> {
        let (adapter, ctx) = self.context_for(name).await?;
        adapter.backup(&ctx, output, opts).await
    }

    pub async fn restore(
        &self,
        name: &str,
        path: &Path,
        opts: RestoreOptions,
    ) -> SpinResult<RestoreOutcome> {
        let (adapter, ctx) = self.context_for(name).await?;
        adapter.restore(&ctx, path, opts).await
    }

    pub async fn detect_backup_format(&self, path: &Path) -> SpinResult<BackupFormatInfo> {
        detect_backup_format(path).await
    }

    pub async fn execute_query(
        &self,
        name: &str,
        query: &str,
        opts: QueryOptions,
    ) -> SpinResult<QueryResult> {
        let (adapter, ctx) = self.context_for(name).await?;
        adapter.execute_query(&ctx, query, opts).await
    }

    pub async fn run_script(
        &self,
        name: &str,
        source: ScriptSource,
        opts: ScriptOptions,
    ) -> SpinResult<ScriptOutcome> {
        let (adapter, ctx) = self.context_for(name).await?;
        adapter.run_script(&ctx, source, opts).await
    }

    pub async fn create_database(&self, name: &str, db: &str) -> SpinResult<()> {
        let (adapter, ctx) = self.context_for(name).await?;
        adapter.create_database(&ctx, db).await?;
        self.containers.add_database(name, db).await
    }

    pub async fn drop_database(&self, name: &str, db: &str) -> SpinResult<()> {
        let (adapter, ctx) = self.context_for(name).await?;
        adapter.drop_database(&ctx, db).await?;
        self.containers.remove_database(name, db).await
    }

    pub async fn list_databases(&self, name: &str) -> SpinResult<Vec<String>> {
        let (adapter, ctx) = self.context_for(name).await?;
        adapter.list_databases(&ctx).await
    }

    pub async fn database_size(&self, name: &str) -> SpinResult<Option<u64>> {
        let (adapter, ctx) = self.context_for(name).await?;
        adapter.database_size(&ctx).await
    }

    pub async fn create_user(
        &self,
        name: &str,
        request: CreateUserRequest,
    ) -> SpinResult<UserCredentials> {
        let (adapter, ctx) = self.context_for(name).await?;
        adapter.create_user(&ctx, request).await
    }

    pub async fn connection_string(&self, name: &str, database: Option<&str>) -> SpinResult<String> {
        let (adapter, ctx) = self.context_for(name).await?;
        Ok(adapter.connection_string(&ctx, database))
    }

    /// Pull a remote database into a local container
    pub async fn pull(&self, name: &str, request: PullRequest) -> SpinResult<PullOutcome> {
        let guard = self.containers.lock_for(name).await;
        let _lock = guard.lock().await;
        let (adapter, ctx) = self.context_for(name).await?;
        self.pull_pipeline.pull(adapter, &ctx, request).await
    }

    /// Drop stale/dead binary tool entries from the global config
    pub async fn refresh_tool_cache(&self) -> SpinResult<usize> {
        self.config.refresh_stale_binaries().await
    }

    pub async fn delete_container(&self, name: &str, opts: DeleteOptions) -> SpinResult<()> {
        self.containers.delete(name, opts).await
    }

    pub async fn clone_container(&self, source: &str, target: &str) -> SpinResult<Container> {
        self.containers.clone_container(source, target).await
    }

    pub async fn rename_container(&self, old_name: &str, new_name: &str) -> SpinResult<Container> {
        self.containers.rename(old_name, new_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_engine_refuses_while_referenced() {
        let tmp = tempfile::tempdir().unwrap();
        let core = SpinDb::with_root(tmp.path()).unwrap();
        core.containers()
            .create(
                "app",
                CreateOptions {
                    engine: Engine::Postgresql,
                    version: "16".to_string(),
                    port: None,
                    database: Some("app".to_string()),
                },
            )
            .await
            .unwrap();
        // Fake the installation on disk
        let marker = core.binaries().marker_path(Engine::Postgresql, "16.4.0");
        tokio::fs::create_dir_all(marker.parent().unwrap()).await.unwrap();
        tokio::fs::write(&marker, b"").await.unwrap();

        let err = core.delete_engine(Engine::Postgresql, "16.4.0").await.unwrap_err();
        assert!(err.to_string().contains("Cannot delete: 1 container(s) are using postgresql 16.4.0"));
        assert!(marker.is_file(), "installation must be preserved");

        core.containers().delete("app", DeleteOptions::default()).await.unwrap();
        core.delete_engine(Engine::Postgresql, "16.4.0").await.unwrap();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_file_container_create_materializes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let core = SpinDb::with_root(tmp.path()).unwrap();
        let file = tmp.path().join("notes.sqlite");
        let container = core
            .create_container(
                "notes",
                CreateOptions {
                    engine: Engine::Sqlite,
                    version: "3.46".to_string(),
                    port: None,
                    database: Some(file.display().to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(container.port, 0);
        assert!(file.is_file());
        assert!(core.is_running("notes").await.unwrap());
        assert_eq!(
            core.containers().get_config("notes").await.unwrap().status,
            ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn test_connection_string_for_file_engine_is_path() {
        let tmp = tempfile::tempdir().unwrap();
        let core = SpinDb::with_root(tmp.path()).unwrap();
        let file = tmp.path().join("notes.sqlite");
        core.create_container(
            "notes",
            CreateOptions {
                engine: Engine::Sqlite,
                version: "3.46".to_string(),
                port: None,
                database: Some(file.display().to_string()),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            core.connection_string("notes", None).await.unwrap(),
            file.display().to_string()
        );
    }
}
