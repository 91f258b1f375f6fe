//! Qdrant adapter
//!
//! Qdrant is managed through its HTTP API rather than a CLI: snapshots
//! are created and downloaded over HTTP, and collections take the place
//! of logical databases (so the per-database operations report
//! unsupported). Snapshot restore requires a stopped instance; the staged
//! snapshot is handed to the server with `--storage-snapshot` on the next
//! start.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};
use crate::engines::adapter::{
    BackupFormat, BackupOptions, BackupOutcome, CreateUserRequest, EngineAdapter, EngineContext,
    InitOptions, QueryOptions, QueryResult, RestoreOptions, RestoreOutcome, ScriptOptions,
    ScriptOutcome, ScriptSource, StartOutcome, UserCredentials,
};
use crate::engines::common::parse_remote_url;
use crate::engines::format::detect_backup_format;
use crate::infrastructure::fsutil::{copy_recursive, remove_recursive};
use crate::infrastructure::process::{
    DEFAULT_READY_TIMEOUT, ProcessManager, ReadyProbe, StartSpec, StopSpec,
};

/// Snapshot staged by a restore, consumed on the next start
const STAGED_SNAPSHOT: &str = "restore.snapshot";

pub struct QdrantAdapter {
    process: ProcessManager,
}

impl QdrantAdapter {
    pub fn new(process: ProcessManager) -> Self {
        Self { process }
    }

    fn base_url(ctx: &EngineContext) -> String {
        format!("http://{}:{}", ctx.host(), ctx.container.port)
    }

    fn http() -> SpinResult<reqwest::Client> {
        Ok(reqwest::Client::builder().timeout(Duration::from_secs(60)).build()?)
    }

    async fn require_running(&self, ctx: &EngineContext) -> SpinResult<()> {
        if !self.process.is_running(&ctx.pid_file).await {
            return Err(SpinError::precondition(format!(
                "Qdrant '{}' must be running for this operation; start it first",
                ctx.container.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineAdapter for QdrantAdapter {
    fn engine(&self) -> Engine {
        Engine::Qdrant
    }

    fn process_manager(&self) -> &ProcessManager {
        &self.process
    }

    async fn init_data_dir(&self, ctx: &EngineContext, _opts: InitOptions) -> SpinResult<()> {
        tokio::fs::create_dir_all(&ctx.data_dir)
            .await
            .map_err(|e| SpinError::io(format!("create {}", ctx.data_dir.display()), e))?;
        Ok(())
    }

    async fn start(&self, ctx: &EngineContext) -> SpinResult<StartOutcome> {
        let mut args = Vec::new();
        // A snapshot staged by restore is consumed exactly once
        let staged = ctx.data_dir.join(STAGED_SNAPSHOT);
        if staged.is_file() {
            info!("📥 Starting '{}' from staged snapshot", ctx.container.name);
            args.push("--storage-snapshot".to_string());
            args.push(staged.display().to_string());
            args.push("--force-snapshot".to_string());
        }

        let spec = StartSpec {
            engine: Engine::Qdrant,
            container: ctx.container.name.clone(),
            program: ctx.tool("qdrant")?,
            args,
            env: vec![
                ("QDRANT__SERVICE__HOST".to_string(), ctx.host().to_string()),
                ("QDRANT__SERVICE__HTTP_PORT".to_string(), ctx.container.port.to_string()),
                (
                    "QDRANT__SERVICE__GRPC_PORT".to_string(),
                    ctx.container.port.saturating_add(1).to_string(),
                ),
                ("QDRANT__STORAGE__STORAGE_PATH".to_string(), ctx.data_dir.display().to_string()),
            ],
            log_file: ctx.log_file.clone(),
            pid_file: ctx.pid_file.clone(),
            ready: ReadyProbe::Http { url: format!("{}/readyz", Self::base_url(ctx)) },
            ready_timeout: DEFAULT_READY_TIMEOUT,
        };
        self.process.start(&spec).await?;
        if staged.is_file() {
            let _ = remove_recursive(&staged).await;
        }
        Ok(StartOutcome {
            port: ctx.container.port,
            connection_string: self.connection_string(ctx, None),
        })
    }

    /// No admin shutdown command; the signal ladder does the work
    async fn stop(&self, ctx: &EngineContext) -> SpinResult<()> {
        let spec = StopSpec {
            engine: Engine::Qdrant,
            container: ctx.container.name.clone(),
            pid_file: ctx.pid_file.clone(),
            graceful: None,
            ping: Some(ReadyProbe::Http { url: format!("{}/readyz", Self::base_url(ctx)) }),
        };
        self.process.stop(&spec).await
    }

    async fn create_database(&self, _ctx: &EngineContext, _db: &str) -> SpinResult<()> {
        Err(SpinError::unsupported(Engine::Qdrant, "createDatabase"))
    }

    async fn drop_database(&self, _ctx: &EngineContext, _db: &str) -> SpinResult<()> {
        Err(SpinError::unsupported(Engine::Qdrant, "dropDatabase"))
    }

    async fn list_databases(&self, _ctx: &EngineContext) -> SpinResult<Vec<String>> {
        Err(SpinError::unsupported(Engine::Qdrant, "listDatabases"))
    }

    async fn run_script(
        &self,
        _ctx: &EngineContext,
        _source: ScriptSource,
        _opts: ScriptOptions,
    ) -> SpinResult<ScriptOutcome> {
        Err(SpinError::unsupported(Engine::Qdrant, "runScript"))
    }

    /// Lists collections; the query text is ignored beyond `collections`
    async fn execute_query(
        &self,
        ctx: &EngineContext,
        query: &str,
        _opts: QueryOptions,
    ) -> SpinResult<QueryResult> {
        self.require_running(ctx).await?;
        if query.trim() != "collections" {
            return Err(SpinError::unsupported(Engine::Qdrant, "executeQuery"));
        }
        let response: serde_json::Value = Self::http()?
            .get(format!("{}/collections", Self::base_url(ctx)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let rows = response["result"]["collections"]
            .as_array()
            .map(|collections| {
                collections
                    .iter()
                    .filter_map(|c| c["name"].as_str())
                    .map(|name| vec![name.to_string()])
                    .collect()
            })
            .unwrap_or_default();
        Ok(QueryResult { columns: vec!["collection".to_string()], rows })
    }

    /// Full-instance snapshot over HTTP, downloaded to `output`
    async fn backup(
        &self,
        ctx: &EngineContext,
        output: &Path,
        opts: BackupOptions,
    ) -> SpinResult<BackupOutcome> {
        if opts.format != BackupFormat::Snapshot {
            return Err(SpinError::precondition(format!(
                "Qdrant backups are snapshots; {} is not supported",
                opts.format.description()
            )));
        }
        self.require_running(ctx).await?;
        let client = Self::http()?;
        let created: serde_json::Value = client
            .post(format!("{}/snapshots", Self::base_url(ctx)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let snapshot_name = created["result"]["name"].as_str().ok_or_else(|| {
            SpinError::precondition("snapshot creation returned no name")
        })?;

        let bytes = client
            .get(format!("{}/snapshots/{}", Self::base_url(ctx), snapshot_name))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        tokio::fs::write(output, &bytes)
            .await
            .map_err(|e| SpinError::io(format!("write {}", output.display()), e))?;
        // Server-side copy is no longer needed once downloaded
        let _ = client
            .delete(format!("{}/snapshots/{}", Self::base_url(ctx), snapshot_name))
            .send()
            .await;

        Ok(BackupOutcome {
            path: output.to_path_buf(),
            format: opts.format,
            size: bytes.len() as u64,
        })
    }

    /// Snapshot restore requires a stopped instance: the file is staged in
    /// the storage path and consumed by the next start
    async fn restore(
        &self,
        ctx: &EngineContext,
        path: &Path,
        _opts: RestoreOptions,
    ) -> SpinResult<RestoreOutcome> {
        let info = detect_backup_format(path).await?;
        if !info.format.accepted_by(Engine::Qdrant) {
            return Err(SpinError::wrong_engine_dump(
                info.format.source_engine().unwrap_or("unknown"),
                Engine::Qdrant,
            ));
        }
        if self.process.is_running(&ctx.pid_file).await {
            return Err(SpinError::precondition(format!(
                "Qdrant '{}' must be stopped for snapshot restore; stop it first",
                ctx.container.name
            )));
        }

        tokio::fs::create_dir_all(&ctx.data_dir)
            .await
            .map_err(|e| SpinError::io(format!("create {}", ctx.data_dir.display()), e))?;
        copy_recursive(path, &ctx.data_dir.join(STAGED_SNAPSHOT)).await?;
        info!("📥 Snapshot staged for '{}'; it loads on next start", ctx.container.name);
        Ok(RestoreOutcome {
            format: info.format,
            stdout: String::new(),
            stderr: String::new(),
            code: 0,
        })
    }

    /// Snapshot a remote instance over HTTP and download it
    async fn dump_from_connection_string(
        &self,
        _ctx: &EngineContext,
        url: &str,
        output: &Path,
    ) -> SpinResult<()> {
        let parsed = parse_remote_url(url, Engine::Qdrant, &["http", "https", "qdrant"])?;
        let scheme = if parsed.scheme() == "https" { "https" } else { "http" };
        let base = format!(
            "{}://{}:{}",
            scheme,
            parsed.host_str().unwrap_or("localhost"),
            parsed.port().unwrap_or(6333)
        );
        let client = Self::http()?;
        // An api key travels in the dedicated header, never the URL we log
        let api_key = parsed.password().map(str::to_string);
        let with_key = |req: reqwest::RequestBuilder| match &api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        };

        let created: serde_json::Value = with_key(client.post(format!("{base}/snapshots")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let snapshot_name = created["result"]["name"].as_str().ok_or_else(|| {
            SpinError::precondition("remote snapshot creation returned no name")
        })?;
        let bytes = with_key(client.get(format!("{base}/snapshots/{snapshot_name}")))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        tokio::fs::write(output, &bytes)
            .await
            .map_err(|e| SpinError::io(format!("write {}", output.display()), e))?;
        let _ = with_key(client.delete(format!("{base}/snapshots/{snapshot_name}"))).send().await;
        Ok(())
    }

    fn connection_string(&self, ctx: &EngineContext, _database: Option<&str>) -> String {
        Self::base_url(ctx)
    }

    async fn database_size(&self, ctx: &EngineContext) -> SpinResult<Option<u64>> {
        crate::infrastructure::fsutil::path_size(&ctx.data_dir).await.map(Some)
    }

    async fn create_user(
        &self,
        _ctx: &EngineContext,
        _request: CreateUserRequest,
    ) -> SpinResult<UserCredentials> {
        Err(SpinError::unsupported(Engine::Qdrant, "createUser"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::Container;
    use crate::infrastructure::platform::PlatformService;

    fn context(tmp: &Path) -> EngineContext {
        EngineContext {
            container: Container::new("vectors", Engine::Qdrant, "1.12.0", 6333, ""),
            install_dir: tmp.join("install"),
            data_dir: tmp.join("data"),
            log_file: tmp.join("vectors.log"),
            pid_file: tmp.join("vectors.pid"),
            socket_file: tmp.join("vectors.sock"),
            platform: PlatformService::new(),
            recorded_tools: std::collections::HashMap::new(),
        }
    }

    fn adapter() -> QdrantAdapter {
        QdrantAdapter::new(ProcessManager::new(PlatformService::new()))
    }

    #[tokio::test]
    async fn test_snapshot_restore_requires_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        tokio::fs::write(&ctx.pid_file, format!("{}\n", std::process::id())).await.unwrap();
        let snapshot = tmp.path().join("x.snapshot");
        tokio::fs::write(&snapshot, b"\x00\x01binary").await.unwrap();

        let err = adapter().restore(&ctx, &snapshot, RestoreOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("must be stopped"));
    }

    #[tokio::test]
    async fn test_snapshot_restore_stages_file() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let snapshot = tmp.path().join("x.snapshot");
        tokio::fs::write(&snapshot, b"\x00\x01binary").await.unwrap();

        adapter().restore(&ctx, &snapshot, RestoreOptions::default()).await.unwrap();
        assert!(ctx.data_dir.join(STAGED_SNAPSHOT).is_file());
    }

    #[tokio::test]
    async fn test_logical_databases_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        assert!(matches!(
            adapter().create_database(&ctx, "x").await.unwrap_err(),
            SpinError::UnsupportedOperation { .. }
        ));
    }
}
