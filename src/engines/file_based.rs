//! SQLite / DuckDB adapter
//!
//! File-based engines have no server to supervise: the container IS the
//! database file, "running" means the file exists, and start/stop reduce
//! to existence checks. Both CLIs descend from the sqlite3 shell, so one
//! adapter drives both through dot-commands and stdin scripts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};
use crate::engines::adapter::{
    BackupFormat, BackupOptions, BackupOutcome, CreateUserRequest, EngineAdapter, EngineContext,
    InitOptions, QueryOptions, QueryResult, RestoreOptions, RestoreOutcome, ScriptOptions,
    ScriptOutcome, ScriptSource, StartOutcome, UserCredentials,
};
use crate::engines::common::{
    StdinSource, ToolInvocation, gzip_compress_file, gzip_decompress_file, parse_tsv, run_tool,
};
use crate::engines::format::{DetectedFormat, detect_backup_format};
use crate::infrastructure::fsutil::{copy_recursive, remove_recursive};
use crate::infrastructure::process::ProcessManager;

/// Which file engine this adapter instance speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFlavor {
    Sqlite,
    Duckdb,
}

impl FileFlavor {
    fn engine(self) -> Engine {
        match self {
            Self::Sqlite => Engine::Sqlite,
            Self::Duckdb => Engine::Duckdb,
        }
    }

    fn cli(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite3",
            Self::Duckdb => "duckdb",
        }
    }

    fn own_file_format(self) -> DetectedFormat {
        match self {
            Self::Sqlite => DetectedFormat::SqliteFile,
            Self::Duckdb => DetectedFormat::DuckdbFile,
        }
    }
}

pub struct FileAdapter {
    flavor: FileFlavor,
    process: ProcessManager,
}

impl FileAdapter {
    pub fn new(flavor: FileFlavor, process: ProcessManager) -> Self {
        Self { flavor, process }
    }

    fn file_path(&self, ctx: &EngineContext) -> PathBuf {
        PathBuf::from(&ctx.container.database)
    }

    fn require_file(&self, ctx: &EngineContext) -> SpinResult<PathBuf> {
        let file = self.file_path(ctx);
        if !file.is_file() {
            return Err(SpinError::precondition(format!(
                "{} database file is missing: {}",
                self.flavor.engine().display_name(),
                file.display()
            )));
        }
        Ok(file)
    }

    /// Run the CLI against a database file with a script on stdin
    async fn run_cli(
        &self,
        ctx: &EngineContext,
        file: &Path,
        stdin: StdinSource,
        extra_args: &[&str],
    ) -> SpinResult<ScriptOutcome> {
        let mut invocation = ToolInvocation::new(ctx.tool(self.flavor.cli())?).arg("-batch");
        if self.flavor == FileFlavor::Sqlite {
            // Fail the process on SQL errors instead of continuing
            invocation = invocation.arg("-bail");
        }
        let invocation = invocation
            .args(extra_args.iter().copied())
            .arg(file.display().to_string())
            .stdin(stdin);
        run_tool(invocation).await
    }
}

#[async_trait]
impl EngineAdapter for FileAdapter {
    fn engine(&self) -> Engine {
        self.flavor.engine()
    }

    fn process_manager(&self) -> &ProcessManager {
        &self.process
    }

    /// Create the database file at the recorded path. The file is given a
    /// real engine header by running `VACUUM;` through the CLI when the
    /// tool is available; otherwise an empty placeholder is created.
    async fn init_data_dir(&self, ctx: &EngineContext, opts: InitOptions) -> SpinResult<()> {
        let file = opts.path.unwrap_or_else(|| self.file_path(ctx));
        if file.is_file() {
            return Ok(());
        }
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SpinError::io(format!("create {}", parent.display()), e))?;
        }

        match ctx.tool(self.flavor.cli()) {
            Ok(_) => {
                let outcome = self
                    .run_cli(ctx, &file, StdinSource::Bytes(b"VACUUM;\n".to_vec()), &[])
                    .await?;
                if outcome.code != 0 {
                    remove_recursive(&file).await?;
                    return Err(SpinError::precondition(format!(
                        "initializing {} failed: {}",
                        file.display(),
                        outcome.stderr.trim()
                    )));
                }
            }
            Err(_) => {
                tokio::fs::write(&file, b"")
                    .await
                    .map_err(|e| SpinError::io(format!("create {}", file.display()), e))?;
            }
        }
        info!("📄 Initialized {} file {}", self.flavor.engine(), file.display());
        Ok(())
    }

    /// "Start" is defined as the file existing
    async fn start(&self, ctx: &EngineContext) -> SpinResult<StartOutcome> {
        let file = self.require_file(ctx)?;
        Ok(StartOutcome {
            port: 0,
            connection_string: file.display().to_string(),
        })
    }

    /// Nothing to stop for a file
    async fn stop(&self, _ctx: &EngineContext) -> SpinResult<()> {
        Ok(())
    }

    async fn create_database(&self, _ctx: &EngineContext, _db: &str) -> SpinResult<()> {
        Err(SpinError::unsupported(self.flavor.engine(), "createDatabase"))
    }

    async fn drop_database(&self, _ctx: &EngineContext, _db: &str) -> SpinResult<()> {
        Err(SpinError::unsupported(self.flavor.engine(), "dropDatabase"))
    }

    async fn list_databases(&self, _ctx: &EngineContext) -> SpinResult<Vec<String>> {
        Err(SpinError::unsupported(self.flavor.engine(), "listDatabases"))
    }

    async fn run_script(
        &self,
        ctx: &EngineContext,
        source: ScriptSource,
        _opts: ScriptOptions,
    ) -> SpinResult<ScriptOutcome> {
        let file = self.require_file(ctx)?;
        let stdin = match source {
            ScriptSource::File(path) => StdinSource::File(path),
            ScriptSource::Sql(sql) => StdinSource::Bytes(sql.into_bytes()),
        };
        let outcome = self.run_cli(ctx, &file, stdin, &[]).await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "script failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(outcome)
    }

    async fn execute_query(
        &self,
        ctx: &EngineContext,
        query: &str,
        _opts: QueryOptions,
    ) -> SpinResult<QueryResult> {
        let file = self.require_file(ctx)?;
        let outcome = self
            .run_cli(
                ctx,
                &file,
                StdinSource::Bytes(query.as_bytes().to_vec()),
                &["-header", "-separator", "\t"],
            )
            .await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "query failed: {}",
                outcome.stderr.trim()
            )));
        }
        Ok(parse_tsv(&outcome.stdout))
    }

    async fn backup(
        &self,
        ctx: &EngineContext,
        output: &Path,
        opts: BackupOptions,
    ) -> SpinResult<BackupOutcome> {
        let file = self.require_file(ctx)?;
        match opts.format {
            BackupFormat::FileCopy => {
                copy_recursive(&file, output).await?;
            }
            BackupFormat::Sql | BackupFormat::SqlGz => {
                let outcome = self
                    .run_cli(ctx, &file, StdinSource::Bytes(b".dump\n".to_vec()), &[])
                    .await?;
                if outcome.code != 0 {
                    return Err(SpinError::precondition(format!(
                        "dump failed ({}): {}",
                        outcome.code,
                        outcome.stderr.trim()
                    )));
                }
                if opts.format == BackupFormat::Sql {
                    tokio::fs::write(output, outcome.stdout.as_bytes())
                        .await
                        .map_err(|e| SpinError::io(format!("write {}", output.display()), e))?;
                } else {
                    let plain = output.with_extension("partial.sql");
                    tokio::fs::write(&plain, outcome.stdout.as_bytes())
                        .await
                        .map_err(|e| SpinError::io(format!("write {}", plain.display()), e))?;
                    gzip_compress_file(&plain, output).await?;
                    remove_recursive(&plain).await?;
                }
            }
            other => {
                return Err(SpinError::precondition(format!(
                    "{} cannot produce {} backups",
                    self.flavor.engine().display_name(),
                    other.description()
                )));
            }
        }
        let size = tokio::fs::metadata(output)
            .await
            .map_err(|e| SpinError::io(format!("stat {}", output.display()), e))?
            .len();
        Ok(BackupOutcome { path: output.to_path_buf(), format: opts.format, size })
    }

    async fn restore(
        &self,
        ctx: &EngineContext,
        path: &Path,
        opts: RestoreOptions,
    ) -> SpinResult<RestoreOutcome> {
        let info = detect_backup_format(path).await?;
        if !info.format.accepted_by(self.flavor.engine()) {
            return Err(SpinError::wrong_engine_dump(
                info.format.source_engine().unwrap_or("unknown"),
                self.flavor.engine(),
            ));
        }
        let _ = opts;

        let target = self.file_path(ctx);
        // A byte copy of the engine's own file format replaces the file
        if info.format == self.flavor.own_file_format() {
            copy_recursive(path, &target).await?;
            return Ok(RestoreOutcome {
                format: info.format,
                stdout: String::new(),
                stderr: String::new(),
                code: 0,
            });
        }

        let mut effective_path = path.to_path_buf();
        let mut format = info.format;
        let mut scratch: Option<PathBuf> = None;
        if format == DetectedFormat::Gzip {
            let unpacked = path.with_extension("unpacked.sql");
            gzip_decompress_file(path, &unpacked).await?;
            format = detect_backup_format(&unpacked).await?.format;
            effective_path = unpacked.clone();
            scratch = Some(unpacked);
        }

        if !target.is_file() {
            self.init_data_dir(ctx, InitOptions::default()).await?;
        }
        let outcome = self
            .run_cli(ctx, &target, StdinSource::File(effective_path), &[])
            .await;
        if let Some(scratch) = scratch {
            let _ = remove_recursive(&scratch).await;
        }
        let outcome = outcome?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "restore failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(RestoreOutcome {
            format,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            code: outcome.code,
        })
    }

    /// "Remote" for a file engine is another file: dump it to SQL text
    async fn dump_from_connection_string(
        &self,
        ctx: &EngineContext,
        url: &str,
        output: &Path,
    ) -> SpinResult<()> {
        let scheme_prefix = format!("{}://", self.flavor.engine().tag());
        let raw_path = url.strip_prefix(&scheme_prefix).unwrap_or(url);
        let source = PathBuf::from(raw_path);
        if !source.is_absolute() {
            return Err(SpinError::precondition(format!(
                "{} source must be an absolute file path or {}:// URI",
                self.flavor.engine().display_name(),
                self.flavor.engine().tag()
            )));
        }
        if !source.is_file() {
            return Err(SpinError::precondition(format!(
                "source database file does not exist: {}",
                source.display()
            )));
        }
        let outcome = self
            .run_cli(ctx, &source, StdinSource::Bytes(b".dump\n".to_vec()), &[])
            .await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "dump failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        tokio::fs::write(output, outcome.stdout.as_bytes())
            .await
            .map_err(|e| SpinError::io(format!("write {}", output.display()), e))?;
        Ok(())
    }

    fn connection_string(&self, ctx: &EngineContext, _database: Option<&str>) -> String {
        ctx.container.database.clone()
    }

    async fn database_size(&self, ctx: &EngineContext) -> SpinResult<Option<u64>> {
        let file = self.file_path(ctx);
        match tokio::fs::metadata(&file).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SpinError::io(format!("stat {}", file.display()), e)),
        }
    }

    async fn create_user(
        &self,
        _ctx: &EngineContext,
        _request: CreateUserRequest,
    ) -> SpinResult<UserCredentials> {
        Err(SpinError::unsupported(self.flavor.engine(), "createUser"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::Container;
    use crate::infrastructure::platform::PlatformService;

    fn context(file: &Path) -> EngineContext {
        let mut container =
            Container::new("notes", Engine::Sqlite, "3.46.1", 0, &file.display().to_string());
        container.status = crate::domain::container::ContainerStatus::Running;
        EngineContext {
            container,
            install_dir: PathBuf::from("/nonexistent"),
            data_dir: PathBuf::from("/nonexistent"),
            log_file: PathBuf::from("/nonexistent/log"),
            pid_file: PathBuf::from("/nonexistent/pid"),
            socket_file: PathBuf::from("/nonexistent/sock"),
            platform: PlatformService::new(),
            recorded_tools: std::collections::HashMap::new(),
        }
    }

    fn adapter() -> FileAdapter {
        FileAdapter::new(FileFlavor::Sqlite, ProcessManager::new(PlatformService::new()))
    }

    #[tokio::test]
    async fn test_start_requires_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("missing.sqlite");
        let err = adapter().start(&context(&file)).await.unwrap_err();
        assert!(err.to_string().contains("missing"));

        tokio::fs::write(&file, b"SQLite format 3\0").await.unwrap();
        let outcome = adapter().start(&context(&file)).await.unwrap();
        assert_eq!(outcome.port, 0);
        assert_eq!(outcome.connection_string, file.display().to_string());
    }

    #[tokio::test]
    async fn test_logical_database_ops_are_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("n.sqlite");
        let ctx = context(&file);
        let a = adapter();
        assert!(matches!(
            a.create_database(&ctx, "other").await.unwrap_err(),
            SpinError::UnsupportedOperation { .. }
        ));
        assert!(matches!(
            a.list_databases(&ctx).await.unwrap_err(),
            SpinError::UnsupportedOperation { .. }
        ));
    }

    #[tokio::test]
    async fn test_restore_file_copy_replaces_target() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("db.sqlite");
        tokio::fs::write(&target, b"SQLite format 3\0old").await.unwrap();
        let backup = tmp.path().join("backup.sqlite");
        tokio::fs::write(&backup, b"SQLite format 3\0new").await.unwrap();

        let outcome = adapter().restore(&context(&target), &backup, RestoreOptions::default()).await.unwrap();
        assert_eq!(outcome.format, DetectedFormat::SqliteFile);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"SQLite format 3\0new");
    }

    #[tokio::test]
    async fn test_restore_foreign_dump_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("db.sqlite");
        tokio::fs::write(&target, b"SQLite format 3\0").await.unwrap();
        let dump = tmp.path().join("pg.dump");
        tokio::fs::write(&dump, b"PGDMP\x01\x02").await.unwrap();

        let err = adapter().restore(&context(&target), &dump, RestoreOptions::default()).await.unwrap_err();
        assert!(matches!(err, SpinError::WrongEngineDump { .. }));
        // Target untouched
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"SQLite format 3\0");
    }

    #[tokio::test]
    async fn test_database_size_is_file_size() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("s.sqlite");
        tokio::fs::write(&file, vec![0u8; 42]).await.unwrap();
        assert_eq!(adapter().database_size(&context(&file)).await.unwrap(), Some(42));

        let gone = tmp.path().join("gone.sqlite");
        assert_eq!(adapter().database_size(&context(&gone)).await.unwrap(), None);
    }
}
