//! Redis / Valkey adapter
//!
//! Both engines share the RDB format and the `*-cli` tool surface. There
//! are no logical databases to create or drop (keyspaces are numbered and
//! fixed); backup rides on `--rdb`, and restore state depends on the
//! format: command-text restores need a running instance, RDB restores
//! need a stopped one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::domain::container::validate_username;
use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};
use crate::engines::adapter::{
    BackupFormat, BackupOptions, BackupOutcome, CreateUserRequest, EngineAdapter, EngineContext,
    InitOptions, QueryOptions, QueryResult, RestoreOptions, RestoreOutcome, ScriptOptions,
    ScriptOutcome, ScriptSource, StartOutcome, UserCredentials,
};
use crate::engines::common::{
    StdinSource, ToolInvocation, generate_password, gzip_decompress_file, parse_remote_url,
    run_tool,
};
use crate::engines::format::{DetectedFormat, detect_backup_format};
use crate::infrastructure::fsutil::{copy_recursive, remove_recursive};
use crate::infrastructure::process::{
    DEFAULT_READY_TIMEOUT, GracefulShutdown, ProcessManager, ReadyProbe, StartSpec, StopSpec,
};

/// Which flavor of the family this adapter instance speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedisFlavor {
    Redis,
    Valkey,
}

impl RedisFlavor {
    fn engine(self) -> Engine {
        match self {
            Self::Redis => Engine::Redis,
            Self::Valkey => Engine::Valkey,
        }
    }

    fn server(self) -> &'static str {
        match self {
            Self::Redis => "redis-server",
            Self::Valkey => "valkey-server",
        }
    }

    fn cli(self) -> &'static str {
        match self {
            Self::Redis => "redis-cli",
            Self::Valkey => "valkey-cli",
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Valkey => "valkey",
        }
    }
}

pub struct RedisAdapter {
    flavor: RedisFlavor,
    process: ProcessManager,
}

impl RedisAdapter {
    pub fn new(flavor: RedisFlavor, process: ProcessManager) -> Self {
        Self { flavor, process }
    }

    fn ready_probe(&self, ctx: &EngineContext) -> SpinResult<ReadyProbe> {
        Ok(ReadyProbe::Command {
            program: ctx.tool(self.flavor.cli())?,
            args: vec![
                "-h".to_string(),
                ctx.host().to_string(),
                "-p".to_string(),
                ctx.container.port.to_string(),
                "PING".to_string(),
            ],
            env: vec![],
        })
    }

    fn cli(&self, ctx: &EngineContext) -> SpinResult<ToolInvocation> {
        Ok(ToolInvocation::new(ctx.tool(self.flavor.cli())?).args([
            "-h",
            ctx.host(),
            "-p",
            &ctx.container.port.to_string(),
        ]))
    }

    async fn require_stopped(&self, ctx: &EngineContext) -> SpinResult<()> {
        if self.process.is_running(&ctx.pid_file).await {
            return Err(SpinError::precondition(format!(
                "{} '{}' must be stopped for RDB operations; stop it first",
                self.flavor.engine().display_name(),
                ctx.container.name
            )));
        }
        Ok(())
    }

    async fn require_running(&self, ctx: &EngineContext) -> SpinResult<()> {
        if !self.process.is_running(&ctx.pid_file).await {
            return Err(SpinError::precondition(format!(
                "{} '{}' must be running for this operation; start it first",
                self.flavor.engine().display_name(),
                ctx.container.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineAdapter for RedisAdapter {
    fn engine(&self) -> Engine {
        self.flavor.engine()
    }

    fn process_manager(&self) -> &ProcessManager {
        &self.process
    }

    /// No initialization tool: the server creates its files on first save
    async fn init_data_dir(&self, ctx: &EngineContext, _opts: InitOptions) -> SpinResult<()> {
        tokio::fs::create_dir_all(&ctx.data_dir)
            .await
            .map_err(|e| SpinError::io(format!("create {}", ctx.data_dir.display()), e))?;
        Ok(())
    }

    async fn start(&self, ctx: &EngineContext) -> SpinResult<StartOutcome> {
        let spec = StartSpec {
            engine: self.flavor.engine(),
            container: ctx.container.name.clone(),
            program: ctx.tool(self.flavor.server())?,
            args: vec![
                "--port".to_string(),
                ctx.container.port.to_string(),
                "--bind".to_string(),
                ctx.host().to_string(),
                "--dir".to_string(),
                ctx.data_dir.display().to_string(),
                "--daemonize".to_string(),
                "no".to_string(),
                "--dbfilename".to_string(),
                "dump.rdb".to_string(),
            ],
            env: vec![],
            log_file: ctx.log_file.clone(),
            pid_file: ctx.pid_file.clone(),
            ready: self.ready_probe(ctx)?,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        };
        self.process.start(&spec).await?;
        Ok(StartOutcome {
            port: ctx.container.port,
            connection_string: self.connection_string(ctx, None),
        })
    }

    async fn stop(&self, ctx: &EngineContext) -> SpinResult<()> {
        let spec = StopSpec {
            engine: self.flavor.engine(),
            container: ctx.container.name.clone(),
            pid_file: ctx.pid_file.clone(),
            graceful: Some(GracefulShutdown {
                program: ctx.tool(self.flavor.cli())?,
                args: vec![
                    "-h".to_string(),
                    ctx.host().to_string(),
                    "-p".to_string(),
                    ctx.container.port.to_string(),
                    "SHUTDOWN".to_string(),
                    "SAVE".to_string(),
                ],
                env: vec![],
            }),
            ping: Some(self.ready_probe(ctx)?),
        };
        self.process.stop(&spec).await
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

    /// Scripts are files of commands fed through the CLI
    async fn run_script(
        &self,
        ctx: &EngineContext,
        source: ScriptSource,
        _opts: ScriptOptions,
    ) -> SpinResult<ScriptOutcome> {
        self.require_running(ctx).await?;
        let stdin = match source {
            ScriptSource::File(path) => StdinSource::File(path),
            ScriptSource::Sql(commands) => StdinSource::Bytes(commands.into_bytes()),
        };
        let outcome = run_tool(self.cli(ctx)?.stdin(stdin)).await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "script failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(outcome)
    }

    /// One command per call; the reply lines become single-column rows
    async fn execute_query(
        &self,
        ctx: &EngineContext,
        query: &str,
        _opts: QueryOptions,
    ) -> SpinResult<QueryResult> {
        self.require_running(ctx).await?;
        let outcome =
            run_tool(self.cli(ctx)?.stdin(StdinSource::Bytes(query.as_bytes().to_vec()))).await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "command failed: {}",
                outcome.stderr.trim()
            )));
        }
        Ok(QueryResult {
            columns: vec!["result".to_string()],
            rows: outcome.stdout.lines().map(|line| vec![line.to_string()]).collect(),
        })
    }

    /// RDB snapshot of the running instance via `--rdb`
    async fn backup(
        &self,
        ctx: &EngineContext,
        output: &Path,
        opts: BackupOptions,
    ) -> SpinResult<BackupOutcome> {
        if opts.format != BackupFormat::Rdb {
            return Err(SpinError::precondition(format!(
                "{} backups are RDB snapshots; {} is not supported",
                self.flavor.engine().display_name(),
                opts.format.description()
            )));
        }
        self.require_running(ctx).await?;
        let outcome = run_tool(
            self.cli(ctx)?
                .args(["--rdb".to_string(), output.display().to_string()]),
        )
        .await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "RDB dump failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        let size = tokio::fs::metadata(output)
            .await
            .map_err(|e| SpinError::io(format!("stat {}", output.display()), e))?
            .len();
        Ok(BackupOutcome { path: output.to_path_buf(), format: opts.format, size })
    }

    /// RDB restores require a stopped instance (the file is swapped in
    /// under the server); command-text restores require a running one.
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

        let mut effective_path = path.to_path_buf();
        let mut format = info.format;
        let mut scratch: Option<PathBuf> = None;
        if format == DetectedFormat::Gzip {
            let unpacked = path.with_extension("unpacked");
            gzip_decompress_file(path, &unpacked).await?;
            format = detect_backup_format(&unpacked).await?.format;
            effective_path = unpacked.clone();
            scratch = Some(unpacked);
        }

        let result = async {
            if format == DetectedFormat::RedisRdb {
                self.require_stopped(ctx).await?;
                tokio::fs::create_dir_all(&ctx.data_dir)
                    .await
                    .map_err(|e| SpinError::io(format!("create {}", ctx.data_dir.display()), e))?;
                copy_recursive(&effective_path, &ctx.data_dir.join("dump.rdb")).await?;
                info!("📥 RDB snapshot staged for '{}'", ctx.container.name);
                return Ok(RestoreOutcome {
                    format,
                    stdout: String::new(),
                    stderr: String::new(),
                    code: 0,
                });
            }

            // Command text: pipe into a live instance
            self.require_running(ctx).await?;
            let outcome = run_tool(
                self.cli(ctx)?
                    .arg("--pipe")
                    .stdin(StdinSource::File(effective_path.clone())),
            )
            .await?;
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
        .await;

        if let Some(scratch) = scratch {
            let _ = remove_recursive(&scratch).await;
        }
        result
    }

    /// `--rdb` against the remote; the auth secret travels via
    /// REDISCLI_AUTH, never argv
    async fn dump_from_connection_string(
        &self,
        ctx: &EngineContext,
        url: &str,
        output: &Path,
    ) -> SpinResult<()> {
        let parsed = parse_remote_url(url, self.flavor.engine(), &["redis", "valkey", "rediss"])?;
        let host = parsed.host_str().unwrap_or("localhost").to_string();
        let port = parsed.port().unwrap_or(6379);

        let mut invocation = ToolInvocation::new(ctx.tool(self.flavor.cli())?).args([
            "-h".to_string(),
            host,
            "-p".to_string(),
            port.to_string(),
            "--rdb".to_string(),
            output.display().to_string(),
        ]);
        if let Some(password) = parsed.password() {
            invocation = invocation.env("REDISCLI_AUTH", password.to_string());
        }
        let outcome = run_tool(invocation).await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "remote RDB dump failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(())
    }

    fn connection_string(&self, ctx: &EngineContext, _database: Option<&str>) -> String {
        format!("{}://{}:{}", self.flavor.scheme(), ctx.host(), ctx.container.port)
    }

    async fn database_size(&self, ctx: &EngineContext) -> SpinResult<Option<u64>> {
        let result = self.execute_query(ctx, "INFO memory\n", QueryOptions::default()).await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.first())
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|v| v.trim().parse().ok()))
    }

    /// ACL user with full access to the keyspace
    async fn create_user(
        &self,
        ctx: &EngineContext,
        request: CreateUserRequest,
    ) -> SpinResult<UserCredentials> {
        validate_username(&request.username)?;
        self.require_running(ctx).await?;
        let password =
            if request.password.is_empty() { generate_password() } else { request.password.clone() };
        let command = format!(
            "ACL SETUSER {} on >{} ~* +@all\n",
            request.username, password
        );
        let outcome =
            run_tool(self.cli(ctx)?.stdin(StdinSource::Bytes(command.into_bytes()))).await?;
        if outcome.code != 0 || outcome.stdout.contains("ERR") {
            return Err(SpinError::precondition(format!(
                "ACL SETUSER failed: {} {}",
                outcome.stdout.trim(),
                outcome.stderr.trim()
            )));
        }
        Ok(UserCredentials {
            connection_string: format!(
                "{}://{}@{}:{}",
                self.flavor.scheme(),
                request.username,
                ctx.host(),
                ctx.container.port
            ),
            username: request.username,
            password,
            database: request.database,
        })
    }
}
