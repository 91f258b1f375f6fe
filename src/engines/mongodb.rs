//! MongoDB adapter
//!
//! `mongod` is the supervised server, `mongosh` the script/query client,
//! and `mongodump`/`mongorestore` carry the backup pipeline in archive
//! format. Databases are implicit in MongoDB; create materializes one by
//! creating a seed collection. Remote credentials are handed to the dump
//! tool through a temporary config file, never argv.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::container::{validate_database_name, validate_username};
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
use crate::infrastructure::fsutil::remove_recursive;
use crate::infrastructure::process::{
    DEFAULT_READY_TIMEOUT, GracefulShutdown, ProcessManager, ReadyProbe, StartSpec, StopSpec,
};

pub struct MongodbAdapter {
    process: ProcessManager,
}

impl MongodbAdapter {
    pub fn new(process: ProcessManager) -> Self {
        Self { process }
    }

    fn mongosh(&self, ctx: &EngineContext, database: Option<&str>) -> SpinResult<ToolInvocation> {
        let target = format!(
            "mongodb://{}:{}/{}",
            ctx.host(),
            ctx.container.port,
            database.unwrap_or("")
        );
        Ok(ToolInvocation::new(ctx.tool("mongosh")?).arg(target).arg("--quiet"))
    }

    async fn eval(&self, ctx: &EngineContext, database: Option<&str>, js: &str) -> SpinResult<ScriptOutcome> {
        let outcome = run_tool(self.mongosh(ctx, database)?.args(["--eval", js])).await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "mongosh failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(outcome)
    }
}

#[async_trait]
impl EngineAdapter for MongodbAdapter {
    fn engine(&self) -> Engine {
        Engine::Mongodb
    }

    fn process_manager(&self) -> &ProcessManager {
        &self.process
    }

    /// mongod initializes its own files; the directory just has to exist
    async fn init_data_dir(&self, ctx: &EngineContext, _opts: InitOptions) -> SpinResult<()> {
        tokio::fs::create_dir_all(&ctx.data_dir)
            .await
            .map_err(|e| SpinError::io(format!("create {}", ctx.data_dir.display()), e))?;
        Ok(())
    }

    async fn start(&self, ctx: &EngineContext) -> SpinResult<StartOutcome> {
        let spec = StartSpec {
            engine: Engine::Mongodb,
            container: ctx.container.name.clone(),
            program: ctx.tool("mongod")?,
            args: vec![
                "--dbpath".to_string(),
                ctx.data_dir.display().to_string(),
                "--port".to_string(),
                ctx.container.port.to_string(),
                "--bind_ip".to_string(),
                ctx.host().to_string(),
            ],
            env: vec![],
            log_file: ctx.log_file.clone(),
            pid_file: ctx.pid_file.clone(),
            ready: ReadyProbe::Tcp { port: ctx.container.port },
            ready_timeout: DEFAULT_READY_TIMEOUT,
        };
        self.process.start(&spec).await?;
        Ok(StartOutcome {
            port: ctx.container.port,
            connection_string: self.connection_string(ctx, Some(&ctx.container.database)),
        })
    }

    async fn stop(&self, ctx: &EngineContext) -> SpinResult<()> {
        let spec = StopSpec {
            engine: Engine::Mongodb,
            container: ctx.container.name.clone(),
            pid_file: ctx.pid_file.clone(),
            graceful: Some(GracefulShutdown {
                program: ctx.tool("mongosh")?,
                args: vec![
                    format!("mongodb://{}:{}/admin", ctx.host(), ctx.container.port),
                    "--quiet".to_string(),
                    "--eval".to_string(),
                    "db.shutdownServer({force: false})".to_string(),
                ],
                env: vec![],
            }),
            ping: Some(ReadyProbe::Tcp { port: ctx.container.port }),
        };
        self.process.stop(&spec).await
    }

    /// Databases are implicit; creating a seed collection materializes one
    async fn create_database(&self, ctx: &EngineContext, db: &str) -> SpinResult<()> {
        validate_database_name(db)?;
        self.eval(
            ctx,
            None,
            &format!("db.getSiblingDB('{db}').createCollection('_spindb_seed')"),
        )
        .await?;
        Ok(())
    }

    async fn drop_database(&self, ctx: &EngineContext, db: &str) -> SpinResult<()> {
        validate_database_name(db)?;
        self.eval(ctx, None, &format!("db.getSiblingDB('{db}').dropDatabase()")).await?;
        Ok(())
    }

    async fn list_databases(&self, ctx: &EngineContext) -> SpinResult<Vec<String>> {
        let outcome = self
            .eval(
                ctx,
                None,
                "db.adminCommand('listDatabases').databases.map(d => d.name).join('\\n')",
            )
            .await?;
        const SYSTEM: [&str; 3] = ["admin", "config", "local"];
        Ok(outcome
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !SYSTEM.contains(line))
            .map(String::from)
            .collect())
    }

    async fn run_script(
        &self,
        ctx: &EngineContext,
        source: ScriptSource,
        opts: ScriptOptions,
    ) -> SpinResult<ScriptOutcome> {
        let database = opts.database.unwrap_or_else(|| ctx.container.database.clone());
        let outcome = match source {
            ScriptSource::File(path) => {
                run_tool(self.mongosh(ctx, Some(&database))?.stdin(StdinSource::File(path)))
                    .await?
            }
            ScriptSource::Sql(js) => {
                run_tool(self.mongosh(ctx, Some(&database))?.args(["--eval", &js])).await?
            }
        };
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "script failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(outcome)
    }

    /// Evaluates one expression; output lines become single-column rows
    async fn execute_query(
        &self,
        ctx: &EngineContext,
        query: &str,
        opts: QueryOptions,
    ) -> SpinResult<QueryResult> {
        let database = opts.database.unwrap_or_else(|| ctx.container.database.clone());
        let outcome = self.eval(ctx, Some(&database), query).await?;
        Ok(QueryResult {
            columns: vec!["result".to_string()],
            rows: outcome
                .stdout
                .lines()
                .filter(|line| !line.is_empty())
                .map(|line| vec![line.to_string()])
                .collect(),
        })
    }

    async fn backup(
        &self,
        ctx: &EngineContext,
        output: &Path,
        opts: BackupOptions,
    ) -> SpinResult<BackupOutcome> {
        if opts.format != BackupFormat::Archive {
            return Err(SpinError::precondition(format!(
                "MongoDB backups use the archive format; {} is not supported",
                opts.format.description()
            )));
        }
        let database = opts.database.unwrap_or_else(|| ctx.container.database.clone());
        let outcome = run_tool(
            ToolInvocation::new(ctx.tool("mongodump")?).args([
                "--host".to_string(),
                ctx.host().to_string(),
                "--port".to_string(),
                ctx.container.port.to_string(),
                "--db".to_string(),
                database,
                format!("--archive={}", output.display()),
            ]),
        )
        .await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "mongodump failed ({}): {}",
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

    async fn restore(
        &self,
        ctx: &EngineContext,
        path: &Path,
        opts: RestoreOptions,
    ) -> SpinResult<RestoreOutcome> {
        let info = detect_backup_format(path).await?;
        if !info.format.accepted_by(Engine::Mongodb) {
            return Err(SpinError::wrong_engine_dump(
                info.format.source_engine().unwrap_or("unknown"),
                Engine::Mongodb,
            ));
        }

        // `mongodump --gzip` archives lead with the gzip magic; unpack
        // in-process and re-sniff for the archive signature
        let mut effective_path = path.to_path_buf();
        let mut format = info.format;
        let mut scratch: Option<PathBuf> = None;
        if format == DetectedFormat::Gzip {
            let unpacked = path.with_extension("unpacked.archive");
            gzip_decompress_file(path, &unpacked).await?;
            let inner = detect_backup_format(&unpacked).await?;
            if !inner.format.accepted_by(Engine::Mongodb) {
                remove_recursive(&unpacked).await?;
                return Err(SpinError::wrong_engine_dump(
                    inner.format.source_engine().unwrap_or("unknown"),
                    Engine::Mongodb,
                ));
            }
            format = inner.format;
            effective_path = unpacked.clone();
            scratch = Some(unpacked);
        }

        let database = opts.database.unwrap_or_else(|| ctx.container.database.clone());
        let result = async {
            let mut invocation = ToolInvocation::new(ctx.tool("mongorestore")?).args([
                "--host".to_string(),
                ctx.host().to_string(),
                "--port".to_string(),
                ctx.container.port.to_string(),
                format!("--archive={}", effective_path.display()),
                "--drop".to_string(),
            ]);
            if !database.is_empty() {
                invocation = invocation
                    .args(["--nsInclude".to_string(), format!("{database}.*")]);
            }
            let outcome = run_tool(invocation).await?;
            if outcome.code != 0 {
                return Err(SpinError::precondition(format!(
                    "mongorestore failed ({}): {}",
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

    /// The password never reaches argv: it rides in a transient YAML
    /// config file that is removed immediately after the run
    async fn dump_from_connection_string(
        &self,
        ctx: &EngineContext,
        url: &str,
        output: &Path,
    ) -> SpinResult<()> {
        let parsed = parse_remote_url(url, Engine::Mongodb, &["mongodb", "mongodb+srv"])?;
        let host = parsed.host_str().unwrap_or("localhost").to_string();
        let port = parsed.port().unwrap_or(27017);
        let database = parsed.path().trim_start_matches('/').to_string();

        let mut invocation = ToolInvocation::new(ctx.tool("mongodump")?).args([
            "--host".to_string(),
            host,
            "--port".to_string(),
            port.to_string(),
            format!("--archive={}", output.display()),
        ]);
        if !database.is_empty() {
            invocation = invocation.args(["--db".to_string(), database]);
        }
        if !parsed.username().is_empty() {
            invocation =
                invocation.args(["--username".to_string(), parsed.username().to_string()]);
        }

        let mut secret_config: Option<PathBuf> = None;
        if let Some(password) = parsed.password() {
            let config_path = output.with_extension("auth.yaml");
            tokio::fs::write(&config_path, format!("password: {password}\n"))
                .await
                .map_err(|e| SpinError::io("write dump auth config", e))?;
            invocation =
                invocation.args(["--config".to_string(), config_path.display().to_string()]);
            secret_config = Some(config_path);
        }

        let outcome = run_tool(invocation).await;
        if let Some(config_path) = secret_config {
            let _ = remove_recursive(&config_path).await;
        }
        let outcome = outcome?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "remote mongodump failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(())
    }

    fn connection_string(&self, ctx: &EngineContext, database: Option<&str>) -> String {
        match database {
            Some(db) if !db.is_empty() => {
                format!("mongodb://{}:{}/{}", ctx.host(), ctx.container.port, db)
            }
            _ => format!("mongodb://{}:{}", ctx.host(), ctx.container.port),
        }
    }

    async fn database_size(&self, ctx: &EngineContext) -> SpinResult<Option<u64>> {
        let db = ctx.container.database.clone();
        let outcome = self.eval(ctx, Some(&db), "db.stats().dataSize").await?;
        Ok(outcome.stdout.trim().parse::<f64>().ok().map(|v| v as u64))
    }

    async fn create_user(
        &self,
        ctx: &EngineContext,
        request: CreateUserRequest,
    ) -> SpinResult<UserCredentials> {
        validate_username(&request.username)?;
        validate_database_name(&request.database)?;
        let password =
            if request.password.is_empty() { generate_password() } else { request.password.clone() };
        // The createUser document is streamed over stdin
        let script = format!(
            "db.getSiblingDB('{db}').createUser({{user: '{user}', pwd: '{password}', \
             roles: [{{role: 'readWrite', db: '{db}'}}, {{role: 'dbAdmin', db: '{db}'}}]}})",
            db = request.database,
            user = request.username,
        );
        let outcome = run_tool(
            self.mongosh(ctx, Some(&request.database))?
                .stdin(StdinSource::Bytes(script.into_bytes())),
        )
        .await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "createUser failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(UserCredentials {
            connection_string: format!(
                "mongodb://{}@{}:{}/{}",
                request.username,
                ctx.host(),
                ctx.container.port,
                request.database
            ),
            username: request.username,
            password,
            database: request.database,
        })
    }
}
