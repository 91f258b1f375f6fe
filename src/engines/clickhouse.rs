//! ClickHouse adapter
//!
//! One multi-call binary (`clickhouse server` / `clickhouse client`)
//! covers everything. The container port is the HTTP port (the `/ping`
//! health endpoint lives there); the native protocol the client speaks
//! runs on the next port up. SQL dumps are synthesized per table with
//! `SHOW CREATE TABLE` plus `FORMAT SQLInsert` data, both locally and
//! against remote instances.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::domain::container::{validate_database_name, validate_username};
use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};
use crate::engines::adapter::{
    BackupFormat, BackupOptions, BackupOutcome, CreateUserRequest, EngineAdapter, EngineContext,
    InitOptions, QueryOptions, QueryResult, RestoreOptions, RestoreOutcome, ScriptOptions,
    ScriptOutcome, ScriptSource, StartOutcome, UserCredentials,
};
use crate::engines::common::{
    StdinSource, ToolInvocation, generate_password, gzip_compress_file, gzip_decompress_file,
    parse_remote_url, parse_tsv, run_tool,
};
use crate::engines::format::{DetectedFormat, detect_backup_format};
use crate::infrastructure::fsutil::remove_recursive;
use crate::infrastructure::process::{
    DEFAULT_READY_TIMEOUT, GracefulShutdown, ProcessManager, ReadyProbe, StartSpec, StopSpec,
};

/// A client target: the local container or a remote instance
#[derive(Debug, Clone)]
struct ClientTarget {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
}

pub struct ClickhouseAdapter {
    process: ProcessManager,
}

impl ClickhouseAdapter {
    pub fn new(process: ProcessManager) -> Self {
        Self { process }
    }

    /// Native protocol port, one above the HTTP port in the catalog
    fn native_port(ctx: &EngineContext) -> u16 {
        ctx.container.port.saturating_add(1)
    }

    fn local_target(ctx: &EngineContext) -> ClientTarget {
        ClientTarget {
            host: ctx.host().to_string(),
            port: Self::native_port(ctx),
            user: None,
            password: None,
        }
    }

    fn client_for(
        &self,
        ctx: &EngineContext,
        target: &ClientTarget,
        database: Option<&str>,
    ) -> SpinResult<ToolInvocation> {
        let mut invocation = ToolInvocation::new(ctx.tool("clickhouse")?).args([
            "client",
            "--host",
            &target.host,
            "--port",
            &target.port.to_string(),
        ]);
        if let Some(user) = &target.user {
            invocation = invocation.args(["--user", user]);
        }
        if let Some(password) = &target.password {
            // The secret rides in the environment, never argv
            invocation = invocation.env("CLICKHOUSE_PASSWORD", password.clone());
        }
        if let Some(db) = database {
            invocation = invocation.args(["--database", db]);
        }
        Ok(invocation)
    }

    fn client(&self, ctx: &EngineContext, database: Option<&str>) -> SpinResult<ToolInvocation> {
        self.client_for(ctx, &Self::local_target(ctx), database)
    }

    async fn query_target(
        &self,
        ctx: &EngineContext,
        target: &ClientTarget,
        database: Option<&str>,
        sql: &str,
    ) -> SpinResult<ScriptOutcome> {
        let outcome =
            run_tool(self.client_for(ctx, target, database)?.args(["--query", sql])).await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "clickhouse client failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(outcome)
    }

    async fn query(
        &self,
        ctx: &EngineContext,
        database: Option<&str>,
        sql: &str,
    ) -> SpinResult<ScriptOutcome> {
        self.query_target(ctx, &Self::local_target(ctx), database, sql).await
    }

    /// Write a full SQL dump of one database (schema + data per table)
    async fn dump_sql(
        &self,
        ctx: &EngineContext,
        target: &ClientTarget,
        database: &str,
        dest: &Path,
    ) -> SpinResult<()> {
        let tables: Vec<String> = self
            .query_target(ctx, target, Some(database), "SHOW TABLES")
            .await?
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| SpinError::io(format!("create {}", dest.display()), e))?;
        file.write_all(format!("CREATE DATABASE IF NOT EXISTS \"{database}\";\n\n").as_bytes())
            .await
            .map_err(|e| SpinError::io("write dump header", e))?;

        for table in &tables {
            let schema = self
                .query_target(ctx, target, Some(database), &format!("SHOW CREATE TABLE \"{table}\""))
                .await?;
            let data = self
                .query_target(
                    ctx,
                    target,
                    Some(database),
                    &format!("SELECT * FROM \"{table}\" FORMAT SQLInsert"),
                )
                .await?;
            let chunk = format!(
                "{};\n\n{}\n",
                schema.stdout.trim().replace("\\n", "\n"),
                data.stdout.replace("INSERT INTO table", &format!("INSERT INTO \"{table}\"")),
            );
            file.write_all(chunk.as_bytes())
                .await
                .map_err(|e| SpinError::io("write dump chunk", e))?;
        }
        file.flush().await.map_err(|e| SpinError::io("flush dump", e))?;
        Ok(())
    }
}

#[async_trait]
impl EngineAdapter for ClickhouseAdapter {
    fn engine(&self) -> Engine {
        Engine::Clickhouse
    }

    fn process_manager(&self) -> &ProcessManager {
        &self.process
    }

    /// The server lays out its own directories under `--path`
    async fn init_data_dir(&self, ctx: &EngineContext, _opts: InitOptions) -> SpinResult<()> {
        tokio::fs::create_dir_all(&ctx.data_dir)
            .await
            .map_err(|e| SpinError::io(format!("create {}", ctx.data_dir.display()), e))?;
        Ok(())
    }

    async fn start(&self, ctx: &EngineContext) -> SpinResult<StartOutcome> {
        let spec = StartSpec {
            engine: Engine::Clickhouse,
            container: ctx.container.name.clone(),
            program: ctx.tool("clickhouse")?,
            args: vec![
                "server".to_string(),
                "--".to_string(),
                format!("--path={}", ctx.data_dir.display()),
                format!("--http_port={}", ctx.container.port),
                format!("--tcp_port={}", Self::native_port(ctx)),
                "--listen_host=127.0.0.1".to_string(),
            ],
            env: vec![],
            log_file: ctx.log_file.clone(),
            pid_file: ctx.pid_file.clone(),
            ready: ReadyProbe::Http {
                url: format!("http://{}:{}/ping", ctx.host(), ctx.container.port),
            },
            ready_timeout: DEFAULT_READY_TIMEOUT,
        };
        self.process.start(&spec).await?;

        let db = &ctx.container.database;
        if !db.is_empty() {
            self.query(ctx, None, &format!("CREATE DATABASE IF NOT EXISTS \"{db}\"")).await?;
        }
        Ok(StartOutcome {
            port: ctx.container.port,
            connection_string: self.connection_string(ctx, Some(db)),
        })
    }

    async fn stop(&self, ctx: &EngineContext) -> SpinResult<()> {
        let graceful = ctx.tool("clickhouse").ok().map(|program| GracefulShutdown {
            program,
            args: vec![
                "client".to_string(),
                "--host".to_string(),
                ctx.host().to_string(),
                "--port".to_string(),
                Self::native_port(ctx).to_string(),
                "--query".to_string(),
                "SYSTEM SHUTDOWN".to_string(),
            ],
            env: vec![],
        });
        let spec = StopSpec {
            engine: Engine::Clickhouse,
            container: ctx.container.name.clone(),
            pid_file: ctx.pid_file.clone(),
            graceful,
            ping: Some(ReadyProbe::Http {
                url: format!("http://{}:{}/ping", ctx.host(), ctx.container.port),
            }),
        };
        self.process.stop(&spec).await
    }

    async fn create_database(&self, ctx: &EngineContext, db: &str) -> SpinResult<()> {
        validate_database_name(db)?;
        self.query(ctx, None, &format!("CREATE DATABASE \"{db}\"")).await?;
        Ok(())
    }

    async fn drop_database(&self, ctx: &EngineContext, db: &str) -> SpinResult<()> {
        validate_database_name(db)?;
        self.query(ctx, None, &format!("DROP DATABASE IF EXISTS \"{db}\"")).await?;
        Ok(())
    }

    async fn list_databases(&self, ctx: &EngineContext) -> SpinResult<Vec<String>> {
        let outcome = self.query(ctx, None, "SHOW DATABASES").await?;
        const SYSTEM: [&str; 3] = ["INFORMATION_SCHEMA", "information_schema", "system"];
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
        let invocation = self.client(ctx, Some(&database))?.arg("--multiquery");
        let outcome = match source {
            ScriptSource::File(path) => {
                run_tool(invocation.stdin(StdinSource::File(path))).await?
            }
            ScriptSource::Sql(sql) => {
                run_tool(invocation.stdin(StdinSource::Bytes(sql.into_bytes()))).await?
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

    async fn execute_query(
        &self,
        ctx: &EngineContext,
        query: &str,
        opts: QueryOptions,
    ) -> SpinResult<QueryResult> {
        let database = opts.database.unwrap_or_else(|| ctx.container.database.clone());
        let target = ClientTarget {
            host: opts.host.unwrap_or_else(|| ctx.host().to_string()),
            port: Self::native_port(ctx),
            user: opts.username,
            password: opts.password,
        };
        let outcome = run_tool(
            self.client_for(ctx, &target, Some(&database))?
                .args(["--format", "TabSeparatedWithNames", "--query", query]),
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

    /// Schema plus data per table, rendered as executable SQL
    async fn backup(
        &self,
        ctx: &EngineContext,
        output: &Path,
        opts: BackupOptions,
    ) -> SpinResult<BackupOutcome> {
        if !matches!(opts.format, BackupFormat::Sql | BackupFormat::SqlGz) {
            return Err(SpinError::precondition(format!(
                "ClickHouse backups are SQL dumps; {} is not supported",
                opts.format.description()
            )));
        }
        let database = opts.database.unwrap_or_else(|| ctx.container.database.clone());

        let plain = if opts.format == BackupFormat::Sql {
            output.to_path_buf()
        } else {
            output.with_extension("partial.sql")
        };
        if let Err(err) = self.dump_sql(ctx, &Self::local_target(ctx), &database, &plain).await {
            let _ = remove_recursive(&plain).await;
            return Err(err);
        }
        if opts.format == BackupFormat::SqlGz {
            gzip_compress_file(&plain, output).await?;
            remove_recursive(&plain).await?;
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
        if !info.format.accepted_by(Engine::Clickhouse) {
            return Err(SpinError::wrong_engine_dump(
                info.format.source_engine().unwrap_or("unknown"),
                Engine::Clickhouse,
            ));
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

        let database = opts.database.unwrap_or_else(|| ctx.container.database.clone());
        let result = async {
            if opts.create_database {
                self.query(ctx, None, &format!("CREATE DATABASE IF NOT EXISTS \"{database}\""))
                    .await?;
            }
            let outcome = run_tool(
                self.client(ctx, Some(&database))?
                    .arg("--multiquery")
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

    /// Remote dump through `clickhouse client`; the password travels in
    /// CLICKHOUSE_PASSWORD
    async fn dump_from_connection_string(
        &self,
        ctx: &EngineContext,
        url: &str,
        output: &Path,
    ) -> SpinResult<()> {
        let parsed = parse_remote_url(url, Engine::Clickhouse, &["clickhouse", "tcp"])?;
        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(SpinError::precondition("connection string is missing the database name"));
        }
        let target = ClientTarget {
            host: parsed.host_str().unwrap_or("localhost").to_string(),
            port: parsed.port().unwrap_or(9000),
            user: (!parsed.username().is_empty()).then(|| parsed.username().to_string()),
            password: parsed.password().map(str::to_string),
        };
        self.dump_sql(ctx, &target, &database, output).await
    }

    fn connection_string(&self, ctx: &EngineContext, database: Option<&str>) -> String {
        let db = database.unwrap_or(&ctx.container.database);
        format!(
            "clickhouse://{}@{}:{}/{}",
            Engine::Clickhouse.superuser().unwrap_or("default"),
            ctx.host(),
            Self::native_port(ctx),
            db
        )
    }

    async fn database_size(&self, ctx: &EngineContext) -> SpinResult<Option<u64>> {
        let db = ctx.container.database.clone();
        let outcome = self
            .query(
                ctx,
                None,
                &format!(
                    "SELECT coalesce(sum(bytes_on_disk), 0) FROM system.parts WHERE database = '{db}' AND active"
                ),
            )
            .await?;
        Ok(outcome.stdout.trim().parse().ok())
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
        let sql = format!(
            "CREATE USER \"{user}\" IDENTIFIED WITH plaintext_password BY '{password}';\n\
             GRANT ALL ON \"{db}\".* TO \"{user}\";",
            user = request.username,
            password = password.replace('\'', "\\'"),
            db = request.database,
        );
        let outcome = run_tool(
            self.client(ctx, None)?
                .arg("--multiquery")
                .stdin(StdinSource::Bytes(sql.into_bytes())),
        )
        .await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "CREATE USER failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(UserCredentials {
            connection_string: format!(
                "clickhouse://{}@{}:{}/{}",
                request.username,
                ctx.host(),
                Self::native_port(ctx),
                request.database
            ),
            username: request.username,
            password,
            database: request.database,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::Container;
    use crate::infrastructure::platform::PlatformService;

    fn context(tmp: &Path) -> EngineContext {
        EngineContext {
            container: Container::new("events", Engine::Clickhouse, "24.8.4", 8123, "app"),
            install_dir: tmp.join("install"),
            data_dir: tmp.join("data"),
            log_file: tmp.join("events.log"),
            pid_file: tmp.join("events.pid"),
            socket_file: tmp.join("events.sock"),
            platform: PlatformService::new(),
            recorded_tools: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn test_native_port_is_http_plus_one() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        assert_eq!(ClickhouseAdapter::native_port(&ctx), 8124);
        assert_eq!(
            ClickhouseAdapter::new(ProcessManager::new(PlatformService::new()))
                .connection_string(&ctx, Some("app")),
            "clickhouse://default@127.0.0.1:8124/app"
        );
    }

    #[tokio::test]
    async fn test_foreign_dump_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path());
        let adapter = ClickhouseAdapter::new(ProcessManager::new(PlatformService::new()));
        let dump = tmp.path().join("dump.rdb");
        tokio::fs::write(&dump, b"REDIS0011").await.unwrap();
        let err = adapter.restore(&ctx, &dump, RestoreOptions::default()).await.unwrap_err();
        assert!(matches!(err, SpinError::WrongEngineDump { .. }));
    }
}
