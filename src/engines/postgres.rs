//! PostgreSQL adapter
//!
//! Wraps the binaries shipped in a PostgreSQL installation: `initdb` for
//! data directory setup, the `postgres` server daemon, `pg_ctl` for fast
//! shutdown, `pg_isready` as the health probe, `psql` for queries and
//! scripts, and `pg_dump`/`pg_restore` for the backup pipeline. Local
//! instances run with trust auth on loopback; remote dumps authenticate
//! through `PGPASSWORD`.

use std::path::Path;

use async_trait::async_trait;

use crate::domain::container::{validate_database_name, validate_username};
use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};
use crate::domain::version::Version;
use crate::engines::adapter::{
    BackupFormat, BackupOptions, BackupOutcome, CreateUserRequest, EngineAdapter, EngineContext,
    INIT_TIMEOUT, InitOptions, QueryOptions, QueryResult, RestoreOptions, RestoreOutcome,
    ScriptOptions, ScriptOutcome, ScriptSource, StartOutcome, UserCredentials,
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

pub struct PostgresAdapter {
    process: ProcessManager,
}

impl PostgresAdapter {
    pub fn new(process: ProcessManager) -> Self {
        Self { process }
    }

    fn superuser(_ctx: &EngineContext) -> String {
        Engine::Postgresql.superuser().unwrap_or("postgres").to_string()
    }

    fn ready_probe(&self, ctx: &EngineContext) -> SpinResult<ReadyProbe> {
        Ok(ReadyProbe::Command {
            program: ctx.tool("pg_isready")?,
            args: vec![
                "-h".to_string(),
                ctx.host().to_string(),
                "-p".to_string(),
                ctx.container.port.to_string(),
            ],
            env: vec![],
        })
    }

    /// psql invocation against the local instance
    fn psql(&self, ctx: &EngineContext, database: &str) -> SpinResult<ToolInvocation> {
        Ok(ToolInvocation::new(ctx.tool("psql")?)
            .args([
                "-h",
                ctx.host(),
                "-p",
                &ctx.container.port.to_string(),
                "-U",
                &Self::superuser(ctx),
                "-d",
                database,
                "-v",
                "ON_ERROR_STOP=1",
            ]))
    }

    async fn run_sql(&self, ctx: &EngineContext, database: &str, sql: &str) -> SpinResult<ScriptOutcome> {
        let outcome = run_tool(
            self.psql(ctx, database)?
                .stdin(StdinSource::Bytes(sql.as_bytes().to_vec())),
        )
        .await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "psql failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(outcome)
    }

    /// Major version reported by a plain-SQL dump banner, when present
    fn dump_major(head: &str) -> Option<u32> {
        head.lines()
            .find_map(|line| line.strip_prefix("-- Dumped from database version "))
            .and_then(|rest| Version::parse(rest.trim().split_whitespace().next()?).ok())
            .map(|v| v.major)
    }

    async fn check_dump_version(
        &self,
        ctx: &EngineContext,
        path: &Path,
    ) -> SpinResult<()> {
        let mut head = vec![0u8; 512];
        use tokio::io::AsyncReadExt;
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| SpinError::io(format!("open {}", path.display()), e))?;
        let read = file.read(&mut head).await.map_err(|e| SpinError::io("read dump head", e))?;
        head.truncate(read);

        let Some(dump_major) = Self::dump_major(&String::from_utf8_lossy(&head)) else {
            return Ok(());
        };
        let tool_major = Version::parse(&ctx.container.version)?.major;
        if dump_major > tool_major {
            return Err(SpinError::VersionIncompatible {
                dump_version: dump_major.to_string(),
                tool_version: tool_major.to_string(),
                variant: "postgresql".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EngineAdapter for PostgresAdapter {
    fn engine(&self) -> Engine {
        Engine::Postgresql
    }

    fn process_manager(&self) -> &ProcessManager {
        &self.process
    }

    async fn init_data_dir(&self, ctx: &EngineContext, opts: InitOptions) -> SpinResult<()> {
        if ctx.data_dir.join("PG_VERSION").is_file() {
            return Ok(());
        }
        let created_here = !ctx.data_dir.exists();
        tokio::fs::create_dir_all(&ctx.data_dir)
            .await
            .map_err(|e| SpinError::io(format!("create {}", ctx.data_dir.display()), e))?;

        let superuser = opts.superuser.unwrap_or_else(|| Self::superuser(ctx));
        let outcome = run_tool(
            ToolInvocation::new(ctx.tool("initdb")?)
                .args([
                    "-D",
                    &ctx.data_dir.display().to_string(),
                    "-U",
                    &superuser,
                    "--auth=trust",
                    "--encoding=UTF8",
                    "--no-sync",
                ])
                .timeout(INIT_TIMEOUT),
        )
        .await;

        match outcome {
            Ok(out) if out.code == 0 => Ok(()),
            Ok(out) => {
                if created_here {
                    remove_recursive(&ctx.data_dir).await?;
                }
                Err(SpinError::precondition(format!(
                    "initdb failed ({}): {}",
                    out.code,
                    out.stderr.trim()
                )))
            }
            Err(err) => {
                if created_here {
                    remove_recursive(&ctx.data_dir).await?;
                }
                Err(err)
            }
        }
    }

    async fn start(&self, ctx: &EngineContext) -> SpinResult<StartOutcome> {
        let socket_dir = ctx
            .socket_file
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/tmp".to_string());
        let spec = StartSpec {
            engine: Engine::Postgresql,
            container: ctx.container.name.clone(),
            program: ctx.tool("postgres")?,
            args: vec![
                "-D".to_string(),
                ctx.data_dir.display().to_string(),
                "-p".to_string(),
                ctx.container.port.to_string(),
                "-c".to_string(),
                "listen_addresses=127.0.0.1".to_string(),
                "-k".to_string(),
                socket_dir,
            ],
            env: vec![],
            log_file: ctx.log_file.clone(),
            pid_file: ctx.pid_file.clone(),
            ready: self.ready_probe(ctx)?,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        };
        self.process.start(&spec).await?;

        // Make sure the primary database exists on first start
        let db = &ctx.container.database;
        if !db.is_empty() {
            let existing = self.list_databases(ctx).await?;
            if !existing.iter().any(|d| d == db) {
                self.create_database(ctx, db).await?;
            }
        }
        Ok(StartOutcome {
            port: ctx.container.port,
            connection_string: self.connection_string(ctx, Some(db)),
        })
    }

    async fn stop(&self, ctx: &EngineContext) -> SpinResult<()> {
        let spec = StopSpec {
            engine: Engine::Postgresql,
            container: ctx.container.name.clone(),
            pid_file: ctx.pid_file.clone(),
            graceful: Some(GracefulShutdown {
                program: ctx.tool("pg_ctl")?,
                args: vec![
                    "stop".to_string(),
                    "-D".to_string(),
                    ctx.data_dir.display().to_string(),
                    "-m".to_string(),
                    "fast".to_string(),
                    "-w".to_string(),
                ],
                env: vec![],
            }),
            ping: Some(self.ready_probe(ctx)?),
        };
        self.process.stop(&spec).await
    }

    async fn create_database(&self, ctx: &EngineContext, db: &str) -> SpinResult<()> {
        validate_database_name(db)?;
        self.run_sql(ctx, "postgres", &format!("CREATE DATABASE \"{db}\";")).await?;
        Ok(())
    }

    async fn drop_database(&self, ctx: &EngineContext, db: &str) -> SpinResult<()> {
        validate_database_name(db)?;
        self.run_sql(ctx, "postgres", &format!("DROP DATABASE IF EXISTS \"{db}\";")).await?;
        Ok(())
    }

    async fn list_databases(&self, ctx: &EngineContext) -> SpinResult<Vec<String>> {
        let outcome = run_tool(
            self.psql(ctx, "postgres")?
                .args(["-t", "-A"])
                .arg("-c")
                .arg("SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname"),
        )
        .await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "listing databases failed: {}",
                outcome.stderr.trim()
            )));
        }
        Ok(outcome.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    async fn run_script(
        &self,
        ctx: &EngineContext,
        source: ScriptSource,
        opts: ScriptOptions,
    ) -> SpinResult<ScriptOutcome> {
        let database = opts.database.unwrap_or_else(|| ctx.container.database.clone());
        let invocation = match source {
            ScriptSource::File(path) => self.psql(ctx, &database)?.stdin(StdinSource::File(path)),
            ScriptSource::Sql(sql) => self.psql(ctx, &database)?.arg("-c").arg(sql),
        };
        let outcome = run_tool(invocation).await?;
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
        let host = opts.host.unwrap_or_else(|| ctx.host().to_string());
        let username = opts.username.unwrap_or_else(|| Self::superuser(ctx));

        let mut invocation = ToolInvocation::new(ctx.tool("psql")?).args([
            "-h",
            &host,
            "-p",
            &ctx.container.port.to_string(),
            "-U",
            &username,
            "-d",
            &database,
            "-v",
            "ON_ERROR_STOP=1",
            "-A",
            "-F",
            "\t",
            "-P",
            "footer=off",
            "-c",
            query,
        ]);
        if let Some(password) = opts.password {
            invocation = invocation.env("PGPASSWORD", password);
        }
        if opts.ssl {
            invocation = invocation.env("PGSSLMODE", "require");
        }
        let outcome = run_tool(invocation).await?;
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
        let database = opts.database.unwrap_or_else(|| ctx.container.database.clone());
        let pg_dump = ctx.tool("pg_dump")?;
        let base_args = vec![
            "-h".to_string(),
            ctx.host().to_string(),
            "-p".to_string(),
            ctx.container.port.to_string(),
            "-U".to_string(),
            Self::superuser(ctx),
            "-d".to_string(),
            database,
        ];

        let run_dump = |extra: Vec<String>, dest: std::path::PathBuf| {
            let pg_dump = pg_dump.clone();
            let base_args = base_args.clone();
            async move {
                let outcome = run_tool(
                    ToolInvocation::new(pg_dump)
                        .args(base_args)
                        .args(extra)
                        .args(["-f".to_string(), dest.display().to_string()]),
                )
                .await?;
                if outcome.code != 0 {
                    return Err(SpinError::precondition(format!(
                        "pg_dump failed ({}): {}",
                        outcome.code,
                        outcome.stderr.trim()
                    )));
                }
                Ok::<(), SpinError>(())
            }
        };

        match opts.format {
            BackupFormat::Sql => run_dump(vec![], output.to_path_buf()).await?,
            BackupFormat::Custom => run_dump(vec!["-Fc".to_string()], output.to_path_buf()).await?,
            BackupFormat::Tar => run_dump(vec!["-Ft".to_string()], output.to_path_buf()).await?,
            BackupFormat::SqlGz => {
                let plain = output.with_extension("partial.sql");
                let result = run_dump(vec![], plain.clone()).await;
                match result {
                    Ok(()) => {
                        gzip_compress_file(&plain, output).await?;
                        remove_recursive(&plain).await?;
                    }
                    Err(err) => {
                        remove_recursive(&plain).await?;
                        return Err(err);
                    }
                }
            }
            other => {
                return Err(SpinError::precondition(format!(
                    "PostgreSQL cannot produce {} backups",
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
        if !info.format.accepted_by(Engine::Postgresql) {
            return Err(SpinError::wrong_engine_dump(
                info.format.source_engine().unwrap_or("unknown"),
                Engine::Postgresql,
            ));
        }

        // Compressed dumps are decompressed in-process, then re-sniffed
        let mut effective_path = path.to_path_buf();
        let mut format = info.format;
        let mut scratch: Option<std::path::PathBuf> = None;
        if format == DetectedFormat::Gzip {
            let unpacked = path.with_extension("unpacked.sql");
            gzip_decompress_file(path, &unpacked).await?;
            let inner = detect_backup_format(&unpacked).await?;
            if !inner.format.accepted_by(Engine::Postgresql) {
                remove_recursive(&unpacked).await?;
                return Err(SpinError::wrong_engine_dump(
                    inner.format.source_engine().unwrap_or("unknown"),
                    Engine::Postgresql,
                ));
            }
            format = inner.format;
            effective_path = unpacked.clone();
            scratch = Some(unpacked);
        }

        let database = opts.database.unwrap_or_else(|| ctx.container.database.clone());
        let result = async {
            if opts.validate_version
                && matches!(format, DetectedFormat::PostgresqlSql | DetectedFormat::PlainSql)
            {
                self.check_dump_version(ctx, &effective_path).await?;
            }
            if opts.create_database {
                let existing = self.list_databases(ctx).await?;
                if !existing.iter().any(|d| d == &database) {
                    self.create_database(ctx, &database).await?;
                }
            }

            let outcome = match format {
                DetectedFormat::PostgresqlCustom => {
                    run_tool(
                        ToolInvocation::new(ctx.tool("pg_restore")?).args([
                            "-h",
                            ctx.host(),
                            "-p",
                            &ctx.container.port.to_string(),
                            "-U",
                            &Self::superuser(ctx),
                            "-d",
                            &database,
                            "--no-owner",
                            "--no-privileges",
                            &effective_path.display().to_string(),
                        ]),
                    )
                    .await?
                }
                _ => {
                    run_tool(
                        self.psql(ctx, &database)?
                            .stdin(StdinSource::File(effective_path.clone())),
                    )
                    .await?
                }
            };
            // Any non-zero exit is a failure; "warnings" exits are not a
            // thing this adapter accepts
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

    async fn dump_from_connection_string(
        &self,
        ctx: &EngineContext,
        url: &str,
        output: &Path,
    ) -> SpinResult<()> {
        let parsed = parse_remote_url(url, Engine::Postgresql, &["postgres", "postgresql"])?;
        let host = parsed.host_str().unwrap_or("localhost").to_string();
        let port = parsed.port().unwrap_or(5432);
        let username =
            if parsed.username().is_empty() { Self::superuser(ctx) } else { parsed.username().to_string() };
        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(SpinError::precondition("connection string is missing the database name"));
        }

        let mut invocation = ToolInvocation::new(ctx.tool("pg_dump")?).args([
            "-h",
            &host,
            "-p",
            &port.to_string(),
            "-U",
            &username,
            "-d",
            &database,
            "--no-owner",
            "--no-privileges",
            "-f",
            &output.display().to_string(),
        ]);
        if let Some(password) = parsed.password() {
            invocation = invocation.env("PGPASSWORD", password.to_string());
        }
        let outcome = run_tool(invocation).await?;
        if outcome.code != 0 {
            return Err(SpinError::precondition(format!(
                "remote pg_dump failed ({}): {}",
                outcome.code,
                outcome.stderr.trim()
            )));
        }
        Ok(())
    }

    fn connection_string(&self, ctx: &EngineContext, database: Option<&str>) -> String {
        let db = database.unwrap_or(&ctx.container.database);
        format!(
            "postgresql://{}@{}:{}/{}",
            Self::superuser(ctx),
            ctx.host(),
            ctx.container.port,
            db
        )
    }

    async fn database_size(&self, ctx: &EngineContext) -> SpinResult<Option<u64>> {
        let db = ctx.container.database.clone();
        let result = self
            .execute_query(
                ctx,
                &format!("SELECT pg_database_size('{db}')"),
                QueryOptions::default(),
            )
            .await?;
        Ok(result.rows.first().and_then(|row| row.first()).and_then(|v| v.parse().ok()))
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
        // The statement travels over stdin, never argv
        let sql = format!(
            "CREATE ROLE \"{user}\" LOGIN PASSWORD '{password}';\n\
             GRANT ALL PRIVILEGES ON DATABASE \"{db}\" TO \"{user}\";",
            user = request.username,
            password = password.replace('\'', "''"),
            db = request.database,
        );
        self.run_sql(ctx, "postgres", &sql).await?;
        Ok(UserCredentials {
            connection_string: format!(
                "postgresql://{}@{}:{}/{}",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::Container;
    use crate::infrastructure::platform::PlatformService;

    #[test]
    fn test_dump_major_parsing() {
        let head = "-- PostgreSQL database dump\n-- Dumped from database version 16.4 (Homebrew)\n";
        assert_eq!(PostgresAdapter::dump_major(head), Some(16));
        assert_eq!(PostgresAdapter::dump_major("-- no banner here\n"), None);
    }

    #[tokio::test]
    async fn test_create_user_rejects_identifier_break_out() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = EngineContext {
            container: Container::new("pgdev", Engine::Postgresql, "16.4.0", 5432, "app"),
            install_dir: tmp.path().join("install"),
            data_dir: tmp.path().join("data"),
            log_file: tmp.path().join("pgdev.log"),
            pid_file: tmp.path().join("pgdev.pid"),
            socket_file: tmp.path().join("pgdev.sock"),
            platform: PlatformService::new(),
            recorded_tools: std::collections::HashMap::new(),
        };
        let adapter = PostgresAdapter::new(ProcessManager::new(PlatformService::new()));

        // Rejected by the grammar before any statement is built
        let err = adapter
            .create_user(
                &ctx,
                CreateUserRequest {
                    username: "x\"; DROP DATABASE app; --".to_string(),
                    password: String::new(),
                    database: "app".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SpinError::InvalidUsername { .. }));
    }
}
