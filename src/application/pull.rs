//! Pull pipeline - remote-to-local data transfer
//!
//! Dumps a remote instance and restores it into a local container, either
//! replacing the primary database (with an optional safety copy first) or
//! cloning into a fresh database. Every mutating step registers a
//! compensator; the temp dump is removed on all paths.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::application::containers::ContainerManager;
use crate::application::transaction::Transaction;
use crate::domain::container::validate_database_name;
use crate::domain::engine::{Engine, EngineKind};
use crate::domain::errors::{SpinError, SpinResult};
use crate::engines::adapter::{
    BackupFormat, BackupOptions, EngineAdapter, EngineContext, RestoreOptions,
};
use crate::engines::common::backup_database_name;
use crate::infrastructure::fsutil::remove_recursive;
use crate::infrastructure::paths::SpinPaths;

/// How the pulled data lands in the container
#[derive(Debug, Clone)]
pub enum PullMode {
    /// Overwrite the primary database, optionally cloning it into a
    /// timestamped backup database first
    Replace { backup: bool },
    /// Restore into a newly created database with this name
    CloneInto { database: String },
}

/// One pull request
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub from_url: String,
    pub mode: PullMode,
    pub dry_run: bool,
}

/// What a pull would do (dry-run) or did (completed)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullPlan {
    pub mode: &'static str,
    pub target_database: String,
    pub backup_database: Option<String>,
    pub source_url: String,
}

/// Pull result
#[derive(Debug, Clone)]
pub enum PullOutcome {
    /// Dry-run: the plan that would have executed
    Planned(PullPlan),
    Completed(PullPlan),
}

/// Remote-to-local transfer orchestrator
pub struct PullPipeline {
    paths: SpinPaths,
    containers: Arc<ContainerManager>,
}

impl PullPipeline {
    pub fn new(paths: SpinPaths, containers: Arc<ContainerManager>) -> Self {
        Self { paths, containers }
    }

    /// Native backup format used for the pre-pull safety copy
    fn safety_format(engine: Engine) -> BackupFormat {
        match engine {
            Engine::Redis | Engine::Valkey => BackupFormat::Rdb,
            Engine::Qdrant => BackupFormat::Snapshot,
            Engine::Sqlite | Engine::Duckdb => BackupFormat::FileCopy,
            Engine::Mongodb => BackupFormat::Archive,
            _ => BackupFormat::Sql,
        }
    }

    pub async fn pull(
        &self,
        adapter: Arc<dyn EngineAdapter>,
        ctx: &EngineContext,
        request: PullRequest,
    ) -> SpinResult<PullOutcome> {
        let engine = ctx.engine();

        // Server containers must be up; file containers operate on the file
        if engine.kind() == EngineKind::Server
            && !adapter.process_manager().is_running(&ctx.pid_file).await
        {
            return Err(SpinError::precondition(format!(
                "Container '{}' must be running to pull into it",
                ctx.container.name
            )));
        }

        let plan = match &request.mode {
            PullMode::Replace { backup } => PullPlan {
                mode: "replace",
                target_database: ctx.container.database.clone(),
                backup_database: (*backup && engine.supports_databases())
                    .then(|| backup_database_name(&ctx.container.database)),
                source_url: request.from_url.clone(),
            },
            PullMode::CloneInto { database } => {
                if !engine.supports_databases() {
                    return Err(SpinError::unsupported(engine, "pull --as"));
                }
                validate_database_name(database)?;
                PullPlan {
                    mode: "clone-into",
                    target_database: database.clone(),
                    backup_database: None,
                    source_url: request.from_url.clone(),
                }
            }
        };
        if request.dry_run {
            return Ok(PullOutcome::Planned(plan));
        }

        tokio::fs::create_dir_all(self.paths.tmp_dir())
            .await
            .map_err(|e| SpinError::io("create tmp dir", e))?;
        let dump_path = self.paths.tmp_dir().join(format!("pull-{}.dump", Uuid::new_v4().simple()));
        let mut temp_files = vec![dump_path.clone()];

        let mut tx = Transaction::new();
        let outcome = self
            .execute(&adapter, ctx, &request, &plan, &dump_path, &mut temp_files, &mut tx)
            .await;

        let result = match outcome {
            Ok(()) => {
                tx.commit();
                info!(
                    "✅ Pull into '{}' completed ({} -> {})",
                    ctx.container.name, plan.source_url, plan.target_database
                );
                Ok(PullOutcome::Completed(plan))
            }
            Err(err) => {
                warn!("❌ Pull into '{}' failed, rolling back: {}", ctx.container.name, err);
                tx.rollback().await;
                Err(err)
            }
        };

        // The temp dump (and any safety copy) goes away on every path
        for path in temp_files {
            let _ = remove_recursive(&path).await;
        }
        result
    }

    async fn execute(
        &self,
        adapter: &Arc<dyn EngineAdapter>,
        ctx: &EngineContext,
        request: &PullRequest,
        plan: &PullPlan,
        dump_path: &PathBuf,
        temp_files: &mut Vec<PathBuf>,
        tx: &mut Transaction,
    ) -> SpinResult<()> {
        let engine = ctx.engine();

        match &request.mode {
            PullMode::Replace { backup } => {
                if engine.supports_databases() {
                    if let Some(backup_db) = &plan.backup_database {
                        self.clone_primary_into_backup(adapter, ctx, backup_db, temp_files, tx)
                            .await?;
                    }
                } else if *backup {
                    self.stash_safety_copy(adapter, ctx, temp_files, tx).await?;
                }

                adapter.dump_from_connection_string(ctx, &request.from_url, dump_path).await?;

                if engine.supports_databases() {
                    // The partial new primary is dropped and refilled from
                    // the backup database if anything below fails
                    if let Some(backup_db) = &plan.backup_database {
                        let adapter = Arc::clone(adapter);
                        let ctx = ctx.clone();
                        let target = plan.target_database.clone();
                        let backup_db = backup_db.clone();
                        let tmp = self.paths.tmp_dir();
                        tx.add_rollback(
                            format!("restore '{target}' from '{backup_db}'"),
                            move || async move {
                                let stash =
                                    tmp.join(format!("unwind-{}.sql", Uuid::new_v4().simple()));
                                adapter
                                    .backup(
                                        &ctx,
                                        &stash,
                                        BackupOptions {
                                            database: Some(backup_db),
                                            format: BackupFormat::Sql,
                                        },
                                    )
                                    .await?;
                                adapter.drop_database(&ctx, &target).await?;
                                adapter.create_database(&ctx, &target).await?;
                                let result = adapter
                                    .restore(
                                        &ctx,
                                        &stash,
                                        RestoreOptions {
                                            database: Some(target),
                                            create_database: false,
                                            validate_version: false,
                                        },
                                    )
                                    .await;
                                let _ = remove_recursive(&stash).await;
                                result.map(|_| ())
                            },
                        );
                    }

                    adapter.drop_database(ctx, &plan.target_database).await?;
                    adapter.create_database(ctx, &plan.target_database).await?;
                    adapter
                        .restore(
                            ctx,
                            dump_path,
                            RestoreOptions {
                                database: Some(plan.target_database.clone()),
                                create_database: false,
                                validate_version: true,
                            },
                        )
                        .await?;
                } else {
                    self.restore_whole_instance(adapter, ctx, dump_path).await?;
                }
            }
            PullMode::CloneInto { database } => {
                adapter.create_database(ctx, database).await?;
                {
                    let adapter = Arc::clone(adapter);
                    let ctx = ctx.clone();
                    let database = database.clone();
                    tx.add_rollback(format!("drop created database '{database}'"), move || {
                        async move { adapter.drop_database(&ctx, &database).await }
                    });
                }

                adapter.dump_from_connection_string(ctx, &request.from_url, dump_path).await?;
                adapter
                    .restore(
                        ctx,
                        dump_path,
                        RestoreOptions {
                            database: Some(database.clone()),
                            create_database: false,
                            validate_version: true,
                        },
                    )
                    .await?;

                self.containers.add_database(&ctx.container.name, database).await?;
                {
                    let containers = Arc::clone(&self.containers);
                    let name = ctx.container.name.clone();
                    let database = database.clone();
                    tx.add_rollback(format!("untrack database '{database}'"), move || {
                        async move { containers.remove_database(&name, &database).await }
                    });
                }
            }
        }
        Ok(())
    }

    /// Safety copy for database-capable engines: a timestamped database on
    /// the same instance, populated from the primary
    async fn clone_primary_into_backup(
        &self,
        adapter: &Arc<dyn EngineAdapter>,
        ctx: &EngineContext,
        backup_db: &str,
        temp_files: &mut Vec<PathBuf>,
        tx: &mut Transaction,
    ) -> SpinResult<()> {
        let stash = self.paths.tmp_dir().join(format!("pull-safety-{}.sql", Uuid::new_v4().simple()));
        temp_files.push(stash.clone());
        adapter
            .backup(
                ctx,
                &stash,
                BackupOptions {
                    database: Some(ctx.container.database.clone()),
                    format: BackupFormat::Sql,
                },
            )
            .await?;

        adapter.create_database(ctx, backup_db).await?;
        {
            let adapter = Arc::clone(adapter);
            let ctx = ctx.clone();
            let backup_db = backup_db.to_string();
            tx.add_rollback(format!("drop backup database '{backup_db}'"), move || {
                async move { adapter.drop_database(&ctx, &backup_db).await }
            });
        }

        adapter
            .restore(
                ctx,
                &stash,
                RestoreOptions {
                    database: Some(backup_db.to_string()),
                    create_database: false,
                    validate_version: false,
                },
            )
            .await?;

        self.containers.add_database(&ctx.container.name, backup_db).await?;
        {
            let containers = Arc::clone(&self.containers);
            let name = ctx.container.name.clone();
            let backup_db = backup_db.to_string();
            tx.add_rollback(format!("untrack backup database '{backup_db}'"), move || {
                async move { containers.remove_database(&name, &backup_db).await }
            });
        }
        info!("🛟 Backup database '{}' created on '{}'", backup_db, ctx.container.name);
        Ok(())
    }

    /// Safety copy for engines without logical databases: a native-format
    /// file stashed under tmp, restored wholesale on rollback
    async fn stash_safety_copy(
        &self,
        adapter: &Arc<dyn EngineAdapter>,
        ctx: &EngineContext,
        temp_files: &mut Vec<PathBuf>,
        tx: &mut Transaction,
    ) -> SpinResult<()> {
        let stash = self
            .paths
            .tmp_dir()
            .join(format!("pull-safety-{}.native", Uuid::new_v4().simple()));
        temp_files.push(stash.clone());
        adapter
            .backup(
                ctx,
                &stash,
                BackupOptions { database: None, format: Self::safety_format(ctx.engine()) },
            )
            .await?;

        let adapter = Arc::clone(adapter);
        let ctx_clone = ctx.clone();
        let stash_clone = stash.clone();
        tx.add_rollback("restore instance from safety copy", move || async move {
            restore_whole_instance_inner(&adapter, &ctx_clone, &stash_clone).await
        });
        Ok(())
    }

    async fn restore_whole_instance(
        &self,
        adapter: &Arc<dyn EngineAdapter>,
        ctx: &EngineContext,
        dump_path: &PathBuf,
    ) -> SpinResult<()> {
        restore_whole_instance_inner(adapter, ctx, dump_path).await
    }
}

/// Restore a whole-instance dump (RDB, snapshot, file copy). Formats that
/// need a stopped instance get a stop/restore/start cycle around them.
async fn restore_whole_instance_inner(
    adapter: &Arc<dyn EngineAdapter>,
    ctx: &EngineContext,
    dump_path: &std::path::Path,
) -> SpinResult<()> {
    let needs_stopped_restore = matches!(
        ctx.engine(),
        Engine::Redis | Engine::Valkey | Engine::Qdrant
    );
    if needs_stopped_restore && adapter.process_manager().is_running(&ctx.pid_file).await {
        adapter.stop(ctx).await?;
        let restored = adapter.restore(ctx, dump_path, RestoreOptions::default()).await;
        let started = adapter.start(ctx).await;
        restored?;
        started?;
        return Ok(());
    }
    adapter.restore(ctx, dump_path, RestoreOptions::default()).await.map(|_| ())
}
