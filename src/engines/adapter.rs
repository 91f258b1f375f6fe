//! Engine adapter contract
//!
//! Every engine implements the same capability surface; engine-specific
//! rules (file-based storage, missing logical databases, restore state
//! preconditions) live inside the adapter. Adapters receive an immutable
//! `EngineContext` snapshot and never hold a reference back to the
//! managers that call them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::container::Container;
use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};
use crate::engines::format::DetectedFormat;
use crate::infrastructure::platform::PlatformService;
use crate::infrastructure::process::ProcessManager;

/// Hard cap for data directory initialization
pub const INIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Immutable per-operation snapshot handed to adapters
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub container: Container,
    /// Engine installation directory (`bin/{engine}-{version}-{os}-{arch}`)
    pub install_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    pub socket_file: PathBuf,
    pub platform: PlatformService,
    /// Tool paths recorded in the global config, snapshotted at call time
    pub recorded_tools: HashMap<String, PathBuf>,
}

impl EngineContext {
    pub fn engine(&self) -> Engine {
        self.container.engine
    }

    pub fn host(&self) -> &'static str {
        "127.0.0.1"
    }

    /// Path of a tool inside this installation's `bin/`
    pub fn bundled(&self, tool: &str) -> PathBuf {
        self.install_dir.join("bin").join(format!("{tool}{}", self.platform.exec_ext()))
    }

    /// Resolve an external tool: the installation's own `bin/` first, then
    /// paths recorded in the global config, then PATH. Missing tools are a
    /// typed, UI-recoverable error.
    pub fn tool(&self, name: &str) -> SpinResult<PathBuf> {
        let bundled = self.bundled(name);
        if bundled.is_file() {
            return Ok(bundled);
        }
        if let Some(recorded) = self.recorded_tools.get(name) {
            if recorded.is_file() {
                return Ok(recorded.clone());
            }
        }
        self.platform
            .find_tool(name)
            .ok_or_else(|| SpinError::missing_tool(name, self.engine()))
    }
}

/// Options for data directory initialization
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Admin account override (engine default otherwise)
    pub superuser: Option<String>,
    /// File-based engines: explicit file path override
    pub path: Option<PathBuf>,
}

/// Successful start report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub port: u16,
    pub connection_string: String,
}

/// Exactly one of an SQL file or inline SQL
#[derive(Debug, Clone)]
pub enum ScriptSource {
    File(PathBuf),
    Sql(String),
}

/// Options for `run_script`
#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    pub database: Option<String>,
}

/// Captured output of a client invocation
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

/// Options for `execute_query`
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub database: Option<String>,
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
}

/// Structured query output parsed from the client's tabular format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Requested backup output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFormat {
    /// Plain SQL text
    Sql,
    /// Gzip-compressed SQL (in-process streaming compression)
    SqlGz,
    /// PostgreSQL custom format (`pg_dump -Fc`)
    Custom,
    /// PostgreSQL tar format (`pg_dump -Ft`)
    Tar,
    /// Redis/Valkey RDB snapshot
    Rdb,
    /// MongoDB archive (`mongodump --archive`)
    Archive,
    /// Qdrant snapshot
    Snapshot,
    /// Byte copy of the database file (file-based engines)
    FileCopy,
}

impl BackupFormat {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Sql => "plain SQL",
            Self::SqlGz => "gzip-compressed SQL",
            Self::Custom => "PostgreSQL custom dump",
            Self::Tar => "PostgreSQL tar dump",
            Self::Rdb => "RDB snapshot",
            Self::Archive => "MongoDB archive",
            Self::Snapshot => "Qdrant snapshot",
            Self::FileCopy => "database file copy",
        }
    }
}

/// Options for `backup`
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub database: Option<String>,
    pub format: BackupFormat,
}

/// Completed backup report
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub path: PathBuf,
    pub format: BackupFormat,
    pub size: u64,
}

/// Options for `restore`
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub database: Option<String>,
    /// Create the target database before restoring
    pub create_database: bool,
    /// Refuse dumps from an incompatible tool major (default true)
    pub validate_version: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self { database: None, create_database: false, validate_version: true }
    }
}

/// Completed restore report
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub format: DetectedFormat,
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

/// Request for `create_user`
#[derive(Debug, Clone)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub database: String,
}

/// Credentials of a user created on the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
    pub database: String,
    pub connection_string: String,
}

/// Common capability surface every engine implements
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn engine(&self) -> Engine;

    /// Supervisor used for start/stop (adapters own their process plumbing)
    fn process_manager(&self) -> &ProcessManager;

    /// Create and initialize the data directory (server engines) or the
    /// database file (file engines). When this call created the directory
    /// and initialization fails, the directory is removed again.
    async fn init_data_dir(&self, ctx: &EngineContext, opts: InitOptions) -> SpinResult<()>;

    /// Start the engine and wait for readiness
    async fn start(&self, ctx: &EngineContext) -> SpinResult<StartOutcome>;

    /// Stop the engine through the graceful-then-escalate ladder
    async fn stop(&self, ctx: &EngineContext) -> SpinResult<()>;

    async fn create_database(&self, ctx: &EngineContext, db: &str) -> SpinResult<()>;

    async fn drop_database(&self, ctx: &EngineContext, db: &str) -> SpinResult<()>;

    async fn list_databases(&self, ctx: &EngineContext) -> SpinResult<Vec<String>>;

    /// Run a script file or inline SQL through the engine's client
    async fn run_script(
        &self,
        ctx: &EngineContext,
        source: ScriptSource,
        opts: ScriptOptions,
    ) -> SpinResult<ScriptOutcome>;

    /// Execute a query and parse the structured output
    async fn execute_query(
        &self,
        ctx: &EngineContext,
        query: &str,
        opts: QueryOptions,
    ) -> SpinResult<QueryResult>;

    async fn backup(
        &self,
        ctx: &EngineContext,
        output: &Path,
        opts: BackupOptions,
    ) -> SpinResult<BackupOutcome>;

    async fn restore(
        &self,
        ctx: &EngineContext,
        path: &Path,
        opts: RestoreOptions,
    ) -> SpinResult<RestoreOutcome>;

    /// Dump a remote instance reachable through `url` into `output`.
    /// The URL scheme must match this adapter's engine; credentials are
    /// passed to the dump tool via environment, never argv.
    async fn dump_from_connection_string(
        &self,
        ctx: &EngineContext,
        url: &str,
        output: &Path,
    ) -> SpinResult<()>;

    fn connection_string(&self, ctx: &EngineContext, database: Option<&str>) -> String;

    /// Size of the primary database in bytes, when the engine can report it
    async fn database_size(&self, ctx: &EngineContext) -> SpinResult<Option<u64>>;

    async fn create_user(
        &self,
        ctx: &EngineContext,
        request: CreateUserRequest,
    ) -> SpinResult<UserCredentials>;
}
