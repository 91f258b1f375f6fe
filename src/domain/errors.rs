//! Typed error taxonomy for the container lifecycle core
//!
//! Every failure the core can surface carries a stable kind, a human
//! message, and (where one helps) a remediation hint. The UI layer decides
//! presentation; the core never prints.

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::engine::Engine;

pub type SpinResult<T> = Result<T, SpinError>;

#[derive(Error, Debug)]
pub enum SpinError {
    #[error("Required tool '{tool}' for {engine} was not found")]
    MissingTool {
        tool: String,
        engine: String,
    },

    #[error("Backup was produced by {detected}, not {expected}")]
    WrongEngineDump {
        detected: String,
        expected: String,
        hint: String,
    },

    #[error("Dump version {dump_version} is incompatible with tool version {tool_version}")]
    VersionIncompatible {
        dump_version: String,
        tool_version: String,
        variant: String,
    },

    #[error("Port {port} is not available")]
    PortUnavailable { port: u16 },

    #[error("No free port in range {lo}-{hi}")]
    NoPortsAvailable { lo: u16, hi: u16 },

    #[error("{engine} did not finish initializing within {timeout_secs}s (log: {log_path})")]
    ProcessInitTimeout {
        engine: String,
        timeout_secs: u64,
        log_path: String,
    },

    #[error("{engine} did not become ready within {timeout_secs}s (log: {log_path})")]
    ProcessReadyTimeout {
        engine: String,
        timeout_secs: u64,
        log_path: String,
    },

    #[error("Process {pid} refused to exit after escalated termination")]
    ProcessStopTimeout { pid: u32 },

    #[error("Download failed for {url}: {cause}")]
    DownloadFailed { url: String, cause: String },

    #[error("Failed to extract archive {archive}: {cause}")]
    ExtractFailed { archive: String, cause: String },

    #[error("Binary verification failed: expected version {expected}, reported {actual}")]
    VerifyFailed { expected: String, actual: String },

    #[error("A container named '{name}' already exists")]
    NameConflict { name: String },

    #[error("Container '{name}' was not found")]
    NotFound { name: String },

    #[error("Invalid container name '{name}' (must match [A-Za-z][A-Za-z0-9_-]{{0,62}})")]
    InvalidName { name: String },

    #[error("Invalid database name '{name}' (must match [A-Za-z_][A-Za-z0-9_]{{0,62}})")]
    InvalidDatabaseName { name: String },

    #[error("Invalid username '{name}' (must match [A-Za-z_][A-Za-z0-9_]{{0,62}})")]
    InvalidUsername { name: String },

    #[error("Invalid version '{raw}' (expected X, X.Y, or X.Y.Z)")]
    InvalidVersion { raw: String },

    #[error("Unknown engine '{tag}'")]
    UnknownEngine { tag: String },

    #[error("{engine} does not support {operation}: {reason}")]
    UnsupportedOperation {
        engine: String,
        operation: String,
        reason: String,
    },

    #[error("Failed to persist {path}: {cause}")]
    StorePersistFailed { path: PathBuf, cause: String },

    #[error("Store {path} is present but malformed: {cause}")]
    StoreCorrupt { path: PathBuf, cause: String },

    #[error("Operation cancelled by caller")]
    CancelledByCaller,

    #[error("{message}")]
    Precondition { message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SpinError {
    pub fn missing_tool(tool: &str, engine: Engine) -> Self {
        Self::MissingTool {
            tool: tool.to_string(),
            engine: engine.display_name().to_string(),
        }
    }

    pub fn wrong_engine_dump(detected: &str, expected: Engine) -> Self {
        Self::WrongEngineDump {
            detected: detected.to_string(),
            expected: expected.tag().to_string(),
            hint: format!(
                "Restore this dump into a {detected} container, or produce a new dump with the {} tools",
                expected.display_name()
            ),
        }
    }

    pub fn unsupported(engine: Engine, operation: &str) -> Self {
        Self::UnsupportedOperation {
            engine: engine.display_name().to_string(),
            operation: operation.to_string(),
            reason: engine.no_database_reason().to_string(),
        }
    }

    pub fn unknown_engine(tag: &str) -> Self {
        Self::UnknownEngine { tag: tag.to_string() }
    }

    pub fn invalid_version(raw: &str) -> Self {
        Self::InvalidVersion { raw: raw.trim().to_string() }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition { message: message.into() }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    pub fn download_failed(url: &str, cause: impl std::fmt::Display) -> Self {
        Self::DownloadFailed { url: url.to_string(), cause: cause.to_string() }
    }

    /// Whether the UI layer can offer a recovery action (e.g. installing a
    /// missing tool) instead of aborting
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MissingTool { .. } | Self::PortUnavailable { .. })
    }

    /// Process exit code for entry points that wrap the core: 0 success,
    /// 1 generic failure, 2 missing-tool recoverable
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingTool { .. } => 2,
            _ => 1,
        }
    }

    /// Remediation hint shown alongside the message, when one exists
    pub fn remediation(&self) -> Option<&str> {
        match self {
            Self::WrongEngineDump { hint, .. } => Some(hint),
            Self::MissingTool { .. } => Some("Install the missing tool or point config.binaries at it"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(SpinError::missing_tool("pg_dump", Engine::Postgresql).exit_code(), 2);
        assert_eq!(SpinError::NameConflict { name: "x".into() }.exit_code(), 1);
    }

    #[test]
    fn test_wrong_engine_dump_carries_hint() {
        let err = SpinError::wrong_engine_dump("postgresql", Engine::Mysql);
        assert!(err.remediation().unwrap().contains("postgresql"));
        assert!(err.to_string().contains("not mysql"));
    }

    #[test]
    fn test_missing_tool_is_recoverable() {
        assert!(SpinError::missing_tool("mysqldump", Engine::Mysql).is_recoverable());
        assert!(!SpinError::CancelledByCaller.is_recoverable());
    }
}
