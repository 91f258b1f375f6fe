//! SpinDB - local ephemeral database instance manager
//!
//! The engine-and-container lifecycle core: binary resolver/downloader,
//! container catalog, process supervisor, and the backup/restore/clone
//! pipeline with transactional rollback. "Containers" here are native OS
//! processes (or single database files) backed by on-disk data
//! directories - no OS containers involved.
//!
//! Modern Rust module organization (Rust 2024+ style):
//! - Each module is defined in its own .rs file or directory
//! - No mod.rs files - clean, modern structure
//! - Direct module declarations following Rust 2024 conventions

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(missing_docs)]

pub mod domain {
    //! Core entities, value objects, and the error taxonomy
    pub mod container;
    pub mod engine;
    pub mod errors;
    pub mod version;

    // Re-export commonly used items
    pub use container::{
        Container, ContainerStatus, validate_container_name, validate_database_name,
        validate_username,
    };
    pub use engine::{Engine, EngineKind, PortRange};
    pub use errors::{SpinError, SpinResult};
    pub use version::{Version, normalize_full, resolve_version, sort_versions_desc};
}

pub mod infrastructure {
    //! Platform plumbing: paths, stores, downloads, processes, ports
    pub mod archive;
    pub mod binaries;
    pub mod fsutil;
    pub mod http;
    pub mod logging;
    pub mod paths;
    pub mod platform;
    pub mod ports;
    pub mod process;
    pub mod stores {
        //! Atomically written JSON stores
        pub mod atomic;
        pub mod catalog;
        pub mod config_store;
        pub mod file_registry;
    }

    pub use binaries::BinaryManager;
    pub use http::{DownloadClient, DownloadConfig};
    pub use logging::{LoggingConfig, init_logging};
    pub use paths::SpinPaths;
    pub use platform::{PlatformInfo, PlatformService, TerminateOutcome};
    pub use process::{ProcessManager, ReadyProbe};
}

pub mod application {
    //! Managers and multi-step operations composed over the infrastructure
    pub mod containers;
    pub mod core;
    pub mod pull;
    pub mod transaction;
    pub mod updates;

    pub use containers::{ContainerManager, CreateOptions, DeleteOptions};
    pub use core::SpinDb;
    pub use pull::{PullMode, PullOutcome, PullPipeline, PullPlan, PullRequest};
    pub use transaction::Transaction;
    pub use updates::UpdateChecker;
}

pub mod engines {
    //! Engine adapters: one capability surface, per-engine semantics
    pub mod adapter;
    pub mod clickhouse;
    pub mod common;
    pub mod file_based;
    pub mod format;
    pub mod mongodb;
    pub mod mysql;
    pub mod postgres;
    pub mod qdrant;
    pub mod redis;
    pub mod registry;

    pub use adapter::{
        BackupFormat, BackupOptions, BackupOutcome, CreateUserRequest, EngineAdapter,
        EngineContext, QueryOptions, QueryResult, RestoreOptions, RestoreOutcome, ScriptOptions,
        ScriptOutcome, ScriptSource, StartOutcome, UserCredentials,
    };
    pub use format::{BackupFormatInfo, DetectedFormat, detect_backup_format};
    pub use registry::adapter_for;
}

// Crate-level convenience re-exports
pub use application::SpinDb;
pub use domain::{Container, ContainerStatus, Engine, SpinError, SpinResult};
