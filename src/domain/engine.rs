//! Supported database engines and their static metadata
//!
//! Every engine the manager knows about is described here: whether it is a
//! real server or a single-file database, which executable marks a finished
//! installation, how its `--version` output is parsed, and which port range
//! it scans when the preferred port is taken.

use serde::{Deserialize, Serialize};

use crate::domain::errors::{SpinError, SpinResult};

/// Database engine tag as stored in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgresql,
    Mysql,
    Mariadb,
    Sqlite,
    Duckdb,
    Mongodb,
    Redis,
    Valkey,
    Clickhouse,
    Qdrant,
}

/// Whether an engine runs as a supervised server process or is a plain file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Daemon process listening on a TCP port
    Server,
    /// Single-file database, no process to supervise
    File,
}

/// Inclusive TCP port range scanned when allocating a port for an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl Engine {
    /// All engines, in catalog display order
    pub const ALL: [Engine; 10] = [
        Engine::Postgresql,
        Engine::Mysql,
        Engine::Mariadb,
        Engine::Sqlite,
        Engine::Duckdb,
        Engine::Mongodb,
        Engine::Redis,
        Engine::Valkey,
        Engine::Clickhouse,
        Engine::Qdrant,
    ];

    /// Parse a catalog tag into an engine
    pub fn from_tag(tag: &str) -> SpinResult<Self> {
        match tag {
            "postgresql" => Ok(Self::Postgresql),
            "mysql" => Ok(Self::Mysql),
            "mariadb" => Ok(Self::Mariadb),
            "sqlite" => Ok(Self::Sqlite),
            "duckdb" => Ok(Self::Duckdb),
            "mongodb" => Ok(Self::Mongodb),
            "redis" => Ok(Self::Redis),
            "valkey" => Ok(Self::Valkey),
            "clickhouse" => Ok(Self::Clickhouse),
            "qdrant" => Ok(Self::Qdrant),
            other => Err(SpinError::unknown_engine(other)),
        }
    }

    /// Catalog tag (lowercase, matches the serde representation)
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
            Self::Sqlite => "sqlite",
            Self::Duckdb => "duckdb",
            Self::Mongodb => "mongodb",
            Self::Redis => "redis",
            Self::Valkey => "valkey",
            Self::Clickhouse => "clickhouse",
            Self::Qdrant => "qdrant",
        }
    }

    /// Human-facing engine name
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgresql => "PostgreSQL",
            Self::Mysql => "MySQL",
            Self::Mariadb => "MariaDB",
            Self::Sqlite => "SQLite",
            Self::Duckdb => "DuckDB",
            Self::Mongodb => "MongoDB",
            Self::Redis => "Redis",
            Self::Valkey => "Valkey",
            Self::Clickhouse => "ClickHouse",
            Self::Qdrant => "Qdrant",
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Sqlite | Self::Duckdb => EngineKind::File,
            _ => EngineKind::Server,
        }
    }

    pub fn is_file_based(&self) -> bool {
        self.kind() == EngineKind::File
    }

    /// Default port offered when creating a container (0 for file engines)
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgresql => 5432,
            Self::Mysql | Self::Mariadb => 3306,
            Self::Sqlite | Self::Duckdb => 0,
            Self::Mongodb => 27017,
            Self::Redis | Self::Valkey => 6379,
            Self::Clickhouse => 8123,
            Self::Qdrant => 6333,
        }
    }

    /// Port range scanned when the preferred port is busy
    pub fn port_range(&self) -> PortRange {
        match self {
            Self::Postgresql => PortRange { lo: 5432, hi: 5532 },
            Self::Mysql | Self::Mariadb => PortRange { lo: 3306, hi: 3406 },
            Self::Sqlite | Self::Duckdb => PortRange { lo: 0, hi: 0 },
            Self::Mongodb => PortRange { lo: 27017, hi: 27117 },
            Self::Redis | Self::Valkey => PortRange { lo: 6379, hi: 6479 },
            Self::Clickhouse => PortRange { lo: 8123, hi: 8223 },
            Self::Qdrant => PortRange { lo: 6333, hi: 6433 },
        }
    }

    /// Engine-specific admin account used for local management
    pub fn superuser(&self) -> Option<&'static str> {
        match self {
            Self::Postgresql => Some("postgres"),
            Self::Mysql | Self::Mariadb => Some("root"),
            Self::Clickhouse => Some("default"),
            _ => None,
        }
    }

    /// Executable whose presence under `{install}/bin/` marks a finished
    /// installation. Extension-less; the platform layer appends `.exe` on
    /// Windows.
    pub fn marker_executable(&self) -> &'static str {
        match self {
            Self::Postgresql => "postgres",
            Self::Mysql => "mysqld",
            Self::Mariadb => "mariadbd",
            Self::Sqlite => "sqlite3",
            Self::Duckdb => "duckdb",
            Self::Mongodb => "mongod",
            Self::Redis => "redis-server",
            Self::Valkey => "valkey-server",
            Self::Clickhouse => "clickhouse",
            Self::Qdrant => "qdrant",
        }
    }

    /// Flag passed to the marker executable to report its version
    pub fn version_flag(&self) -> &'static str {
        match self {
            Self::Postgresql => "--version",
            Self::Mysql | Self::Mariadb => "--version",
            Self::Sqlite => "--version",
            Self::Duckdb => "--version",
            Self::Mongodb => "--version",
            Self::Redis | Self::Valkey => "--version",
            Self::Clickhouse => "--version",
            Self::Qdrant => "--version",
        }
    }

    /// Regex extracting the version number from the marker's `--version`
    /// output. Group 1 is the dotted version.
    pub fn version_pattern(&self) -> &'static str {
        match self {
            // "postgres (PostgreSQL) 16.4"
            Self::Postgresql => r"PostgreSQL\)?\s+(\d+(?:\.\d+)*)",
            // "mysqld  Ver 8.0.39 for Linux"
            Self::Mysql => r"Ver\s+(\d+(?:\.\d+)*)",
            // "mariadbd  Ver 11.4.3-MariaDB"
            Self::Mariadb => r"Ver\s+(\d+(?:\.\d+)*)",
            // "3.46.1 2024-08-13 ..."
            Self::Sqlite => r"^(\d+(?:\.\d+)*)",
            // "v1.1.0 fa5c2fe15f"
            Self::Duckdb => r"v(\d+(?:\.\d+)*)",
            // "db version v8.0.1"
            Self::Mongodb => r"db version v(\d+(?:\.\d+)*)",
            // "Redis server v=7.4.0 sha=..."
            Self::Redis => r"v=(\d+(?:\.\d+)*)",
            // "Valkey server v=8.0.0 sha=..."
            Self::Valkey => r"v=(\d+(?:\.\d+)*)",
            // "ClickHouse local version 24.8.4.13 (official build)."
            Self::Clickhouse => r"version\s+(\d+(?:\.\d+)*)",
            // "qdrant 1.12.0"
            Self::Qdrant => r"qdrant\s+(\d+(?:\.\d+)*)",
        }
    }

    /// Client/admin tools shipped inside the engine archive, recorded in
    /// the global config when an installation completes
    pub fn bundled_tools(&self) -> &'static [&'static str] {
        match self {
            Self::Postgresql => &["postgres", "initdb", "pg_ctl", "pg_isready", "psql", "pg_dump", "pg_restore", "createdb", "dropdb"],
            Self::Mysql => &["mysqld", "mysql", "mysqladmin", "mysqldump"],
            Self::Mariadb => &["mariadbd", "mariadb", "mariadb-admin", "mariadb-dump"],
            Self::Sqlite => &["sqlite3"],
            Self::Duckdb => &["duckdb"],
            Self::Mongodb => &["mongod", "mongosh", "mongodump", "mongorestore"],
            Self::Redis => &["redis-server", "redis-cli"],
            Self::Valkey => &["valkey-server", "valkey-cli"],
            Self::Clickhouse => &["clickhouse"],
            Self::Qdrant => &["qdrant"],
        }
    }

    /// Whether the engine has logical databases that can be created,
    /// dropped, and listed independently of the instance
    pub fn supports_databases(&self) -> bool {
        match self {
            Self::Postgresql | Self::Mysql | Self::Mariadb | Self::Mongodb | Self::Clickhouse => {
                true
            }
            Self::Sqlite | Self::Duckdb | Self::Redis | Self::Valkey | Self::Qdrant => false,
        }
    }

    /// Human-friendly reason reported when a per-database operation is
    /// requested on an engine that has none
    pub fn no_database_reason(&self) -> &'static str {
        match self {
            Self::Sqlite | Self::Duckdb => {
                "file-based engines store exactly one database per file"
            }
            Self::Redis | Self::Valkey => {
                "keyspaces are numbered and fixed; logical databases cannot be created or dropped"
            }
            Self::Qdrant => "collections are managed through the HTTP API, not as logical databases",
            _ => "engine does not support logical databases",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}
