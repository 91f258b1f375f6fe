//! Container entity and catalog-level validation
//!
//! A container is a managed local database instance: a native engine
//! process backed by an on-disk data directory, or (for file-based
//! engines) a single database file. This module owns the record shape
//! persisted under `containers/{name}.json` and the name grammars the
//! catalog enforces.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};

static CONTAINER_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,62}$").expect("static name regex"));
static DATABASE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("static db name regex"));
static USER_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("static user regex"));

/// Lifecycle status of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Registered but never started
    Created,
    /// Engine process is supervised and believed alive (file engines:
    /// the database file exists)
    Running,
    /// Engine process confirmed exited (file engines: file missing)
    Stopped,
    /// File-based container attached to a file outside the data root
    Linked,
}

/// Catalog record for one managed instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub engine: Engine,
    /// Normalized `X.Y.Z` engine version
    pub version: String,
    /// TCP port for server engines, 0 for file-based engines
    pub port: u16,
    /// Primary logical database; for file-based engines this is the
    /// absolute path of the database file
    pub database: String,
    /// Every database tracked on this container, primary first
    #[serde(default)]
    pub databases: Vec<String>,
    pub status: ContainerStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Container {
    /// Build a freshly created (never started) container record.
    /// `database` must already be validated by the caller.
    pub fn new(name: &str, engine: Engine, version: &str, port: u16, database: &str) -> Self {
        Self {
            name: name.to_string(),
            engine,
            version: version.to_string(),
            port,
            database: database.to_string(),
            databases: vec![database.to_string()],
            status: ContainerStatus::Created,
            created_at: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Track an additional database, keeping the primary first.
    /// Idempotent: re-adding an existing name is a no-op.
    pub fn add_database(&mut self, db: &str) {
        if !self.databases.iter().any(|d| d == db) {
            self.databases.push(db.to_string());
        }
    }

    /// Stop tracking a database. Idempotent; the primary slot in
    /// `database` is cleared if it was the one removed.
    pub fn remove_database(&mut self, db: &str) {
        self.databases.retain(|d| d != db);
        if self.database == db {
            self.database = self.databases.first().cloned().unwrap_or_default();
        }
    }

    /// Catalog invariants per engine kind. Violations indicate a
    /// corrupted or hand-edited record.
    pub fn check_invariants(&self) -> SpinResult<()> {
        validate_container_name(&self.name)?;
        if self.engine.is_file_based() {
            if self.port != 0 {
                return Err(SpinError::precondition(format!(
                    "file-based container '{}' must have port 0, found {}",
                    self.name, self.port
                )));
            }
            if !std::path::Path::new(&self.database).is_absolute() {
                return Err(SpinError::precondition(format!(
                    "file-based container '{}' must record an absolute file path",
                    self.name
                )));
            }
        } else if !self.database.is_empty() {
            validate_database_name(&self.database)?;
        }
        if let Some(first) = self.databases.first() {
            if !self.database.is_empty() && first != &self.database {
                return Err(SpinError::precondition(format!(
                    "container '{}' primary database is not first in its database list",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Validate a container name against `[A-Za-z][A-Za-z0-9_-]{0,62}`
pub fn validate_container_name(name: &str) -> SpinResult<()> {
    if CONTAINER_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(SpinError::InvalidName { name: name.to_string() })
    }
}

/// Validate a logical database name against `[A-Za-z_][A-Za-z0-9_]{0,62}`
pub fn validate_database_name(name: &str) -> SpinResult<()> {
    if DATABASE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(SpinError::InvalidDatabaseName { name: name.to_string() })
    }
}

/// Validate an engine account name against `[A-Za-z_][A-Za-z0-9_]{0,62}`.
/// Usernames reach engine scripts as identifiers, so they are held to the
/// same grammar as database names before any statement is built.
pub fn validate_username(name: &str) -> SpinResult<()> {
    if USER_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(SpinError::InvalidUsername { name: name.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_container_name_grammar() {
        assert!(validate_container_name("pgdev").is_ok());
        assert!(validate_container_name("app-copy_2").is_ok());
        assert!(validate_container_name("A").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("1abc").is_err());
        assert!(validate_container_name("-abc").is_err());
        assert!(validate_container_name("has space").is_err());
        assert!(validate_container_name(&"a".repeat(64)).is_err());
        assert!(validate_container_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_database_name_grammar() {
        assert!(validate_database_name("app").is_ok());
        assert!(validate_database_name("_private").is_ok());
        assert!(validate_database_name("app-db").is_err());
        assert!(validate_database_name("9app").is_err());
    }

    #[test]
    fn test_username_grammar_rejects_injection_shapes() {
        assert!(validate_username("app_user").is_ok());
        assert!(validate_username("_svc").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("user name").is_err());
        assert!(validate_username("x\"; DROP DATABASE app; --").is_err());
        assert!(validate_username("x', pwd:'y'}); db.dropDatabase(); //").is_err());
    }

    #[test]
    fn test_add_remove_database_idempotent() {
        let mut c = Container::new("app", Engine::Postgresql, "16.4.0", 5432, "app");
        c.add_database("extra");
        c.add_database("extra");
        assert_eq!(c.databases, vec!["app", "extra"]);

        c.remove_database("extra");
        c.remove_database("extra");
        assert_eq!(c.databases, vec!["app"]);
        assert_eq!(c.database, "app");
    }

    #[test]
    fn test_primary_reassigned_when_removed() {
        let mut c = Container::new("app", Engine::Postgresql, "16.4.0", 5432, "app");
        c.add_database("second");
        c.remove_database("app");
        assert_eq!(c.database, "second");
        assert_eq!(c.databases, vec!["second"]);
    }

    #[test]
    fn test_file_based_invariants() {
        let mut c = Container::new("notes", Engine::Sqlite, "3.46.1", 0, "/abs/notes.sqlite");
        assert!(c.check_invariants().is_ok());

        c.port = 5000;
        assert!(c.check_invariants().is_err());

        c.port = 0;
        c.database = "relative/notes.sqlite".to_string();
        c.databases = vec![c.database.clone()];
        assert!(c.check_invariants().is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_names_round_trip(name in "[A-Za-z][A-Za-z0-9_-]{0,62}") {
            prop_assert!(validate_container_name(&name).is_ok());
        }
    }
}
