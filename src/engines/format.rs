//! Backup format detection
//!
//! Sniffs the first 128 bytes of a backup file for magic numbers and
//! textual markers. Detection is engine-independent; adapters use the
//! result to refuse foreign dumps before any data is touched.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};

/// Number of leading bytes inspected
pub const SNIFF_LEN: usize = 128;

/// What the first bytes of a backup file identify it as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedFormat {
    /// gzip stream (0x1f 0x8b); contents identified after decompression
    Gzip,
    /// PostgreSQL custom dump (`PGDMP` prefix)
    PostgresqlCustom,
    /// pg_dump plain SQL (`-- PostgreSQL database dump`)
    PostgresqlSql,
    /// mysqldump plain SQL (`-- MySQL dump`)
    MysqlSql,
    /// mariadb-dump plain SQL (`-- MariaDB dump`)
    MariadbSql,
    /// SQLite database file (`SQLite format 3\0`)
    SqliteFile,
    /// DuckDB database file (`DUCK` block signature)
    DuckdbFile,
    /// Redis/Valkey RDB snapshot (`REDIS` prefix)
    RedisRdb,
    /// mongodump archive (0x6d 0xe2 0x99 0x81)
    MongoArchive,
    /// SQL text without an engine banner
    PlainSql,
    Unknown,
}

impl DetectedFormat {
    /// Engine family the dump came from, when identifiable
    pub fn source_engine(&self) -> Option<&'static str> {
        match self {
            Self::PostgresqlCustom | Self::PostgresqlSql => Some("postgresql"),
            Self::MysqlSql => Some("mysql"),
            Self::MariadbSql => Some("mariadb"),
            Self::SqliteFile => Some("sqlite"),
            Self::DuckdbFile => Some("duckdb"),
            Self::RedisRdb => Some("redis"),
            Self::MongoArchive => Some("mongodb"),
            Self::Gzip | Self::PlainSql | Self::Unknown => None,
        }
    }

    /// Whether a dump of this format may be restored into `engine`.
    /// MySQL and MariaDB accept each other's SQL dumps; Redis and Valkey
    /// share the RDB format. Unidentified content is allowed through and
    /// left to the engine's own tools.
    pub fn accepted_by(&self, engine: Engine) -> bool {
        match self.source_engine() {
            None => true,
            Some(source) => match engine {
                Engine::Mysql | Engine::Mariadb => source == "mysql" || source == "mariadb",
                Engine::Redis | Engine::Valkey => source == "redis",
                _ => source == engine.tag(),
            },
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip-compressed SQL",
            Self::PostgresqlCustom => "PostgreSQL custom dump",
            Self::PostgresqlSql => "plain SQL",
            Self::MysqlSql => "plain SQL",
            Self::MariadbSql => "plain SQL",
            Self::SqliteFile => "database file copy",
            Self::DuckdbFile => "database file copy",
            Self::RedisRdb => "RDB snapshot",
            Self::MongoArchive => "MongoDB archive",
            Self::PlainSql => "plain SQL",
            Self::Unknown => "unknown",
        }
    }

    /// Tool invocation a human would use to restore this format
    pub fn restore_command(&self) -> &'static str {
        match self {
            Self::Gzip => "gunzip -c dump.sql.gz | <engine client>",
            Self::PostgresqlCustom => "pg_restore -d <db> dump.pgdump",
            Self::PostgresqlSql => "psql -d <db> -f dump.sql",
            Self::MysqlSql => "mysql <db> < dump.sql",
            Self::MariadbSql => "mariadb <db> < dump.sql",
            Self::SqliteFile => "copy the file into place",
            Self::DuckdbFile => "copy the file into place",
            Self::RedisRdb => "stop the instance and replace dump.rdb",
            Self::MongoArchive => "mongorestore --archive=dump.archive",
            Self::PlainSql => "<engine client> < dump.sql",
            Self::Unknown => "unknown",
        }
    }
}

/// Detection report: format plus human-facing description and the restore
/// invocation a UI can display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFormatInfo {
    pub format: DetectedFormat,
    pub description: String,
    pub restore_command: String,
}

impl From<DetectedFormat> for BackupFormatInfo {
    fn from(format: DetectedFormat) -> Self {
        Self {
            format,
            description: format.description().to_string(),
            restore_command: format.restore_command().to_string(),
        }
    }
}

/// Sniff the leading bytes of `path`
pub async fn detect_backup_format(path: &Path) -> SpinResult<BackupFormatInfo> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SpinError::io(format!("open {}", path.display()), e))?;
    let mut head = vec![0u8; SNIFF_LEN];
    let read = file
        .read(&mut head)
        .await
        .map_err(|e| SpinError::io(format!("read {}", path.display()), e))?;
    head.truncate(read);
    Ok(BackupFormatInfo::from(sniff(&head)))
}

/// Classify a leading byte slice
pub fn sniff(head: &[u8]) -> DetectedFormat {
    if head.starts_with(&[0x1f, 0x8b]) {
        return DetectedFormat::Gzip;
    }
    if head.starts_with(b"PGDMP") {
        return DetectedFormat::PostgresqlCustom;
    }
    if head.starts_with(b"SQLite format 3\0") {
        return DetectedFormat::SqliteFile;
    }
    if head.starts_with(b"REDIS") {
        return DetectedFormat::RedisRdb;
    }
    if head.starts_with(&[0x6d, 0xe2, 0x99, 0x81]) {
        return DetectedFormat::MongoArchive;
    }
    // DuckDB files carry "DUCK" at offset 8 of the main header block
    if head.len() >= 12 && &head[8..12] == b"DUCK" {
        return DetectedFormat::DuckdbFile;
    }

    let text = String::from_utf8_lossy(head);
    if text.contains("-- PostgreSQL database dump") {
        return DetectedFormat::PostgresqlSql;
    }
    if text.contains("-- MySQL dump") {
        return DetectedFormat::MysqlSql;
    }
    if text.contains("-- MariaDB dump") {
        return DetectedFormat::MariadbSql;
    }
    let trimmed = text.trim_start();
    if trimmed.starts_with("--")
        || trimmed.starts_with("CREATE ")
        || trimmed.starts_with("SET ")
        || trimmed.starts_with("BEGIN")
        || trimmed.starts_with("INSERT ")
    {
        return DetectedFormat::PlainSql;
    }
    DetectedFormat::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_magic() {
        assert_eq!(sniff(&[0x1f, 0x8b, 0x08, 0x00]), DetectedFormat::Gzip);
    }

    #[test]
    fn test_pgdmp_prefix() {
        assert_eq!(sniff(b"PGDMP\x01\x0e\x00"), DetectedFormat::PostgresqlCustom);
    }

    #[test]
    fn test_textual_banners() {
        assert_eq!(
            sniff(b"-- PostgreSQL database dump\n-- Dumped from database version 16.4\n"),
            DetectedFormat::PostgresqlSql
        );
        assert_eq!(
            sniff(b"-- MySQL dump 10.13  Distrib 8.0.39\n"),
            DetectedFormat::MysqlSql
        );
        assert_eq!(
            sniff(b"-- MariaDB dump 10.19  Distrib 11.4.3-MariaDB\n"),
            DetectedFormat::MariadbSql
        );
    }

    #[test]
    fn test_binary_signatures() {
        assert_eq!(sniff(b"SQLite format 3\0data"), DetectedFormat::SqliteFile);
        assert_eq!(sniff(b"REDIS0011rest"), DetectedFormat::RedisRdb);
        assert_eq!(sniff(&[0x6d, 0xe2, 0x99, 0x81, 0x00]), DetectedFormat::MongoArchive);
    }

    #[test]
    fn test_plain_sql_and_unknown() {
        assert_eq!(sniff(b"CREATE TABLE users (id int);"), DetectedFormat::PlainSql);
        assert_eq!(sniff(b"\x00\x01\x02\x03"), DetectedFormat::Unknown);
        assert_eq!(sniff(b""), DetectedFormat::Unknown);
    }

    #[test]
    fn test_family_acceptance() {
        assert!(DetectedFormat::MysqlSql.accepted_by(Engine::Mariadb));
        assert!(DetectedFormat::MariadbSql.accepted_by(Engine::Mysql));
        assert!(DetectedFormat::RedisRdb.accepted_by(Engine::Valkey));
        assert!(!DetectedFormat::PostgresqlCustom.accepted_by(Engine::Mysql));
        assert!(DetectedFormat::PlainSql.accepted_by(Engine::Postgresql));
    }

    #[tokio::test]
    async fn test_detect_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dump.pgdump");
        tokio::fs::write(&path, b"PGDMP\x01rest-of-dump").await.unwrap();
        let info = detect_backup_format(&path).await.unwrap();
        assert_eq!(info.format, DetectedFormat::PostgresqlCustom);
        assert_eq!(info.description, "PostgreSQL custom dump");
        assert!(info.restore_command.contains("pg_restore"));
    }
}
