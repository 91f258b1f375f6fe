//! Tests for backup format detection and cross-engine restore refusal
use spindb::application::{CreateOptions, SpinDb};
use spindb::domain::{Engine, SpinError};
use spindb::engines::{DetectedFormat, RestoreOptions, detect_backup_format};

#[tokio::test]
async fn detect_identifies_the_canonical_magics() {
    let tmp = tempfile::tempdir().unwrap();
    let cases: &[(&str, &[u8], DetectedFormat)] = &[
        ("custom.pgdump", b"PGDMP\x01\x0e", DetectedFormat::PostgresqlCustom),
        (
            "plain.sql",
            b"-- PostgreSQL database dump\n-- Dumped from database version 16.4\n",
            DetectedFormat::PostgresqlSql,
        ),
        ("mysql.sql", b"-- MySQL dump 10.13  Distrib 8.0.39\n", DetectedFormat::MysqlSql),
        ("maria.sql", b"-- MariaDB dump 10.19\n", DetectedFormat::MariadbSql),
        ("packed.sql.gz", &[0x1f, 0x8b, 0x08, 0x00, 0x00], DetectedFormat::Gzip),
        ("db.sqlite", b"SQLite format 3\0", DetectedFormat::SqliteFile),
        ("dump.rdb", b"REDIS0011\xfa", DetectedFormat::RedisRdb),
        ("docs.archive", &[0x6d, 0xe2, 0x99, 0x81, 0x01], DetectedFormat::MongoArchive),
        ("garbage.bin", &[0x00, 0x01, 0x02, 0x03], DetectedFormat::Unknown),
    ];
    for (name, bytes, expected) in cases {
        let path = tmp.path().join(name);
        tokio::fs::write(&path, bytes).await.unwrap();
        let info = detect_backup_format(&path).await.unwrap();
        assert_eq!(info.format, *expected, "mismatch for {name}");
    }
}

#[tokio::test]
async fn restoring_postgres_dump_into_mysql_container_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let core = SpinDb::with_root(tmp.path()).unwrap();
    core.create_container(
        "mydb",
        CreateOptions {
            engine: Engine::Mysql,
            version: "8.0".to_string(),
            port: None,
            database: Some("app".to_string()),
        },
    )
    .await
    .unwrap();

    let dump = tmp.path().join("pg.dump");
    tokio::fs::write(&dump, b"PGDMP\x01\x0e\x00rest").await.unwrap();
    let info = core.detect_backup_format(&dump).await.unwrap();
    assert_eq!(info.format, DetectedFormat::PostgresqlCustom);

    let before = core.containers().get_config("mydb").await.unwrap();
    let err = core.restore("mydb", &dump, RestoreOptions::default()).await.unwrap_err();
    match err {
        SpinError::WrongEngineDump { detected, expected, .. } => {
            assert_eq!(detected, "postgresql");
            assert_eq!(expected, "mysql");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Catalog unchanged, no database tracked
    let after = core.containers().get_config("mydb").await.unwrap();
    assert_eq!(after.databases, before.databases);
    assert_eq!(after.status, before.status);
}

#[tokio::test]
async fn gzip_wrapped_foreign_dump_is_still_refused() {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let tmp = tempfile::tempdir().unwrap();
    let core = SpinDb::with_root(tmp.path()).unwrap();
    core.create_container(
        "mydb",
        CreateOptions {
            engine: Engine::Mysql,
            version: "8.0".to_string(),
            port: None,
            database: Some("app".to_string()),
        },
    )
    .await
    .unwrap();

    // gzip around a PostgreSQL plain dump
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(b"-- PostgreSQL database dump\n-- Dumped from database version 16.4\nCREATE TABLE t (id int);\n")
        .unwrap();
    let packed = encoder.finish().unwrap();
    let dump = tmp.path().join("pg.sql.gz");
    tokio::fs::write(&dump, &packed).await.unwrap();

    let err = core.restore("mydb", &dump, RestoreOptions::default()).await.unwrap_err();
    assert!(matches!(err, SpinError::WrongEngineDump { .. }));
    // The decompression scratch file was cleaned up
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().contains("unpacked"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn detect_backup_consistency_for_file_engine() {
    // backup(fmt) -> detect(backup) reports a description matching fmt
    let tmp = tempfile::tempdir().unwrap();
    let core = SpinDb::with_root(tmp.path()).unwrap();
    let file = tmp.path().join("notes.sqlite");
    core.create_container(
        "notes",
        CreateOptions {
            engine: Engine::Sqlite,
            version: "3.46".to_string(),
            port: None,
            database: Some(file.display().to_string()),
        },
    )
    .await
    .unwrap();

    let output = tmp.path().join("notes.backup");
    let outcome = core
        .backup(
            "notes",
            &output,
            spindb::engines::BackupOptions {
                database: None,
                format: spindb::engines::BackupFormat::FileCopy,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.size, tokio::fs::metadata(&file).await.unwrap().len());

    let info = core.detect_backup_format(&output).await.unwrap();
    // An initialized sqlite file carries its own magic; an empty
    // placeholder detects as unknown - both are acceptable copies
    if tokio::fs::metadata(&file).await.unwrap().len() > 0 {
        assert_eq!(info.description, outcome.format.description());
    }
}
