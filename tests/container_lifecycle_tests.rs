//! Tests for container lifecycle invariants over a temp root
use std::collections::HashSet;

use spindb::application::{CreateOptions, DeleteOptions, SpinDb};
use spindb::domain::{ContainerStatus, Engine, SpinError};

fn core(root: &std::path::Path) -> SpinDb {
    SpinDb::with_root(root).unwrap()
}

fn pg(database: &str) -> CreateOptions {
    CreateOptions {
        engine: Engine::Postgresql,
        version: "16".to_string(),
        port: None,
        database: Some(database.to_string()),
    }
}

#[tokio::test]
async fn create_create_same_name_is_name_conflict() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
    core.create_container("pgdev", pg("app")).await.unwrap();
    let err = core.create_container("pgdev", pg("app")).await.unwrap_err();
    assert!(matches!(err, SpinError::NameConflict { .. }));
}

#[tokio::test]
async fn create_records_created_status_and_normalized_version() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
    let container = core.create_container("pgdev", pg("app")).await.unwrap();
    assert_eq!(container.status, ContainerStatus::Created);
    assert_eq!(container.version, "16.4.0");
    assert_eq!(container.databases.first(), Some(&container.database));
    // The catalog file landed where the layout says it should
    assert!(core.paths().container_file("pgdev").is_file());
}

#[tokio::test]
async fn running_server_containers_never_share_a_port() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
    for name in ["a", "b", "c"] {
        core.create_container(name, pg("app")).await.unwrap();
        core.containers().set_status(name, ContainerStatus::Running).await.unwrap();
    }
    let mut seen = HashSet::new();
    for container in core.containers().list().await.unwrap() {
        assert!(seen.insert(container.port), "port {} shared", container.port);
    }
}

#[tokio::test]
async fn file_based_containers_have_port_zero_and_absolute_path() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
    let file = tmp.path().join("notes.sqlite");
    let container = core
        .create_container(
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
    assert_eq!(container.port, 0);
    assert!(std::path::Path::new(&container.database).is_absolute());
    container.check_invariants().unwrap();

    // status=running iff the file exists
    assert!(core.is_running("notes").await.unwrap());
    tokio::fs::remove_file(&file).await.unwrap();
    assert!(!core.is_running("notes").await.unwrap());
}

#[tokio::test]
async fn clone_of_running_server_demands_stop_first() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
    core.create_container("app", pg("app")).await.unwrap();
    core.containers().set_status("app", ContainerStatus::Running).await.unwrap();

    let err = core.clone_container("app", "app-copy").await.unwrap_err();
    assert!(err.to_string().contains("Stop container"));

    core.containers().set_status("app", ContainerStatus::Stopped).await.unwrap();
    let cloned = core.clone_container("app", "app-copy").await.unwrap();
    assert_eq!(cloned.status, ContainerStatus::Stopped);
    assert!(core.containers().exists("app-copy").await);
}

#[tokio::test]
async fn clone_copies_data_directory_structurally() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
    let src = core.create_container("app", pg("app")).await.unwrap();
    let data = core.paths().data_dir(Engine::Postgresql, "app");
    tokio::fs::create_dir_all(data.join("base")).await.unwrap();
    tokio::fs::write(data.join("PG_VERSION"), b"16\n").await.unwrap();
    tokio::fs::write(data.join("base").join("1"), b"seed").await.unwrap();

    let cloned = core.clone_container("app", "app-copy").await.unwrap();
    assert_ne!(cloned.port, src.port);
    let copy = core.paths().data_dir(Engine::Postgresql, "app-copy");
    assert_eq!(tokio::fs::read(copy.join("PG_VERSION")).await.unwrap(), b"16\n");
    assert_eq!(tokio::fs::read(copy.join("base").join("1")).await.unwrap(), b"seed");
}

#[tokio::test]
async fn cloned_file_container_matches_byte_for_byte() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
    let file = tmp.path().join("orig.sqlite");
    tokio::fs::write(&file, b"SQLite format 3\0payload-bytes").await.unwrap();
    core.containers()
        .attach(&file, "orig", Engine::Sqlite)
        .await
        .unwrap();

    let cloned = core.clone_container("orig", "copy").await.unwrap();
    let cloned_bytes = tokio::fs::read(&cloned.database).await.unwrap();
    assert_eq!(cloned_bytes, b"SQLite format 3\0payload-bytes");
}

#[tokio::test]
async fn rename_to_existing_name_fails_and_leaves_both_intact() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
    core.create_container("a", pg("app")).await.unwrap();
    core.create_container("b", pg("app")).await.unwrap();

    let err = core.rename_container("a", "b").await.unwrap_err();
    assert!(matches!(err, SpinError::NameConflict { .. }));
    assert!(core.containers().exists("a").await);
    assert!(core.containers().exists("b").await);
}

#[tokio::test]
async fn delete_running_container_requires_force() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
    core.create_container("app", pg("app")).await.unwrap();
    // A PID file pointing at this test process marks it running
    let pid_file = core.paths().pid_file(Engine::Postgresql, "app");
    tokio::fs::create_dir_all(pid_file.parent().unwrap()).await.unwrap();
    tokio::fs::write(&pid_file, format!("{}\n", std::process::id())).await.unwrap();

    let err = core.delete_container("app", DeleteOptions::default()).await.unwrap_err();
    assert!(err.to_string().contains("running"));
    assert!(core.containers().exists("app").await);
}

#[tokio::test]
async fn detach_then_attach_round_trips_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
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

    // Detach: catalog entry and registry entry go away, the file stays
    core.containers().detach("notes").await.unwrap();
    assert!(!core.paths().container_file("notes").is_file());
    assert!(
        core.containers().registry(Engine::Sqlite).await.get("notes").await.unwrap().is_none()
    );
    assert!(file.is_file());

    // Attach: record recreated with status reflecting the live file
    let attached = core.containers().attach(&file, "notes", Engine::Sqlite).await.unwrap();
    assert_eq!(attached.status, ContainerStatus::Running);
    assert!(core.paths().container_file("notes").is_file());
    assert!(
        core.containers().registry(Engine::Sqlite).await.get("notes").await.unwrap().is_some()
    );
}

#[tokio::test]
async fn file_delete_defaults_to_removing_file_detach_keeps_it() {
    let tmp = tempfile::tempdir().unwrap();
    let core = core(tmp.path());
    let file = tmp.path().join("scratch.duckdb");
    core.create_container(
        "scratch",
        CreateOptions {
            engine: Engine::Duckdb,
            version: "1.1".to_string(),
            port: None,
            database: Some(file.display().to_string()),
        },
    )
    .await
    .unwrap();
    assert!(file.is_file());

    core.delete_container("scratch", DeleteOptions::default()).await.unwrap();
    assert!(!file.exists(), "default delete removes the database file");
}
