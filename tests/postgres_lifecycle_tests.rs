//! End-to-end lifecycle over scripted stand-in binaries (POSIX only)
//!
//! Exercises the real start/stop path - spawn detached, PID file, ready
//! probe, graceful stop, catalog transitions - against shell scripts that
//! behave like a PostgreSQL installation.
#![cfg(unix)]

use spindb::application::{CreateOptions, SpinDb};
use spindb::domain::{ContainerStatus, Engine};
use tokio_util::sync::CancellationToken;

async fn write_script(dir: &std::path::Path, name: &str, body: &str) {
    let path = dir.join(name);
    tokio::fs::write(&path, body).await.unwrap();
    spindb::infrastructure::platform::make_executable(&path).await.unwrap();
}

/// Scripted binaries mimicking a postgresql-16.4.0 install
async fn seed_fake_postgres(core: &SpinDb) {
    let info = core.platform().info();
    let bin = core
        .paths()
        .install_dir(Engine::Postgresql, "16.4.0", info.os, info.arch)
        .join("bin");
    tokio::fs::create_dir_all(&bin).await.unwrap();

    write_script(
        &bin,
        "postgres",
        "#!/bin/sh\n\
         while [ $# -gt 0 ]; do case \"$1\" in -D) D=\"$2\"; shift 2;; *) shift;; esac; done\n\
         echo $$ > \"$D/postmaster.pid\"\n\
         exec sleep 600\n",
    )
    .await;
    write_script(
        &bin,
        "initdb",
        "#!/bin/sh\n\
         while [ $# -gt 0 ]; do case \"$1\" in -D) D=\"$2\"; shift 2;; *) shift;; esac; done\n\
         mkdir -p \"$D\" && echo 16 > \"$D/PG_VERSION\"\n",
    )
    .await;
    write_script(
        &bin,
        "pg_ctl",
        "#!/bin/sh\n\
         while [ $# -gt 0 ]; do case \"$1\" in -D) D=\"$2\"; shift 2;; *) shift;; esac; done\n\
         kill \"$(cat \"$D/postmaster.pid\" 2>/dev/null)\" 2>/dev/null\n\
         exit 0\n",
    )
    .await;
    write_script(&bin, "pg_isready", "#!/bin/sh\nexit 0\n").await;
    write_script(&bin, "psql", "#!/bin/sh\necho postgres\nexit 0\n").await;
}

#[tokio::test]
async fn create_start_stop_walks_the_status_machine() {
    let tmp = tempfile::tempdir().unwrap();
    let core = SpinDb::with_root(tmp.path()).unwrap();
    seed_fake_postgres(&core).await;

    let container = core
        .create_container(
            "pgdev",
            CreateOptions {
                engine: Engine::Postgresql,
                version: "16.4.0".to_string(),
                port: None,
                database: Some("app".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(container.status, ContainerStatus::Created);

    let outcome = core.start_container("pgdev", &CancellationToken::new(), None).await.unwrap();
    assert_eq!(outcome.port, container.port);
    assert_eq!(
        outcome.connection_string,
        format!("postgresql://postgres@127.0.0.1:{}/app", container.port)
    );

    // Catalog records running; the PID file exists between start and stop
    let started = core.containers().get_config("pgdev").await.unwrap();
    assert_eq!(started.status, ContainerStatus::Running);
    let pid_file = core.paths().pid_file(Engine::Postgresql, "pgdev");
    assert!(pid_file.is_file());
    assert!(core.is_running("pgdev").await.unwrap());
    // initdb ran against the layout's data dir
    assert!(core.paths().data_dir(Engine::Postgresql, "pgdev").join("PG_VERSION").is_file());

    core.stop_container("pgdev").await.unwrap();
    let stopped = core.containers().get_config("pgdev").await.unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert!(!pid_file.exists());
    assert!(!core.is_running("pgdev").await.unwrap());
}

#[tokio::test]
async fn second_start_conflicts_until_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let core = SpinDb::with_root(tmp.path()).unwrap();
    seed_fake_postgres(&core).await;
    core.create_container(
        "pgdev",
        CreateOptions {
            engine: Engine::Postgresql,
            version: "16.4.0".to_string(),
            port: None,
            database: Some("app".to_string()),
        },
    )
    .await
    .unwrap();

    core.start_container("pgdev", &CancellationToken::new(), None).await.unwrap();
    let err = core.start_container("pgdev", &CancellationToken::new(), None).await.unwrap_err();
    assert!(err.to_string().contains("already appears to be running"));

    core.stop_container("pgdev").await.unwrap();
    core.start_container("pgdev", &CancellationToken::new(), None).await.unwrap();
    core.stop_container("pgdev").await.unwrap();
}

#[tokio::test]
async fn stop_with_dead_pid_clears_the_file_and_succeeds() {
    let tmp = tempfile::tempdir().unwrap();
    let core = SpinDb::with_root(tmp.path()).unwrap();
    seed_fake_postgres(&core).await;
    core.create_container(
        "stale",
        CreateOptions {
            engine: Engine::Postgresql,
            version: "16.4.0".to_string(),
            port: None,
            database: Some("app".to_string()),
        },
    )
    .await
    .unwrap();

    let pid_file = core.paths().pid_file(Engine::Postgresql, "stale");
    tokio::fs::create_dir_all(pid_file.parent().unwrap()).await.unwrap();
    tokio::fs::write(&pid_file, "3999999\n").await.unwrap();

    core.stop_container("stale").await.unwrap();
    assert!(!pid_file.exists());
    assert_eq!(
        core.containers().get_config("stale").await.unwrap().status,
        ContainerStatus::Stopped
    );
}
