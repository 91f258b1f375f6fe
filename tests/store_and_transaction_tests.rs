//! Tests for store atomicity, transactional rollback, and install dedup
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use spindb::application::{SpinDb, Transaction};
use spindb::domain::{Engine, SpinError};
use spindb::infrastructure::stores::atomic::{load_json, save_json};
use tokio_util::sync::CancellationToken;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Blob {
    generation: u64,
    payload: String,
}

#[tokio::test]
async fn concurrent_readers_never_observe_a_truncated_store() {
    let tmp = tempfile::tempdir().unwrap();
    let path = Arc::new(tmp.path().join("store.json"));
    save_json(&*path, &Blob { generation: 0, payload: "x".repeat(4096) }).await.unwrap();

    let writer = {
        let path = Arc::clone(&path);
        tokio::spawn(async move {
            for generation in 1..=50u64 {
                save_json(&*path, &Blob { generation, payload: "x".repeat(4096) })
                    .await
                    .unwrap();
            }
        })
    };
    let reader = {
        let path = Arc::clone(&path);
        tokio::spawn(async move {
            for _ in 0..200 {
                // Malformed content would surface as StoreCorrupt
                let blob: Option<Blob> = load_json(&*path).await.unwrap();
                let blob = blob.unwrap();
                assert_eq!(blob.payload.len(), 4096);
            }
        })
    };
    writer.await.unwrap();
    reader.await.unwrap();
}

#[tokio::test]
async fn transaction_rollback_restores_pre_operation_state() {
    // A failing multi-step operation over real files: after rollback the
    // observable filesystem equals the pre-operation state
    let tmp = tempfile::tempdir().unwrap();
    let original = tmp.path().join("data");
    tokio::fs::create_dir_all(&original).await.unwrap();
    tokio::fs::write(original.join("keep"), b"payload").await.unwrap();

    let moved = tmp.path().join("moved");
    let mut tx = Transaction::new();

    let outcome: Result<(), SpinError> = async {
        spindb::infrastructure::fsutil::move_path(&original, &moved).await?;
        {
            let (src, dest) = (original.clone(), moved.clone());
            tx.add_rollback("move data back", move || async move {
                spindb::infrastructure::fsutil::move_path(&dest, &src).await
            });
        }
        Err(SpinError::precondition("simulated failure after step 1"))
    }
    .await;

    assert!(outcome.is_err());
    tx.rollback().await;
    assert!(original.join("keep").is_file());
    assert!(!moved.exists());
}

#[tokio::test]
async fn ensure_installed_twice_does_not_redownload() {
    let tmp = tempfile::tempdir().unwrap();
    let core = SpinDb::with_root(tmp.path()).unwrap();
    // Pre-seed the installation; the unroutable base URL would make any
    // download attempt fail loudly
    let marker = core.binaries().marker_path(Engine::Sqlite, "3.46.1");
    tokio::fs::create_dir_all(marker.parent().unwrap()).await.unwrap();
    tokio::fs::write(&marker, b"").await.unwrap();
    assert!(core.binaries().is_installed(Engine::Sqlite, "3.46.1"));

    for _ in 0..2 {
        core.binaries()
            .ensure_installed(Engine::Sqlite, "3.46.1", &CancellationToken::new(), None)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn concurrent_ensure_installed_callers_share_one_outcome() {
    let tmp = tempfile::tempdir().unwrap();
    let core = Arc::new(SpinDb::with_root(tmp.path()).unwrap());
    let marker = core.binaries().marker_path(Engine::Sqlite, "3.46.1");
    tokio::fs::create_dir_all(marker.parent().unwrap()).await.unwrap();
    tokio::fs::write(&marker, b"").await.unwrap();

    let successes = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let core = Arc::clone(&core);
        let successes = Arc::clone(&successes);
        handles.push(tokio::spawn(async move {
            let dir = core
                .binaries()
                .ensure_installed(Engine::Sqlite, "3.46.1", &CancellationToken::new(), None)
                .await
                .unwrap();
            assert!(dir.ends_with(format!(
                "sqlite-3.46.1-{}-{}",
                core.platform().info().os.as_str(),
                core.platform().info().arch.as_str()
            )));
            successes.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(successes.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn download_404_message_names_the_version() {
    // A 404 from the archive host must translate into a DownloadFailed
    // whose message lets the UI name the missing version
    let tmp = tempfile::tempdir().unwrap();

    // Local listener answering 404 to everything
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                    .await;
            });
        }
    });

    let with_url = spindb::infrastructure::BinaryManager::new(
        spindb::infrastructure::SpinPaths::new(tmp.path()),
        spindb::infrastructure::PlatformService::new(),
        spindb::infrastructure::DownloadClient::with_defaults().unwrap(),
        Arc::new(spindb::infrastructure::stores::config_store::ConfigStore::new(
            tmp.path().join("config.json"),
        )),
    )
    .with_base_url(format!("http://{addr}"));

    let err = with_url
        .ensure_installed(Engine::Postgresql, "16.4.0", &CancellationToken::new(), None)
        .await
        .unwrap_err();
    match err {
        SpinError::DownloadFailed { url, cause } => {
            assert!(url.contains("16.4.0"), "url must name the version: {url}");
            assert!(cause.contains("version not available"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
