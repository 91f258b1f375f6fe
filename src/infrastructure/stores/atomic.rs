//! Atomic JSON persistence: write-temp + fsync + rename
//!
//! Readers observing a save in progress see either the pre- or post-state,
//! never a truncated file. On any failure before the rename the previous
//! on-disk state is guaranteed intact.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::domain::errors::{SpinError, SpinResult};

/// Serialize `value` pretty-printed and atomically replace `path`
pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> SpinResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

/// Load and deserialize `path`. `Ok(None)` when the file is missing;
/// `StoreCorrupt` when present but malformed.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> SpinResult<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SpinError::io(format!("read {}", path.display()), e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| SpinError::StoreCorrupt { path: path.to_path_buf(), cause: e.to_string() })
}

/// Write bytes to a sibling temp file, fsync, then rename over `path`
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> SpinResult<()> {
    let parent = path.parent().ok_or_else(|| {
        SpinError::precondition(format!("store path {} has no parent", path.display()))
    })?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| SpinError::io(format!("create {}", parent.display()), e))?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        Uuid::new_v4().simple()
    ));

    let persist = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| SpinError::io(format!("create {}", tmp.display()), e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| SpinError::io(format!("write {}", tmp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| SpinError::io(format!("fsync {}", tmp.display()), e))?;
        drop(file);
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| SpinError::io(format!("rename into {}", path.display()), e))?;
        Ok::<(), SpinError>(())
    }
    .await;

    if let Err(err) = persist {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(SpinError::StorePersistFailed {
            path: path.to_path_buf(),
            cause: err.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("doc.json");
        let doc = Doc { name: "a".into(), count: 3 };

        save_json(&path, &doc).await.unwrap();
        let loaded: Option<Doc> = load_json(&path).await.unwrap();
        assert_eq!(loaded.unwrap(), doc);
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded: Option<Doc> = load_json(&tmp.path().join("absent.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_malformed_file_is_corrupt_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = load_json::<Doc>(&path).await.unwrap_err();
        assert!(matches!(err, SpinError::StoreCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");
        for i in 0..5u32 {
            save_json(&path, &Doc { name: "x".into(), count: i }).await.unwrap();
        }
        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["doc.json"]);
    }
}
