//! Filesystem helpers shared by the container lifecycle operations
//!
//! Renames never assume same-filesystem: every move falls back to
//! copy + fsync + delete when the OS reports a cross-device link.

use std::path::Path;

use tracing::debug;

use crate::domain::errors::{SpinError, SpinResult};

/// Recursively copy a file or directory tree
pub async fn copy_recursive(src: &Path, dest: &Path) -> SpinResult<()> {
    if src.is_file() {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SpinError::io(format!("create {}", parent.display()), e))?;
        }
        tokio::fs::copy(src, dest)
            .await
            .map_err(|e| SpinError::io(format!("copy {} -> {}", src.display(), dest.display()), e))?;
        return Ok(());
    }

    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| SpinError::io(format!("create {}", dest.display()), e))?;
    // Recursion over an unbounded tree: walk iteratively with a stack
    let mut pending = vec![(src.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&from)
            .await
            .map_err(|e| SpinError::io(format!("read {}", from.display()), e))?;
        while let Some(entry) =
            entries.next_entry().await.map_err(|e| SpinError::io("read dir entry", e))?
        {
            let target = to.join(entry.file_name());
            let file_type =
                entry.file_type().await.map_err(|e| SpinError::io("stat dir entry", e))?;
            if file_type.is_dir() {
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|e| SpinError::io(format!("create {}", target.display()), e))?;
                pending.push((entry.path(), target));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &target).await.map_err(|e| {
                    SpinError::io(
                        format!("copy {} -> {}", entry.path().display(), target.display()),
                        e,
                    )
                })?;
            }
            // Sockets and other specials are runtime artifacts, skipped
        }
    }
    Ok(())
}

/// Move a file or directory, falling back to copy+delete across devices
pub async fn move_path(src: &Path, dest: &Path) -> SpinResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SpinError::io(format!("create {}", parent.display()), e))?;
    }
    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => {
            debug!("📦 Cross-device move {} -> {}, copying", src.display(), dest.display());
            copy_recursive(src, dest).await?;
            remove_recursive(src).await
        }
        Err(err) => {
            Err(SpinError::io(format!("move {} -> {}", src.display(), dest.display()), err))
        }
    }
}

fn is_cross_device(err: &std::io::Error) -> bool {
    // EXDEV is not a stable ErrorKind on all toolchains; check both
    err.kind() == std::io::ErrorKind::CrossesDevices || err.raw_os_error() == Some(18)
}

/// Remove a file or directory tree; missing paths are tolerated
pub async fn remove_recursive(path: &Path) -> SpinResult<()> {
    let result = if path.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SpinError::io(format!("remove {}", path.display()), e)),
    }
}

/// Total size in bytes of a file or directory tree
pub async fn path_size(path: &Path) -> SpinResult<u64> {
    if path.is_file() {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| SpinError::io(format!("stat {}", path.display()), e))?;
        return Ok(meta.len());
    }
    let mut total = 0u64;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(SpinError::io(format!("read {}", dir.display()), e)),
        };
        while let Some(entry) =
            entries.next_entry().await.map_err(|e| SpinError::io("read dir entry", e))?
        {
            let file_type =
                entry.file_type().await.map_err(|e| SpinError::io("stat dir entry", e))?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry
                    .metadata()
                    .await
                    .map_err(|e| SpinError::io("stat file", e))?
                    .len();
            }
        }
    }
    Ok(total)
}
