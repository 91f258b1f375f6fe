//! Archive extraction for downloaded engine binaries
//!
//! POSIX archives are tar.gz extracted with the system `tar`; Windows
//! archives are zip extracted with PowerShell's `Expand-Archive`. After
//! extraction the layout is normalized: an archive whose only top-level
//! entry is a single engine directory has that directory's children
//! flattened into the install directory.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::errors::{SpinError, SpinResult};
use crate::infrastructure::platform::{OsTag, PlatformService, make_executable};

/// Archive extension for a platform's engine downloads
pub fn archive_ext(os: OsTag) -> &'static str {
    if os == OsTag::Win32 { "zip" } else { "tar.gz" }
}

/// Extract `archive` into `dest`, normalize single-root layouts, and mark
/// everything under `dest/bin` executable on POSIX.
pub async fn extract_archive(
    platform: &PlatformService,
    archive: &Path,
    dest: &Path,
) -> SpinResult<()> {
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| SpinError::io(format!("create {}", dest.display()), e))?;

    if platform.info().os == OsTag::Win32 {
        extract_zip(archive, dest).await?;
    } else {
        extract_tar_gz(archive, dest).await?;
    }

    flatten_single_root(dest).await?;
    mark_binaries_executable(dest).await?;
    info!("📂 Extracted {} into {}", archive.display(), dest.display());
    Ok(())
}

async fn extract_tar_gz(archive: &Path, dest: &Path) -> SpinResult<()> {
    debug!("🗜️ tar -xzf {} -C {}", archive.display(), dest.display());
    let output = Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()
        .await
        .map_err(|e| SpinError::io("spawn tar", e))?;
    if !output.status.success() {
        return Err(SpinError::ExtractFailed {
            archive: archive.display().to_string(),
            cause: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

async fn extract_zip(archive: &Path, dest: &Path) -> SpinResult<()> {
    let script = format!(
        "Expand-Archive -LiteralPath \"{}\" -DestinationPath \"{}\" -Force",
        archive.display(),
        dest.display()
    );
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", &script])
        .output()
        .await
        .map_err(|e| SpinError::io("spawn powershell Expand-Archive", e))?;
    if !output.status.success() {
        return Err(SpinError::ExtractFailed {
            archive: archive.display().to_string(),
            cause: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// If `dest` contains exactly one directory and nothing else, move that
/// directory's children up into `dest`. Archives come both flat and
/// nested; installations must always be flat.
async fn flatten_single_root(dest: &Path) -> SpinResult<()> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dest)
        .await
        .map_err(|e| SpinError::io(format!("read {}", dest.display()), e))?;
    while let Some(entry) =
        read_dir.next_entry().await.map_err(|e| SpinError::io("read extracted entries", e))?
    {
        entries.push(entry.path());
    }

    let [single_root] = entries.as_slice() else {
        return Ok(());
    };
    if !single_root.is_dir() {
        return Ok(());
    }

    debug!("🪜 Flattening single-root archive layout: {}", single_root.display());
    let mut children = tokio::fs::read_dir(single_root)
        .await
        .map_err(|e| SpinError::io(format!("read {}", single_root.display()), e))?;
    while let Some(child) =
        children.next_entry().await.map_err(|e| SpinError::io("read nested entries", e))?
    {
        let target = dest.join(child.file_name());
        tokio::fs::rename(child.path(), &target)
            .await
            .map_err(|e| SpinError::io(format!("move {} up", child.path().display()), e))?;
    }
    tokio::fs::remove_dir(single_root)
        .await
        .map_err(|e| SpinError::io(format!("remove {}", single_root.display()), e))?;
    Ok(())
}

async fn mark_binaries_executable(dest: &Path) -> SpinResult<()> {
    let bin = dest.join("bin");
    if !bin.is_dir() {
        return Ok(());
    }
    let mut entries = tokio::fs::read_dir(&bin)
        .await
        .map_err(|e| SpinError::io(format!("read {}", bin.display()), e))?;
    while let Some(entry) =
        entries.next_entry().await.map_err(|e| SpinError::io("read bin entries", e))?
    {
        if entry.path().is_file() {
            make_executable(&entry.path()).await?;
        }
    }
    Ok(())
}
