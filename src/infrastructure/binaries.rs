//! Binary manager - download, extract, verify, and delete engine builds
//!
//! Pre-built engine archives live at deterministic URLs of the form
//! `{base}/{engine}-{version}/{engine}-{version}-{os}-{arch}.{ext}`.
//! Installation is a pipeline: resolve version, download to a per-install
//! temp directory, extract, normalize layout, verify the marker binary
//! reports the requested version, then record bundled tool paths. Any
//! failure collapses the install back to nothing.
//!
//! Concurrency contract: at most one in-flight install per
//! (engine, version, os, arch); concurrent callers share the outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};
use crate::domain::version::{Version, resolve_version, sort_versions_desc, version_map};
use crate::infrastructure::archive::{archive_ext, extract_archive};
use crate::infrastructure::http::{DownloadClient, ProgressFn};
use crate::infrastructure::paths::SpinPaths;
use crate::infrastructure::platform::PlatformService;
use crate::infrastructure::stores::config_store::{ConfigStore, ToolSource};

/// Default archive host
pub mod defaults {
    /// Base URL engine archives are fetched from
    pub const BINARY_BASE_URL: &str = "https://get.spindb.io/engines";
    /// TTL for the process-local upstream release listing cache
    pub const RELEASE_CACHE_TTL_SECS: u64 = 5 * 60;
}

type InstallKey = (Engine, String, &'static str, &'static str);

/// Process-local cache of upstream release listings per engine.
/// Not shared across threads of different workers by design.
static RELEASE_CACHE: Lazy<std::sync::Mutex<HashMap<Engine, (Instant, Vec<String>)>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

/// Download/install manager for engine binaries
pub struct BinaryManager {
    paths: SpinPaths,
    platform: PlatformService,
    client: DownloadClient,
    config: Arc<ConfigStore>,
    base_url: String,
    inflight: Mutex<HashMap<InstallKey, Arc<Mutex<()>>>>,
}

impl BinaryManager {
    pub fn new(
        paths: SpinPaths,
        platform: PlatformService,
        client: DownloadClient,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            paths,
            platform,
            client,
            config,
            base_url: defaults::BINARY_BASE_URL.to_string(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Override the archive host (tests point this at a local server)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Resolve a user-supplied version to the full release to install
    pub fn resolve_version(&self, engine: Engine, requested: &str) -> SpinResult<String> {
        resolve_version(engine, requested)
    }

    /// Archive URL for one (engine, version) on this platform
    pub fn download_url(&self, engine: Engine, version: &str) -> String {
        let info = self.platform.info();
        format!(
            "{base}/{engine}-{version}/{engine}-{version}-{os}-{arch}.{ext}",
            base = self.base_url,
            engine = engine.tag(),
            version = version,
            os = info.os.as_str(),
            arch = info.arch.as_str(),
            ext = archive_ext(info.os),
        )
    }

    /// Install directory for a full version on this platform
    pub fn install_dir(&self, engine: Engine, version: &str) -> PathBuf {
        let info = self.platform.info();
        self.paths.install_dir(engine, version, info.os, info.arch)
    }

    /// Path of the marker executable inside an installation
    pub fn marker_path(&self, engine: Engine, version: &str) -> PathBuf {
        self.install_dir(engine, version)
            .join("bin")
            .join(format!("{}{}", engine.marker_executable(), self.platform.exec_ext()))
    }

    /// Whether the marker executable for this release exists
    pub fn is_installed(&self, engine: Engine, version: &str) -> bool {
        self.marker_path(engine, version).is_file()
    }

    /// Installed versions of an engine on this platform, latest first
    pub fn list_installed(&self, engine: Engine) -> Vec<String> {
        let info = self.platform.info();
        self.paths.installed_versions(engine, info.os, info.arch)
    }

    /// Ensure one release is installed, downloading when needed.
    ///
    /// Returns the install directory. Concurrent calls for the same
    /// (engine, version, os, arch) are collapsed onto one install; later
    /// callers observe the finished installation.
    pub async fn ensure_installed(
        &self,
        engine: Engine,
        version: &str,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> SpinResult<PathBuf> {
        let full = self.resolve_version(engine, version)?;
        let install_dir = self.install_dir(engine, &full);
        if self.is_installed(engine, &full) {
            return Ok(install_dir);
        }

        let info = self.platform.info();
        let key: InstallKey = (engine, full.clone(), info.os.as_str(), info.arch.as_str());
        let gate = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(inflight.entry(key.clone()).or_default())
        };
        let _install_permit = gate.lock().await;

        // A concurrent caller may have finished the install while we
        // waited on the gate
        if self.is_installed(engine, &full) {
            self.release_gate(&key).await;
            return Ok(install_dir);
        }

        let result = self.install(engine, &full, cancel, progress).await;
        self.release_gate(&key).await;
        result.map(|()| install_dir)
    }

    async fn release_gate(&self, key: &InstallKey) {
        let mut inflight = self.inflight.lock().await;
        inflight.remove(key);
    }

    async fn install(
        &self,
        engine: Engine,
        full_version: &str,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> SpinResult<()> {
        let install_dir = self.install_dir(engine, full_version);
        let tmp_dir = self.paths.install_tmp_dir(engine, full_version);
        let url = self.download_url(engine, full_version);
        info!("⬇️ Installing {} {} from {}", engine.display_name(), full_version, url);

        let pipeline = async {
            tokio::fs::create_dir_all(&tmp_dir)
                .await
                .map_err(|e| SpinError::io(format!("create {}", tmp_dir.display()), e))?;
            let archive =
                tmp_dir.join(format!("archive.{}", archive_ext(self.platform.info().os)));

            self.client.download_to_file(&url, &archive, cancel, progress).await?;
            extract_archive(&self.platform, &archive, &install_dir).await?;
            self.verify(engine, full_version).await?;
            self.record_bundled_tools(engine, full_version).await?;
            Ok::<(), SpinError>(())
        }
        .await;

        // The temp directory is always removed; a failed install never
        // leaves a partial install directory behind
        let _ = tokio::fs::remove_dir_all(&tmp_dir).await;
        if let Err(err) = pipeline {
            let _ = tokio::fs::remove_dir_all(&install_dir).await;
            return Err(err);
        }
        info!("✅ Installed {} {}", engine.display_name(), full_version);
        Ok(())
    }

    /// Execute the marker's version flag and accept when the reported
    /// version matches the requested one fully or on the major component
    pub async fn verify(&self, engine: Engine, full_version: &str) -> SpinResult<()> {
        let marker = self.marker_path(engine, full_version);
        if !marker.is_file() {
            return Err(SpinError::VerifyFailed {
                expected: full_version.to_string(),
                actual: format!("marker executable missing: {}", marker.display()),
            });
        }

        let output = Command::new(&marker)
            .arg(engine.version_flag())
            .output()
            .await
            .map_err(|e| SpinError::io(format!("run {}", marker.display()), e))?;
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        let pattern = Regex::new(engine.version_pattern())
            .map_err(|e| SpinError::precondition(format!("bad version pattern: {e}")))?;
        let reported = pattern
            .captures(text.trim())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| SpinError::VerifyFailed {
                expected: full_version.to_string(),
                actual: text.trim().to_string(),
            })?;

        let expected = Version::parse(full_version)?;
        let actual = Version::parse(&reported)?;
        if expected.compare(&actual) == std::cmp::Ordering::Equal || expected.same_major(&actual) {
            debug!("🔍 Verified {} {} (reports {})", engine.tag(), full_version, reported);
            Ok(())
        } else {
            Err(SpinError::VerifyFailed {
                expected: full_version.to_string(),
                actual: reported,
            })
        }
    }

    async fn record_bundled_tools(&self, engine: Engine, full_version: &str) -> SpinResult<()> {
        let bin = self.install_dir(engine, full_version).join("bin");
        for tool in engine.bundled_tools() {
            let path = bin.join(format!("{tool}{}", self.platform.exec_ext()));
            if path.is_file() {
                self.config.record_tool(tool, path, ToolSource::Bundled).await?;
            }
        }
        Ok(())
    }

    /// Remove an installation and forget its recorded tools. Reference
    /// checks against the catalog are the caller's job.
    pub async fn delete(&self, engine: Engine, version: &str) -> SpinResult<()> {
        let full = self.resolve_version(engine, version)?;
        let install_dir = self.install_dir(engine, &full);
        if !install_dir.exists() {
            return Ok(());
        }
        self.config.drop_tools_under(&install_dir).await?;
        tokio::fs::remove_dir_all(&install_dir)
            .await
            .map_err(|e| SpinError::io(format!("remove {}", install_dir.display()), e))?;
        info!("🗑️ Deleted {} {} installation", engine.display_name(), full);
        Ok(())
    }

    /// Versions available upstream, newest first. Served from a 5-minute
    /// process-local cache; on network failure falls back to the static
    /// version map (advisory data must never block lifecycle operations).
    pub async fn available_versions(&self, engine: Engine) -> Vec<String> {
        if let Some(cached) = cached_releases(engine) {
            return cached;
        }
        let url = format!("{}/{}/releases.json", self.base_url, engine.tag());
        match self.client.get_json::<Vec<String>>(&url).await {
            Ok(mut versions) => {
                sort_versions_desc(&mut versions);
                store_releases(engine, versions.clone());
                versions
            }
            Err(err) => {
                warn!("🌐 Release listing for {} unavailable: {}", engine.tag(), err);
                let mut fallback: Vec<String> =
                    version_map(engine).iter().map(|(_, full)| (*full).to_string()).collect();
                sort_versions_desc(&mut fallback);
                fallback.dedup();
                fallback
            }
        }
    }
}

fn cached_releases(engine: Engine) -> Option<Vec<String>> {
    let cache = RELEASE_CACHE.lock().ok()?;
    let (stamped, versions) = cache.get(&engine)?;
    if stamped.elapsed() < Duration::from_secs(defaults::RELEASE_CACHE_TTL_SECS) {
        Some(versions.clone())
    } else {
        None
    }
}

fn store_releases(engine: Engine, versions: Vec<String>) {
    if let Ok(mut cache) = RELEASE_CACHE.lock() {
        cache.insert(engine, (Instant::now(), versions));
    }
}
