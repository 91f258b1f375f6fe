//! Global configuration store (`config.json`)
//!
//! Persists binary tool paths discovered during installs, user
//! preferences, and the advisory update cache. All writes go through the
//! atomic temp+rename path; in-process access is serialized so each
//! load-mutate-save is one logical step.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::errors::SpinResult;
use crate::infrastructure::logging::LoggingConfig;
use crate::infrastructure::stores::atomic::{load_json, save_json};

/// How long a recorded binary tool path is trusted before re-probing
pub const BINARY_CACHE_STALE_DAYS: i64 = 7;

/// Where a recorded tool came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    /// Shipped inside an engine installation under `bin/`
    Bundled,
    /// Found on the host (PATH or configured directory)
    System,
}

/// One recorded external tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryToolEntry {
    pub path: PathBuf,
    pub source: ToolSource,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

/// User preferences persisted across sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default)]
    pub icon_mode: Option<String>,
}

/// Advisory cache for the tool's own release channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCache {
    #[serde(default)]
    pub latest_version: Option<String>,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub auto_check_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UpdateCache {
    fn default() -> Self {
        Self { latest_version: None, last_check: None, auto_check_enabled: true }
    }
}

/// Complete global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub binaries: HashMap<String, BinaryToolEntry>,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub update: UpdateCache,
}

/// Store wrapper serializing access to `config.json`
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path, guard: Mutex::new(()) }
    }

    /// Load the config, defaulting when the file does not exist yet.
    /// A present-but-malformed file is an error, never silently reset.
    pub async fn load(&self) -> SpinResult<GlobalConfig> {
        let _lock = self.guard.lock().await;
        Ok(load_json(&self.path).await?.unwrap_or_default())
    }

    pub async fn save(&self, config: &GlobalConfig) -> SpinResult<()> {
        let _lock = self.guard.lock().await;
        save_json(&self.path, config).await
    }

    /// Load, mutate, save as one exclusive step
    pub async fn update<F>(&self, mutate: F) -> SpinResult<GlobalConfig>
    where
        F: FnOnce(&mut GlobalConfig),
    {
        let _lock = self.guard.lock().await;
        let mut config: GlobalConfig = load_json(&self.path).await?.unwrap_or_default();
        mutate(&mut config);
        save_json(&self.path, &config).await?;
        Ok(config)
    }

    /// Record a tool path discovered during an engine install
    pub async fn record_tool(&self, name: &str, path: PathBuf, source: ToolSource) -> SpinResult<()> {
        debug!("🔧 Recording tool '{}' -> {}", name, path.display());
        self.update(|config| {
            config.binaries.insert(
                name.to_string(),
                BinaryToolEntry { path, source, recorded_at: Utc::now() },
            );
        })
        .await?;
        Ok(())
    }

    /// Forget every tool whose path sits under `install_dir` (called when
    /// that installation is deleted)
    pub async fn drop_tools_under(&self, install_dir: &std::path::Path) -> SpinResult<()> {
        self.update(|config| {
            config.binaries.retain(|_, entry| !entry.path.starts_with(install_dir));
        })
        .await?;
        Ok(())
    }

    /// Look up a recorded tool path
    pub async fn tool_path(&self, name: &str) -> SpinResult<Option<PathBuf>> {
        Ok(self.load().await?.binaries.get(name).map(|entry| entry.path.clone()))
    }

    /// Re-probe stale entries: drop recorded tools whose file no longer
    /// exists, refresh the timestamp of the ones that still answer
    /// `--version`. Entries younger than the staleness window are left
    /// alone.
    pub async fn refresh_stale_binaries(&self) -> SpinResult<usize> {
        let config = self.load().await?;
        let stale_before = Utc::now() - Duration::days(BINARY_CACHE_STALE_DAYS);
        let mut dropped = Vec::new();
        let mut refreshed = Vec::new();

        for (name, entry) in &config.binaries {
            if entry.recorded_at > stale_before {
                continue;
            }
            if !entry.path.is_file() {
                dropped.push(name.clone());
                continue;
            }
            let alive = tokio::process::Command::new(&entry.path)
                .arg("--version")
                .output()
                .await
                .map(|out| out.status.success())
                .unwrap_or(false);
            if alive {
                refreshed.push(name.clone());
            } else {
                dropped.push(name.clone());
            }
        }
        if dropped.is_empty() && refreshed.is_empty() {
            return Ok(0);
        }
        let removed = dropped.len();
        self.update(|config| {
            for name in &dropped {
                config.binaries.remove(name);
            }
            for name in &refreshed {
                if let Some(entry) = config.binaries.get_mut(name) {
                    entry.recorded_at = Utc::now();
                }
            }
        })
        .await?;
        if removed > 0 {
            info!("🧹 Dropped {} stale binary tool entries", removed);
        }
        Ok(removed)
    }
}
