//! Advisory update checker
//!
//! Refreshes the cached latest release of the tool itself at most once a
//! day. Strictly advisory: failures are swallowed and lifecycle
//! operations never wait on it.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::domain::errors::SpinResult;
use crate::infrastructure::http::DownloadClient;
use crate::infrastructure::stores::config_store::ConfigStore;

/// Release channel endpoint
pub const RELEASE_URL: &str = "https://get.spindb.io/release.json";
/// Minimum interval between refreshes
pub const CHECK_INTERVAL_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
struct ReleaseDoc {
    version: String,
}

/// Throttled latest-version refresher
pub struct UpdateChecker {
    config: Arc<ConfigStore>,
    client: DownloadClient,
    release_url: String,
}

impl UpdateChecker {
    pub fn new(config: Arc<ConfigStore>, client: DownloadClient) -> Self {
        Self { config, client, release_url: RELEASE_URL.to_string() }
    }

    pub fn with_release_url(mut self, url: impl Into<String>) -> Self {
        self.release_url = url.into();
        self
    }

    /// Refresh the cached latest version when the check is enabled and the
    /// throttle window has passed. Returns the cached latest version (old
    /// or new); network failures keep the previous value.
    pub async fn check(&self) -> SpinResult<Option<String>> {
        let config = self.config.load().await?;
        if !config.update.auto_check_enabled {
            return Ok(config.update.latest_version);
        }
        let due = match config.update.last_check {
            Some(last) => Utc::now() - last >= Duration::hours(CHECK_INTERVAL_HOURS),
            None => true,
        };
        if !due {
            debug!("🕐 Update check throttled (last {:?})", config.update.last_check);
            return Ok(config.update.latest_version);
        }

        match self.client.get_json::<ReleaseDoc>(&self.release_url).await {
            Ok(release) => {
                let updated = self
                    .config
                    .update(|c| {
                        c.update.latest_version = Some(release.version.clone());
                        c.update.last_check = Some(Utc::now());
                    })
                    .await?;
                Ok(updated.update.latest_version)
            }
            Err(err) => {
                // Advisory only: record the attempt, keep the old answer
                warn!("🌐 Update check failed: {}", err);
                let updated = self.config.update(|c| c.update.last_check = Some(Utc::now())).await?;
                Ok(updated.update.latest_version)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::paths::SpinPaths;

    #[tokio::test]
    async fn test_disabled_check_returns_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::new(SpinPaths::new(tmp.path()).config_file()));
        config
            .update(|c| {
                c.update.auto_check_enabled = false;
                c.update.latest_version = Some("0.4.0".to_string());
            })
            .await
            .unwrap();

        let checker =
            UpdateChecker::new(Arc::clone(&config), DownloadClient::with_defaults().unwrap())
                .with_release_url("http://127.0.0.1:1/release.json");
        assert_eq!(checker.check().await.unwrap(), Some("0.4.0".to_string()));
    }

    #[tokio::test]
    async fn test_throttled_check_skips_network() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::new(SpinPaths::new(tmp.path()).config_file()));
        config
            .update(|c| {
                c.update.last_check = Some(Utc::now());
                c.update.latest_version = Some("0.4.1".to_string());
            })
            .await
            .unwrap();

        // Unroutable URL: a network attempt would fail, not return 0.4.1
        let checker =
            UpdateChecker::new(Arc::clone(&config), DownloadClient::with_defaults().unwrap())
                .with_release_url("http://127.0.0.1:1/release.json");
        assert_eq!(checker.check().await.unwrap(), Some("0.4.1".to_string()));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_value() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::new(SpinPaths::new(tmp.path()).config_file()));
        config
            .update(|c| {
                c.update.last_check = Some(Utc::now() - Duration::hours(48));
                c.update.latest_version = Some("0.3.9".to_string());
            })
            .await
            .unwrap();

        let checker =
            UpdateChecker::new(Arc::clone(&config), DownloadClient::with_defaults().unwrap())
                .with_release_url("http://127.0.0.1:1/release.json");
        assert_eq!(checker.check().await.unwrap(), Some("0.3.9".to_string()));
        // The failed attempt still stamps last_check
        let after = config.load().await.unwrap();
        assert!(Utc::now() - after.update.last_check.unwrap() < Duration::minutes(1));
    }
}
