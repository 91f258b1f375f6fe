//! HTTP download client for engine binary archives
//!
//! Thin reqwest wrapper tuned for large archive downloads: streaming to
//! disk, an absolute per-attempt timeout, cooperative cancellation, and a
//! progress callback for the UI collaborator.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, ClientBuilder, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::errors::{SpinError, SpinResult};

/// Progress callback: (bytes downloaded, total bytes when known)
pub type ProgressFn = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Configuration for download behavior
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Absolute cap for one download attempt
    pub timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(20),
            user_agent: format!("spindb/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Streaming download client
#[derive(Debug, Clone)]
pub struct DownloadClient {
    client: Client,
    config: DownloadConfig,
}

impl DownloadClient {
    pub fn new(config: DownloadConfig) -> SpinResult<Self> {
        let client = ClientBuilder::new()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn with_defaults() -> SpinResult<Self> {
        Self::new(DownloadConfig::default())
    }

    /// Stream `url` into `dest`, creating parent directories.
    ///
    /// 404 fails with a "version not available" shaped `DownloadFailed`;
    /// other non-success statuses carry the status line. The absolute
    /// timeout covers the whole body, not just the first byte. On any
    /// failure the partial file is removed.
    pub async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> SpinResult<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SpinError::io(format!("create {}", parent.display()), e))?;
        }

        let attempt = self.stream_body(url, dest, cancel, progress);
        let outcome = tokio::select! {
            r = tokio::time::timeout(self.config.timeout, attempt) => match r {
                Ok(inner) => inner,
                Err(_) => Err(SpinError::download_failed(
                    url,
                    format!("timed out after {}s", self.config.timeout.as_secs()),
                )),
            },
            () = cancel.cancelled() => Err(SpinError::CancelledByCaller),
        };

        match outcome {
            Ok(bytes) => {
                info!("📦 Downloaded {} bytes from {}", bytes, url);
                Ok(bytes)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(dest).await;
                Err(err)
            }
        }
    }

    async fn stream_body(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> SpinResult<u64> {
        debug!("⬇️ GET {}", url);
        let response = self.client.get(url).send().await.map_err(|e| {
            SpinError::download_failed(url, e)
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(SpinError::download_failed(url, "version not available (404)"));
            }
            status if !status.is_success() => {
                return Err(SpinError::download_failed(url, format!("HTTP {status}")));
            }
            _ => {}
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| SpinError::io(format!("create {}", dest.display()), e))?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(SpinError::CancelledByCaller);
            }
            let chunk = chunk.map_err(|e| SpinError::download_failed(url, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| SpinError::io(format!("write {}", dest.display()), e))?;
            downloaded += chunk.len() as u64;
            if let Some(progress) = progress {
                progress(downloaded, total);
            }
        }
        file.flush().await.map_err(|e| SpinError::io(format!("flush {}", dest.display()), e))?;
        Ok(downloaded)
    }

    /// GET a small JSON document (release metadata)
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> SpinResult<T> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout_is_five_minutes() {
        let config = DownloadConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_connect() {
        let client = DownloadClient::with_defaults().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .download_to_file(
                "http://127.0.0.1:1/never.tar.gz",
                &tmp.path().join("never.tar.gz"),
                &cancel,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SpinError::CancelledByCaller | SpinError::DownloadFailed { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_download_failed() {
        let client = DownloadClient::with_defaults().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("x.tar.gz");
        let err = client
            .download_to_file("http://127.0.0.1:1/x.tar.gz", &dest, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SpinError::DownloadFailed { .. }));
        assert!(!dest.exists());
    }
}
