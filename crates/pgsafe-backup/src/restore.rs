//! Restore: download an artifact by URL, then decrypt and decompress it.
//!
//! Only the final `.dump` survives a successful restore. On any failure
//! nothing is left behind, in particular no partially decrypted file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use pgsafe_core::types::DownloadedArtifact;
use pgsafe_crypto::{decrypt_file, DerivedKeys};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::Codec;
use crate::error::RestoreError;

const MIB: u64 = 1024 * 1024;
/// Progress step when the total size is known
const PERCENT_STEP: u64 = 5;
/// Progress cadence when the total size is unknown
const BYTES_STEP: u64 = 10 * MIB;
const TIME_STEP: Duration = Duration::from_secs(15);

/// A progress line worth logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressReport {
    Percent {
        percent: u64,
        downloaded: u64,
        total: u64,
    },
    Bytes {
        downloaded: u64,
    },
}

/// Throttles download progress reporting: every 5 percentage points when
/// the size is known, else every 10 MiB or 15 s, whichever comes first.
#[derive(Debug)]
pub struct DownloadProgress {
    total: Option<u64>,
    downloaded: u64,
    last_percent: u64,
    last_bytes: u64,
    last_at: Instant,
}

impl DownloadProgress {
    pub fn new(total: Option<u64>, now: Instant) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            downloaded: 0,
            last_percent: 0,
            last_bytes: 0,
            last_at: now,
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn record(&mut self, bytes: u64, now: Instant) -> Option<ProgressReport> {
        self.downloaded += bytes;
        match self.total {
            Some(total) => {
                let percent = self.downloaded.saturating_mul(100) / total;
                (percent >= self.last_percent + PERCENT_STEP).then(|| {
                    self.last_percent = percent;
                    ProgressReport::Percent {
                        percent,
                        downloaded: self.downloaded,
                        total,
                    }
                })
            }
            None => {
                let due = self.downloaded - self.last_bytes >= BYTES_STEP
                    || now.duration_since(self.last_at) >= TIME_STEP;
                due.then(|| {
                    self.last_bytes = self.downloaded;
                    self.last_at = now;
                    ProgressReport::Bytes {
                        downloaded: self.downloaded,
                    }
                })
            }
        }
    }
}

fn mb(bytes: u64) -> String {
    format!("{:.1}", bytes as f64 / MIB as f64)
}

/// Removes every tracked path on drop unless it was kept
struct Cleanup {
    paths: Vec<PathBuf>,
}

impl Cleanup {
    fn keep(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %path.display(), error = %e, "failed to remove restore intermediate"),
            }
        }
    }
}

/// The last non-empty path segment of `url`, which becomes the local file name
pub fn file_name_from_url(url: &str) -> Result<String, RestoreError> {
    let invalid = |reason: &str| RestoreError::InvalidDownloadUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };
    let parsed = reqwest::Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("only http and https URLs are supported"));
    }
    let name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        return Err(invalid("URL has no file name in its path"));
    }
    Ok(name.to_string())
}

pub struct RestoreRetriever {
    restore_dir: PathBuf,
    codec: Arc<dyn Codec>,
    keys: Option<DerivedKeys>,
    http: reqwest::Client,
}

impl RestoreRetriever {
    pub fn new(restore_dir: PathBuf, codec: Arc<dyn Codec>, keys: Option<DerivedKeys>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            restore_dir,
            codec,
            keys,
            http,
        }
    }

    /// Download `url` into the restore directory and turn it into a `.dump`.
    /// Returns the path of the restored dump.
    pub async fn retrieve_from_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RestoreError> {
        let name = file_name_from_url(url)?;
        let artifact =
            DownloadedArtifact::from_file_name(&name).ok_or_else(|| RestoreError::InvalidDownloadUrl {
                url: url.to_string(),
                reason: format!("{name} is not a .zst or .zst.enc backup artifact"),
            })?;
        let keys = match (artifact.encrypted, &self.keys) {
            (true, None) => return Err(RestoreError::MissingKey),
            (true, Some(keys)) => Some(keys.clone()),
            (false, _) => None,
        };

        tokio::fs::create_dir_all(&self.restore_dir)
            .await
            .map_err(|e| RestoreError::io("creating", &self.restore_dir, e))?;

        let downloaded = self.restore_dir.join(&name);
        let compressed = self.restore_dir.join(&artifact.compressed_name);
        let dump = self.restore_dir.join(&artifact.dump_name);
        let mut cleanup = Cleanup {
            paths: vec![downloaded.clone(), compressed.clone(), dump.clone()],
        };

        self.download(url, &downloaded, cancel).await?;

        if let Some(keys) = keys {
            info!(file = %downloaded.display(), "decrypting");
            let (src, dst) = (downloaded.clone(), compressed.clone());
            tokio::task::spawn_blocking(move || decrypt_file(&src, &dst, &keys))
                .await
                .map_err(RestoreError::Task)??;
            if cancel.is_cancelled() {
                return Err(RestoreError::Cancelled);
            }
        }

        self.codec
            .decompress(&compressed, &dump, cancel)
            .await
            .map_err(RestoreError::DecompressionFailed)?;

        cleanup.keep(&dump);
        drop(cleanup);

        info!(file = %dump.display(), "restored backup file");
        Ok(dump)
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), RestoreError> {
        let failed = |reason: String| RestoreError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        info!(url, "downloading backup file");
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
            r = self.http.get(url).send() => r,
        };
        let resp = sent.map_err(|e| failed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(failed(format!("HTTP status {}", resp.status())));
        }

        let total = resp.content_length();
        if let Some(total) = total {
            info!(size_mb = %mb(total), "download size");
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| RestoreError::io("creating", dest, e))?;
        let mut progress = DownloadProgress::new(total, Instant::now());
        let mut body = resp.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
                n = body.next() => n,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| failed(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| RestoreError::io("writing", dest, e))?;

            match progress.record(chunk.len() as u64, Instant::now()) {
                Some(ProgressReport::Percent {
                    percent,
                    downloaded,
                    total,
                }) => info!(
                    percent,
                    downloaded_mb = %mb(downloaded),
                    total_mb = %mb(total),
                    "downloading"
                ),
                Some(ProgressReport::Bytes { downloaded }) => {
                    info!(downloaded_mb = %mb(downloaded), "downloading")
                }
                None => {}
            }
        }

        file.sync_all()
            .await
            .map_err(|e| RestoreError::io("syncing", dest, e))?;
        info!(
            file = %dest.display(),
            size_mb = %mb(progress.downloaded()),
            "download completed"
        );
        Ok(())
    }
}
