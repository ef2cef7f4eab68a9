//! TransferClient: the `Storage` capability over an `ObjectBackend`

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use pgsafe_core::{PgsafeConfig, RemoteObject};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{ObjectBackend, OpendalBackend};
use crate::error::{TransferError, TransferResult};
use crate::multipart::upload_multipart;
use crate::retry::RetryPolicy;
use crate::storage::Storage;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Key prefix inside the bucket, without leading or trailing slashes
    pub prefix: String,
    /// Base of download references: `{url_base}/{key}`
    pub url_base: String,
    /// Files at or above this size go through a multi-part session
    pub multipart_threshold: u64,
    pub chunk_size: u64,
    pub upload_timeout: Duration,
    pub retry: RetryPolicy,
}

impl TransferSettings {
    pub fn from_config(cfg: &PgsafeConfig) -> Self {
        let storage = &cfg.storage;
        let url_base = match storage.public_url.as_deref().filter(|u| !u.is_empty()) {
            Some(public) => public.trim_end_matches('/').to_string(),
            None => format!(
                "{}/{}",
                storage.endpoint.trim_end_matches('/'),
                storage.bucket
            ),
        };
        Self {
            prefix: storage.prefix.trim_matches('/').to_string(),
            url_base,
            multipart_threshold: storage.multipart_threshold_bytes,
            chunk_size: storage.multipart_chunk_bytes,
            upload_timeout: storage.upload_timeout(),
            retry: RetryPolicy::from_config(&cfg.retry),
        }
    }
}

pub struct TransferClient {
    backend: Arc<dyn ObjectBackend>,
    settings: TransferSettings,
}

impl TransferClient {
    pub fn new(backend: Arc<dyn ObjectBackend>, settings: TransferSettings) -> Self {
        Self { backend, settings }
    }

    /// Validate the storage section and build an OpenDAL-backed client.
    pub fn from_config(cfg: &PgsafeConfig) -> anyhow::Result<Self> {
        cfg.validate_storage()
            .context("invalid storage configuration")?;
        let op = crate::operator::build_from_core_config(&cfg.storage)?;
        let chunk = usize::try_from(cfg.storage.multipart_chunk_bytes)
            .context("storage.multipart_chunk_bytes does not fit in memory")?;
        let backend = OpendalBackend::new(op, chunk);
        Ok(Self::new(
            Arc::new(backend),
            TransferSettings::from_config(cfg),
        ))
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Full object key for a logical name
    pub fn key_for(&self, name: &str) -> String {
        let name = name.trim_start_matches('/');
        if self.settings.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.settings.prefix)
        }
    }

    pub fn download_url(&self, name: &str) -> String {
        format!("{}/{}", self.settings.url_base, self.key_for(name))
    }

    async fn put_file(
        &self,
        local: &Path,
        key: &str,
        cancel: &CancellationToken,
    ) -> TransferResult<()> {
        let body = Bytes::from(
            tokio::fs::read(local)
                .await
                .map_err(|e| TransferError::io("reading", local, e))?,
        );
        self.settings
            .retry
            .run("put object", cancel, || self.backend.put(key, body.clone()))
            .await
    }
}

#[async_trait]
impl Storage for TransferClient {
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> TransferResult<String> {
        let key = self.key_for(remote);
        let size = tokio::fs::metadata(local)
            .await
            .map_err(|e| TransferError::io("reading metadata of", local, e))?
            .len();
        let multipart = size >= self.settings.multipart_threshold;

        info!(
            file = %local.display(),
            key = %key,
            size_mb = %format!("{:.2}", size as f64 / MIB),
            multipart,
            "uploading"
        );
        let started = Instant::now();

        let deadline = Deadline::start(cancel, self.settings.upload_timeout);
        let result = if multipart {
            upload_multipart(
                self.backend.as_ref(),
                &self.settings.retry,
                local,
                &key,
                size,
                self.settings.chunk_size,
                deadline.token(),
            )
            .await
            .map(|_| ())
        } else {
            self.put_file(local, &key, deadline.token()).await
        };
        deadline.finish(result)?;

        info!(
            key = %key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "upload complete"
        );
        Ok(self.download_url(remote))
    }

    async fn download(
        &self,
        remote: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> TransferResult<u64> {
        let key = self.key_for(remote);
        let mut stream = self
            .settings
            .retry
            .run("get object", cancel, || self.backend.get(&key))
            .await?;

        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io("creating", parent, e))?;
        }
        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| TransferError::io("creating", local, e))?;

        let copied: TransferResult<u64> = async {
            let mut written = 0u64;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TransferError::cancelled("get object")),
                    n = stream.next() => n,
                };
                let Some(chunk) = next else { break };
                let chunk = chunk.map_err(|e| TransferError::io("streaming into", local, e))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| TransferError::io("writing", local, e))?;
                written += chunk.len() as u64;
            }
            file.sync_all()
                .await
                .map_err(|e| TransferError::io("syncing", local, e))?;
            Ok(written)
        }
        .await;

        match copied {
            Ok(written) => {
                info!(key = %key, file = %local.display(), bytes = written, "download complete");
                Ok(written)
            }
            Err(err) => {
                drop(file);
                if let Err(e) = tokio::fs::remove_file(local).await {
                    warn!(file = %local.display(), error = %e, "failed to remove partial download");
                }
                Err(err)
            }
        }
    }

    async fn delete(&self, remote: &str, cancel: &CancellationToken) -> TransferResult<()> {
        let key = self.key_for(remote);
        self.settings
            .retry
            .run("delete object", cancel, || self.backend.delete(&key))
            .await
    }

    async fn list(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> TransferResult<Vec<RemoteObject>> {
        let root = if self.settings.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.settings.prefix)
        };
        let full = format!("{root}{}", prefix.trim_start_matches('/'));

        let objects = self
            .settings
            .retry
            .run("list objects", cancel, || self.backend.list(&full))
            .await?;

        Ok(objects
            .into_iter()
            .filter_map(|obj| {
                let name = obj.name.strip_prefix(root.as_str())?.to_string();
                (!name.is_empty()).then_some(RemoteObject { name, ..obj })
            })
            .collect())
    }

    async fn check_health(&self) -> TransferResult<()> {
        let root = if self.settings.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.settings.prefix)
        };
        crate::health::check_health(self.backend.as_ref(), &root).await
    }
}

/// Child cancellation token that also fires when `timeout` elapses.
///
/// `finish` reports a deadline expiry as `DeadlineExceeded` instead of the
/// `Cancelled` the inner operation observed.
struct Deadline {
    parent: CancellationToken,
    token: CancellationToken,
    timeout: Duration,
    timer: JoinHandle<()>,
}

impl Deadline {
    fn start(parent: &CancellationToken, timeout: Duration) -> Self {
        let token = parent.child_token();
        let fire = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            fire.cancel();
        });
        Self {
            parent: parent.clone(),
            token,
            timeout,
            timer,
        }
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn finish<T>(&self, result: TransferResult<T>) -> TransferResult<T> {
        match result {
            Err(TransferError::Cancelled { operation })
                if self.token.is_cancelled() && !self.parent.is_cancelled() =>
            {
                Err(TransferError::DeadlineExceeded {
                    operation,
                    timeout: self.timeout,
                })
            }
            other => other,
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeBackend, Op};
    use chrono::Utc;
    use opendal::ErrorKind;
    use tempfile::TempDir;

    fn settings(prefix: &str) -> TransferSettings {
        TransferSettings {
            prefix: prefix.to_string(),
            url_base: "https://r2.example.com/backups".to_string(),
            multipart_threshold: 16,
            chunk_size: 8,
            upload_timeout: Duration::from_secs(60),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            },
        }
    }

    fn client(backend: &Arc<FakeBackend>, prefix: &str) -> TransferClient {
        TransferClient::new(backend.clone(), settings(prefix))
    }

    fn source(dir: &TempDir, len: usize) -> std::path::PathBuf {
        let path = dir.path().join("misskey_2025-08-28_21-35.dump.zst");
        std::fs::write(&path, vec![7u8; len]).unwrap();
        path
    }

    #[test]
    fn test_settings_from_config() {
        let mut cfg = PgsafeConfig::default();
        cfg.storage.endpoint = "https://acct.r2.cloudflarestorage.com/".into();
        cfg.storage.bucket = "backups".into();
        cfg.storage.prefix = "/misskey/".into();

        let s = TransferSettings::from_config(&cfg);
        assert_eq!(s.prefix, "misskey");
        assert_eq!(s.url_base, "https://acct.r2.cloudflarestorage.com/backups");
        assert_eq!(s.retry.max_attempts, 6);

        cfg.storage.public_url = Some("https://backups.example.com/".into());
        let s = TransferSettings::from_config(&cfg);
        assert_eq!(s.url_base, "https://backups.example.com");
    }

    #[test]
    fn test_keys_and_urls() {
        let backend = Arc::new(FakeBackend::new());
        let c = client(&backend, "misskey");
        assert_eq!(c.key_for("a.dump.zst"), "misskey/a.dump.zst");
        assert_eq!(
            c.download_url("a.dump.zst"),
            "https://r2.example.com/backups/misskey/a.dump.zst"
        );
        assert_eq!(client(&backend, "").key_for("a.dump.zst"), "a.dump.zst");
    }

    #[tokio::test]
    async fn test_small_file_uses_single_put() {
        let tmp = TempDir::new().unwrap();
        let src = source(&tmp, 10);
        let backend = Arc::new(FakeBackend::new());

        let url = client(&backend, "misskey")
            .upload(&src, "misskey_2025-08-28_21-35.dump.zst", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            url,
            "https://r2.example.com/backups/misskey/misskey_2025-08-28_21-35.dump.zst"
        );
        assert_eq!(
            backend.ops(),
            vec![Op::Put("misskey/misskey_2025-08-28_21-35.dump.zst".into())]
        );
    }

    #[tokio::test]
    async fn test_threshold_size_uses_multipart() {
        let tmp = TempDir::new().unwrap();
        let src = source(&tmp, 16);
        let backend = Arc::new(FakeBackend::new());

        client(&backend, "misskey")
            .upload(&src, "big.dump.zst", &CancellationToken::new())
            .await
            .unwrap();

        let ops = backend.ops();
        assert_eq!(ops.first(), Some(&Op::CreateMultipart));
        assert_eq!(ops.last(), Some(&Op::Complete(vec![1, 2])));
        assert_eq!(backend.object("misskey/big.dump.zst").unwrap(), vec![7u8; 16]);
    }

    #[tokio::test]
    async fn test_put_retries_transient_failure() {
        let tmp = TempDir::new().unwrap();
        let src = source(&tmp, 4);
        let backend = Arc::new(FakeBackend::new());
        backend.fail_next(
            "put",
            opendal::Error::new(ErrorKind::Unexpected, "500").set_temporary(),
        );

        client(&backend, "")
            .upload(&src, "a", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(backend.ops().len(), 2);
        assert!(backend.object("a").is_some());
    }

    #[tokio::test]
    async fn test_list_strips_prefix() {
        let backend = Arc::new(FakeBackend::new());
        let now = Utc::now();
        backend.insert("misskey/a.dump.zst", b"1", now);
        backend.insert("misskey/b.dump.zst.enc", b"22", now);
        backend.insert("elsewhere/c", b"333", now);

        let mut listed = client(&backend, "misskey")
            .list("", &CancellationToken::new())
            .await
            .unwrap();
        listed.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<_> = listed.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a.dump.zst", "b.dump.zst.enc"]);
        assert_eq!(listed[1].size, 2);
        assert_eq!(backend.ops(), vec![Op::List("misskey/".into())]);
    }

    #[tokio::test]
    async fn test_download_overwrites_local_file() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("restore").join("a.dump.zst");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"stale contents that are longer").unwrap();

        let backend = Arc::new(FakeBackend::new());
        backend.insert("misskey/a.dump.zst", b"fresh bytes", Utc::now());

        let written = client(&backend, "misskey")
            .download("a.dump.zst", &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh bytes");
    }

    #[tokio::test]
    async fn test_delete_permission_denied_is_terminal() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_next("delete", opendal::Error::new(ErrorKind::PermissionDenied, "403"));

        let err = client(&backend, "misskey")
            .delete("a", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Terminal { .. }));
        assert_eq!(backend.ops().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_deadline_reported_as_deadline_exceeded() {
        let tmp = TempDir::new().unwrap();
        let src = source(&tmp, 4);
        let backend = Arc::new(FakeBackend::new());
        for _ in 0..3 {
            backend.fail_next(
                "put",
                opendal::Error::new(ErrorKind::Unexpected, "503").set_temporary(),
            );
        }

        let mut s = settings("");
        s.upload_timeout = Duration::from_millis(7);
        s.retry.max_attempts = 10;
        s.retry.base_delay = Duration::from_millis(100);
        s.retry.max_delay = Duration::from_millis(100);
        let c = TransferClient::new(backend.clone(), s);

        let err = c
            .upload(&src, "a", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::DeadlineExceeded { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_caller_cancel_is_not_a_deadline() {
        let tmp = TempDir::new().unwrap();
        let src = source(&tmp, 4);
        let backend = Arc::new(FakeBackend::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client(&backend, "")
            .upload(&src, "a", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled { .. }));
    }
}
