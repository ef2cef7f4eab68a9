//! Backup orchestrator: Dumping → Compressing → (Encrypting) → Uploading → Pruning → Done

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local, TimeZone, Utc};
use pgsafe_core::{ArtifactName, BackupResult, PgsafeConfig};
use pgsafe_crypto::{derive_keys, encrypt_file, CryptoResult, DerivedKeys};
use pgsafe_storage::Storage;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{codec_from_config, Codec};
use crate::dump::{DumpProducer, PgDump};
use crate::error::{BackupError, RestoreError, Stage};
use crate::prune::prune_expired;
use crate::restore::RestoreRetriever;

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub database: String,
    pub work_dir: PathBuf,
    pub retention_days: u32,
}

impl BackupSettings {
    pub fn from_config(cfg: &PgsafeConfig) -> Self {
        Self {
            database: cfg.database.name.clone(),
            work_dir: cfg.backup.work_dir.clone(),
            retention_days: cfg.backup.retention_days,
        }
    }
}

/// Derive keys from an optional key string. `None` and empty both mean "no encryption".
pub fn keys_from_material(material: Option<&SecretString>) -> CryptoResult<Option<DerivedKeys>> {
    match material {
        Some(m) if !m.expose_secret().is_empty() => derive_keys(m).map(Some),
        _ => Ok(None),
    }
}

/// The local files one run may create. Dropping it deletes all of them.
struct WorkingFiles {
    dump: PathBuf,
    compressed: PathBuf,
    encrypted: PathBuf,
}

impl WorkingFiles {
    fn new(dir: &Path, name: &ArtifactName) -> Self {
        Self {
            dump: dir.join(name.dump()),
            compressed: dir.join(name.compressed()),
            encrypted: dir.join(name.encrypted()),
        }
    }
}

impl Drop for WorkingFiles {
    fn drop(&mut self) {
        for path in [&self.dump, &self.compressed, &self.encrypted] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(file = %path.display(), "removed working file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %path.display(), error = %e, "failed to remove working file"),
            }
        }
    }
}

pub struct BackupService {
    settings: BackupSettings,
    dumper: Arc<dyn DumpProducer>,
    codec: Arc<dyn Codec>,
    storage: Arc<dyn Storage>,
    keys: Option<DerivedKeys>,
    restorer: RestoreRetriever,
}

impl BackupService {
    pub fn new(
        settings: BackupSettings,
        dumper: Arc<dyn DumpProducer>,
        codec: Arc<dyn Codec>,
        storage: Arc<dyn Storage>,
        keys: Option<DerivedKeys>,
        restore_dir: PathBuf,
    ) -> Self {
        let restorer = RestoreRetriever::new(restore_dir, codec.clone(), keys.clone());
        Self {
            settings,
            dumper,
            codec,
            storage,
            keys,
            restorer,
        }
    }

    /// Wire up pg_dump, the configured codec and the configured key.
    ///
    /// Pass [`pgsafe_storage::UnconfiguredStorage`] for restore-only use.
    pub fn from_config(cfg: &PgsafeConfig, storage: Arc<dyn Storage>) -> CryptoResult<Self> {
        let keys = keys_from_material(cfg.encryption.key.as_ref())?;
        Ok(Self::new(
            BackupSettings::from_config(cfg),
            Arc::new(PgDump::new(cfg.backup.pg_dump_binary.clone(), &cfg.database)),
            codec_from_config(&cfg.backup),
            storage,
            keys,
            cfg.backup.restore_dir.clone(),
        ))
    }

    pub fn encryption_enabled(&self) -> bool {
        self.keys.is_some()
    }

    pub async fn create_backup(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BackupResult, BackupError> {
        self.create_backup_at(Local::now(), cancel).await
    }

    /// Run the pipeline once, naming artifacts after `now`.
    ///
    /// Every local file the run creates is gone by the time this returns,
    /// whichever way it returns.
    pub async fn create_backup_at<Tz>(
        &self,
        now: DateTime<Tz>,
        cancel: &CancellationToken,
    ) -> Result<BackupResult, BackupError>
    where
        Tz: TimeZone,
        Tz::Offset: Display + Send + Sync,
    {
        let started = Instant::now();
        if !self.storage.is_configured() {
            return Err(BackupError::StorageNotConfigured);
        }

        let work_dir = &self.settings.work_dir;
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|source| BackupError::Io {
                stage: Stage::Dumping,
                context: format!("creating {}", work_dir.display()),
                source,
            })?;

        let name = ArtifactName::new(&self.settings.database, &now);
        let files = WorkingFiles::new(work_dir, &name);
        info!(backup = %name.stem(), "starting backup");

        enter(Stage::Dumping);
        self.dumper
            .dump(&files.dump, cancel)
            .await
            .map_err(BackupError::DumpFailed)?;

        enter(Stage::Compressing);
        self.codec
            .compress(&files.dump, &files.compressed, cancel)
            .await
            .map_err(BackupError::CompressionFailed)?;

        let upload_path = match &self.keys {
            Some(keys) => {
                enter(Stage::Encrypting);
                let (src, dst, keys) = (
                    files.compressed.clone(),
                    files.encrypted.clone(),
                    keys.clone(),
                );
                tokio::task::spawn_blocking(move || encrypt_file(&src, &dst, &keys))
                    .await
                    .map_err(|source| BackupError::Task {
                        stage: Stage::Encrypting,
                        source,
                    })?
                    .map_err(BackupError::EncryptionFailed)?;
                &files.encrypted
            }
            None => &files.compressed,
        };

        let file_size = tokio::fs::metadata(upload_path)
            .await
            .map_err(|source| BackupError::Io {
                stage: Stage::Uploading,
                context: format!("reading metadata of {}", upload_path.display()),
                source,
            })?
            .len();
        let encrypted = self.keys.is_some();
        let file_name = name.final_name(encrypted);

        enter(Stage::Uploading);
        let download_url = self
            .storage
            .upload(upload_path, &file_name, cancel)
            .await
            .map_err(BackupError::UploadFailed)?;

        enter(Stage::Pruning);
        let pruned_objects = match prune_expired(
            self.storage.as_ref(),
            self.settings.retention_days,
            now.with_timezone(&Utc),
            cancel,
        )
        .await
        {
            Ok(report) => report.deleted.len(),
            Err(e) => {
                warn!(error = %e, "retention pruning failed; backup itself succeeded");
                0
            }
        };

        enter(Stage::Done);
        let result = BackupResult {
            file_name,
            file_size,
            duration: started.elapsed(),
            download_url,
            encrypted,
            pruned_objects,
        };
        info!(
            file = %result.file_name,
            size_mb = %format!("{:.2}", result.file_size as f64 / 1024.0 / 1024.0),
            duration_ms = result.duration.as_millis() as u64,
            encrypted,
            "backup completed successfully"
        );
        Ok(result)
    }

    /// Download and restore an artifact. See [`RestoreRetriever::retrieve_from_url`].
    pub async fn retrieve_from_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RestoreError> {
        self.restorer.retrieve_from_url(url, cancel).await
    }
}

fn enter(stage: Stage) {
    debug!(%stage, "entering stage");
}
