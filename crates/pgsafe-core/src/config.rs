use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

const MIB: u64 = 1024 * 1024;

/// S3 requires every part except the last to be at least 5 MiB.
pub const MIN_MULTIPART_CHUNK_BYTES: u64 = 5 * MIB;

/// Secrets never serialize; a set secret renders as a placeholder.
fn redact<T, S: Serializer>(secret: &Option<T>, serializer: S) -> Result<S::Ok, S::Error> {
    match secret {
        Some(_) => serializer.serialize_str("<redacted>"),
        None => serializer.serialize_none(),
    }
}

/// Top-level configuration (loaded from pgsafe.toml, then overridden from the environment)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PgsafeConfig {
    pub database: DatabaseConfig,
    pub backup: BackupConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub encryption: EncryptionConfig,
    pub notification: NotificationConfig,
    pub schedule: ScheduleConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(serialize_with = "redact")]
    pub password: Option<SecretString>,
    /// Database name; also the leading component of every artifact name
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Shell out to the `zstd` binary
    External,
    /// In-process zstd
    Builtin,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Local working directory for intermediate artifacts
    pub work_dir: PathBuf,
    /// Directory restored dumps are written to
    pub restore_dir: PathBuf,
    /// Remote objects older than this many days are pruned
    pub retention_days: u32,
    pub compression_level: i32,
    pub codec: CodecKind,
    pub zstd_binary: PathBuf,
    pub pg_dump_binary: PathBuf,
    /// Upper bound on one scheduled run (dump through prune)
    pub run_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3-compatible endpoint (e.g. https://<account>.r2.cloudflarestorage.com)
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// Key prefix every artifact is stored under
    pub prefix: String,
    pub access_key_id: Option<String>,
    #[serde(serialize_with = "redact")]
    pub secret_access_key: Option<SecretString>,
    /// Public base URL for download references; falls back to endpoint/bucket
    pub public_url: Option<String>,
    /// Enforce HTTPS for S3 connections (error on HTTP endpoints)
    pub enforce_tls: bool,
    pub upload_timeout_secs: u64,
    /// Files at or above this size use multi-part upload
    pub multipart_threshold_bytes: u64,
    pub multipart_chunk_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per remote operation, first attempt included
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Key material (base64 or raw text, at least 32 bytes). Unset disables encryption.
    #[serde(serialize_with = "redact")]
    pub key: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    /// The URL embeds the webhook token, so it is treated as a secret
    #[serde(serialize_with = "redact")]
    pub discord_webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Seconds between scheduled runs
    pub interval_secs: u64,
    /// Run once at startup when the first tick is more than 30 minutes away
    pub run_on_start: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    pub debug: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: None,
            name: "misskey".into(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/pgsafe/backups"),
            restore_dir: PathBuf::from("restore"),
            retention_days: 30,
            compression_level: 3,
            codec: CodecKind::External,
            zstd_binary: PathBuf::from("zstd"),
            pg_dump_binary: PathBuf::from("pg_dump"),
            run_timeout_secs: 30 * 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: "auto".into(),
            bucket: String::new(),
            prefix: String::new(),
            access_key_id: None,
            secret_access_key: None,
            public_url: None,
            enforce_tls: false,
            upload_timeout_secs: 120 * 60,
            multipart_threshold_bytes: 100 * MIB,
            multipart_chunk_bytes: 100 * MIB,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            discord_webhook_url: None,
            timeout_secs: 30,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 12 * 60 * 60,
            run_on_start: true,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "text".into(),
            debug: false,
        }
    }
}

impl PgsafeConfig {
    /// Load from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides using the process environment.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("POSTGRES_HOST") {
            self.database.host = v;
        }
        if let Some(v) = get("POSTGRES_PORT") {
            self.database.port = v.parse().map_err(|e| ConfigError::Invalid {
                key: "POSTGRES_PORT",
                reason: format!("{e}"),
            })?;
        }
        if let Some(v) = get("POSTGRES_USER") {
            self.database.user = v;
        }
        if let Some(v) = get("POSTGRES_PASSWORD") {
            self.database.password = Some(SecretString::from(v));
        }
        if let Some(v) = get("POSTGRES_DB") {
            self.database.name = v;
        }
        if let Some(v) = get("BACKUP_ENDPOINT") {
            self.storage.endpoint = v;
        }
        if let Some(v) = get("BACKUP_ACCESS_KEY_ID").or_else(|| get("AWS_ACCESS_KEY_ID")) {
            self.storage.access_key_id = Some(v);
        }
        if let Some(v) = get("BACKUP_SECRET_ACCESS_KEY").or_else(|| get("AWS_SECRET_ACCESS_KEY")) {
            self.storage.secret_access_key = Some(SecretString::from(v));
        }
        if let Some(v) = get("R2_BUCKET_NAME") {
            self.storage.bucket = v;
        }
        if let Some(v) = get("R2_PREFIX") {
            self.storage.prefix = v;
        }
        if let Some(v) = get("BACKUP_ENCRYPTION_KEY") {
            self.encryption.key = Some(SecretString::from(v));
        }
        Ok(())
    }

    /// TOML rendering with every secret replaced by a placeholder
    pub fn to_redacted_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Whether a non-empty encryption key is configured.
    pub fn encryption_enabled(&self) -> bool {
        self.encryption
            .key
            .as_ref()
            .is_some_and(|k| !k.expose_secret().is_empty())
    }

    /// Validate everything a backup run needs: database, storage credentials, tuning.
    pub fn validate_for_backup(&self) -> ConfigResult<()> {
        if self.database.host.is_empty() {
            return Err(ConfigError::Missing("database.host"));
        }
        if self.database.name.is_empty() {
            return Err(ConfigError::Missing("database.name"));
        }
        if self.database.user.is_empty() {
            return Err(ConfigError::Missing("database.user"));
        }
        self.validate_storage()?;

        if self.backup.retention_days == 0 {
            return Err(ConfigError::Invalid {
                key: "backup.retention_days",
                reason: "must be at least 1".into(),
            });
        }
        if !(1..=22).contains(&self.backup.compression_level) {
            return Err(ConfigError::Invalid {
                key: "backup.compression_level",
                reason: format!("{} is outside 1..=22", self.backup.compression_level),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "retry.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid {
                key: "retry.base_delay_ms",
                reason: "must not exceed retry.max_delay_ms".into(),
            });
        }
        Ok(())
    }

    /// Everything `validate_for_backup` checks, plus the scheduler cadence.
    pub fn validate_for_daemon(&self) -> ConfigResult<()> {
        self.validate_for_backup()?;
        if self.schedule.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "schedule.interval_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.backup.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "backup.run_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Validate the object store section on its own (used by `list` too).
    pub fn validate_storage(&self) -> ConfigResult<()> {
        let storage = &self.storage;
        if storage.endpoint.is_empty() {
            return Err(ConfigError::Missing("storage.endpoint"));
        }
        if storage.bucket.is_empty() {
            return Err(ConfigError::Missing("storage.bucket"));
        }
        if storage.access_key_id.as_deref().unwrap_or_default().is_empty() {
            return Err(ConfigError::Missing("storage.access_key_id"));
        }
        if storage
            .secret_access_key
            .as_ref()
            .map_or(true, |s| s.expose_secret().is_empty())
        {
            return Err(ConfigError::Missing("storage.secret_access_key"));
        }
        if storage.enforce_tls && storage.endpoint.starts_with("http://") {
            return Err(ConfigError::Invalid {
                key: "storage.endpoint",
                reason: format!(
                    "plaintext HTTP endpoint ({}) with enforce_tls enabled",
                    storage.endpoint
                ),
            });
        }
        if storage.multipart_chunk_bytes < MIN_MULTIPART_CHUNK_BYTES {
            return Err(ConfigError::Invalid {
                key: "storage.multipart_chunk_bytes",
                reason: format!("must be at least {MIN_MULTIPART_CHUNK_BYTES}"),
            });
        }
        if storage.multipart_threshold_bytes < storage.multipart_chunk_bytes {
            return Err(ConfigError::Invalid {
                key: "storage.multipart_threshold_bytes",
                reason: "must be at least storage.multipart_chunk_bytes".into(),
            });
        }
        Ok(())
    }
}

impl BackupConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl StorageConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
