use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

/// Suffix of the raw dump written by the dump producer
pub const DUMP_SUFFIX: &str = ".dump";
/// Suffix appended by the compression codec
pub const COMPRESSION_SUFFIX: &str = ".zst";
/// Suffix appended by the stream cipher codec
pub const ENCRYPTION_SUFFIX: &str = ".enc";

/// Deterministic artifact name: `{database}_{YYYY-MM-DD}_{HH-MM}` plus a suffix chain.
///
/// The suffix order is fixed: `.dump` → `.zst` → `.enc`. Restore strips them
/// in reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    stem: String,
}

impl ArtifactName {
    pub fn new<Tz>(database: &str, at: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        Self {
            stem: format!("{database}_{}", at.format("%Y-%m-%d_%H-%M")),
        }
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// `misskey_2025-08-28_21-35.dump`
    pub fn dump(&self) -> String {
        format!("{}{DUMP_SUFFIX}", self.stem)
    }

    /// `misskey_2025-08-28_21-35.dump.zst`
    pub fn compressed(&self) -> String {
        format!("{}{COMPRESSION_SUFFIX}", self.dump())
    }

    /// `misskey_2025-08-28_21-35.dump.zst.enc`
    pub fn encrypted(&self) -> String {
        format!("{}{ENCRYPTION_SUFFIX}", self.compressed())
    }

    /// The name that is uploaded: encrypted when a key is configured, compressed otherwise.
    pub fn final_name(&self, encrypted: bool) -> String {
        if encrypted {
            self.encrypted()
        } else {
            self.compressed()
        }
    }
}

/// Local names derived from a downloaded artifact's file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    /// Whether the download carries the encryption suffix
    pub encrypted: bool,
    /// Name of the compressed form (after decrypt, before decompress)
    pub compressed_name: String,
    /// Name of the final restorable dump
    pub dump_name: String,
}

impl DownloadedArtifact {
    /// Parse `x.zst.enc` or `x.zst`. Anything else is not a pgsafe artifact.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (encrypted, compressed) = match name.strip_suffix(ENCRYPTION_SUFFIX) {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        let dump = compressed.strip_suffix(COMPRESSION_SUFFIX)?;
        if dump.is_empty() {
            return None;
        }
        Some(Self {
            encrypted,
            compressed_name: compressed.to_string(),
            dump_name: dump.to_string(),
        })
    }
}

/// One object in the remote store, with its name relative to the configured prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Outcome of a successful backup run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResult {
    /// Logical file name (with suffix chain) as stored remotely
    pub file_name: String,
    /// Size of the uploaded artifact in bytes
    pub file_size: u64,
    pub duration: Duration,
    pub download_url: String,
    pub encrypted: bool,
    /// Expired objects removed by the retention pass that followed the upload
    #[serde(default)]
    pub pruned_objects: usize,
}

/// Structured event handed to the notification sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackupEvent {
    Succeeded(BackupResult),
    Failed { duration: Duration, error: String },
}

impl BackupEvent {
    pub fn duration(&self) -> Duration {
        match self {
            BackupEvent::Succeeded(result) => result.duration,
            BackupEvent::Failed { duration, .. } => *duration,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BackupEvent::Succeeded(_))
    }
}
