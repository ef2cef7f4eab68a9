use std::fmt;
use std::path::Path;
use std::process::ExitStatus;

use pgsafe_crypto::CryptoError;
use pgsafe_storage::TransferError;

/// Pipeline position of a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dumping,
    Compressing,
    Encrypting,
    Uploading,
    Pruning,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Dumping => "dumping",
            Stage::Compressing => "compressing",
            Stage::Encrypting => "encrypting",
            Stage::Uploading => "uploading",
            Stage::Pruning => "pruning",
            Stage::Done => "done",
        };
        f.write_str(s)
    }
}

/// Failure of an external tool (pg_dump, zstd) or of the in-process codec
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{program} cancelled")]
    Cancelled { program: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("codec task failed: {0}")]
    Task(#[source] tokio::task::JoinError),
}

impl ToolError {
    pub(crate) fn io(context: &str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context: format!("{context} {}", path.display()),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("storage is not configured")]
    StorageNotConfigured,

    #[error("dump failed: {0}")]
    DumpFailed(#[source] ToolError),

    #[error("compression failed: {0}")]
    CompressionFailed(#[source] ToolError),

    #[error("encryption failed: {0}")]
    EncryptionFailed(#[source] CryptoError),

    #[error("upload failed: {0}")]
    UploadFailed(#[source] TransferError),

    #[error("{stage}: {context}: {source}")]
    Io {
        stage: Stage,
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} task failed: {source}")]
    Task {
        stage: Stage,
        #[source]
        source: tokio::task::JoinError,
    },

    /// Raised at the supervised run boundary, never inside the pipeline
    #[error("backup run panicked: {0}")]
    Panicked(String),
}

impl BackupError {
    /// Stage the run was in when it failed
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BackupError::StorageNotConfigured | BackupError::Panicked(_) => None,
            BackupError::DumpFailed(_) => Some(Stage::Dumping),
            BackupError::CompressionFailed(_) => Some(Stage::Compressing),
            BackupError::EncryptionFailed(_) => Some(Stage::Encrypting),
            BackupError::UploadFailed(_) => Some(Stage::Uploading),
            BackupError::Io { stage, .. } | BackupError::Task { stage, .. } => Some(*stage),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("invalid download URL {url:?}: {reason}")]
    InvalidDownloadUrl { url: String, reason: String },

    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("artifact is encrypted but no encryption key is configured")]
    MissingKey,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("decompression failed: {0}")]
    DecompressionFailed(#[source] ToolError),

    #[error("restore cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("decrypt task failed: {0}")]
    Task(#[source] tokio::task::JoinError),
}

impl RestoreError {
    pub(crate) fn io(context: &str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context: format!("{context} {}", path.display()),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_of_errors() {
        let err = BackupError::CompressionFailed(ToolError::Cancelled {
            program: "zstd".into(),
        });
        assert_eq!(err.stage(), Some(Stage::Compressing));
        assert_eq!(err.to_string(), "compression failed: zstd cancelled");

        let err = BackupError::UploadFailed(TransferError::NotConfigured);
        assert_eq!(err.stage(), Some(Stage::Uploading));
        assert_eq!(BackupError::StorageNotConfigured.stage(), None);
    }

    #[test]
    fn test_crypto_errors_pass_through_restore() {
        let err: RestoreError = CryptoError::AuthenticationFailed.into();
        assert!(matches!(
            err,
            RestoreError::Crypto(CryptoError::AuthenticationFailed)
        ));
    }
}
