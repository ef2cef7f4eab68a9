use std::path::PathBuf;

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Integrity and key errors. Always fatal to the operation.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key is not set")]
    MissingKeyMaterial,

    #[error("encryption key must be at least {min} bytes after base64 decoding (got {len})")]
    InsufficientKeyMaterial { len: usize, min: usize },

    #[error("encrypted file is too small to contain nonce and tag: {len} bytes (minimum {min})")]
    ContainerTooShort { len: u64, min: u64 },

    #[error("authentication failed: HMAC mismatch")]
    AuthenticationFailed,

    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CryptoError {
    pub(crate) fn io(context: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        CryptoError::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}
