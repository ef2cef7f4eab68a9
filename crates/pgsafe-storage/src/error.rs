use std::path::Path;
use std::time::Duration;

/// Failure modes of a remote transfer
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The store rejected the request in a way retrying cannot fix
    #[error("{operation} failed: {source}")]
    Terminal {
        operation: String,
        #[source]
        source: opendal::Error,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: opendal::Error,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    #[error("{operation} exceeded its deadline of {timeout:?}")]
    DeadlineExceeded { operation: String, timeout: Duration },

    /// A multi-part session failed at one part and was aborted
    #[error("multipart upload of {key} failed at part {part_number}/{total_parts}: {source}")]
    PartFailed {
        key: String,
        part_number: u32,
        total_parts: u32,
        #[source]
        source: opendal::Error,
    },

    #[error("storage is not configured")]
    NotConfigured,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    pub(crate) fn io(context: &str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context: format!("{context} {}", path.display()),
            source,
        }
    }

    pub(crate) fn cancelled(operation: &str) -> Self {
        Self::Cancelled {
            operation: operation.to_string(),
        }
    }

    /// True for cancellation and deadline expiry, which are not store failures.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            TransferError::Cancelled { .. } | TransferError::DeadlineExceeded { .. }
        )
    }
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;
