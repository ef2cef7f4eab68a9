//! The storage capability the backup pipeline depends on.

use std::path::Path;

use async_trait::async_trait;
use pgsafe_core::RemoteObject;
use tokio_util::sync::CancellationToken;

use crate::error::{TransferError, TransferResult};

/// Upload, download, delete and list artifacts by logical name
/// (relative to the configured prefix).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upload `local` as `remote`. Returns the object's download reference.
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> TransferResult<String>;

    /// Fetch `remote` into `local`, overwriting it. Returns bytes written.
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> TransferResult<u64>;

    async fn delete(&self, remote: &str, cancel: &CancellationToken) -> TransferResult<()>;

    /// Objects under `prefix`, named relative to the configured prefix.
    async fn list(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> TransferResult<Vec<RemoteObject>>;

    async fn check_health(&self) -> TransferResult<()>;

    /// False only for [`UnconfiguredStorage`]; lets callers fail before doing local work.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Stand-in for processes that never touch the bucket (restore-only runs).
/// Every operation fails fast with [`TransferError::NotConfigured`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredStorage;

#[async_trait]
impl Storage for UnconfiguredStorage {
    async fn upload(&self, _: &Path, _: &str, _: &CancellationToken) -> TransferResult<String> {
        Err(TransferError::NotConfigured)
    }

    async fn download(&self, _: &str, _: &Path, _: &CancellationToken) -> TransferResult<u64> {
        Err(TransferError::NotConfigured)
    }

    async fn delete(&self, _: &str, _: &CancellationToken) -> TransferResult<()> {
        Err(TransferError::NotConfigured)
    }

    async fn list(&self, _: &str, _: &CancellationToken) -> TransferResult<Vec<RemoteObject>> {
        Err(TransferError::NotConfigured)
    }

    async fn check_health(&self) -> TransferResult<()> {
        Err(TransferError::NotConfigured)
    }

    fn is_configured(&self) -> bool {
        false
    }
}
