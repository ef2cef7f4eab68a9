//! Storage health check

use crate::backend::ObjectBackend;
use crate::error::{TransferError, TransferResult};

/// Verify the bucket is reachable by fetching at most one entry under the prefix.
///
/// No retries: a check that needs retrying is already unhealthy.
pub async fn check_health(backend: &dyn ObjectBackend, prefix: &str) -> TransferResult<()> {
    backend
        .peek(prefix)
        .await
        .map_err(|source| TransferError::Terminal {
            operation: "storage health check".into(),
            source,
        })
}
