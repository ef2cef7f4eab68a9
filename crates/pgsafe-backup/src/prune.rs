//! Retention pruning: delete remote objects older than the retention window.

use chrono::{DateTime, Duration, Utc};
use pgsafe_storage::{Storage, TransferResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub scanned: usize,
    pub deleted: Vec<String>,
    pub failed: usize,
}

/// List the prefix and delete every object last modified before
/// `now - retention_days`.
///
/// A failed delete is logged and counted; the scan continues. Listing
/// failures and cancellation end the pass with an error.
pub async fn prune_expired(
    storage: &dyn Storage,
    retention_days: u32,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> TransferResult<PruneReport> {
    let cutoff = now - Duration::days(i64::from(retention_days));
    let objects = storage.list("", cancel).await?;

    let mut report = PruneReport {
        scanned: objects.len(),
        ..Default::default()
    };

    for object in objects {
        if object.last_modified >= cutoff {
            continue;
        }
        match storage.delete(&object.name, cancel).await {
            Ok(()) => {
                info!(
                    file = %object.name,
                    last_modified = %object.last_modified,
                    "deleted expired backup"
                );
                report.deleted.push(object.name);
            }
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => {
                warn!(file = %object.name, error = %e, "failed to delete expired backup");
                report.failed += 1;
            }
        }
    }

    debug!(
        scanned = report.scanned,
        deleted = report.deleted.len(),
        failed = report.failed,
        cutoff = %cutoff,
        "retention pass finished"
    );
    Ok(report)
}
