//! Multi-part upload sequencing.
//!
//! A file of `size` bytes is split into `ceil(size / chunk)` parts numbered
//! contiguously from 1. Completion is only requested once every part has a
//! receipt, and receipts are passed in part order. Any failure after the
//! session opens aborts it: a session is never left open.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{MultipartSession, ObjectBackend, PartReceipt};
use crate::error::{TransferError, TransferResult};
use crate::retry::RetryPolicy;

const ABORT_TIMEOUT: Duration = Duration::from_secs(60);
const MIB: u64 = 1024 * 1024;

/// Byte range of one part within the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub part_number: u32,
    pub offset: u64,
    pub len: u64,
}

pub fn plan_parts(file_size: u64, chunk_size: u64) -> Vec<PartPlan> {
    let chunk = chunk_size.max(1);
    (0..file_size.div_ceil(chunk))
        .map(|i| {
            let offset = i * chunk;
            PartPlan {
                part_number: i as u32 + 1,
                offset,
                len: chunk.min(file_size - offset),
            }
        })
        .collect()
}

/// Upload `local` as `key` through a multi-part session. Returns the number of parts.
///
/// Session creation is retried under `retry`; individual parts are not.
pub async fn upload_multipart(
    backend: &dyn ObjectBackend,
    retry: &RetryPolicy,
    local: &Path,
    key: &str,
    file_size: u64,
    chunk_size: u64,
    cancel: &CancellationToken,
) -> TransferResult<u32> {
    let plan = plan_parts(file_size, chunk_size);
    let total_parts = plan.len() as u32;

    let session = retry
        .run("create multipart upload", cancel, || {
            backend.create_multipart(key)
        })
        .await?;
    info!(
        key,
        upload_id = %session.upload_id,
        total_parts,
        chunk_mb = chunk_size / MIB,
        "multipart upload started"
    );

    let result = match upload_parts(backend, &session, local, &plan, cancel).await {
        Ok(receipts) => complete(backend, &session, &receipts, cancel).await,
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        abort_session(backend, &session).await;
        return Err(err);
    }

    info!(key, upload_id = %session.upload_id, total_parts, "multipart upload completed");
    Ok(total_parts)
}

async fn upload_parts(
    backend: &dyn ObjectBackend,
    session: &MultipartSession,
    local: &Path,
    plan: &[PartPlan],
    cancel: &CancellationToken,
) -> TransferResult<Vec<PartReceipt>> {
    let mut file = File::open(local)
        .await
        .map_err(|e| TransferError::io("opening", local, e))?;
    let total_parts = plan.len() as u32;
    let mut receipts = Vec::with_capacity(plan.len());

    for part in plan {
        if cancel.is_cancelled() {
            return Err(TransferError::cancelled("multipart upload"));
        }

        let mut buf = vec![0u8; part.len as usize];
        file.seek(SeekFrom::Start(part.offset))
            .await
            .map_err(|e| TransferError::io("seeking in", local, e))?;
        file.read_exact(&mut buf)
            .await
            .map_err(|e| TransferError::io("reading part from", local, e))?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::cancelled("multipart upload")),
            r = backend.upload_part(session, part.part_number, Bytes::from(buf)) => r,
        };
        let receipt = outcome.map_err(|source| TransferError::PartFailed {
            key: session.key.clone(),
            part_number: part.part_number,
            total_parts,
            source,
        })?;

        if receipt.part_number != part.part_number {
            return Err(TransferError::PartFailed {
                key: session.key.clone(),
                part_number: part.part_number,
                total_parts,
                source: opendal::Error::new(
                    opendal::ErrorKind::Unexpected,
                    format!("store acknowledged part {}", receipt.part_number),
                ),
            });
        }

        debug!(
            upload_id = %session.upload_id,
            part_number = part.part_number,
            total_parts,
            bytes = part.len,
            "part uploaded"
        );
        receipts.push(receipt);
    }

    Ok(receipts)
}

async fn complete(
    backend: &dyn ObjectBackend,
    session: &MultipartSession,
    receipts: &[PartReceipt],
    cancel: &CancellationToken,
) -> TransferResult<()> {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::cancelled("complete multipart upload")),
        r = backend.complete_multipart(session, receipts) => r,
    };
    outcome.map_err(|source| TransferError::Terminal {
        operation: "complete multipart upload".into(),
        source,
    })
}

/// Best-effort abort. Runs even when the caller's token is cancelled.
async fn abort_session(backend: &dyn ObjectBackend, session: &MultipartSession) {
    match tokio::time::timeout(ABORT_TIMEOUT, backend.abort_multipart(session)).await {
        Ok(Ok(())) => warn!(
            key = %session.key,
            upload_id = %session.upload_id,
            "multipart upload aborted"
        ),
        Ok(Err(e)) => error!(
            key = %session.key,
            upload_id = %session.upload_id,
            error = %e,
            "failed to abort multipart upload"
        ),
        Err(_) => error!(
            key = %session.key,
            upload_id = %session.upload_id,
            "timed out aborting multipart upload"
        ),
    }
}
