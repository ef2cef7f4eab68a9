//! pgsafe-storage: resilient transfer of backup artifacts to S3-compatible object storage
//!
//! Layers, bottom up:
//!   - `backend`: wire-level object store operations (`ObjectBackend`), implemented on OpenDAL
//!   - `retry`: exponential backoff with jitter around every remote call
//!   - `multipart`: chunked upload sessions with ordered receipts and abort on failure
//!   - `client`: `TransferClient`, the `Storage` capability used by the backup pipeline

pub mod backend;
pub mod client;
pub mod error;
#[cfg(test)]
mod fake;
pub mod health;
pub mod multipart;
pub mod operator;
pub mod retry;
pub mod storage;

pub use backend::{MultipartSession, ObjectBackend, ObjectStream, OpendalBackend, PartReceipt};
pub use client::{TransferClient, TransferSettings};
pub use error::{TransferError, TransferResult};
pub use health::check_health;
pub use operator::{build_operator, OperatorConfig};
pub use retry::{is_retryable, RetryPolicy};
pub use storage::{Storage, UnconfiguredStorage};
