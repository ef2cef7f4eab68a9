//! Wire-level object store operations.
//!
//! `ObjectBackend` is the seam between transfer policy (retry, multipart
//! sequencing, deadlines) and the store itself. Production uses
//! [`OpendalBackend`]; tests substitute fault-injecting fakes.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use opendal::{ErrorKind, Operator, Writer};
use pgsafe_core::RemoteObject;
use tokio::sync::Mutex;
use tracing::debug;

/// Byte stream of an object body
pub type ObjectStream = BoxStream<'static, std::io::Result<Bytes>>;

/// An open multi-part upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartSession {
    pub key: String,
    pub upload_id: String,
}

/// Store acknowledgement of one uploaded part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn put(&self, key: &str, body: Bytes) -> opendal::Result<()>;

    async fn get(&self, key: &str) -> opendal::Result<ObjectStream>;

    async fn delete(&self, key: &str) -> opendal::Result<()>;

    /// All objects under `prefix`, recursively. `RemoteObject::name` is the full key.
    async fn list(&self, prefix: &str) -> opendal::Result<Vec<RemoteObject>>;

    /// Cheapest call that proves `prefix` is listable: at most one entry is fetched.
    async fn peek(&self, prefix: &str) -> opendal::Result<()>;

    async fn create_multipart(&self, key: &str) -> opendal::Result<MultipartSession>;

    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        body: Bytes,
    ) -> opendal::Result<PartReceipt>;

    async fn complete_multipart(
        &self,
        session: &MultipartSession,
        parts: &[PartReceipt],
    ) -> opendal::Result<()>;

    async fn abort_multipart(&self, session: &MultipartSession) -> opendal::Result<()>;
}

struct OpenUpload {
    writer: Writer,
    parts_written: u32,
}

/// `ObjectBackend` over an OpenDAL operator.
///
/// A multi-part session is an OpenDAL `Writer` configured with the part
/// size as its chunk, so each `upload_part` call flushes exactly one store
/// part. Parts must therefore arrive in order.
pub struct OpendalBackend {
    op: Operator,
    chunk_size: usize,
    uploads: Mutex<HashMap<String, OpenUpload>>,
}

impl OpendalBackend {
    pub fn new(op: Operator, chunk_size: usize) -> Self {
        Self {
            op,
            chunk_size,
            uploads: Mutex::new(HashMap::new()),
        }
    }

    /// Number of sessions that have been created but neither completed nor aborted
    pub async fn open_sessions(&self) -> usize {
        self.uploads.lock().await.len()
    }

    fn unknown_session(session: &MultipartSession) -> opendal::Error {
        opendal::Error::new(
            ErrorKind::Unexpected,
            format!("unknown multipart session {}", session.upload_id),
        )
    }
}

fn to_utc(ts: impl Into<SystemTime>) -> DateTime<Utc> {
    DateTime::<Utc>::from(ts.into())
}

#[async_trait]
impl ObjectBackend for OpendalBackend {
    async fn put(&self, key: &str, body: Bytes) -> opendal::Result<()> {
        self.op.write(key, body).await.map(|_| ())
    }

    async fn get(&self, key: &str) -> opendal::Result<ObjectStream> {
        let reader = self.op.reader(key).await?;
        let stream = reader.into_bytes_stream(..).await?;
        Ok(stream.boxed())
    }

    async fn delete(&self, key: &str) -> opendal::Result<()> {
        self.op.delete(key).await
    }

    async fn list(&self, prefix: &str) -> opendal::Result<Vec<RemoteObject>> {
        let path = if prefix.is_empty() { "/" } else { prefix };
        let entries = self.op.list_with(path).recursive(true).await?;

        let mut objects = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.metadata().is_dir() {
                continue;
            }
            // some services omit size/mtime from listings
            let meta = match entry.metadata().last_modified() {
                Some(_) => entry.metadata().clone(),
                None => self.op.stat(entry.path()).await?,
            };
            // an unknown mtime counts as fresh so retention never deletes it
            let last_modified = meta.last_modified().map(to_utc).unwrap_or_else(Utc::now);
            objects.push(RemoteObject {
                name: entry.path().to_string(),
                size: meta.content_length(),
                last_modified,
            });
        }
        Ok(objects)
    }

    async fn peek(&self, prefix: &str) -> opendal::Result<()> {
        let path = if prefix.is_empty() { "/" } else { prefix };
        let mut lister = self.op.lister_with(path).recursive(true).await?;
        lister.try_next().await?;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> opendal::Result<MultipartSession> {
        let writer = self.op.writer_with(key).chunk(self.chunk_size).await?;
        let session = MultipartSession {
            key: key.to_string(),
            upload_id: uuid::Uuid::new_v4().to_string(),
        };
        self.uploads.lock().await.insert(
            session.upload_id.clone(),
            OpenUpload {
                writer,
                parts_written: 0,
            },
        );
        debug!(key, upload_id = %session.upload_id, "multipart session opened");
        Ok(session)
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        body: Bytes,
    ) -> opendal::Result<PartReceipt> {
        let mut uploads = self.uploads.lock().await;
        let upload = uploads
            .get_mut(&session.upload_id)
            .ok_or_else(|| Self::unknown_session(session))?;

        if part_number != upload.parts_written + 1 {
            return Err(opendal::Error::new(
                ErrorKind::Unexpected,
                format!(
                    "part {part_number} out of order (expected {})",
                    upload.parts_written + 1
                ),
            ));
        }

        let etag = blake3::hash(&body).to_hex().to_string();
        upload.writer.write(body).await?;
        upload.parts_written = part_number;
        Ok(PartReceipt { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        session: &MultipartSession,
        parts: &[PartReceipt],
    ) -> opendal::Result<()> {
        let mut upload = self
            .uploads
            .lock()
            .await
            .remove(&session.upload_id)
            .ok_or_else(|| Self::unknown_session(session))?;

        let contiguous = parts
            .iter()
            .enumerate()
            .all(|(i, p)| p.part_number as usize == i + 1);
        if !contiguous || parts.len() as u32 != upload.parts_written {
            // the writer is already out of the map; abort it before failing
            let _ = upload.writer.abort().await;
            return Err(opendal::Error::new(
                ErrorKind::Unexpected,
                format!(
                    "completion receipts do not match the {} uploaded parts",
                    upload.parts_written
                ),
            ));
        }

        if let Err(err) = upload.writer.close().await {
            let _ = upload.writer.abort().await;
            return Err(err);
        }
        Ok(())
    }

    async fn abort_multipart(&self, session: &MultipartSession) -> opendal::Result<()> {
        let removed = self.uploads.lock().await.remove(&session.upload_id);
        match removed {
            Some(mut upload) => upload.writer.abort().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn memory_backend(chunk: usize) -> OpendalBackend {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        OpendalBackend::new(op, chunk)
    }

    async fn read_all(backend: &OpendalBackend, key: &str) -> Vec<u8> {
        let chunks: Vec<Bytes> = backend.get(key).await.unwrap().try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = memory_backend(1024);
        backend
            .put("misskey/a.dump.zst", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(read_all(&backend, "misskey/a.dump.zst").await, b"hello");

        backend.delete("misskey/a.dump.zst").await.unwrap();
        assert!(backend.get("misskey/a.dump.zst").await.is_err());
    }

    #[tokio::test]
    async fn test_list_returns_full_keys_and_sizes() {
        let backend = memory_backend(1024);
        backend.put("misskey/a", Bytes::from_static(b"12345")).await.unwrap();
        backend.put("misskey/b", Bytes::from_static(b"1")).await.unwrap();
        backend.put("other/c", Bytes::from_static(b"1")).await.unwrap();

        let mut listed = backend.list("misskey/").await.unwrap();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = listed.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["misskey/a", "misskey/b"]);
        assert_eq!(listed[0].size, 5);
    }

    #[tokio::test]
    async fn test_peek_succeeds_on_empty_and_populated_prefix() {
        let backend = memory_backend(1024);
        backend.peek("misskey/").await.unwrap();

        for i in 0..5 {
            backend
                .put(&format!("misskey/{i}"), Bytes::from_static(b"1"))
                .await
                .unwrap();
        }
        backend.peek("misskey/").await.unwrap();
        backend.peek("").await.unwrap();
    }

    #[tokio::test]
    async fn test_multipart_assembles_parts_in_order() {
        let backend = memory_backend(4);
        let session = backend.create_multipart("big").await.unwrap();
        assert_eq!(backend.open_sessions().await, 1);

        let mut receipts = Vec::new();
        for (i, part) in [&b"aaaa"[..], b"bbbb", b"cc"].iter().enumerate() {
            let r = backend
                .upload_part(&session, i as u32 + 1, Bytes::copy_from_slice(part))
                .await
                .unwrap();
            receipts.push(r);
        }
        backend.complete_multipart(&session, &receipts).await.unwrap();

        assert_eq!(backend.open_sessions().await, 0);
        assert_eq!(read_all(&backend, "big").await, b"aaaabbbbcc");
    }

    #[tokio::test]
    async fn test_multipart_rejects_out_of_order_part() {
        let backend = memory_backend(4);
        let session = backend.create_multipart("big").await.unwrap();
        let err = backend
            .upload_part(&session, 2, Bytes::from_static(b"bbbb"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of order"));

        backend.abort_multipart(&session).await.unwrap();
        assert_eq!(backend.open_sessions().await, 0);
        assert!(backend.get("big").await.is_err());
    }

    #[tokio::test]
    async fn test_complete_with_missing_receipt_fails_and_closes_session() {
        let backend = memory_backend(4);
        let session = backend.create_multipart("big").await.unwrap();
        let r1 = backend
            .upload_part(&session, 1, Bytes::from_static(b"aaaa"))
            .await
            .unwrap();
        backend
            .upload_part(&session, 2, Bytes::from_static(b"bb"))
            .await
            .unwrap();

        assert!(backend.complete_multipart(&session, &[r1]).await.is_err());
        assert_eq!(backend.open_sessions().await, 0);
    }
}
