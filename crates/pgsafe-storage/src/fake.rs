//! In-process `ObjectBackend` with scripted faults and an operation log.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use opendal::ErrorKind;
use pgsafe_core::RemoteObject;
use tokio_util::sync::CancellationToken;

use crate::backend::{MultipartSession, ObjectBackend, ObjectStream, PartReceipt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Put(String),
    Get(String),
    Delete(String),
    List(String),
    Peek(String),
    CreateMultipart,
    UploadPart(u32),
    Complete(Vec<u32>),
    Abort,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, (Bytes, DateTime<Utc>)>,
    sessions: HashMap<String, Vec<Bytes>>,
    ops: Vec<Op>,
    failures: HashMap<&'static str, VecDeque<opendal::Error>>,
    failing_part: Option<(u32, ErrorKind)>,
    cancel_after_part: Option<(u32, CancellationToken)>,
    next_session: u32,
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<State>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.objects.get(key).map(|(b, _)| b.to_vec())
    }

    pub fn insert(&self, key: &str, body: &[u8], last_modified: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .insert(key.to_string(), (Bytes::copy_from_slice(body), last_modified));
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// Queue an error for the next call of `op` ("put", "get", "delete",
    /// "list", "create_multipart", "complete"). `peek` shares the "list" queue.
    pub fn fail_next(&self, op: &'static str, err: opendal::Error) {
        let mut state = self.state.lock().unwrap();
        state.failures.entry(op).or_default().push_back(err);
    }

    pub fn fail_part(&self, part_number: u32, kind: ErrorKind) {
        self.state.lock().unwrap().failing_part = Some((part_number, kind));
    }

    pub fn cancel_after_part(&self, part_number: u32, token: CancellationToken) {
        self.state.lock().unwrap().cancel_after_part = Some((part_number, token));
    }

    fn record(&self, op: Op, name: &'static str) -> opendal::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(op);
        match state.failures.get_mut(name).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectBackend for FakeBackend {
    async fn put(&self, key: &str, body: Bytes) -> opendal::Result<()> {
        self.record(Op::Put(key.to_string()), "put")?;
        let mut state = self.state.lock().unwrap();
        state.objects.insert(key.to_string(), (body, Utc::now()));
        Ok(())
    }

    async fn get(&self, key: &str) -> opendal::Result<ObjectStream> {
        self.record(Op::Get(key.to_string()), "get")?;
        let state = self.state.lock().unwrap();
        let (body, _) = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| opendal::Error::new(ErrorKind::NotFound, "no such key"))?;
        let chunks: Vec<std::io::Result<Bytes>> = body
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn delete(&self, key: &str) -> opendal::Result<()> {
        self.record(Op::Delete(key.to_string()), "delete")?;
        self.state.lock().unwrap().objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> opendal::Result<Vec<RemoteObject>> {
        self.record(Op::List(prefix.to_string()), "list")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (body, mtime))| RemoteObject {
                name: k.clone(),
                size: body.len() as u64,
                last_modified: *mtime,
            })
            .collect())
    }

    async fn peek(&self, prefix: &str) -> opendal::Result<()> {
        self.record(Op::Peek(prefix.to_string()), "list")
    }

    async fn create_multipart(&self, key: &str) -> opendal::Result<MultipartSession> {
        self.record(Op::CreateMultipart, "create_multipart")?;
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let upload_id = format!("upload-{}", state.next_session);
        state.sessions.insert(upload_id.clone(), Vec::new());
        Ok(MultipartSession {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        body: Bytes,
    ) -> opendal::Result<PartReceipt> {
        self.record(Op::UploadPart(part_number), "upload_part")?;
        let mut state = self.state.lock().unwrap();
        if let Some((n, kind)) = state.failing_part {
            if n == part_number {
                return Err(opendal::Error::new(kind, "part rejected"));
            }
        }
        let etag = blake3::hash(&body).to_hex().to_string();
        state
            .sessions
            .get_mut(&session.upload_id)
            .ok_or_else(|| opendal::Error::new(ErrorKind::NotFound, "no such upload"))?
            .push(body);
        if let Some((n, token)) = &state.cancel_after_part {
            if *n == part_number {
                token.cancel();
            }
        }
        Ok(PartReceipt { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        session: &MultipartSession,
        parts: &[PartReceipt],
    ) -> opendal::Result<()> {
        let numbers = parts.iter().map(|p| p.part_number).collect();
        self.record(Op::Complete(numbers), "complete")?;
        let mut state = self.state.lock().unwrap();
        let bodies = state
            .sessions
            .remove(&session.upload_id)
            .ok_or_else(|| opendal::Error::new(ErrorKind::NotFound, "no such upload"))?;
        let joined: Vec<u8> = bodies.iter().flat_map(|b| b.iter().copied()).collect();
        state
            .objects
            .insert(session.key.clone(), (Bytes::from(joined), Utc::now()));
        Ok(())
    }

    async fn abort_multipart(&self, session: &MultipartSession) -> opendal::Result<()> {
        self.record(Op::Abort, "abort")?;
        self.state.lock().unwrap().sessions.remove(&session.upload_id);
        Ok(())
    }
}
