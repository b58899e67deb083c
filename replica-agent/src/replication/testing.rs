//! Fixtures shared by the replication tests.

use crate::fs::fingerprint::FileFingerprint;
use crate::replication::master::MasterRegistry;
use crate::replication::session::ReplicationSession;
use crate::replication::source::Source;
use crate::transfer::client::{ByteStream, MasterClient};
use crate::utils::errors::ReplicationError;
use crate::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Write `content` to `path` and pin its mtime to `version` milliseconds
pub fn write_file(path: &Path, content: &[u8], version: u64) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    FileFingerprint::new(content.len() as u64, version)
        .stamp(&file)
        .unwrap();
}

/// Wraps an in-process registry and fails selected file requests.
pub struct FlakyClient {
    pub inner: MasterRegistry,
    pub fail_on: Option<String>,
    pub truncate: Option<String>,
    pub releases: AtomicUsize,
}

impl FlakyClient {
    pub fn new(inner: MasterRegistry) -> Self {
        Self {
            inner,
            fail_on: None,
            truncate: None,
            releases: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, name: &str) -> Self {
        self.fail_on = Some(name.to_string());
        self
    }

    pub fn truncating(mut self, name: &str) -> Self {
        self.truncate = Some(name.to_string());
        self
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MasterClient for FlakyClient {
    async fn new_session(&self, index: &str) -> Result<ReplicationSession> {
        self.inner.new_session(index).await
    }

    async fn get_file(&self, session_uuid: &str, source: Source, name: &str) -> Result<ByteStream> {
        if self.fail_on.as_deref() == Some(name) {
            return Err(ReplicationError::Network(format!("connection reset fetching {}", name)));
        }
        if self.truncate.as_deref() == Some(name) {
            let stream = futures_util::stream::iter(vec![Ok(bytes::Bytes::from_static(b"x"))]);
            return Ok(Box::pin(stream));
        }
        self.inner.get_file(session_uuid, source, name).await
    }

    async fn release_session(&self, session_uuid: &str) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        MasterClient::release_session(&self.inner, session_uuid).await
    }
}
