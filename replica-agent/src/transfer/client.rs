//! Transport boundary between a slave and its master.
//!
//! The replication engine only needs three calls: open a session, stream one
//! file of that session, release the session. [`MasterClient`] captures them;
//! [`HttpMasterClient`] speaks to a remote `replica-master`, and the
//! in-process [`MasterRegistry`](crate::replication::master::MasterRegistry)
//! implements it directly for same-host replication and tests.

use crate::replication::session::ReplicationSession;
use crate::replication::source::Source;
use crate::utils::errors::ReplicationError;
use crate::Result;
use async_compression::tokio::bufread::ZstdDecoder;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::TryStreamExt;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

/// Raw content of one file, in chunks
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Ask the master for a new session over the current files of `index`.
    async fn new_session(&self, index: &str) -> Result<ReplicationSession>;

    /// Stream a file listed in the manifest of `session_uuid`.
    ///
    /// Fails with `UnknownSession` when the session is not (or no longer)
    /// cached, and `UnknownFile` when the file is not part of its manifest.
    async fn get_file(&self, session_uuid: &str, source: Source, name: &str) -> Result<ByteStream>;

    /// Let the master drop the session. Idempotent.
    async fn release_session(&self, session_uuid: &str) -> Result<()>;
}

/// Error body returned by the master
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    code: Option<String>,
}

pub struct HttpMasterClient {
    client: reqwest::Client,
    base_url: String,
    compression: bool,
}

impl HttpMasterClient {
    pub fn new(base_url: &str, compression: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            compression,
        })
    }

    fn sessions_url(&self, index: &str) -> String {
        format!("{}/api/replication/{}/sessions", self.base_url, index)
    }

    fn session_url(&self, session_uuid: &str) -> String {
        format!("{}/api/replication/sessions/{}", self.base_url, session_uuid)
    }

    /// File names are percent-encoded as individual path segments
    fn file_url(&self, session_uuid: &str, source: Source, name: &str) -> Result<reqwest::Url> {
        let invalid = |detail: String| {
            ReplicationError::Config(format!("Invalid master URL {}: {}", self.base_url, detail))
        };
        let mut url = reqwest::Url::parse(&self.session_url(session_uuid))
            .map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base".to_string()))?
            .extend(["files", source.as_str(), name]);
        Ok(url)
    }
}

#[async_trait]
impl MasterClient for HttpMasterClient {
    async fn new_session(&self, index: &str) -> Result<ReplicationSession> {
        let resp = self.client.post(self.sessions_url(index)).send().await?;

        if !resp.status().is_success() {
            return Err(read_error(resp, |code| match code {
                "unknown_index" => Some(ReplicationError::UnknownIndex(index.to_string())),
                _ => None,
            })
            .await);
        }

        let session = resp.json::<ReplicationSession>().await?;
        debug!(
            index = %index,
            session = %session.session_uuid(),
            files = session.file_count(),
            "Obtained replication session"
        );
        Ok(session)
    }

    async fn get_file(&self, session_uuid: &str, source: Source, name: &str) -> Result<ByteStream> {
        let mut request = self.client.get(self.file_url(session_uuid, source, name)?);
        if self.compression {
            request = request.header(ACCEPT_ENCODING, "zstd");
        }

        let resp = request.send().await?;

        if !resp.status().is_success() {
            return Err(read_error(resp, |code| match code {
                "unknown_session" => {
                    Some(ReplicationError::UnknownSession(session_uuid.to_string()))
                }
                "unknown_file" => Some(ReplicationError::UnknownFile {
                    src: source,
                    name: name.to_string(),
                }),
                _ => None,
            })
            .await);
        }

        let zstd_encoded = resp
            .headers()
            .get(CONTENT_ENCODING)
            .map(|value| value.as_bytes() == b"zstd")
            .unwrap_or(false);

        let body = resp.bytes_stream().map_err(std::io::Error::other);

        if zstd_encoded {
            let decoder = ZstdDecoder::new(StreamReader::new(body));
            Ok(Box::pin(ReaderStream::new(decoder)))
        } else {
            Ok(Box::pin(body))
        }
    }

    async fn release_session(&self, session_uuid: &str) -> Result<()> {
        let resp = self.client.delete(self.session_url(session_uuid)).send().await?;

        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(read_error(resp, |_| None).await),
        }
    }
}

/// Turn a failed response into a typed error when the master sent a known code.
async fn read_error<F>(resp: Response, known: F) -> ReplicationError
where
    F: FnOnce(&str) -> Option<ReplicationError>,
{
    let status = resp.status();
    let body = resp.json::<ErrorBody>().await.ok();

    if let Some(err) = body.as_ref().and_then(|b| b.code.as_deref()).and_then(known) {
        return err;
    }

    let message = body.map(|b| b.error).unwrap_or_else(|| "no error body".to_string());
    ReplicationError::Network(format!("master responded {}: {}", status, message))
}
