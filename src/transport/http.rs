//! Blocking HTTP transport for CouchDB-compatible servers.

use super::{CancelHandle, ChangeStream, DocumentStore, FeedTransport, StreamChunk};
use crate::error::{FeedError, Result};
use crate::types::{Revision, Sequence};
use serde::Deserialize;
use serde_json::Value;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Configuration for [`HttpTransport`].
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Server root, e.g. `http://localhost:5984/`. May carry a path prefix.
    pub base_url: String,

    /// Heartbeat interval requested on change feeds.
    /// Default: 10s
    pub heartbeat: Duration,

    /// Socket read timeout (None = wait forever). Must exceed `heartbeat`
    /// or idle feeds will be reported as interrupted.
    /// Default: 60s
    pub read_timeout: Option<Duration>,

    /// Connect timeout.
    /// Default: 10s
    pub connect_timeout: Duration,

    /// Bearer token sent with every request.
    pub token: Option<String>,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5984/".to_string(),
            heartbeat: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(60)),
            connect_timeout: Duration::from_secs(10),
            token: None,
        }
    }
}

/// HTTP client implementing both the feed transport and the document store.
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<HttpTransportInner>,
}

struct HttpTransportInner {
    base_url: Url,
    heartbeat: Duration,
    token: Option<String>,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct PutResponse {
    rev: String,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let base_url = normalize_base_url(&config.base_url)?;
        let mut builder = ureq::AgentBuilder::new().timeout_connect(config.connect_timeout);
        if let Some(timeout) = config.read_timeout {
            builder = builder.timeout_read(timeout);
        }
        info!(base_url = %base_url, "http transport configured");
        Ok(Self {
            inner: Arc::new(HttpTransportInner {
                base_url,
                heartbeat: config.heartbeat,
                token: config.token,
                agent: builder.build(),
            }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// URL of a collection's continuous change feed.
    pub fn changes_url(&self, collection: &str, since: Option<Sequence>) -> Result<Url> {
        let mut url = build_url(&self.inner.base_url, &[collection, "_changes"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("feed", "continuous");
            pairs.append_pair("heartbeat", &self.inner.heartbeat.as_millis().to_string());
            match since {
                Some(since) => pairs.append_pair("since", &since.to_string()),
                None => pairs.append_pair("since", "now"),
            };
        }
        Ok(url)
    }

    /// URL of one document.
    pub fn document_url(&self, collection: &str, document_id: &str) -> Result<Url> {
        build_url(&self.inner.base_url, &[collection, document_id])
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let mut request = self
            .inner
            .agent
            .request(method, url.as_str())
            .set("Accept", "application/json");
        if let Some(token) = &self.inner.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        request
    }
}

impl FeedTransport for HttpTransport {
    fn open_change_stream(
        &self,
        collection: &str,
        since: Option<Sequence>,
    ) -> Result<Box<dyn ChangeStream>> {
        let url = self.changes_url(collection, since)?;
        let response = self.request("GET", &url).call()?;
        debug!(%url, "change feed opened");
        Ok(Box::new(HttpChangeStream::new(response.into_reader())))
    }
}

impl DocumentStore for HttpTransport {
    fn fetch(&self, collection: &str, document_id: &str) -> Result<Option<Value>> {
        let url = self.document_url(collection, document_id)?;
        match self.request("GET", &url).call() {
            Ok(response) => {
                let value: Value = serde_json::from_reader(response.into_reader())?;
                Ok(Some(value))
            }
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, collection: &str, document_id: &str, value: &Value) -> Result<Revision> {
        let url = self.document_url(collection, document_id)?;
        let payload = serde_json::to_string(value)?;
        let response = self
            .request("PUT", &url)
            .set("Content-Type", "application/json")
            .send_string(&payload)?;
        let put: PutResponse = serde_json::from_reader(response.into_reader())?;
        Ok(Revision::new(put.rev))
    }
}

/// Body of an open `_changes` response.
///
/// ureq cannot abort a blocking read from another thread. The cancel handle
/// marks the stream, and the connection is dropped as soon as the read in
/// flight returns, which the server's heartbeat bounds.
pub struct HttpChangeStream {
    reader: Option<Box<dyn Read + Send + Sync + 'static>>,
    buffer: Vec<u8>,
    cancelled: Arc<AtomicBool>,
}

impl HttpChangeStream {
    fn new(reader: Box<dyn Read + Send + Sync + 'static>) -> Self {
        Self {
            reader: Some(reader),
            buffer: vec![0u8; READ_BUFFER_SIZE],
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn release_if_cancelled(&mut self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            if self.reader.take().is_some() {
                debug!("change feed connection released");
            }
            return true;
        }
        false
    }
}

impl ChangeStream for HttpChangeStream {
    fn next_chunk(&mut self) -> Result<StreamChunk> {
        if self.release_if_cancelled() {
            return Ok(StreamChunk::End);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(StreamChunk::End);
        };
        let read = loop {
            match reader.read(&mut self.buffer) {
                Ok(read) => break read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if self.release_if_cancelled() {
            return Ok(StreamChunk::End);
        }
        if read == 0 {
            self.reader = None;
            return Ok(StreamChunk::End);
        }
        Ok(StreamChunk::Data(self.buffer[..read].to_vec()))
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.reader = None;
    }

    fn cancel_handle(&self) -> CancelHandle {
        let cancelled = self.cancelled.clone();
        Arc::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}

fn normalize_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(FeedError::InvalidUrl(format!(
            "base url must use http or https, got {scheme}"
        )));
    }
    if url.cannot_be_a_base() {
        return Err(FeedError::InvalidUrl("base url cannot be a base".to_string()));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Append percent-encoded segments to the base url's path.
fn build_url(base_url: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| FeedError::InvalidUrl("base url cannot be a base".to_string()))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}
