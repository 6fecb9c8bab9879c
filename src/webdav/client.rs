use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream, TryStreamExt};
use headers::{ContentLength, ContentRange, HeaderMapExt};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{Body, Url};
use tracing::debug;

use super::auth::Credentials;
use crate::error::DavError;

/// Future returned by every WebDAV operation
pub type DavFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DavError>> + Send + 'a>>;

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// Characters escaped inside a single remote path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// A request body of known length, streamed to the server
pub struct ChunkBody {
    len: u64,
    stream: ByteStream,
}

impl ChunkBody {
    pub fn new<S>(len: u64, stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
    {
        Self {
            len,
            stream: Box::pin(stream),
        }
    }

    pub fn empty() -> Self {
        Self::new(0, stream::empty())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + Sync {
        self.stream
    }

    /// Drain the body into memory
    #[cfg(test)]
    pub async fn collect(self) -> io::Result<Vec<u8>> {
        use futures_util::StreamExt;

        let mut out = Vec::with_capacity(self.len as usize);
        let mut stream = self.stream;
        while let Some(block) = stream.next().await {
            out.extend_from_slice(&block?);
        }
        Ok(out)
    }
}

/// Build a `Content-Range: bytes start-end/total` header for `length` bytes at `start`
pub fn byte_range(start: u64, length: u64, total: u64) -> Result<ContentRange, DavError> {
    let invalid = || DavError::InvalidRange {
        start,
        length,
        total,
    };
    let end = start.checked_add(length).ok_or_else(invalid)?;
    if length == 0 || end > total {
        return Err(invalid());
    }
    ContentRange::bytes(start..end, total).map_err(|_| invalid())
}

/// The operations the upload engine needs from a WebDAV server
pub trait DavClient: Send + Sync {
    /// Check the server is reachable and accepts our credentials
    fn connect(&self) -> DavFuture<'_, ()>;

    /// Create a collection. An already existing collection is not an error.
    fn mkdir<'a>(&'a self, path: &'a str) -> DavFuture<'a, ()>;

    /// Write `body` to `path`, optionally as a byte range of the target
    fn write_stream<'a>(
        &'a self,
        path: &'a str,
        body: ChunkBody,
        range: Option<ContentRange>,
    ) -> DavFuture<'a, ()>;

    /// Delete a resource. A missing resource is not an error.
    fn remove<'a>(&'a self, path: &'a str) -> DavFuture<'a, ()>;
}

/// Hands out a fresh client (and therefore fresh connections) on every call
pub trait Connector: Send + Sync + 'static {
    type Client: DavClient + 'static;

    fn client(&self) -> Result<Self::Client, DavError>;
}

/// Server location, credentials and transport settings
#[derive(Debug, Clone)]
pub struct DavConfig {
    pub base_url: String,
    pub credentials: Credentials,
    /// Accept self-signed or otherwise invalid server certificates.
    /// Scoped to clients built from this config only.
    pub accept_invalid_certs: bool,
    /// Give up on a request when the connection stays idle this long.
    /// There is no deadline on the whole transfer.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

impl DavConfig {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            accept_invalid_certs: false,
            read_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// reqwest-backed WebDAV connector
pub struct WebDav {
    config: Arc<DavConfig>,
    base: Url,
}

impl WebDav {
    pub fn new(config: DavConfig) -> Result<Self, DavError> {
        let base = Url::parse(&config.base_url).map_err(|e| DavError::InvalidUrl {
            url: config.base_url.clone(),
            reason: e.to_string(),
        })?;

        if !matches!(base.scheme(), "http" | "https") {
            return Err(DavError::InvalidUrl {
                url: config.base_url.clone(),
                reason: format!("unsupported scheme {:?}", base.scheme()),
            });
        }

        Ok(Self {
            config: Arc::new(config),
            base,
        })
    }
}

impl Connector for WebDav {
    type Client = WebDavClient;

    fn client(&self) -> Result<WebDavClient, DavError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.config.accept_invalid_certs)
            .read_timeout(self.config.read_timeout)
            .connect_timeout(self.config.connect_timeout)
            .build()
            .map_err(DavError::Client)?;

        Ok(WebDavClient {
            http,
            base: self.base.clone(),
            config: Arc::clone(&self.config),
        })
    }
}

/// One client session against the WebDAV server
pub struct WebDavClient {
    http: reqwest::Client,
    base: Url,
    config: Arc<DavConfig>,
}

fn method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("WebDAV method names are valid tokens")
}

impl WebDavClient {
    /// Resolve a `/`-separated remote path against the base URL, encoding each segment
    fn url_for(&self, path: &str, collection: bool) -> Url {
        let mut full = self.base.path().trim_end_matches('/').to_string();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            full.push('/');
            full.extend(utf8_percent_encode(segment, PATH_SEGMENT));
        }
        if collection || full.is_empty() {
            full.push('/');
        }

        let mut url = self.base.clone();
        url.set_path(&full);
        url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        url: Url,
        mut headers: HeaderMap,
        body: Option<Body>,
    ) -> Result<StatusCode, DavError> {
        self.config.credentials.apply(&mut headers);

        let mut request = self.http.request(method.clone(), url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|source| DavError::Request {
            method: method.clone(),
            path: path.to_string(),
            source,
        })?;
        let status = response.status();
        debug!(%method, path, %status, "webdav response");
        Ok(status)
    }

    fn unexpected(method: Method, path: &str, status: StatusCode) -> DavError {
        DavError::Status {
            method,
            path: path.to_string(),
            status,
        }
    }
}

impl DavClient for WebDavClient {
    fn connect(&self) -> DavFuture<'_, ()> {
        Box::pin(async move {
            let propfind = method("PROPFIND");
            let mut headers = HeaderMap::new();
            headers.insert("depth", HeaderValue::from_static("0"));

            let url = self.url_for("", true);
            let status = self.send(propfind.clone(), "/", url, headers, None).await?;
            if status.is_success() {
                Ok(())
            } else {
                Err(Self::unexpected(propfind, "/", status))
            }
        })
    }

    fn mkdir<'a>(&'a self, path: &'a str) -> DavFuture<'a, ()> {
        Box::pin(async move {
            let mkcol = method("MKCOL");
            let url = self.url_for(path, true);
            let status = self.send(mkcol.clone(), path, url, HeaderMap::new(), None).await?;

            match status {
                s if s.is_success() => Ok(()),
                StatusCode::METHOD_NOT_ALLOWED => {
                    debug!(path, "collection already exists");
                    Ok(())
                }
                s => Err(Self::unexpected(mkcol, path, s)),
            }
        })
    }

    fn write_stream<'a>(
        &'a self,
        path: &'a str,
        body: ChunkBody,
        range: Option<ContentRange>,
    ) -> DavFuture<'a, ()> {
        Box::pin(async move {
            let mut headers = HeaderMap::new();
            headers.typed_insert(ContentLength(body.len()));
            if let Some(range) = range {
                headers.typed_insert(range);
            }

            // reqwest only hands back an opaque body error, so keep the
            // local read failure to report it as such
            let local: Arc<Mutex<Option<io::Error>>> = Arc::default();
            let slot = Arc::clone(&local);
            let stream = body.into_stream().map_err(move |e| {
                let forwarded = io::Error::new(e.kind(), e.to_string());
                if let Ok(mut slot) = slot.lock() {
                    slot.get_or_insert(e);
                }
                forwarded
            });

            let url = self.url_for(path, false);
            let sent = self
                .send(Method::PUT, path, url, headers, Some(Body::wrap_stream(stream)))
                .await;
            if let Some(e) = local.lock().ok().and_then(|mut slot| slot.take()) {
                return Err(DavError::Io(e));
            }
            let status = sent?;

            if status.is_success() {
                Ok(())
            } else {
                Err(Self::unexpected(Method::PUT, path, status))
            }
        })
    }

    fn remove<'a>(&'a self, path: &'a str) -> DavFuture<'a, ()> {
        Box::pin(async move {
            let url = self.url_for(path, false);
            let status = self
                .send(Method::DELETE, path, url, HeaderMap::new(), None)
                .await?;

            match status {
                s if s.is_success() => Ok(()),
                StatusCode::NOT_FOUND => Ok(()),
                s => Err(Self::unexpected(Method::DELETE, path, s)),
            }
        })
    }
}
