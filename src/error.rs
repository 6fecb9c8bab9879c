use std::io;
use std::path::PathBuf;

use http::{Method, StatusCode};
use thiserror::Error;

/// Errors returned by the WebDAV collaborator
#[derive(Debug, Error)]
pub enum DavError {
    /// The request never produced a response (connect, TLS, timeout)
    #[error("{method} {path} failed: {source}")]
    Request {
        method: Method,
        path: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a status we do not accept
    #[error("{method} {path} returned {status}")]
    Status {
        method: Method,
        path: String,
        status: StatusCode,
    },

    #[error("invalid WebDAV url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("invalid byte range {start}+{length}/{total}")]
    InvalidRange { start: u64, length: u64, total: u64 },

    /// Reading the local source failed while streaming a body
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DavError {
    /// Anything the server or the network said is worth another attempt.
    /// Local problems (bad url, client setup, reading the source file) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            DavError::Request { .. } | DavError::Status { .. } => true,
            DavError::InvalidUrl { .. }
            | DavError::Client(_)
            | DavError::InvalidRange { .. }
            | DavError::Io(_) => false,
        }
    }
}

/// Errors surfaced by the upload engine, one per file or per walk
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("cannot read {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot connect to WebDAV server: {0}")]
    Connect(#[source] DavError),

    #[error("cannot create remote directory {path}: {source}")]
    Mkdir {
        path: String,
        #[source]
        source: DavError,
    },

    #[error("chunk {index} (offset {offset}) of {path} failed after {attempts} attempt(s): {source}")]
    ChunkFailed {
        path: String,
        index: u64,
        offset: u64,
        attempts: u32,
        #[source]
        source: DavError,
    },

    #[error("upload of {path} was cancelled")]
    Cancelled { path: String },

    #[error("walking {}: {source}", root.display())]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("upload worker stopped abnormally: {0}")]
    Worker(#[from] tokio::task::JoinError),
}
