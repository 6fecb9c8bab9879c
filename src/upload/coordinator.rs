//! One file, end to end: open, chunk, upload concurrently, clean up on failure.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::chunk::{spawn_producer, ChunkPlan, DEFAULT_CHUNK_SIZE};
use super::pool::{run_pool, PoolReport};
use super::retry::{RetryError, RetryPolicy};
use super::throughput::Throughput;
use crate::error::UploadError;
use crate::webdav::{ChunkBody, Connector, DavClient};

/// Default number of concurrent chunk uploads per file
pub const DEFAULT_WORKERS: usize = 4;

/// Tuning shared by every file of a run
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: u64,
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Skip local entries whose relative path matches
    pub exclude: Option<Regex>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            exclude: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Uploading,
    Cancelling,
    Success,
    Failed,
}

/// A single file transfer in flight
#[derive(Debug)]
pub struct UploadJob {
    pub local: PathBuf,
    pub remote: Arc<str>,
    cancel: CancellationToken,
    state: UploadState,
}

impl UploadJob {
    pub fn new(local: &Path, remote: &str) -> Self {
        Self {
            local: local.to_path_buf(),
            remote: Arc::from(remote),
            cancel: CancellationToken::new(),
            state: UploadState::Idle,
        }
    }

    fn transition(&mut self, next: UploadState) {
        debug!(remote = %self.remote, from = ?self.state, to = ?next, "upload state");
        self.state = next;
    }
}

/// Outcome of a successful file upload
#[derive(Debug, Clone)]
pub struct FileReport {
    pub local: PathBuf,
    pub remote: String,
    pub bytes: u64,
    pub chunks: u64,
    pub elapsed: Duration,
}

impl FileReport {
    pub fn throughput(&self) -> Throughput {
        Throughput::new(self.bytes, self.elapsed)
    }
}

/// Upload `local` to `remote` exactly once.
///
/// Non-empty files go through the chunk producer and worker pool. Empty files
/// are written with a single plain PUT, since a byte range cannot describe
/// zero bytes. If any chunk fails for good the partially written remote file
/// is removed (best effort) and the chunk's error is returned.
pub async fn upload_file<C: Connector>(
    connector: &Arc<C>,
    local: &Path,
    remote: &str,
    options: &UploadOptions,
) -> Result<FileReport, UploadError> {
    let mut job = UploadJob::new(local, remote);
    let started = Instant::now();

    let open_err = |source| UploadError::Open {
        path: local.to_path_buf(),
        source,
    };
    let file = tokio::fs::File::open(local).await.map_err(open_err)?;
    let metadata = file.metadata().await.map_err(open_err)?;
    if !metadata.is_file() {
        return Err(open_err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    let size = metadata.len();
    let file = Arc::new(file.into_std().await);

    job.transition(UploadState::Uploading);
    info!(
        local = %local.display(),
        remote,
        bytes = size,
        chunks = ChunkPlan::new(size, options.chunk_size).chunk_count(),
        "uploading file"
    );

    let result = if size == 0 {
        upload_empty(connector, &job, &options.retry).await
    } else {
        let (queue, producer) = spawn_producer(
            Arc::clone(&file),
            size,
            options.chunk_size,
            options.workers,
            job.cancel.clone(),
        );
        let pooled = run_pool(
            Arc::clone(connector),
            Arc::clone(&job.remote),
            queue,
            options.workers,
            options.retry.clone(),
            job.cancel.clone(),
        )
        .await;

        let produced = producer.await;
        match (pooled, produced) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(join)) => Err(UploadError::Worker(join)),
            (Ok(report), Ok(_)) => Ok(report),
        }
    };

    match result {
        Ok(report) => {
            job.transition(UploadState::Success);
            let file_report = FileReport {
                local: job.local,
                remote: remote.to_string(),
                bytes: report.bytes,
                chunks: report.chunks,
                elapsed: started.elapsed(),
            };
            info!(
                local = %file_report.local.display(),
                remote,
                bytes = file_report.bytes,
                chunks = file_report.chunks,
                elapsed_ms = file_report.elapsed.as_millis() as u64,
                throughput = %file_report.throughput(),
                "file uploaded"
            );
            Ok(file_report)
        }
        Err(e) => {
            job.cancel.cancel();
            job.transition(UploadState::Cancelling);
            cleanup(connector.as_ref(), remote).await;
            job.transition(UploadState::Failed);
            Err(e)
        }
    }
}

async fn upload_empty<C: Connector>(
    connector: &Arc<C>,
    job: &UploadJob,
    retry: &RetryPolicy,
) -> Result<PoolReport, UploadError> {
    let path = &*job.remote;
    let connector = connector.as_ref();

    let written = retry
        .run(&job.cancel, |_| async move {
            let client = connector.client()?;
            client.write_stream(path, ChunkBody::empty(), None).await
        })
        .await;

    match written {
        Ok(()) => Ok(PoolReport {
            chunks: 0,
            bytes: 0,
        }),
        Err(RetryError::Failed { attempts, source }) => Err(UploadError::ChunkFailed {
            path: path.to_string(),
            index: 0,
            offset: 0,
            attempts,
            source,
        }),
        Err(RetryError::Cancelled { .. }) => Err(UploadError::Cancelled {
            path: path.to_string(),
        }),
    }
}

/// Remove a partially written remote file. Failures are only logged.
async fn cleanup<C: Connector>(connector: &C, remote: &str) {
    warn!(remote, "upload failed, removing partial remote file");

    let removed = match connector.client() {
        Ok(client) => client.remove(remote).await,
        Err(e) => Err(e),
    };
    if let Err(e) = removed {
        error!(remote, error = %e, "cleanup of partial remote file failed");
    }
}
