//! Fixed-size pool of chunk uploaders sharing one queue.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::chunk::FileChunk;
use super::retry::{RetryError, RetryPolicy};
use super::throughput::Throughput;
use crate::error::UploadError;
use crate::webdav::{Connector, DavClient};

type SharedQueue = Arc<Mutex<mpsc::Receiver<FileChunk>>>;

/// What the pool managed to upload
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub chunks: u64,
    pub bytes: u64,
}

impl PoolReport {
    fn merge(&mut self, other: PoolReport) {
        self.chunks += other.chunks;
        self.bytes += other.bytes;
    }
}

/// Upload every chunk arriving on `queue` to `remote` with `workers` concurrent workers.
///
/// The first chunk that exhausts its retries cancels `cancel`; workers finish
/// whatever they are writing and stop taking new chunks. That chunk's error is
/// returned once every worker has stopped.
pub async fn run_pool<C: Connector>(
    connector: Arc<C>,
    remote: Arc<str>,
    queue: mpsc::Receiver<FileChunk>,
    workers: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Result<PoolReport, UploadError> {
    let queue: SharedQueue = Arc::new(Mutex::new(queue));
    let mut set = JoinSet::new();

    for id in 0..workers.max(1) {
        set.spawn(worker(
            id,
            Arc::clone(&connector),
            Arc::clone(&remote),
            Arc::clone(&queue),
            retry.clone(),
            cancel.clone(),
        ));
    }

    let mut report = PoolReport::default();
    let mut failure = None;

    while let Some(joined) = set.join_next().await {
        let outcome = joined.map_err(UploadError::from).and_then(|r| r);
        match outcome {
            Ok(stats) => report.merge(stats),
            Err(e) => {
                cancel.cancel();
                failure.get_or_insert(e);
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

async fn worker<C: Connector>(
    id: usize,
    connector: Arc<C>,
    remote: Arc<str>,
    queue: SharedQueue,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Result<PoolReport, UploadError> {
    let mut stats = PoolReport::default();

    loop {
        if cancel.is_cancelled() {
            debug!(worker = id, "cancelled, taking no more chunks");
            break;
        }

        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = rx.recv() => chunk,
            }
        };
        let Some(chunk) = next else {
            break;
        };

        let span = chunk.span;
        let started = Instant::now();
        let connector = &*connector;
        let path = &*remote;
        let chunk = &chunk;

        let result = retry
            .run(&cancel, |attempt| async move {
                debug!(worker = id, index = span.index, attempt, "writing chunk");
                let client = connector.client()?;
                let range = span.content_range()?;
                client.write_stream(path, chunk.reader(), Some(range)).await
            })
            .await;

        match result {
            Ok(()) => {
                let elapsed = started.elapsed();
                stats.chunks += 1;
                stats.bytes += span.length;
                info!(
                    path,
                    index = span.index,
                    offset = span.offset,
                    bytes = span.length,
                    elapsed_ms = elapsed.as_millis() as u64,
                    throughput = %Throughput::new(span.length, elapsed),
                    "chunk uploaded"
                );
            }
            Err(RetryError::Cancelled { attempts }) => {
                debug!(worker = id, index = span.index, attempts, "chunk abandoned after cancellation");
                break;
            }
            Err(RetryError::Failed { attempts, source }) => {
                error!(
                    path,
                    index = span.index,
                    offset = span.offset,
                    attempts,
                    error = %source,
                    "chunk failed permanently, cancelling upload"
                );
                cancel.cancel();
                return Err(UploadError::ChunkFailed {
                    path: path.to_string(),
                    index: span.index,
                    offset: span.offset,
                    attempts,
                    source,
                });
            }
        }
    }

    Ok(stats)
}
