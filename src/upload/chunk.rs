//! Splitting a file into fixed-size byte ranges.
//!
//! [`ChunkPlan`] is the pure arithmetic; [`FileChunk`] binds a span to the open
//! file and can hand out any number of independent readers over it. Readers use
//! positional reads, so concurrent workers never share a file cursor.

use std::fs::File;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream;
use headers::ContentRange;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DavError;
use crate::webdav::{byte_range, ChunkBody};

/// 32 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Size of a single positional read while streaming a chunk
const READ_BLOCK: u64 = 256 * 1024;

/// One contiguous range of the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u64,
    pub offset: u64,
    pub length: u64,
    /// Total size of the source file
    pub size: u64,
}

impl ChunkSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn content_range(&self) -> Result<ContentRange, DavError> {
        byte_range(self.offset, self.length, self.size)
    }
}

/// Lazy, ordered sequence of spans covering `[0, size)` exactly once
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    size: u64,
    max_chunk_size: u64,
    next_index: u64,
    next_offset: u64,
}

impl ChunkPlan {
    /// A `max_chunk_size` of zero is treated as one byte.
    pub fn new(size: u64, max_chunk_size: u64) -> Self {
        Self {
            size,
            max_chunk_size: max_chunk_size.max(1),
            next_index: 0,
            next_offset: 0,
        }
    }

    /// Number of chunks the full plan yields
    pub fn chunk_count(&self) -> u64 {
        self.size.div_ceil(self.max_chunk_size)
    }
}

impl Iterator for ChunkPlan {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        if self.next_offset >= self.size {
            return None;
        }

        let span = ChunkSpan {
            index: self.next_index,
            offset: self.next_offset,
            length: self.max_chunk_size.min(self.size - self.next_offset),
            size: self.size,
        };
        self.next_index += 1;
        self.next_offset += span.length;
        Some(span)
    }
}

/// A span plus the file it is read from
#[derive(Debug, Clone)]
pub struct FileChunk {
    pub span: ChunkSpan,
    file: Arc<File>,
}

impl FileChunk {
    pub fn new(span: ChunkSpan, file: Arc<File>) -> Self {
        Self { span, file }
    }

    /// A fresh body streaming exactly this chunk's bytes.
    ///
    /// Every call starts again at the chunk's first byte, so a retry simply
    /// asks for a new reader.
    pub fn reader(&self) -> ChunkBody {
        let end = self.span.end();
        let state = (Arc::clone(&self.file), self.span.offset);

        let blocks = stream::unfold(state, move |(file, pos)| async move {
            if pos >= end {
                return None;
            }

            let len = (end - pos).min(READ_BLOCK) as usize;
            let reading = Arc::clone(&file);
            let read = tokio::task::spawn_blocking(move || read_exact_at(&reading, len, pos)).await;

            match read {
                Ok(Ok(buf)) => {
                    let next = pos + buf.len() as u64;
                    Some((Ok(Bytes::from(buf)), (file, next)))
                }
                Ok(Err(e)) => Some((Err(e), (file, end))),
                Err(e) => Some((Err(io::Error::other(e)), (file, end))),
            }
        });

        ChunkBody::new(self.span.length, blocks)
    }
}

fn read_exact_at(file: &File, len: usize, offset: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; len];
    let mut filled = 0;

    while filled < len {
        match read_at(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shrank while it was being uploaded",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(buf)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Feed the chunks of `file` into a bounded queue from a dedicated task.
///
/// The task blocks while the queue is full and stops early once `cancel`
/// fires or every receiver is gone. It resolves to the number of chunks sent.
pub fn spawn_producer(
    file: Arc<File>,
    size: u64,
    max_chunk_size: u64,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<FileChunk>, JoinHandle<u64>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::spawn(async move {
        let mut sent = 0;
        for span in ChunkPlan::new(size, max_chunk_size) {
            let chunk = FileChunk::new(span, Arc::clone(&file));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(index = span.index, "producer stopped by cancellation");
                    break;
                }
                queued = tx.send(chunk) => {
                    if queued.is_err() {
                        debug!(index = span.index, "producer stopped, no consumers left");
                        break;
                    }
                }
            }
            sent += 1;
        }
        sent
    });

    (rx, handle)
}
