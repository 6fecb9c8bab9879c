//! In-memory WebDAV double for engine tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use headers::ContentRange;
use http::{Method, StatusCode};

use crate::error::DavError;
use crate::webdav::{ChunkBody, Connector, DavClient, DavFuture};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Mkdir(String),
    /// Path and range start (`None` for a whole-file write)
    Write(String, Option<u64>),
    Remove(String),
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    calls: Vec<Call>,
    clients: usize,
    /// Range offsets that fail; `None` means always
    failing: HashMap<u64, Option<u32>>,
    fail_remove: bool,
    failing_dirs: BTreeSet<String>,
}

#[derive(Clone, Default)]
pub struct FakeDav {
    state: Arc<Mutex<State>>,
}

fn unavailable(path: &str) -> DavError {
    DavError::Status {
        method: Method::PUT,
        path: path.to_string(),
        status: StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl FakeDav {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write of the chunk starting at `offset` fails
    pub fn fail_chunk_at(&self, offset: u64) {
        self.state.lock().unwrap().failing.insert(offset, None);
    }

    /// The first `times` writes of the chunk starting at `offset` fail
    pub fn flaky_chunk_at(&self, offset: u64, times: u32) {
        self.state.lock().unwrap().failing.insert(offset, Some(times));
    }

    /// Creating the collection at `path` fails
    pub fn fail_mkdir(&self, path: &str) {
        self.state.lock().unwrap().failing_dirs.insert(path.to_string());
    }

    pub fn fail_remove(&self) {
        self.state.lock().unwrap().fail_remove = true;
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains(path)
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.lock().unwrap().files.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clients(&self) -> usize {
        self.state.lock().unwrap().clients
    }

    pub fn writes_at(&self, offset: u64) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Write(_, Some(o)) if *o == offset))
            .count()
    }

    pub fn removes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Remove(_)))
            .count()
    }

    pub fn mkdirs(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Mkdir(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

impl Connector for FakeDav {
    type Client = FakeDav;

    fn client(&self) -> Result<FakeDav, DavError> {
        self.state.lock().unwrap().clients += 1;
        Ok(self.clone())
    }
}

impl DavClient for FakeDav {
    fn connect(&self) -> DavFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn mkdir<'a>(&'a self, path: &'a str) -> DavFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Mkdir(path.to_string()));
            if state.failing_dirs.contains(path) {
                return Err(DavError::Status {
                    method: Method::from_bytes(b"MKCOL").unwrap(),
                    path: path.to_string(),
                    status: StatusCode::FORBIDDEN,
                });
            }
            state.dirs.insert(path.to_string());
            Ok(())
        })
    }

    fn write_stream<'a>(
        &'a self,
        path: &'a str,
        body: ChunkBody,
        range: Option<ContentRange>,
    ) -> DavFuture<'a, ()> {
        Box::pin(async move {
            let span = range.as_ref().and_then(|r| r.bytes_range().zip(r.bytes_len()));
            let start = span.map(|((start, _), _)| start);

            let should_fail = {
                let mut state = self.state.lock().unwrap();
                state.calls.push(Call::Write(path.to_string(), start));
                match start.and_then(|s| state.failing.get_mut(&s)) {
                    Some(None) => true,
                    Some(Some(0)) | None => false,
                    Some(Some(left)) => {
                        *left -= 1;
                        true
                    }
                }
            };
            if should_fail {
                return Err(unavailable(path));
            }

            let data = body.collect().await?;

            let mut state = self.state.lock().unwrap();
            match span {
                Some(((start, end), total)) => {
                    let file = state.files.entry(path.to_string()).or_default();
                    file.resize(file.len().max(total as usize), 0);
                    file[start as usize..=end as usize].copy_from_slice(&data);
                }
                None => {
                    state.files.insert(path.to_string(), data);
                }
            }
            Ok(())
        })
    }

    fn remove<'a>(&'a self, path: &'a str) -> DavFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Remove(path.to_string()));
            if state.fail_remove {
                return Err(DavError::Status {
                    method: Method::DELETE,
                    path: path.to_string(),
                    status: StatusCode::LOCKED,
                });
            }
            state.files.remove(path);
            Ok(())
        })
    }
}
