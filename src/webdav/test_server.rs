//! In-process WebDAV stand-in used by tests.
//!
//! Speaks just enough of the protocol for the uploader: PROPFIND on a
//! collection, MKCOL, PUT (whole or `Content-Range`) and DELETE. Every request
//! is recorded so tests can assert on the exact wire traffic.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use headers::{authorization::Basic, Authorization, ContentRange, HeaderMapExt};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub content_range: Option<String>,
}

#[derive(Default)]
struct Store {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    requests: Vec<Recorded>,
}

struct Shared {
    username: String,
    password: String,
    store: Mutex<Store>,
    failing_puts: AtomicU32,
}

pub struct TestServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl TestServer {
    /// Bind to an ephemeral port and serve until the runtime shuts down
    pub async fn start(username: &str, password: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut store = Store::default();
        store.dirs.insert("/".into());
        store.dirs.insert("/dav".into());

        let shared = Arc::new(Shared {
            username: username.into(),
            password: password.into(),
            store: Mutex::new(store),
            failing_puts: AtomicU32::new(0),
        });

        let state = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(req, state).await }
                    });

                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        Self { addr, shared }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Answer the next `n` PUT requests with 503
    pub fn fail_next_puts(&self, n: u32) {
        self.shared.failing_puts.store(n, Ordering::SeqCst);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.shared.store.lock().unwrap().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.shared.store.lock().unwrap().dirs.contains(path)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.shared.store.lock().unwrap().requests.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests().iter().filter(|r| r.method == method).count()
    }

    pub fn content_ranges(&self, path: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .filter_map(|r| r.content_range)
            .collect()
    }
}

fn verify_credentials(provided: &Authorization<Basic>, shared: &Shared) -> bool {
    let username_match = provided
        .username()
        .as_bytes()
        .ct_eq(shared.username.as_bytes());
    let password_match = provided
        .password()
        .as_bytes()
        .ct_eq(shared.password.as_bytes());

    (username_match & password_match).into()
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn respond(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<Incoming>,
    shared: Arc<Shared>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().as_str().to_string();
    let decoded = percent_decode_str(req.uri().path())
        .decode_utf8_lossy()
        .to_string();
    let path = match decoded.trim_end_matches('/') {
        "" => "/".to_string(),
        p => p.to_string(),
    };
    let range = req.headers().typed_get::<ContentRange>();

    shared.store.lock().unwrap().requests.push(Recorded {
        method: method.clone(),
        path: path.clone(),
        content_range: req
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    let authorized = req
        .headers()
        .typed_get::<Authorization<Basic>>()
        .is_some_and(|auth| verify_credentials(&auth, &shared));
    if !authorized {
        return Ok(respond(StatusCode::UNAUTHORIZED));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(respond(StatusCode::BAD_REQUEST)),
    };

    let status = match method.as_str() {
        "PROPFIND" => {
            let store = shared.store.lock().unwrap();
            if store.dirs.contains(&path) || store.files.contains_key(&path) {
                StatusCode::MULTI_STATUS
            } else {
                StatusCode::NOT_FOUND
            }
        }
        "MKCOL" => {
            let mut store = shared.store.lock().unwrap();
            if store.dirs.contains(&path) || store.files.contains_key(&path) {
                StatusCode::METHOD_NOT_ALLOWED
            } else if !store.dirs.contains(parent_of(&path)) {
                StatusCode::CONFLICT
            } else {
                store.dirs.insert(path);
                StatusCode::CREATED
            }
        }
        "PUT" => {
            let failing = shared
                .failing_puts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let mut store = shared.store.lock().unwrap();
            if failing {
                StatusCode::SERVICE_UNAVAILABLE
            } else if !store.dirs.contains(parent_of(&path)) {
                StatusCode::CONFLICT
            } else {
                match range.as_ref().and_then(|r| r.bytes_range().zip(r.bytes_len())) {
                    Some(((start, end), total)) => {
                        let file = store.files.entry(path).or_default();
                        file.resize(file.len().max(total as usize), 0);
                        file[start as usize..=end as usize].copy_from_slice(&body);
                        StatusCode::NO_CONTENT
                    }
                    None => {
                        store.files.insert(path, body.to_vec());
                        StatusCode::CREATED
                    }
                }
            }
        }
        "DELETE" => {
            let mut store = shared.store.lock().unwrap();
            if store.files.remove(&path).is_some() {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::NOT_FOUND
            }
        }
        _ => StatusCode::METHOD_NOT_ALLOWED,
    };

    Ok(respond(status))
}
