// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    convert::Infallible,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::head,
};
use axum_test::TestServer;
use futures::{StreamExt, stream};
use jiff::SignedDuration;
use parking_lot::Mutex;
use rangecache_downloader::{DownloadEvent, DownloadRequest, Downloader, DownloaderConfig};
use tempfile::TempDir;
use tokio::sync::{Semaphore, mpsc::UnboundedReceiver};

#[derive(Clone)]
pub struct AppState {
    pub content:       Arc<Vec<u8>>,
    pub accept_ranges: bool,
    /// Advertise ranges on HEAD but answer every GET with the whole body.
    pub ignore_ranges: bool,
    pub head_status:   StatusCode,
    pub get_status:    StatusCode,
    /// A ranged GET starting at this offset sends one small frame and then
    /// hangs.
    pub stall_from:    Arc<Mutex<Option<usize>>>,
    /// When set, every GET waits for a permit before answering.
    pub gate:          Option<Arc<Semaphore>>,
    pub heads:         Arc<AtomicUsize>,
    pub gets:          Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content:       Arc::new(content),
            accept_ranges: true,
            ignore_ranges: false,
            head_status:   StatusCode::OK,
            get_status:    StatusCode::OK,
            stall_from:    Arc::new(Mutex::new(None)),
            gate:          None,
            heads:         Arc::new(AtomicUsize::new(0)),
            gets:          Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1024);
        }
    }

    pub fn heads(&self) -> usize { self.heads.load(Ordering::SeqCst) }

    pub fn gets(&self) -> usize { self.gets.load(Ordering::SeqCst) }
}

async fn handle_head(State(state): State<AppState>) -> Response {
    state.heads.fetch_add(1, Ordering::SeqCst);
    if state.head_status != StatusCode::OK {
        return state.head_status.into_response();
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(state.content.len()),
    );
    if state.accept_ranges {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    (StatusCode::OK, headers).into_response()
}

async fn handle_get(headers: HeaderMap, State(state): State<AppState>) -> Response {
    state.gets.fetch_add(1, Ordering::SeqCst);
    if let Some(gate) = &state.gate
        && let Ok(permit) = gate.acquire().await
    {
        permit.forget();
    }
    if state.get_status != StatusCode::OK {
        return state.get_status.into_response();
    }

    let total_len = state.content.len();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_range(value, total_len))
        .filter(|_| state.accept_ranges && !state.ignore_ranges);

    let Some((start, end)) = range else {
        let mut response_headers = HeaderMap::new();
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total_len));
        return (
            StatusCode::OK,
            response_headers,
            Bytes::copy_from_slice(&state.content),
        )
            .into_response();
    };

    let slice = Bytes::copy_from_slice(&state.content[start..=end]);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {start}-{end}/{total_len}")).unwrap(),
    );
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(slice.len()));

    let stalled = *state.stall_from.lock() == Some(start);
    if stalled {
        let first = slice.slice(..slice.len().min(1024));
        let body = Body::from_stream(
            stream::once(async move { Ok::<_, Infallible>(first) }).chain(stream::pending()),
        );
        return (StatusCode::PARTIAL_CONTENT, response_headers, body).into_response();
    }
    (StatusCode::PARTIAL_CONTENT, response_headers, slice).into_response()
}

fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let value = value.strip_prefix("bytes=")?;
    let (start_str, end_str) = value.split_once('-')?;
    let start: usize = start_str.parse().ok()?;
    let end: usize = end_str.parse().ok()?;
    if start <= end && end < total {
        Some((start, end))
    } else {
        None
    }
}

pub fn create_temp_dir(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(&format!("rangecache-{prefix}-"))
        .tempdir()
        .expect("failed to create temp dir")
}

fn create_test_server(state: AppState) -> TestServer {
    let app = Router::new()
        .route("/file", head(handle_head).get(handle_get))
        .with_state(state);

    TestServer::builder()
        .http_transport()
        .build(app)
}

fn get_file_url(server: &TestServer) -> String {
    let base = server
        .server_address()
        .expect("server should have HTTP address")
        .to_string();
    if base.ends_with('/') {
        format!("{base}file")
    } else {
        format!("{base}/file")
    }
}

/// Deterministic, non-repeating-per-chunk body.
pub fn sample(len: usize) -> Vec<u8> { (0..len).map(|i| (i % 251) as u8).collect() }

pub struct Fixture {
    pub server:     TestServer,
    pub state:      AppState,
    pub url:        String,
    pub downloader: Downloader,
    pub cache_dir:  TempDir,
    pub chunks_dir: TempDir,
}

impl Fixture {
    pub fn new(state: AppState) -> Self { Self::with_stall_timeout(state, SignedDuration::from_secs(10)) }

    pub fn with_stall_timeout(state: AppState, stall_timeout: SignedDuration) -> Self {
        rangecache_common_telemetry::init_default_ut_logging();

        let server = create_test_server(state.clone());
        let url = get_file_url(&server);
        let cache_dir = create_temp_dir("cache");
        let chunks_dir = create_temp_dir("chunks");
        let config = DownloaderConfig::builder()
            .cache_dir(cache_dir.path().to_path_buf())
            .chunks_dir(chunks_dir.path().to_path_buf())
            .probe_timeout(SignedDuration::from_secs(5))
            .stall_timeout(stall_timeout)
            .progress_min_interval(SignedDuration::from_millis(10))
            .build();
        let downloader = Downloader::new(config).expect("failed to create downloader");

        Self {
            server,
            state,
            url,
            downloader,
            cache_dir,
            chunks_dir,
        }
    }

    pub fn request(&self, chunk_count: usize) -> DownloadRequest {
        DownloadRequest::builder()
            .url(self.url.clone())
            .chunk_count(chunk_count)
            .build()
    }

    /// Put a plain file where `dir` was, so nothing can be created under it.
    pub fn block_dir(dir: &TempDir) {
        std::fs::remove_dir_all(dir.path()).expect("failed to remove dir");
        std::fs::write(dir.path(), b"not a directory").expect("failed to write blocker");
    }

    /// Files left in the chunks directory.
    pub fn leftovers(&self) -> Vec<String> { list_dir(self.chunks_dir.path()) }
}

pub fn list_dir(path: &Path) -> Vec<String> {
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// Receive events until `End`.
pub async fn collect(mut rx: UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(event) = rx.recv().await {
            let end = event.is_end();
            events.push(event);
            if end {
                break;
            }
        }
    })
    .await
    .expect("download did not end in time");
    events
}

/// Poll `condition` until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Event names with progress ticks left out, e.g. `["start(3)", "success",
/// "end"]`.
pub fn outline(events: &[DownloadEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|event| !matches!(event, DownloadEvent::Progress { .. }))
        .map(|event| match event {
            DownloadEvent::Start { chunk_count } => format!("start({chunk_count})"),
            other => other.as_ref().to_string(),
        })
        .collect()
}

/// Latest `(downloaded, total)` reported for `chunk`.
pub fn last_progress(events: &[DownloadEvent], chunk: usize) -> Option<(u64, u64)> {
    events.iter().rev().find_map(|event| match event {
        DownloadEvent::Progress {
            chunk_index,
            downloaded,
            total,
        } if *chunk_index == chunk => Some((*downloaded, *total)),
        _ => None,
    })
}

/// `on_start? on_progress* terminal on_end`, with progress never going
/// backwards within a chunk.
pub fn assert_lifecycle(events: &[DownloadEvent]) {
    let (last, rest) = events.split_last().expect("no events");
    assert!(last.is_end(), "last event is {last:?}");
    let (terminal, rest) = rest.split_last().expect("no terminal event");
    assert!(terminal.is_terminal(), "expected a terminal event, got {terminal:?}");

    let mut seen: HashMap<usize, u64> = HashMap::new();
    for (position, event) in rest.iter().enumerate() {
        match event {
            DownloadEvent::Start { .. } => assert_eq!(position, 0, "start must come first"),
            DownloadEvent::Progress {
                chunk_index,
                downloaded,
                ..
            } => {
                let previous = seen.insert(*chunk_index, *downloaded).unwrap_or(0);
                assert!(
                    *downloaded >= previous,
                    "chunk {chunk_index} went from {previous} to {downloaded}"
                );
            }
            other => panic!("unexpected {other:?} before the terminal event"),
        }
    }
}
