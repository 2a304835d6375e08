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

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use strum_macros::AsRefStr;
use tokio::sync::mpsc;

use crate::error::DownloadError;

/// Observer of one download.
///
/// Every method has a no-op default so a listener only implements what it
/// cares about. Per listener the calls arrive in this order:
///
/// ```text
/// on_start -> on_progress* -> (on_success | on_not_found | on_fail | on_stop | on_cancel) -> on_end
/// ```
///
/// `on_start` is skipped when the download never reaches the transfer phase
/// (cache hit, 404 from the probe, cancel while probing). `on_end` always
/// comes last, exactly once, and nothing follows it.
///
/// Callbacks run on a Tokio worker thread; keep them short.
pub trait DownloadListener: Send + Sync {
    /// The transfer is about to start with `chunk_count` ranges. Called right
    /// after the HEAD probe, or immediately when no probe is sent.
    fn on_start(&self, _chunk_count: usize) {}

    /// `chunk_index` is always 0 for an unchunked download. `downloaded` never
    /// decreases for a given chunk. `total` is 0 while unknown.
    fn on_progress(&self, _chunk_index: usize, _downloaded: u64, _total: u64) {}

    /// The file is committed to the cache at `path`.
    fn on_success(&self, _path: &Path) {}

    /// The server answered 404. `on_fail` is not called in this case.
    fn on_not_found(&self) {}

    /// The download broke. Not called for cancels or stops.
    fn on_fail(&self, _error: Arc<DownloadError>) {}

    /// A streaming consumer stopped the download. `partial` points at the
    /// bytes received so far, if any.
    fn on_stop(&self, _partial: Option<&Path>) {}

    fn on_cancel(&self) {}

    /// Always the last call.
    fn on_end(&self) {}
}

/// A listener callback as data.
#[derive(Debug, Clone, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DownloadEvent {
    Start {
        chunk_count: usize,
    },
    Progress {
        chunk_index: usize,
        downloaded:  u64,
        total:       u64,
    },
    Success {
        path: PathBuf,
    },
    NotFound,
    Fail {
        error: Arc<DownloadError>,
    },
    Stop {
        partial: Option<PathBuf>,
    },
    Cancel,
    End,
}

impl DownloadEvent {
    /// Invoke the matching callback on `listener`.
    pub fn dispatch(&self, listener: &dyn DownloadListener) {
        match self {
            Self::Start { chunk_count } => listener.on_start(*chunk_count),
            Self::Progress {
                chunk_index,
                downloaded,
                total,
            } => listener.on_progress(*chunk_index, *downloaded, *total),
            Self::Success { path } => listener.on_success(path),
            Self::NotFound => listener.on_not_found(),
            Self::Fail { error } => listener.on_fail(Arc::clone(error)),
            Self::Stop { partial } => listener.on_stop(partial.as_deref()),
            Self::Cancel => listener.on_cancel(),
            Self::End => listener.on_end(),
        }
    }

    /// One of the five outcomes that precede `End`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success { .. }
                | Self::NotFound
                | Self::Fail { .. }
                | Self::Stop { .. }
                | Self::Cancel
        )
    }

    #[must_use]
    pub const fn is_end(&self) -> bool { matches!(self, Self::End) }
}

/// Listener that forwards every callback into a channel, for async
/// consumers.
///
/// ```no_run
/// # async fn demo(downloader: rangecache_downloader::Downloader) {
/// use rangecache_downloader::{DownloadEvent, DownloadRequest, EventStream};
///
/// let (listener, mut events) = EventStream::channel();
/// let request = DownloadRequest::builder().url("https://example.com/v.webm").build();
/// let _handle = downloader.start_download(request, listener);
/// while let Some(event) = events.recv().await {
///     if event.is_end() {
///         break;
///     }
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct EventStream {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl EventStream {
    #[must_use]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: DownloadEvent) { let _ = self.tx.send(event); }
}

impl DownloadListener for EventStream {
    fn on_start(&self, chunk_count: usize) { self.forward(DownloadEvent::Start { chunk_count }); }

    fn on_progress(&self, chunk_index: usize, downloaded: u64, total: u64) {
        self.forward(DownloadEvent::Progress {
            chunk_index,
            downloaded,
            total,
        });
    }

    fn on_success(&self, path: &Path) {
        self.forward(DownloadEvent::Success {
            path: path.to_path_buf(),
        });
    }

    fn on_not_found(&self) { self.forward(DownloadEvent::NotFound); }

    fn on_fail(&self, error: Arc<DownloadError>) { self.forward(DownloadEvent::Fail { error }); }

    fn on_stop(&self, partial: Option<&Path>) {
        self.forward(DownloadEvent::Stop {
            partial: partial.map(Path::to_path_buf),
        });
    }

    fn on_cancel(&self) { self.forward(DownloadEvent::Cancel); }

    fn on_end(&self) { self.forward(DownloadEvent::End); }
}
