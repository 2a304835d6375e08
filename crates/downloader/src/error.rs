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

use std::{path::PathBuf, time::Duration};

use snafu::Snafu;
use strum_macros::Display;

/// Coarse classification of a [`DownloadError`].
///
/// Listeners use it to tell a broken download from a missing resource or a
/// user cancel without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// HEAD probe failed. Never terminal: the coordinator falls back to a
    /// single unranged fetch.
    Probe,
    /// The server answered 404.
    NotFound,
    /// A chunk could not be transferred.
    Transport,
    /// Local disk trouble while writing, finalizing or committing.
    Io,
    /// The download was cancelled.
    Cancelled,
    /// A fetcher task died unexpectedly, or the engine could not start.
    Internal,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DownloadError {
    #[snafu(display("Probe of {url} failed: {source}"))]
    Probe { url: String, source: reqwest::Error },

    #[snafu(display("Probe of {url} returned HTTP {status}"))]
    ProbeStatus { url: String, status: u16 },

    #[snafu(display("Probe of {url} timed out after {timeout:?}"))]
    ProbeTimeout { url: String, timeout: Duration },

    #[snafu(display("{url} was not found"))]
    NotFound { url: String },

    #[snafu(display("Network error on chunk {index}: {source}"))]
    Network { index: usize, source: reqwest::Error },

    #[snafu(display("HTTP {status} on chunk {index} of {url}"))]
    Http {
        index:  usize,
        status: u16,
        url:    String,
    },

    #[snafu(display("Chunk {index} stalled: no data for {timeout:?}"))]
    Stalled { index: usize, timeout: Duration },

    #[snafu(display("Server ignored the Range header for chunk {index}"))]
    RangeIgnored { index: usize },

    #[snafu(display("Chunk {index} length mismatch: expected {expected} bytes, got {actual}"))]
    LengthMismatch {
        index:    usize,
        expected: u64,
        actual:   u64,
    },

    #[snafu(display("File write error at {}: {source}", path.display()))]
    FileWrite {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("File read error at {}: {source}", path.display()))]
    FileRead {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Metadata at {} is malformed: {source}", path.display()))]
    MetadataCorrupted {
        path:   PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to encode {what}: {source}"))]
    Encode {
        what:   &'static str,
        source: serde_json::Error,
    },

    #[snafu(display("Download was cancelled"))]
    Cancelled,

    #[snafu(display("Chunk {index} task panicked"))]
    TaskPanic { index: usize },

    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild { source: reqwest::Error },
}

impl DownloadError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Probe { .. } | Self::ProbeStatus { .. } | Self::ProbeTimeout { .. } => {
                ErrorKind::Probe
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Network { .. }
            | Self::Http { .. }
            | Self::Stalled { .. }
            | Self::RangeIgnored { .. }
            | Self::LengthMismatch { .. } => ErrorKind::Transport,
            Self::FileWrite { .. }
            | Self::FileRead { .. }
            | Self::MetadataCorrupted { .. }
            | Self::Encode { .. } => ErrorKind::Io,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::TaskPanic { .. } | Self::ClientBuild { .. } => ErrorKind::Internal,
        }
    }

    /// Whether re-invoking the download has a reasonable chance of
    /// succeeding. The engine never retries a chunk on its own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool { matches!(self.kind(), ErrorKind::Transport) }
}
