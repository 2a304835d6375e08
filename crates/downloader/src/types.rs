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

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{config::DEFAULT_CHUNK_COUNT, key::ContentKey};

/// A request to download a file into the cache
#[derive(Debug, Clone, Builder)]
pub struct DownloadRequest {
    /// URL to download from
    #[builder(into)]
    pub url:              String,
    /// Dedupe and cache key; the URL when absent
    #[builder(into)]
    pub destination_key:  Option<String>,
    /// Whether the engine may probe the server and split the body into ranges
    #[builder(default = true)]
    pub chunking_enabled: bool,
    #[builder(default = DEFAULT_CHUNK_COUNT)]
    pub chunk_count:      usize,
    /// Ignore an existing cache entry and download again
    #[builder(default)]
    pub force_refresh:    bool,
}

impl DownloadRequest {
    #[must_use]
    pub fn content_key(&self) -> ContentKey {
        ContentKey::derive(self.destination_key.as_deref().unwrap_or(&self.url))
    }

    /// Chunk count before server-side limits apply; 1 when chunking is off.
    #[must_use]
    pub fn desired_chunks(&self) -> usize {
        if self.chunking_enabled {
            self.chunk_count.max(1)
        } else {
            1
        }
    }
}

/// Lifecycle of one logical download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DownloadState {
    NotStarted,
    Probing,
    #[strum(to_string = "downloading({chunk_count})")]
    Downloading {
        chunk_count: usize,
    },
    Success,
    NotFound,
    Failed,
    Stopped,
    Canceled,
    Ended,
}

impl DownloadState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::NotFound
                | Self::Failed
                | Self::Stopped
                | Self::Canceled
                | Self::Ended
        )
    }
}

/// Status of a single chunk
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    #[default]
    Pending,
    InFlight,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkProgress {
    pub state:      ChunkState,
    pub downloaded: u64,
    /// 0 while unknown
    pub total:      u64,
}

/// Point-in-time view of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSnapshot {
    pub state:  DownloadState,
    pub chunks: Vec<ChunkProgress>,
}

impl DownloadSnapshot {
    #[must_use]
    pub fn downloaded(&self) -> u64 { self.chunks.iter().map(|c| c.downloaded).sum() }

    #[must_use]
    pub fn total(&self) -> u64 { self.chunks.iter().map(|c| c.total).sum() }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn request_defaults() {
        let request = DownloadRequest::builder()
            .url("http://example.com/a.webm")
            .build();
        assert!(request.chunking_enabled);
        assert_eq!(request.chunk_count, DEFAULT_CHUNK_COUNT);
        assert!(!request.force_refresh);
        assert_eq!(
            request.content_key(),
            ContentKey::derive("http://example.com/a.webm")
        );
    }

    #[test]
    fn destination_key_overrides_url() {
        let request = DownloadRequest::builder()
            .url("http://mirror-1.example.com/a.webm")
            .destination_key("a.webm")
            .chunking_enabled(false)
            .chunk_count(8)
            .build();
        assert_eq!(request.content_key(), ContentKey::derive("a.webm"));
        assert_eq!(request.desired_chunks(), 1);
    }

    #[test]
    fn state_names() {
        assert_eq!(
            DownloadState::Downloading { chunk_count: 3 }.to_string(),
            "downloading(3)"
        );
        assert_eq!(DownloadState::NotFound.to_string(), "not_found");
        assert!(DownloadState::Stopped.is_terminal());
        assert!(!DownloadState::Probing.is_terminal());
        assert_eq!(ChunkState::from_str("in_flight").unwrap(), ChunkState::InFlight);
    }
}
