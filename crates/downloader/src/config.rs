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

use bon::Builder;
use jiff::SignedDuration;
use rangecache_base::readable_size::ReadableSize;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Chunk count used when a request does not ask for one.
pub const DEFAULT_CHUNK_COUNT: usize = 4;

/// Limits applied on top of the chunk count a caller asks for.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Upper bound on parallel range requests per download (default: 16)
    #[default = 16]
    pub max_chunks:     usize,
    /// Chunks are never planned smaller than this (default: 256KiB)
    #[default(ReadableSize::kb(256))]
    pub min_chunk_size: ReadableSize,
}

impl ChunkingConfig {
    /// Number of chunks actually planned for a file of `total_size` bytes when
    /// the caller asked for `desired`.
    #[must_use]
    pub fn effective_chunks(&self, total_size: u64, desired: usize) -> usize {
        let capped = desired.clamp(1, self.max_chunks.max(1));
        let min_chunk = self.min_chunk_size.as_bytes().max(1);
        let by_size = usize::try_from(total_size / min_chunk)
            .unwrap_or(usize::MAX)
            .max(1);
        capped.min(by_size)
    }
}

/// Configuration for the downloader
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Chunking limits
    #[default(ChunkingConfig::default())]
    #[builder(default)]
    pub chunking: ChunkingConfig,

    /// Committed cache entries (default: user cache dir / rangecache / files)
    #[default(default_root().join("files"))]
    #[builder(default = default_root().join("files"))]
    pub cache_dir: PathBuf,

    /// In-progress `.download` files and resume journals (default: user cache
    /// dir / rangecache / chunks)
    #[default(default_root().join("chunks"))]
    #[builder(default = default_root().join("chunks"))]
    pub chunks_dir: PathBuf,

    /// How long one HEAD probe may take before it counts as failed
    #[default(SignedDuration::from_secs(10))]
    #[builder(default = SignedDuration::from_secs(10))]
    pub probe_timeout: SignedDuration,

    /// Extra HEAD attempts after a transport error. Status codes are never
    /// retried.
    #[default = 1]
    #[builder(default = 1)]
    pub probe_max_retries: usize,

    #[default(SignedDuration::from_secs(10))]
    #[builder(default = SignedDuration::from_secs(10))]
    pub connect_timeout: SignedDuration,

    /// Longest wait for a response head or the next body frame before a chunk
    /// fails as stalled
    #[default(SignedDuration::from_secs(30))]
    #[builder(default = SignedDuration::from_secs(30))]
    pub stall_timeout: SignedDuration,

    /// Progress ticks per chunk are at least this far apart, unless
    /// `progress_min_bytes` arrived in between
    #[default(SignedDuration::from_millis(100))]
    #[builder(default = SignedDuration::from_millis(100))]
    pub progress_min_interval: SignedDuration,

    #[default(ReadableSize::kb(256))]
    #[builder(default = ReadableSize::kb(256))]
    pub progress_min_bytes: ReadableSize,

    /// Custom User-Agent header (default: `rangecache/<version>`)
    pub user_agent: Option<String>,
}

impl DownloaderConfig {
    #[must_use]
    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("rangecache/{}", env!("CARGO_PKG_VERSION")))
    }
}

fn default_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("rangecache")
}

/// Negative durations clamp to zero.
pub(crate) fn to_std(duration: SignedDuration) -> Duration {
    Duration::try_from(duration).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_chunks_honours_request() {
        let config = ChunkingConfig::default();
        assert_eq!(config.effective_chunks(9_000_000, 3), 3);
        assert_eq!(config.effective_chunks(9_000_000, 0), 1);
    }

    #[test]
    fn effective_chunks_caps_at_max() {
        let config = ChunkingConfig::default();
        assert_eq!(config.effective_chunks(1 << 40, 64), 16);
    }

    #[test]
    fn effective_chunks_respects_min_chunk_size() {
        let config = ChunkingConfig::default();
        // 600KiB only fits two 256KiB chunks
        assert_eq!(config.effective_chunks(600 * 1024, 8), 2);
        assert_eq!(config.effective_chunks(1024, 8), 1);

        let tiny = ChunkingConfig {
            min_chunk_size: ReadableSize(1),
            ..ChunkingConfig::default()
        };
        assert_eq!(tiny.effective_chunks(1024, 8), 8);
    }

    #[test]
    fn builder_and_default_agree() {
        let built = DownloaderConfig::builder().build();
        assert_eq!(built, DownloaderConfig::default());
        assert!(built.user_agent().starts_with("rangecache/"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: DownloaderConfig = serde_json::from_str(
            r#"{"cache_dir": "/var/cache/rc", "chunking": {"max_chunks": 4}, "probe_max_retries": 0}"#,
        )
        .unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/rc"));
        assert_eq!(config.chunking.max_chunks, 4);
        assert_eq!(config.chunking.min_chunk_size, ReadableSize::kb(256));
        assert_eq!(config.probe_max_retries, 0);
        assert_eq!(config.stall_timeout, SignedDuration::from_secs(30));
    }

    #[test]
    fn negative_durations_clamp() {
        assert_eq!(to_std(SignedDuration::from_secs(-5)), Duration::ZERO);
        assert_eq!(to_std(SignedDuration::from_millis(250)), Duration::from_millis(250));
    }
}
