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

//! Chunked HTTP downloads into an on-disk cache.
//!
//! A [`Downloader`] probes the server with `HEAD`, splits the body into byte
//! ranges fetched in parallel, writes them into one preallocated file and
//! commits the result to a [`CacheIndex`]. Concurrent requests for the same
//! content key share one download, and every subscriber sees the same
//! ordered [`DownloadListener`] callbacks ending with `on_end`.

mod assembler;
mod cache_index;
mod config;
mod coordinator;
mod downloader;
mod error;
mod fetcher;
mod journal;
mod key;
mod listener;
mod metrics;
mod planner;
mod probe;
mod registry;
mod subscribers;
mod types;

pub use cache_index::{CacheEntry, CacheIndex, CacheMetadata};
pub use config::{ChunkingConfig, DEFAULT_CHUNK_COUNT, DownloaderConfig};
pub use downloader::Downloader;
pub use error::{DownloadError, ErrorKind};
pub use key::ContentKey;
pub use listener::{DownloadEvent, DownloadListener, EventStream};
pub use planner::{ChunkSpec, plan};
pub use registry::DownloadHandle;
pub use types::{
    ChunkProgress, ChunkState, DownloadRequest, DownloadSnapshot, DownloadState,
};
