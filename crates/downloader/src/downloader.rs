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

use std::sync::Arc;

use snafu::ResultExt;
use tracing::info;

use crate::{
    cache_index::{CacheEntry, CacheIndex},
    config::{DownloaderConfig, to_std},
    coordinator::EngineContext,
    error::{ClientBuildSnafu, DownloadError, FileWriteSnafu},
    journal::JournalStore,
    key::ContentKey,
    listener::DownloadListener,
    probe::Prober,
    registry::{DownloadHandle, DownloadRegistry},
    types::DownloadRequest,
};

/// Entry point of the engine.
///
/// Owns the HTTP client, the cache and the registry of live downloads.
/// Requests for the same content key share one download while it runs, and
/// finished files are served from the cache without touching the network.
pub struct Downloader {
    registry: Arc<DownloadRegistry>,
}

impl Downloader {
    /// Build the HTTP client and create the cache and chunk directories.
    pub fn new(config: DownloaderConfig) -> Result<Self, DownloadError> {
        std::fs::create_dir_all(&config.cache_dir).context(FileWriteSnafu {
            path: &config.cache_dir,
        })?;
        std::fs::create_dir_all(&config.chunks_dir).context(FileWriteSnafu {
            path: &config.chunks_dir,
        })?;

        let client = reqwest::Client::builder()
            .connect_timeout(to_std(config.connect_timeout))
            .user_agent(config.user_agent())
            .build()
            .context(ClientBuildSnafu)?;
        let prober = Prober::new(
            client.clone(),
            to_std(config.probe_timeout),
            config.probe_max_retries,
        );

        info!(
            cache_dir = %config.cache_dir.display(),
            chunks_dir = %config.chunks_dir.display(),
            "downloader ready"
        );
        let ctx = EngineContext {
            cache: CacheIndex::new(config.cache_dir.clone()),
            journals: JournalStore::new(config.chunks_dir.clone()),
            client,
            prober,
            config,
        };
        Ok(Self {
            registry: Arc::new(DownloadRegistry::new(Arc::new(ctx))),
        })
    }

    /// Start downloading `request`, or join the download already running for
    /// its key. `listener` receives the full event sequence.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start_download(
        &self,
        request: DownloadRequest,
        listener: Arc<dyn DownloadListener>,
    ) -> DownloadHandle {
        self.registry.start(request, listener)
    }

    /// The committed entry for `destination_key` (or URL), if any.
    pub async fn cache_lookup(
        &self,
        destination_key: &str,
    ) -> Result<Option<CacheEntry>, DownloadError> {
        self.cache().lookup(&ContentKey::derive(destination_key)).await
    }

    #[must_use]
    pub fn cache(&self) -> &CacheIndex { &self.registry.context().cache }

    #[must_use]
    pub fn config(&self) -> &DownloaderConfig { &self.registry.context().config }

    /// Number of downloads that have not ended yet.
    #[must_use]
    pub fn in_flight(&self) -> usize { self.registry.in_flight() }

    /// Cancel every running download. Listeners get `on_cancel` and `on_end`.
    pub fn shutdown(&self) {
        info!(in_flight = self.in_flight(), "shutting down downloader");
        self.registry.shutdown();
    }
}
