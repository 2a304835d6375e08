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

mod common;

use common::{AppState, Fixture, collect, list_dir, outline, sample};
use rangecache_downloader::{ContentKey, DownloadRequest, EventStream};

async fn download_as(fx: &Fixture, destination_key: &str) {
    let (listener, rx) = EventStream::channel();
    let request = DownloadRequest::builder()
        .url(fx.url.clone())
        .destination_key(destination_key)
        .chunk_count(2)
        .build();
    fx.downloader.start_download(request, listener);
    assert_eq!(outline(&collect(rx).await), ["start(2)", "success", "end"]);
}

#[tokio::test]
async fn destination_key_decides_the_cache_slot() {
    let content = sample(600_000);
    let fx = Fixture::new(AppState::new(content.clone()));

    download_as(&fx, "video-a").await;
    download_as(&fx, "video-b").await;
    assert_eq!(fx.state.gets(), 4);

    let a = fx.downloader.cache_lookup("video-a").await.unwrap().unwrap();
    let b = fx.downloader.cache_lookup("video-b").await.unwrap().unwrap();
    assert_ne!(a.path, b.path);
    assert_eq!(a.key, ContentKey::derive("video-a"));
    assert!(fx.downloader.cache_lookup(&fx.url).await.unwrap().is_none());

    let cache = fx.downloader.cache();
    assert_eq!(cache.entries().await.unwrap().len(), 2);
    assert_eq!(cache.total_size().await.unwrap(), 1_200_000);
}

#[tokio::test]
async fn invalidate_and_clear_remove_entries() {
    let fx = Fixture::new(AppState::new(sample(600_000)));
    download_as(&fx, "a").await;
    download_as(&fx, "b").await;
    let cache = fx.downloader.cache();

    assert!(cache.invalidate(&ContentKey::derive("a")).await.unwrap());
    assert!(!cache.invalidate(&ContentKey::derive("a")).await.unwrap());
    assert!(fx.downloader.cache_lookup("a").await.unwrap().is_none());
    assert!(fx.downloader.cache_lookup("b").await.unwrap().is_some());

    assert_eq!(cache.clear().await.unwrap(), 1);
    assert!(cache.entries().await.unwrap().is_empty());
    assert!(list_dir(fx.cache_dir.path()).is_empty());

    // Invalidated entries download again instead of being served.
    download_as(&fx, "a").await;
}

#[tokio::test]
async fn corrupt_entry_is_downloaded_again() {
    let content = sample(600_000);
    let fx = Fixture::new(AppState::new(content.clone()));
    download_as(&fx, "a").await;

    let entry = fx.downloader.cache_lookup("a").await.unwrap().unwrap();
    let metadata = entry.path.with_file_name("metadata.json");
    tokio::fs::write(&metadata, b"{ not json").await.unwrap();

    assert!(fx.downloader.cache_lookup("a").await.unwrap().is_none());
    assert!(!entry.path.exists());

    download_as(&fx, "a").await;
    let entry = fx.downloader.cache_lookup("a").await.unwrap().unwrap();
    assert_eq!(tokio::fs::read(&entry.path).await.unwrap(), content);
}
