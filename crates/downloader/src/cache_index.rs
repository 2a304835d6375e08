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
    io::ErrorKind,
    path::{Path, PathBuf},
};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{
    assembler::sha256_file,
    error::{DownloadError, EncodeSnafu, FileReadSnafu, FileWriteSnafu, MetadataCorruptedSnafu},
    key::ContentKey,
    metrics::CACHE_LOOKUP_TOTAL,
};

const CONTENT_FILE: &str = "content";
const METADATA_FILE: &str = "metadata.json";
const CONTENT_STAGING_FILE: &str = "content.new";
const METADATA_STAGING_FILE: &str = "metadata.json.tmp";

/// A committed, fully downloaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key:        ContentKey,
    pub path:       PathBuf,
    pub size_bytes: u64,
    pub complete:   bool,
}

/// Sidecar stored next to each cached file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub url:           String,
    pub file_size:     u64,
    /// Lowercase hex
    pub sha256:        String,
    pub downloaded_at: Timestamp,
    pub complete:      bool,
}

/// On-disk index of completed downloads.
///
/// Layout: `<root>/<key>/content` plus `<root>/<key>/metadata.json`. The
/// metadata file is written last through a rename, so an entry becomes
/// visible in one step and readers never see a half written file.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    root: PathBuf,
}

impl CacheIndex {
    pub const fn new(root: PathBuf) -> Self { Self { root } }

    #[must_use]
    pub fn root(&self) -> &Path { &self.root }

    fn entry_dir(&self, key: &ContentKey) -> PathBuf { self.root.join(key.as_str()) }

    /// Look up a committed entry.
    ///
    /// A metadata file that does not parse takes the whole entry down with
    /// it. An entry whose content is missing or has the wrong length is
    /// invalidated as well.
    pub async fn lookup(&self, key: &ContentKey) -> Result<Option<CacheEntry>, DownloadError> {
        let dir = self.entry_dir(key);
        let metadata_path = dir.join(METADATA_FILE);

        let raw = match fs::read_to_string(&metadata_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                CACHE_LOOKUP_TOTAL.with_label_values(&["miss"]).inc();
                return Ok(None);
            }
            Err(e) => {
                return Err(e).context(FileReadSnafu {
                    path: metadata_path,
                });
            }
        };

        let metadata: CacheMetadata = match serde_json::from_str(&raw) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(%key, error = %e, "malformed cache metadata, removing entry");
                CACHE_LOOKUP_TOTAL.with_label_values(&["corrupt"]).inc();
                self.invalidate(key).await?;
                return Ok(None);
            }
        };

        let content_path = dir.join(CONTENT_FILE);
        let on_disk = fs::metadata(&content_path).await.ok().map(|m| m.len());
        if !metadata.complete || on_disk != Some(metadata.file_size) {
            warn!(
                %key,
                expected = metadata.file_size,
                actual = ?on_disk,
                "cache entry is incomplete, removing"
            );
            CACHE_LOOKUP_TOTAL.with_label_values(&["corrupt"]).inc();
            self.invalidate(key).await?;
            return Ok(None);
        }

        CACHE_LOOKUP_TOTAL.with_label_values(&["hit"]).inc();
        Ok(Some(CacheEntry {
            key:        key.clone(),
            path:       content_path,
            size_bytes: metadata.file_size,
            complete:   true,
        }))
    }

    /// Publish `staged` as the content of `key`, replacing any previous
    /// entry. `staged` is moved, or copied when it lives on another
    /// filesystem.
    ///
    /// The new content and metadata are staged inside the entry directory
    /// first; a failure up to that point leaves the previous entry intact.
    pub async fn commit(
        &self,
        key: &ContentKey,
        staged: &Path,
        metadata: CacheMetadata,
    ) -> Result<CacheEntry, DownloadError> {
        let dir = self.entry_dir(key);
        fs::create_dir_all(&dir)
            .await
            .context(FileWriteSnafu { path: &dir })?;

        let content_new = dir.join(CONTENT_STAGING_FILE);
        let metadata_new = dir.join(METADATA_STAGING_FILE);
        if let Err(e) = Self::stage(staged, &content_new, &metadata_new, &metadata).await {
            let _ = fs::remove_file(&content_new).await;
            let _ = fs::remove_file(&metadata_new).await;
            return Err(e);
        }

        // Hide the old entry before its content is replaced.
        let metadata_path = dir.join(METADATA_FILE);
        match fs::remove_file(&metadata_path).await {
            Ok(()) => debug!(%key, "replacing cache entry"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(FileWriteSnafu { path: metadata_path }),
        }

        let content_path = dir.join(CONTENT_FILE);
        fs::rename(&content_new, &content_path)
            .await
            .context(FileWriteSnafu {
                path: &content_path,
            })?;
        fs::rename(&metadata_new, &metadata_path)
            .await
            .context(FileWriteSnafu {
                path: &metadata_path,
            })?;

        info!(%key, size = metadata.file_size, "cache entry committed");
        Ok(CacheEntry {
            key:        key.clone(),
            path:       content_path,
            size_bytes: metadata.file_size,
            complete:   metadata.complete,
        })
    }

    async fn stage(
        staged: &Path,
        content_new: &Path,
        metadata_new: &Path,
        metadata: &CacheMetadata,
    ) -> Result<(), DownloadError> {
        if fs::rename(staged, content_new).await.is_err() {
            fs::copy(staged, content_new)
                .await
                .context(FileWriteSnafu { path: content_new })?;
            let _ = fs::remove_file(staged).await;
        }

        let encoded = serde_json::to_vec_pretty(metadata).context(EncodeSnafu {
            what: "cache metadata",
        })?;
        fs::write(metadata_new, encoded)
            .await
            .context(FileWriteSnafu { path: metadata_new })
    }

    /// Remove the entry for `key`. Returns whether anything was removed.
    pub async fn invalidate(&self, key: &ContentKey) -> Result<bool, DownloadError> {
        let dir = self.entry_dir(key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(%key, "cache entry invalidated");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context(FileWriteSnafu { path: dir }),
        }
    }

    /// All committed entries. Broken entries are dropped while listing.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>, DownloadError> {
        let mut entries = Vec::new();
        for key in self.keys().await? {
            if let Some(entry) = self.lookup(&key).await? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    pub async fn total_size(&self) -> Result<u64, DownloadError> {
        Ok(self.entries().await?.iter().map(|e| e.size_bytes).sum())
    }

    /// Remove every entry. Returns how many entry directories were removed.
    pub async fn clear(&self) -> Result<usize, DownloadError> {
        let mut removed = 0;
        for key in self.keys().await? {
            if self.invalidate(&key).await? {
                removed += 1;
            }
        }
        info!(removed, "cache cleared");
        Ok(removed)
    }

    /// Recompute the content hash of `key` and compare it with the metadata.
    /// A mismatching entry is removed. Returns `Ok(false)` when the entry is
    /// absent or was removed.
    pub async fn verify(&self, key: &ContentKey) -> Result<bool, DownloadError> {
        let Some(entry) = self.lookup(key).await? else {
            return Ok(false);
        };
        let metadata_path = self.entry_dir(key).join(METADATA_FILE);
        let raw = fs::read_to_string(&metadata_path)
            .await
            .context(FileReadSnafu {
                path: &metadata_path,
            })?;
        let expected = serde_json::from_str::<CacheMetadata>(&raw)
            .context(MetadataCorruptedSnafu {
                path: &metadata_path,
            })?
            .sha256;

        let actual = sha256_file(&entry.path).await?;
        if actual == expected {
            Ok(true)
        } else {
            warn!(%key, %expected, %actual, "cache entry failed verification");
            self.invalidate(key).await?;
            Ok(false)
        }
    }

    async fn keys(&self) -> Result<Vec<ContentKey>, DownloadError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(FileReadSnafu { path: &self.root }),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .context(FileReadSnafu { path: &self.root })?
        {
            if let Some(key) = entry.file_name().to_str().and_then(ContentKey::from_hex) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn metadata(url: &str, body: &[u8]) -> CacheMetadata {
        use sha2::{Digest, Sha256};
        CacheMetadata {
            url:           url.to_string(),
            file_size:     body.len() as u64,
            sha256:        format!("{:x}", Sha256::digest(body)),
            downloaded_at: Timestamp::now(),
            complete:      true,
        }
    }

    async fn staged(dir: &TempDir, name: &str, body: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn commit_then_lookup() {
        let work = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(work.path().join("cache"));
        let url = "http://4chan.org/image.jpg";
        let key = ContentKey::derive(url);

        assert!(index.lookup(&key).await.unwrap().is_none());

        let staged = staged(&work, "a.download", b"jpeg bytes").await;
        let entry = index
            .commit(&key, &staged, metadata(url, b"jpeg bytes"))
            .await
            .unwrap();
        assert!(!staged.exists());
        assert_eq!(entry.size_bytes, 10);

        let found = index.lookup(&key).await.unwrap().unwrap();
        assert_eq!(found, entry);
        assert!(found.complete);
        assert_eq!(fs::read(&found.path).await.unwrap(), b"jpeg bytes");
        assert!(index.verify(&key).await.unwrap());
    }

    #[tokio::test]
    async fn commit_overwrites_previous_entry() {
        let work = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(work.path().join("cache"));
        let key = ContentKey::derive("http://example.com/a");

        let first = staged(&work, "1", b"old").await;
        index
            .commit(&key, &first, metadata("http://example.com/a", b"old"))
            .await
            .unwrap();
        let second = staged(&work, "2", b"newer").await;
        index
            .commit(&key, &second, metadata("http://example.com/a", b"newer"))
            .await
            .unwrap();

        let found = index.lookup(&key).await.unwrap().unwrap();
        assert_eq!(found.size_bytes, 5);
        assert_eq!(fs::read(&found.path).await.unwrap(), b"newer");
    }

    #[tokio::test]
    async fn failed_commit_keeps_previous_entry() {
        let work = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(work.path().join("cache"));
        let key = ContentKey::derive("http://example.com/a");

        let first = staged(&work, "1", b"old").await;
        index
            .commit(&key, &first, metadata("http://example.com/a", b"old"))
            .await
            .unwrap();

        let missing = work.path().join("never-written");
        let err = index
            .commit(&key, &missing, metadata("http://example.com/a", b"newer"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);

        let found = index.lookup(&key).await.unwrap().unwrap();
        assert_eq!(found.size_bytes, 3);
        assert_eq!(fs::read(&found.path).await.unwrap(), b"old");
        assert!(index.verify(&key).await.unwrap());

        let mut names: Vec<_> = std::fs::read_dir(work.path().join("cache").join(key.as_str()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, [CONTENT_FILE, METADATA_FILE]);
    }

    #[tokio::test]
    async fn malformed_metadata_deletes_both_files() {
        let work = tempfile::tempdir().unwrap();
        let root = work.path().join("cache");
        let index = CacheIndex::new(root.clone());
        let url = "http://4chan.org/image.jpg";
        let key = ContentKey::derive(url);

        let staged = staged(&work, "a.download", b"jpeg bytes").await;
        index
            .commit(&key, &staged, metadata(url, b"jpeg bytes"))
            .await
            .unwrap();

        let metadata_path = root.join(key.as_str()).join(METADATA_FILE);
        let mut raw = fs::read(&metadata_path).await.unwrap();
        let last = raw.len() - 1;
        raw[last] = b',';
        fs::write(&metadata_path, raw).await.unwrap();

        assert!(index.lookup(&key).await.unwrap().is_none());
        assert!(std::fs::read_dir(&root).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn truncated_content_is_not_visible() {
        let work = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(work.path().join("cache"));
        let key = ContentKey::derive("http://example.com/v.webm");

        let staged = staged(&work, "v", b"0123456789").await;
        let entry = index
            .commit(&key, &staged, metadata("http://example.com/v.webm", b"0123456789"))
            .await
            .unwrap();
        fs::write(&entry.path, b"01234").await.unwrap();

        assert!(index.lookup(&key).await.unwrap().is_none());
        assert!(!index.invalidate(&key).await.unwrap());
    }

    #[tokio::test]
    async fn verify_detects_bit_rot() {
        let work = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(work.path().join("cache"));
        let key = ContentKey::derive("http://example.com/v.webm");

        let staged = staged(&work, "v", b"0123456789").await;
        let entry = index
            .commit(&key, &staged, metadata("http://example.com/v.webm", b"0123456789"))
            .await
            .unwrap();
        fs::write(&entry.path, b"0123456780").await.unwrap();

        assert!(index.lookup(&key).await.unwrap().is_some());
        assert!(!index.verify(&key).await.unwrap());
        assert!(index.lookup(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_clear_and_total_size() {
        let work = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(work.path().join("cache"));
        assert_eq!(index.clear().await.unwrap(), 0);

        for (i, body) in [b"aa".as_slice(), b"bbbb".as_slice()].into_iter().enumerate() {
            let url = format!("http://example.com/{i}");
            let staged = staged(&work, &i.to_string(), body).await;
            index
                .commit(&ContentKey::derive(&url), &staged, metadata(&url, body))
                .await
                .unwrap();
        }

        assert_eq!(index.entries().await.unwrap().len(), 2);
        assert_eq!(index.total_size().await.unwrap(), 6);
        assert_eq!(index.clear().await.unwrap(), 2);
        assert!(index.entries().await.unwrap().is_empty());
    }
}
