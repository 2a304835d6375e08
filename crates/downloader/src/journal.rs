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
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::fs;
use tracing::warn;

use crate::{
    error::{DownloadError, EncodeSnafu, FileWriteSnafu},
    key::ContentKey,
    planner::ChunkSpec,
};

/// Persistent record of a chunked download, kept beside its `.download`
/// file so a later attempt can skip ranges that already landed on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeJournal {
    pub url:        String,
    pub total_size: u64,
    pub chunks:     Vec<ChunkSpec>,
    pub completed:  BTreeSet<usize>,
    pub updated_at: Timestamp,
}

impl ResumeJournal {
    #[must_use]
    pub fn new(url: &str, total_size: u64, chunks: Vec<ChunkSpec>) -> Self {
        Self {
            url: url.to_string(),
            total_size,
            chunks,
            completed: BTreeSet::new(),
            updated_at: Timestamp::now(),
        }
    }

    /// A journal only applies to the exact same plan of the exact same body.
    #[must_use]
    pub fn matches(&self, url: &str, total_size: u64, chunks: &[ChunkSpec]) -> bool {
        self.url == url && self.total_size == total_size && self.chunks == chunks
    }

    pub fn mark_completed(&mut self, index: usize) {
        self.completed.insert(index);
        self.updated_at = Timestamp::now();
    }

    #[must_use]
    pub fn is_completed(&self, index: usize) -> bool { self.completed.contains(&index) }
}

/// Location of partial files and journals for every key.
#[derive(Debug, Clone)]
pub struct JournalStore {
    dir: PathBuf,
}

impl JournalStore {
    pub const fn new(dir: PathBuf) -> Self { Self { dir } }

    #[must_use]
    pub fn partial_path(&self, key: &ContentKey) -> PathBuf {
        self.dir.join(format!("{key}.download"))
    }

    fn journal_path(&self, key: &ContentKey) -> PathBuf {
        self.dir.join(format!("{key}.journal.json"))
    }

    /// Load the journal for `key`. An unreadable journal is removed and
    /// treated as absent.
    pub async fn load(&self, key: &ContentKey) -> Option<ResumeJournal> {
        let path = self.journal_path(key);
        let raw = fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(journal) => Some(journal),
            Err(e) => {
                warn!(%key, error = %e, "dropping malformed resume journal");
                remove_if_exists(&path).await;
                None
            }
        }
    }

    /// Write through a temp file and rename, so a crash never leaves a torn
    /// journal.
    pub async fn save(&self, key: &ContentKey, journal: &ResumeJournal) -> Result<(), DownloadError> {
        fs::create_dir_all(&self.dir)
            .await
            .context(FileWriteSnafu { path: &self.dir })?;

        let path = self.journal_path(key);
        let tmp = path.with_extension("json.tmp");
        let encoded = serde_json::to_vec_pretty(journal).context(EncodeSnafu {
            what: "resume journal",
        })?;
        fs::write(&tmp, encoded)
            .await
            .context(FileWriteSnafu { path: &tmp })?;
        fs::rename(&tmp, &path)
            .await
            .context(FileWriteSnafu { path: &path })
    }

    pub async fn remove(&self, key: &ContentKey) { remove_if_exists(&self.journal_path(key)).await; }

    /// Remove both the journal and the partial file of `key`.
    pub async fn discard(&self, key: &ContentKey) {
        self.remove(key).await;
        remove_if_exists(&self.partial_path(key)).await;
    }
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove file");
    }
}
