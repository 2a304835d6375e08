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

use std::path::Path;

use sha2::{Digest, Sha256};
use snafu::{ResultExt, ensure};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncReadExt,
};

use crate::error::{DownloadError, FileReadSnafu, FileWriteSnafu, LengthMismatchSnafu};

const READ_BUFFER: usize = 512 * 1024;

/// A finished output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub size:   u64,
    /// Lowercase hex
    pub sha256: String,
}

/// Owns the `.download` file that fetchers write into.
pub struct ChunkAssembler;

impl ChunkAssembler {
    /// Make sure `path` exists and is ready for offset writes.
    ///
    /// With `reuse` set and a file of exactly `total_size` bytes already in
    /// place, the file is kept as is so completed ranges survive. Otherwise
    /// it is truncated and, when the size is known, preallocated.
    pub async fn prepare(
        path: &Path,
        total_size: Option<u64>,
        reuse: bool,
    ) -> Result<bool, DownloadError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context(FileWriteSnafu { path: parent })?;
        }

        if reuse
            && let Some(total) = total_size
            && fs::metadata(path).await.is_ok_and(|m| m.len() == total)
        {
            return Ok(true);
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .context(FileWriteSnafu { path })?;
        if let Some(total) = total_size {
            file.set_len(total).await.context(FileWriteSnafu { path })?;
        }
        Ok(false)
    }

    /// Check that the assembled file has the expected length and hash it in
    /// byte order, which is chunk index order.
    pub async fn finalize(
        path: &Path,
        expected_size: Option<u64>,
    ) -> Result<Assembled, DownloadError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .context(FileReadSnafu { path })?;
        file.sync_all().await.context(FileWriteSnafu { path })?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_BUFFER];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buffer).await.context(FileReadSnafu { path })?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            size += n as u64;
        }

        if let Some(expected) = expected_size {
            ensure!(
                size == expected,
                LengthMismatchSnafu {
                    index: 0_usize,
                    expected,
                    actual: size,
                }
            );
        }

        Ok(Assembled {
            size,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }

    /// Whether a partial file exists and holds at least one byte.
    pub async fn has_data(path: &Path) -> bool {
        fs::metadata(path).await.is_ok_and(|m| m.len() > 0)
    }
}

/// Hash an arbitrary file, used to verify cache entries.
pub(crate) async fn sha256_file(path: &Path) -> Result<String, DownloadError> {
    let mut file = File::open(path).await.context(FileReadSnafu { path })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buffer).await.context(FileReadSnafu { path })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn prepare_preallocates_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("a.download");

        assert!(!ChunkAssembler::prepare(&path, Some(64), false).await.unwrap());
        assert_eq!(fs::metadata(&path).await.unwrap().len(), 64);

        fs::write(&path, vec![7u8; 64]).await.unwrap();
        assert!(ChunkAssembler::prepare(&path, Some(64), true).await.unwrap());
        assert_eq!(fs::read(&path).await.unwrap(), vec![7u8; 64]);

        // wrong length is not reusable
        assert!(!ChunkAssembler::prepare(&path, Some(32), true).await.unwrap());
        assert_eq!(fs::read(&path).await.unwrap(), vec![0u8; 32]);
    }

    #[tokio::test]
    async fn disjoint_writes_assemble_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.download");
        ChunkAssembler::prepare(&path, Some(6), false).await.unwrap();

        for (offset, data) in [(3u64, b"def"), (0u64, b"abc")] {
            let mut file = OpenOptions::new().write(true).open(&path).await.unwrap();
            file.seek(std::io::SeekFrom::Start(offset)).await.unwrap();
            file.write_all(data).await.unwrap();
            file.flush().await.unwrap();
        }

        let assembled = ChunkAssembler::finalize(&path, Some(6)).await.unwrap();
        assert_eq!(assembled.size, 6);
        assert_eq!(fs::read(&path).await.unwrap(), b"abcdef");
        assert_eq!(assembled.sha256, sha256_file(&path).await.unwrap());
        assert!(ChunkAssembler::finalize(&path, Some(7)).await.is_err());
    }

    #[tokio::test]
    async fn fresh_partial_has_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.download");
        assert!(!ChunkAssembler::has_data(&path).await);
        ChunkAssembler::prepare(&path, None, false).await.unwrap();
        assert!(!ChunkAssembler::has_data(&path).await);
    }
}
