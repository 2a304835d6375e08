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

use std::{io::SeekFrom, path::PathBuf, sync::Arc, time::Duration};

use futures::StreamExt;
use reqwest::{StatusCode, header::RANGE};
use snafu::{ResultExt, ensure};
use tokio::{
    fs::OpenOptions,
    io::{AsyncSeekExt, AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    error::{
        CancelledSnafu, DownloadError, FileWriteSnafu, HttpSnafu, LengthMismatchSnafu,
        NetworkSnafu, NotFoundSnafu, RangeIgnoredSnafu, StalledSnafu,
    },
    metrics::CHUNK_BYTES_TOTAL,
    planner::ChunkSpec,
};

const WRITE_BUFFER: usize = 256 * 1024;

/// One unit of work for a [`RangeFetcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkJob {
    pub index:        usize,
    /// `None` fetches the whole body without a `Range` header, writing from
    /// offset 0.
    pub range:        Option<ChunkSpec>,
    /// Required body length, when known up front.
    pub expected_len: Option<u64>,
}

impl ChunkJob {
    #[must_use]
    pub const fn ranged(spec: ChunkSpec) -> Self {
        Self {
            index:        spec.index,
            range:        Some(spec),
            expected_len: Some(spec.byte_len()),
        }
    }

    #[must_use]
    pub const fn whole_body() -> Self {
        Self {
            index:        0,
            range:        None,
            expected_len: None,
        }
    }

    const fn offset(&self) -> u64 {
        match self.range {
            Some(spec) => spec.start,
            None => 0,
        }
    }
}

/// Terminal result of one chunk.
#[derive(Debug)]
pub enum FetchOutcome {
    Completed(u64),
    Failed(DownloadError),
    Canceled,
}

/// Messages a fetcher sends to its coordinator. `Finished` is always the last
/// message for a chunk.
#[derive(Debug)]
pub enum ChunkReport {
    Started {
        index: usize,
    },
    Progress {
        index:      usize,
        downloaded: u64,
        total:      u64,
    },
    Finished {
        index:   usize,
        outcome: FetchOutcome,
    },
}

/// Rate limit for progress ticks of one chunk.
#[derive(Debug)]
pub(crate) struct ProgressThrottle {
    min_interval: Duration,
    min_bytes:    u64,
    last_at:      Instant,
    last_bytes:   u64,
}

impl ProgressThrottle {
    pub(crate) fn new(min_interval: Duration, min_bytes: u64) -> Self {
        Self {
            min_interval,
            min_bytes,
            last_at: Instant::now(),
            last_bytes: 0,
        }
    }

    pub(crate) fn should_emit(&mut self, downloaded: u64) -> bool {
        let now = Instant::now();
        if downloaded.saturating_sub(self.last_bytes) >= self.min_bytes
            || now.duration_since(self.last_at) >= self.min_interval
        {
            self.last_at = now;
            self.last_bytes = downloaded;
            true
        } else {
            false
        }
    }
}

/// Settings shared by every fetcher of one download.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub stall_timeout:         Duration,
    pub progress_min_interval: Duration,
    pub progress_min_bytes:    u64,
}

/// Streams one byte range of `url` into `output` at the range's offset.
///
/// `output` must already exist; every fetcher opens its own handle and only
/// touches its own range, so siblings never overlap.
pub struct RangeFetcher {
    client:   reqwest::Client,
    url:      Arc<str>,
    output:   PathBuf,
    settings: FetchSettings,
}

impl RangeFetcher {
    pub const fn new(
        client: reqwest::Client,
        url: Arc<str>,
        output: PathBuf,
        settings: FetchSettings,
    ) -> Self {
        Self {
            client,
            url,
            output,
            settings,
        }
    }

    /// Fetch `job` until it completes, fails, or `cancel` fires. Errors never
    /// escape: they are reported as [`FetchOutcome::Failed`].
    pub async fn run(
        &self,
        job: ChunkJob,
        cancel: CancellationToken,
        reports: mpsc::UnboundedSender<ChunkReport>,
    ) {
        let index = job.index;
        let _ = reports.send(ChunkReport::Started { index });

        let outcome = match self.fetch(job, &cancel, &reports).await {
            Ok(written) => FetchOutcome::Completed(written),
            Err(DownloadError::Cancelled) => FetchOutcome::Canceled,
            Err(e) => FetchOutcome::Failed(e),
        };
        debug!(chunk = index, ?outcome, "chunk finished");
        let _ = reports.send(ChunkReport::Finished { index, outcome });
    }

    async fn fetch(
        &self,
        job: ChunkJob,
        cancel: &CancellationToken,
        reports: &mpsc::UnboundedSender<ChunkReport>,
    ) -> Result<u64, DownloadError> {
        let index = job.index;
        let stall = self.settings.stall_timeout;

        let mut request = self.client.get(&*self.url);
        if let Some(spec) = job.range {
            request = request.header(RANGE, spec.range_header());
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return CancelledSnafu.fail(),
            sent = tokio::time::timeout(stall, request.send()) => sent
                .map_err(|_| StalledSnafu { index, timeout: stall }.build())?
                .context(NetworkSnafu { index })?,
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return NotFoundSnafu { url: &*self.url }.fail();
        }
        ensure!(
            status.is_success(),
            HttpSnafu {
                index,
                status: status.as_u16(),
                url: &*self.url,
            }
        );
        if job.range.is_some() {
            ensure!(
                status == StatusCode::PARTIAL_CONTENT,
                RangeIgnoredSnafu { index }
            );
        }

        let expected = job.expected_len.or_else(|| response.content_length());
        let total = expected.unwrap_or(0);

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.output)
            .await
            .context(FileWriteSnafu { path: &self.output })?;
        file.seek(SeekFrom::Start(job.offset()))
            .await
            .context(FileWriteSnafu { path: &self.output })?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);

        let mut throttle = ProgressThrottle::new(
            self.settings.progress_min_interval,
            self.settings.progress_min_bytes,
        );
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        let streamed: Result<(), DownloadError> = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break CancelledSnafu.fail(),
                next = tokio::time::timeout(stall, stream.next()) => next,
            };
            let Ok(next) = next else {
                break StalledSnafu {
                    index,
                    timeout: stall,
                }
                .fail();
            };
            let Some(frame) = next else {
                break Ok(());
            };
            let bytes = match frame.context(NetworkSnafu { index }) {
                Ok(bytes) => bytes,
                Err(e) => break Err(e),
            };

            let len = bytes.len() as u64;
            if let Some(expected) = expected
                && downloaded + len > expected
            {
                break LengthMismatchSnafu {
                    index,
                    expected,
                    actual: downloaded + len,
                }
                .fail();
            }
            if let Err(e) = writer
                .write_all(&bytes)
                .await
                .context(FileWriteSnafu { path: &self.output })
            {
                break Err(e);
            }
            downloaded += len;
            CHUNK_BYTES_TOTAL.inc_by(len);

            if throttle.should_emit(downloaded) {
                trace!(chunk = index, downloaded, total, "progress");
                let _ = reports.send(ChunkReport::Progress {
                    index,
                    downloaded,
                    total,
                });
            }
        };

        // Flush even on cancel so a stopped download keeps what it received.
        let flushed = writer
            .flush()
            .await
            .context(FileWriteSnafu { path: &self.output });
        streamed?;
        flushed?;

        if let Some(expected) = expected {
            ensure!(
                downloaded == expected,
                LengthMismatchSnafu {
                    index,
                    expected,
                    actual: downloaded,
                }
            );
        }
        writer
            .get_mut()
            .sync_data()
            .await
            .context(FileWriteSnafu { path: &self.output })?;

        let _ = reports.send(ChunkReport::Progress {
            index,
            downloaded,
            total: total.max(downloaded),
        });
        Ok(downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn throttle_limits_by_time_and_bytes() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(100), 1000);

        assert!(!throttle.should_emit(10));
        assert!(!throttle.should_emit(500));
        assert!(throttle.should_emit(1000));
        assert!(!throttle.should_emit(1500));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(throttle.should_emit(1600));
        assert!(!throttle.should_emit(1700));
    }

    #[test]
    fn jobs_know_their_offset() {
        let ranged = ChunkJob::ranged(ChunkSpec::new(2, 600, 899));
        assert_eq!(ranged.index, 2);
        assert_eq!(ranged.offset(), 600);
        assert_eq!(ranged.expected_len, Some(300));

        let whole = ChunkJob::whole_body();
        assert_eq!(whole.offset(), 0);
        assert_eq!(whole.range, None);
    }
}
