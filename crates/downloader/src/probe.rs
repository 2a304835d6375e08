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

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{
    StatusCode,
    header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap},
};
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::error::{DownloadError, ProbeSnafu, ProbeStatusSnafu, ProbeTimeoutSnafu};

/// What a HEAD request revealed about the remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInfo {
    pub total_size:      Option<u64>,
    pub supports_ranges: bool,
}

impl RemoteInfo {
    /// Size to split into ranges, if the server allows it.
    #[must_use]
    pub fn chunkable_size(&self) -> Option<u64> {
        self.total_size
            .filter(|size| self.supports_ranges && *size > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Found(RemoteInfo),
    NotFound,
}

/// Issues the HEAD probe that decides between a chunked and a direct fetch.
pub struct Prober {
    client:      reqwest::Client,
    timeout:     Duration,
    max_retries: usize,
}

impl Prober {
    pub const fn new(client: reqwest::Client, timeout: Duration, max_retries: usize) -> Self {
        Self {
            client,
            timeout,
            max_retries,
        }
    }

    /// Probe `url`, retrying transport errors and timeouts up to
    /// `max_retries` times with exponential backoff. Any answered status is
    /// final.
    pub async fn probe(&self, url: &str) -> Result<ProbeOutcome, DownloadError> {
        let backoff = ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2));

        (|| self.try_probe(url))
            .retry(backoff)
            .when(|e| {
                matches!(
                    e,
                    DownloadError::Probe { .. } | DownloadError::ProbeTimeout { .. }
                )
            })
            .notify(|e, delay| debug!(url, error = %e, ?delay, "retrying probe"))
            .await
    }

    async fn try_probe(&self, url: &str) -> Result<ProbeOutcome, DownloadError> {
        let response = tokio::time::timeout(self.timeout, self.client.head(url).send())
            .await
            .map_err(|_| {
                ProbeTimeoutSnafu {
                    url,
                    timeout: self.timeout,
                }
                .build()
            })?
            .context(ProbeSnafu { url })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(ProbeOutcome::NotFound);
        }
        ensure!(
            status.is_success(),
            ProbeStatusSnafu {
                url,
                status: status.as_u16(),
            }
        );

        // A HEAD body is empty, so the length has to come from the header
        // rather than `Response::content_length`.
        Ok(ProbeOutcome::Found(RemoteInfo {
            total_size:      content_length(response.headers()),
            supports_ranges: accepts_byte_ranges(response.headers()),
        }))
    }
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

pub(crate) fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_RANGES)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))
}
