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

use serde::{Deserialize, Serialize};

/// One contiguous, inclusive byte range of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub index: usize,
    pub start: u64,
    /// Inclusive
    pub end:   u64,
}

impl ChunkSpec {
    #[must_use]
    pub(crate) const fn new(index: usize, start: u64, end: u64) -> Self {
        debug_assert!(end >= start, "chunk range ends before it starts");
        Self { index, start, end }
    }

    #[must_use]
    pub const fn byte_len(&self) -> u64 { self.end - self.start + 1 }

    /// Value for the `Range` request header.
    #[must_use]
    pub fn range_header(&self) -> String { format!("bytes={}-{}", self.start, self.end) }
}

/// Split `[0, total_size)` into `desired_chunks` contiguous ranges whose
/// lengths differ by at most one byte. The first `total_size % n` chunks
/// carry the extra byte.
///
/// Returns a single range when `desired_chunks <= 1` (callers pass 1 when
/// chunking is disabled) or when there are fewer bytes than chunks, and no
/// ranges at all for an empty body.
#[must_use]
pub fn plan(total_size: u64, desired_chunks: usize) -> Vec<ChunkSpec> {
    if total_size == 0 {
        return Vec::new();
    }
    let count = u64::try_from(desired_chunks.max(1)).unwrap_or(u64::MAX);
    if count == 1 || total_size < count {
        return vec![ChunkSpec::new(0, 0, total_size - 1)];
    }

    let base = total_size / count;
    let remainder = total_size % count;
    let mut start = 0;
    (0..desired_chunks)
        .map(|index| {
            let extra = u64::from(u64::try_from(index).is_ok_and(|i| i < remainder));
            let len = base + extra;
            let spec = ChunkSpec::new(index, start, start + len - 1);
            start += len;
            spec
        })
        .collect()
}
