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

use std::{borrow::Cow, fmt};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deterministic identifier of one cached resource.
///
/// The lowercase hex SHA-256 of the canonical form of a destination key.
/// Keys that parse as URLs are canonicalized first (scheme and host
/// lowercased, default port dropped, fragment removed), so trivially
/// different spellings of one URL share a cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    #[must_use]
    pub fn derive(destination_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonicalize(destination_key).as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Accepts an already derived key, e.g. a cache directory name.
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        (hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')))
            .then(|| Self(hex.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

fn canonicalize(raw: &str) -> Cow<'_, str> {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(mut url) if url.has_host() => {
            url.set_fragment(None);
            Cow::Owned(url.into())
        }
        _ => Cow::Borrowed(trimmed),
    }
}
