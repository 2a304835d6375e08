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

use rangecache_common_telemetry::LoggingOptions;
use rangecache_downloader::DownloaderConfig;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Whatever};

/// Contents of the file passed with `--config`.
///
/// ```json
/// {
///   "logging": { "dir": "/var/log/rangecache", "level": "info" },
///   "downloader": { "cache_dir": "/data/rangecache/files", "stall_timeout": "45s" }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub logging:    LoggingOptions,
    pub downloader: DownloaderConfig,
}

impl CliConfig {
    /// Load `path`, or the defaults when no file was given.
    pub fn load(path: Option<&Path>) -> Result<Self, Whatever> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_whatever_context(|_| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_whatever_context(|_| format!("invalid config {}", path.display()))
    }
}
