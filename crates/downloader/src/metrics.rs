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

use std::sync::LazyLock;

use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};

pub const OUTCOME_LABEL: &str = "outcome";
pub const RESULT_LABEL: &str = "result";

pub static DOWNLOADS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "rangecache_downloads_started_total",
        "Total number of downloads started"
    )
    .unwrap()
});

pub static DOWNLOADS_FINISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "rangecache_downloads_finished_total",
        "Total number of downloads finished, by outcome",
        &[OUTCOME_LABEL]
    )
    .unwrap()
});

pub static DOWNLOADS_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "rangecache_downloads_in_flight",
        "Number of downloads currently running"
    )
    .unwrap()
});

pub static DOWNLOAD_ATTACHES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "rangecache_download_attaches_total",
        "Total number of requests attached to an existing download"
    )
    .unwrap()
});

pub static PROBE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "rangecache_probe_total",
        "Total number of HEAD probes, by result",
        &[RESULT_LABEL]
    )
    .unwrap()
});

pub static CHUNK_BYTES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "rangecache_chunk_bytes_total",
        "Total number of body bytes written by chunk fetchers"
    )
    .unwrap()
});

pub static CACHE_LOOKUP_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "rangecache_cache_lookup_total",
        "Total number of cache lookups, by result",
        &[RESULT_LABEL]
    )
    .unwrap()
});
