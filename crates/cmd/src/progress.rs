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

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const CHUNK_TEMPLATE: &str =
    "chunk {prefix:>3} [{bar:40.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec}";

/// One progress bar per chunk, drawn on stderr.
#[derive(Default)]
pub struct ChunkBars {
    multi: MultiProgress,
    bars:  Vec<ProgressBar>,
}

impl ChunkBars {
    pub fn start(&mut self, chunk_count: usize) {
        let style = ProgressStyle::with_template(CHUNK_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━━╌");
        self.bars = (0..chunk_count)
            .map(|index| {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(style.clone());
                bar.set_prefix(index.to_string());
                bar
            })
            .collect();
    }

    pub fn update(&self, chunk_index: usize, downloaded: u64, total: u64) {
        if let Some(bar) = self.bars.get(chunk_index) {
            if total > 0 {
                bar.set_length(total);
            }
            bar.set_position(downloaded);
        }
    }

    /// Leave finished bars on screen, clear the rest.
    pub fn finish(&self, success: bool) {
        for bar in &self.bars {
            if success {
                bar.finish();
            } else {
                bar.abandon();
            }
        }
    }
}
