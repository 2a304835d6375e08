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

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rangecache_base::readable_size::ReadableSize;
use rangecache_common_telemetry::{init_global_logging, set_panic_hook};
use rangecache_downloader::{
    ContentKey, DEFAULT_CHUNK_COUNT, DownloadEvent, DownloadRequest, Downloader, EventStream,
};
use snafu::{ResultExt, Whatever, whatever};
use tracing::info;

mod config;
mod progress;

use config::CliConfig;
use progress::ChunkBars;

#[derive(Debug, Parser)]
#[clap(
    name = "rangecache",
    about = "Chunked HTTP downloads into a local cache",
    version
)]
struct Cli {
    /// JSON file with `logging` and `downloader` sections
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for cached files and partial downloads
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log engine activity to stdout
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Get(GetArgs),
    Lookup(LookupArgs),
    Invalidate(InvalidateArgs),
    Clear(ClearArgs),
    List(ListArgs),
}

/// A cache key given on the command line: either an already derived key or
/// the destination key / URL it is derived from.
fn resolve_key(target: &str) -> ContentKey {
    ContentKey::from_hex(target).unwrap_or_else(|| ContentKey::derive(target))
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Download a file into the cache and print where it landed.
Ctrl-C cancels the download.
Examples:

rangecache get https://example.com/video.webm
rangecache get https://mirror.example.com/video.webm --key video.webm --chunks 8
rangecache get https://example.com/video.webm --output ./video.webm

")]
struct GetArgs {
    url: String,

    /// Cache key to use instead of the URL
    #[arg(long)]
    key: Option<String>,

    /// Number of parallel range requests
    #[arg(long, short = 'n', default_value_t = DEFAULT_CHUNK_COUNT)]
    chunks: usize,

    /// Fetch with a single request, without probing
    #[arg(long)]
    no_chunking: bool,

    /// Download again even if the file is cached
    #[arg(long)]
    force: bool,

    /// Copy the cached file here
    #[arg(long, short)]
    output: Option<PathBuf>,
}

impl GetArgs {
    async fn run(self, downloader: &Downloader) -> Result<(), Whatever> {
        let request = DownloadRequest::builder()
            .url(self.url.clone())
            .maybe_destination_key(self.key.clone())
            .chunking_enabled(!self.no_chunking)
            .chunk_count(self.chunks)
            .force_refresh(self.force)
            .build();

        let (listener, mut events) = EventStream::channel();
        let handle = downloader.start_download(request, listener);
        let mut bars = ChunkBars::default();
        let mut outcome = None;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(DownloadEvent::Start { chunk_count }) => bars.start(chunk_count),
                    Some(DownloadEvent::Progress { chunk_index, downloaded, total }) => {
                        bars.update(chunk_index, downloaded, total);
                    }
                    Some(DownloadEvent::End) | None => break,
                    Some(terminal) => outcome = Some(terminal),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, cancelling download");
                    handle.cancel();
                }
            }
        }
        bars.finish(matches!(outcome, Some(DownloadEvent::Success { .. })));

        match outcome {
            Some(DownloadEvent::Success { path }) => {
                let shown = match self.output {
                    Some(output) => {
                        tokio::fs::copy(&path, &output).await.with_whatever_context(|_| {
                            format!("failed to copy to {}", output.display())
                        })?;
                        output
                    }
                    None => path,
                };
                println!("{}", shown.display());
                Ok(())
            }
            Some(DownloadEvent::NotFound) => whatever!("{} was not found", self.url),
            Some(DownloadEvent::Fail { error }) => {
                whatever!("download failed ({}): {error}", error.kind())
            }
            Some(DownloadEvent::Stop { .. }) => whatever!("download stopped"),
            Some(DownloadEvent::Cancel) => whatever!("download cancelled"),
            _ => whatever!("download ended without an outcome"),
        }
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print the path and size of a cached file. Exits with an error when the file
is not cached.
Examples:

rangecache lookup https://example.com/video.webm
rangecache lookup video.webm

")]
struct LookupArgs {
    /// Cache key, destination key or URL
    target: String,
}

impl LookupArgs {
    async fn run(self, downloader: &Downloader) -> Result<(), Whatever> {
        let key = resolve_key(&self.target);
        let entry = downloader
            .cache()
            .lookup(&key)
            .await
            .whatever_context("cache lookup failed")?;
        let Some(entry) = entry else {
            whatever!("{} is not cached", self.target);
        };
        println!(
            "{}\t{}",
            entry.path.display(),
            ReadableSize(entry.size_bytes)
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Remove one file from the cache.
Examples:

rangecache invalidate https://example.com/video.webm

")]
struct InvalidateArgs {
    /// Cache key, destination key or URL
    target: String,
}

impl InvalidateArgs {
    async fn run(self, downloader: &Downloader) -> Result<(), Whatever> {
        let removed = downloader
            .cache()
            .invalidate(&resolve_key(&self.target))
            .await
            .whatever_context("failed to invalidate entry")?;
        if removed {
            println!("removed {}", self.target);
        } else {
            println!("{} was not cached", self.target);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Remove every file from the cache.
Examples:

rangecache clear

")]
struct ClearArgs {}

impl ClearArgs {
    async fn run(self, downloader: &Downloader) -> Result<(), Whatever> {
        let removed = downloader
            .cache()
            .clear()
            .await
            .whatever_context("failed to clear cache")?;
        println!("removed {removed} entries");
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

List cached files with their keys and sizes.
Examples:

rangecache list
rangecache list --verify

")]
struct ListArgs {
    /// Recompute hashes and drop entries that do not match
    #[arg(long)]
    verify: bool,
}

impl ListArgs {
    async fn run(self, downloader: &Downloader) -> Result<(), Whatever> {
        let cache = downloader.cache();
        let entries = cache
            .entries()
            .await
            .whatever_context("failed to list cache")?;

        let mut total = 0;
        for entry in entries {
            if self.verify
                && !cache
                    .verify(&entry.key)
                    .await
                    .whatever_context("failed to verify entry")?
            {
                println!("{}\tcorrupt, removed", entry.key);
                continue;
            }
            total += entry.size_bytes;
            println!(
                "{}\t{}\t{}",
                entry.key,
                ReadableSize(entry.size_bytes),
                entry.path.display()
            );
        }
        println!("total {}", ReadableSize(total));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();

    let mut config = CliConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.cache_dir {
        config.downloader.cache_dir = root.join("files");
        config.downloader.chunks_dir = root.join("chunks");
    }
    if config.logging.level.is_none() {
        let level = if cli.verbose {
            "info,rangecache_downloader=debug"
        } else {
            "warn"
        };
        config.logging.level = Some(level.to_string());
    }

    let _guards = init_global_logging("rangecache", &config.logging);
    set_panic_hook();

    let downloader =
        Downloader::new(config.downloader).whatever_context("failed to start downloader")?;
    match cli.commands {
        Commands::Get(args) => args.run(&downloader).await,
        Commands::Lookup(args) => args.run(&downloader).await,
        Commands::Invalidate(args) => args.run(&downloader).await,
        Commands::Clear(args) => args.run(&downloader).await,
        Commands::List(args) => args.run(&downloader).await,
    }
}
