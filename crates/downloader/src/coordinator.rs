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
    path::{Path, PathBuf},
    sync::Arc,
};

use jiff::Timestamp;
use parking_lot::Mutex;
use strum_macros::AsRefStr;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    assembler::ChunkAssembler,
    cache_index::{CacheIndex, CacheMetadata},
    config::{DownloaderConfig, to_std},
    error::{DownloadError, ErrorKind},
    fetcher::{ChunkJob, ChunkReport, FetchOutcome, FetchSettings, RangeFetcher},
    journal::{JournalStore, ResumeJournal},
    key::ContentKey,
    listener::{DownloadEvent, DownloadListener},
    metrics::{DOWNLOADS_FINISHED, DOWNLOADS_IN_FLIGHT, DOWNLOADS_STARTED, PROBE_TOTAL},
    planner::{ChunkSpec, plan},
    probe::{ProbeOutcome, Prober},
    subscribers::{Release, SubscriberHub, SubscriberId},
    types::{ChunkProgress, ChunkState, DownloadRequest, DownloadSnapshot, DownloadState},
};

/// Everything coordinators of one downloader share.
pub(crate) struct EngineContext {
    pub(crate) client:   reqwest::Client,
    pub(crate) config:   DownloaderConfig,
    pub(crate) cache:    CacheIndex,
    pub(crate) journals: JournalStore,
    pub(crate) prober:   Prober,
}

impl EngineContext {
    fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            stall_timeout:         to_std(self.config.stall_timeout),
            progress_min_interval: to_std(self.config.progress_min_interval),
            progress_min_bytes:    self.config.progress_min_bytes.as_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TransferPlan {
    /// One GET without a `Range` header.
    Direct,
    Chunked {
        total_size: u64,
        chunks:     Vec<ChunkSpec>,
    },
}

/// Output of [`Coordinator::stage`].
struct Staged {
    jobs:          Vec<ChunkJob>,
    expected_size: Option<u64>,
    journal:       Option<ResumeJournal>,
}

/// The single externally visible result of a download.
#[derive(Debug, AsRefStr)]
#[strum(serialize_all = "snake_case")]
enum Outcome {
    Success(PathBuf),
    NotFound,
    Failed(DownloadError),
    Stopped(Option<PathBuf>),
    Canceled,
}

impl Outcome {
    const fn state(&self) -> DownloadState {
        match self {
            Self::Success(_) => DownloadState::Success,
            Self::NotFound => DownloadState::NotFound,
            Self::Failed(_) => DownloadState::Failed,
            Self::Stopped(_) => DownloadState::Stopped,
            Self::Canceled => DownloadState::Canceled,
        }
    }

    fn into_event(self) -> DownloadEvent {
        match self {
            Self::Success(path) => DownloadEvent::Success { path },
            Self::NotFound => DownloadEvent::NotFound,
            Self::Failed(error) => DownloadEvent::Fail {
                error: Arc::new(error),
            },
            Self::Stopped(partial) => DownloadEvent::Stop { partial },
            Self::Canceled => DownloadEvent::Cancel,
        }
    }
}

/// Owns one logical download from cache check to `on_end`.
///
/// The coordinator is the only writer of the download's state and the only
/// publisher of its events. Fetchers report to it over a channel; it decides
/// the terminal outcome once every fetcher has finished, with the precedence
/// cancel, stop, first chunk error, success.
pub(crate) struct Coordinator {
    id:       u64,
    key:      ContentKey,
    request:  DownloadRequest,
    ctx:      Arc<EngineContext>,
    hub:      SubscriberHub,
    snapshot: Mutex<DownloadSnapshot>,
    cancel:   CancellationToken,
    stop:     CancellationToken,
    /// Terminal state, set after `on_end` was published.
    finished: watch::Sender<Option<DownloadState>>,
}

impl Coordinator {
    pub(crate) fn new(
        id: u64,
        request: DownloadRequest,
        ctx: Arc<EngineContext>,
        listener: Arc<dyn DownloadListener>,
    ) -> (Arc<Self>, SubscriberId) {
        let (hub, subscriber) = SubscriberHub::with_subscriber(listener);
        let (finished, _) = watch::channel(None);
        let coordinator = Self {
            id,
            key: request.content_key(),
            request,
            ctx,
            hub,
            snapshot: Mutex::new(DownloadSnapshot {
                state:  DownloadState::NotStarted,
                chunks: Vec::new(),
            }),
            cancel: CancellationToken::new(),
            stop: CancellationToken::new(),
            finished,
        };
        (Arc::new(coordinator), subscriber)
    }

    pub(crate) const fn id(&self) -> u64 { self.id }

    pub(crate) const fn key(&self) -> &ContentKey { &self.key }

    pub(crate) fn attach(&self, listener: Arc<dyn DownloadListener>) -> Option<SubscriberId> {
        self.hub.attach(listener)
    }

    pub(crate) fn subscriber_count(&self) -> usize { self.hub.subscriber_count() }

    /// Withdraw one subscriber's interest; the download is cancelled when it
    /// was the last one.
    pub(crate) fn release(&self, subscriber: SubscriberId) {
        match self.hub.release(subscriber) {
            Release::Detached => debug!(key = %self.key, subscriber, "subscriber detached"),
            Release::LastInterest => {
                info!(key = %self.key, "last subscriber cancelled, cancelling download");
                self.cancel.cancel();
            }
            Release::Ignored => {}
        }
    }

    pub(crate) fn stop(&self) { self.stop.cancel(); }

    /// Cancel regardless of subscribers.
    pub(crate) fn abort(&self) { self.cancel.cancel(); }

    /// Whether newcomers must start a fresh download instead of joining.
    pub(crate) fn is_closing(&self) -> bool {
        self.cancel.is_cancelled() || self.finished.borrow().is_some()
    }

    pub(crate) fn snapshot(&self) -> DownloadSnapshot { self.snapshot.lock().clone() }

    /// Resolves with the terminal state once `on_end` has been published.
    pub(crate) async fn finished(&self) -> DownloadState {
        let mut rx = self.finished.subscribe();
        let state = match rx.wait_for(Option::is_some).await {
            Ok(state) => *state,
            Err(_) => None,
        };
        state.unwrap_or(DownloadState::Ended)
    }

    /// Drive the download to its end. `previous` is the coordinator this one
    /// replaced for the same key; the key's partial file is not touched until
    /// it has finished.
    pub(crate) async fn run(&self, previous: Option<Arc<Self>>) {
        if let Some(previous) = previous {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {}
                _ = previous.finished() => {}
            }
        }

        DOWNLOADS_STARTED.inc();
        DOWNLOADS_IN_FLIGHT.inc();
        let outcome = self.drive().await;
        DOWNLOADS_IN_FLIGHT.dec();
        self.finish(outcome);
    }

    async fn drive(&self) -> Outcome {
        if self.cancel.is_cancelled() {
            return Outcome::Canceled;
        }

        if !self.request.force_refresh {
            match self.ctx.cache.lookup(&self.key).await {
                Ok(Some(entry)) => {
                    info!(key = %self.key, path = %entry.path.display(), "served from cache");
                    return Outcome::Success(entry.path);
                }
                Ok(None) => {}
                Err(e) => warn!(key = %self.key, error = %e, "cache lookup failed, downloading"),
            }
        }

        match self.resolve_plan().await {
            Ok(plan) => self.transfer(plan).await,
            Err(outcome) => outcome,
        }
    }

    /// Probe the server when chunking is wanted. Anything short of a usable
    /// size with byte-range support falls back to a direct fetch, except a
    /// 404 which ends the download.
    async fn resolve_plan(&self) -> Result<TransferPlan, Outcome> {
        let desired = self.request.desired_chunks();
        if desired <= 1 {
            return Ok(TransferPlan::Direct);
        }

        self.snapshot.lock().state = DownloadState::Probing;
        let probed = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Outcome::Canceled),
            () = self.stop.cancelled() => return Err(Outcome::Stopped(None)),
            probed = self.ctx.prober.probe(&self.request.url) => probed,
        };

        match probed {
            Ok(ProbeOutcome::NotFound) => {
                PROBE_TOTAL.with_label_values(&["not_found"]).inc();
                info!(key = %self.key, url = %self.request.url, "probe returned 404");
                Err(Outcome::NotFound)
            }
            Ok(ProbeOutcome::Found(info)) => {
                let Some(total_size) = info.chunkable_size() else {
                    PROBE_TOTAL.with_label_values(&["no_ranges"]).inc();
                    debug!(key = %self.key, ?info, "no byte-range support, fetching directly");
                    return Ok(TransferPlan::Direct);
                };
                PROBE_TOTAL.with_label_values(&["ranges"]).inc();

                let count = self
                    .ctx
                    .config
                    .chunking
                    .effective_chunks(total_size, desired);
                let chunks = plan(total_size, count);
                debug!(key = %self.key, total_size, chunks = chunks.len(), "planned chunks");
                if chunks.len() > 1 {
                    Ok(TransferPlan::Chunked { total_size, chunks })
                } else {
                    Ok(TransferPlan::Direct)
                }
            }
            Err(e) => {
                PROBE_TOTAL.with_label_values(&["error"]).inc();
                warn!(key = %self.key, error = %e, "probe failed, fetching directly");
                Ok(TransferPlan::Direct)
            }
        }
    }

    async fn transfer(&self, plan: TransferPlan) -> Outcome {
        self.enter_downloading(&plan);
        let partial = self.ctx.journals.partial_path(&self.key);

        let mut staged = match self.stage(&plan, &partial).await {
            Ok(staged) => staged,
            Err(e) => {
                self.ctx.journals.discard(&self.key).await;
                return Outcome::Failed(e);
            }
        };
        self.replay_resumed(staged.journal.as_ref());

        let first_error = self.fetch_all(&mut staged, &partial).await;

        let outcome = if self.cancel.is_cancelled() {
            Outcome::Canceled
        } else if self.stop.is_cancelled() {
            return self.keep_partial(&staged, &partial).await;
        } else if let Some(error) = first_error {
            if error.kind() == ErrorKind::NotFound {
                Outcome::NotFound
            } else {
                Outcome::Failed(error)
            }
        } else {
            match self.commit(&partial, staged.expected_size).await {
                Ok(path) => return Outcome::Success(path),
                Err(e) => Outcome::Failed(e),
            }
        };

        self.ctx.journals.discard(&self.key).await;
        outcome
    }

    fn enter_downloading(&self, plan: &TransferPlan) {
        let chunks: Vec<ChunkProgress> = match plan {
            TransferPlan::Direct => vec![ChunkProgress::default()],
            TransferPlan::Chunked { chunks, .. } => chunks
                .iter()
                .map(|spec| ChunkProgress {
                    total: spec.byte_len(),
                    ..ChunkProgress::default()
                })
                .collect(),
        };
        let chunk_count = chunks.len();
        {
            let mut snapshot = self.snapshot.lock();
            snapshot.state = DownloadState::Downloading { chunk_count };
            snapshot.chunks = chunks;
        }

        info!(key = %self.key, url = %self.request.url, chunk_count, "download started");
        self.hub.publish(DownloadEvent::Start { chunk_count });
    }

    /// Create the output file and pick the chunks that still need fetching.
    async fn stage(&self, plan: &TransferPlan, partial: &Path) -> Result<Staged, DownloadError> {
        match plan {
            TransferPlan::Direct => {
                self.ctx.journals.remove(&self.key).await;
                ChunkAssembler::prepare(partial, None, false).await?;
                Ok(Staged {
                    jobs:          vec![ChunkJob::whole_body()],
                    expected_size: None,
                    journal:       None,
                })
            }
            TransferPlan::Chunked { total_size, chunks } => {
                let resumable = self
                    .ctx
                    .journals
                    .load(&self.key)
                    .await
                    .filter(|journal| journal.matches(&self.request.url, *total_size, chunks));
                let reused =
                    ChunkAssembler::prepare(partial, Some(*total_size), resumable.is_some()).await?;

                let journal = match resumable {
                    Some(journal) if reused => {
                        info!(
                            key = %self.key,
                            completed = journal.completed.len(),
                            "resuming download"
                        );
                        journal
                    }
                    _ => ResumeJournal::new(&self.request.url, *total_size, chunks.clone()),
                };
                self.ctx.journals.save(&self.key, &journal).await?;

                let jobs = chunks
                    .iter()
                    .filter(|spec| !journal.is_completed(spec.index))
                    .map(|spec| ChunkJob::ranged(*spec))
                    .collect();
                Ok(Staged {
                    jobs,
                    expected_size: Some(*total_size),
                    journal: Some(journal),
                })
            }
        }
    }

    /// Chunks finished by an earlier attempt report as complete right away.
    fn replay_resumed(&self, journal: Option<&ResumeJournal>) {
        let Some(journal) = journal else {
            return;
        };
        for spec in journal.chunks.iter().filter(|s| journal.is_completed(s.index)) {
            let len = spec.byte_len();
            self.update_chunk(spec.index, |chunk| {
                chunk.state = ChunkState::Completed;
                chunk.downloaded = len;
            });
            self.hub.publish(DownloadEvent::Progress {
                chunk_index: spec.index,
                downloaded:  len,
                total:       len,
            });
        }
    }

    /// Run one fetcher per pending job and wait for all of them. Returns the
    /// first chunk error, if any.
    async fn fetch_all(&self, staged: &mut Staged, partial: &Path) -> Option<DownloadError> {
        let fetcher = Arc::new(RangeFetcher::new(
            self.ctx.client.clone(),
            Arc::from(self.request.url.as_str()),
            partial.to_path_buf(),
            self.ctx.fetch_settings(),
        ));
        let abort = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        for job in staged.jobs.iter().copied() {
            let fetcher = Arc::clone(&fetcher);
            let token = abort.child_token();
            let tx = tx.clone();
            tasks.spawn(async move { fetcher.run(job, token, tx).await });
        }
        drop(tx);

        let mut first_error = None;
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled(), if !abort.is_cancelled() => {
                    debug!(key = %self.key, "cancel requested, aborting chunks");
                    abort.cancel();
                }
                () = self.stop.cancelled(), if !abort.is_cancelled() => {
                    debug!(key = %self.key, "stop requested, aborting chunks");
                    abort.cancel();
                }
                report = rx.recv() => match report {
                    Some(report) => {
                        self.on_report(report, &mut staged.journal, &abort, &mut first_error)
                            .await;
                    }
                    None => break,
                },
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(key = %self.key, error = %e, "chunk task did not finish cleanly");
            }
        }

        // A chunk without a terminal report belongs to a task that panicked.
        let mut snapshot = self.snapshot.lock();
        for (index, chunk) in snapshot.chunks.iter_mut().enumerate() {
            if matches!(chunk.state, ChunkState::Pending | ChunkState::InFlight) {
                chunk.state = ChunkState::Failed;
                first_error.get_or_insert(DownloadError::TaskPanic { index });
            }
        }
        first_error
    }

    async fn on_report(
        &self,
        report: ChunkReport,
        journal: &mut Option<ResumeJournal>,
        abort: &CancellationToken,
        first_error: &mut Option<DownloadError>,
    ) {
        match report {
            ChunkReport::Started { index } => {
                self.update_chunk(index, |chunk| chunk.state = ChunkState::InFlight);
            }
            ChunkReport::Progress {
                index,
                downloaded,
                total,
            } => {
                self.update_chunk(index, |chunk| {
                    chunk.downloaded = downloaded;
                    if total > 0 {
                        chunk.total = total;
                    }
                });
                self.hub.publish(DownloadEvent::Progress {
                    chunk_index: index,
                    downloaded,
                    total,
                });
            }
            ChunkReport::Finished { index, outcome } => match outcome {
                FetchOutcome::Completed(bytes) => {
                    self.update_chunk(index, |chunk| chunk.state = ChunkState::Completed);
                    debug!(key = %self.key, chunk = index, bytes, "chunk completed");
                    if let Some(journal) = journal {
                        journal.mark_completed(index);
                        if let Err(e) = self.ctx.journals.save(&self.key, journal).await {
                            warn!(key = %self.key, error = %e, "failed to update resume journal");
                        }
                    }
                }
                FetchOutcome::Failed(error) => {
                    self.update_chunk(index, |chunk| chunk.state = ChunkState::Failed);
                    warn!(key = %self.key, chunk = index, error = %error, "chunk failed");
                    if first_error.is_none() {
                        *first_error = Some(error);
                        abort.cancel();
                    }
                }
                FetchOutcome::Canceled => {
                    self.update_chunk(index, |chunk| chunk.state = ChunkState::Canceled);
                }
            },
        }
    }

    fn update_chunk(&self, index: usize, update: impl FnOnce(&mut ChunkProgress)) {
        if let Some(chunk) = self.snapshot.lock().chunks.get_mut(index) {
            update(chunk);
        }
    }

    /// Hash the assembled file and publish it to the cache.
    async fn commit(
        &self,
        partial: &Path,
        expected_size: Option<u64>,
    ) -> Result<PathBuf, DownloadError> {
        let assembled = ChunkAssembler::finalize(partial, expected_size).await?;
        let metadata = CacheMetadata {
            url:           self.request.url.clone(),
            file_size:     assembled.size,
            sha256:        assembled.sha256,
            downloaded_at: Timestamp::now(),
            complete:      true,
        };
        let entry = self.ctx.cache.commit(&self.key, partial, metadata).await?;
        self.ctx.journals.remove(&self.key).await;
        Ok(entry.path)
    }

    /// A stopped download keeps its bytes and journal for a later resume.
    async fn keep_partial(&self, staged: &Staged, partial: &Path) -> Outcome {
        // A chunked output is preallocated, so its length says nothing about
        // what arrived.
        let reported = self.snapshot.lock().downloaded();
        let received = reported > 0
            || (staged.journal.is_none() && ChunkAssembler::has_data(partial).await);
        if !received {
            self.ctx.journals.discard(&self.key).await;
            return Outcome::Stopped(None);
        }

        if let Some(journal) = &staged.journal
            && let Err(e) = self.ctx.journals.save(&self.key, journal).await
        {
            warn!(key = %self.key, error = %e, "failed to save resume journal");
        }
        Outcome::Stopped(Some(partial.to_path_buf()))
    }

    fn finish(&self, outcome: Outcome) {
        let state = outcome.state();
        DOWNLOADS_FINISHED
            .with_label_values(&[outcome.as_ref()])
            .inc();
        match &outcome {
            Outcome::Failed(error) => {
                warn!(key = %self.key, kind = %error.kind(), error = %error, "download failed");
            }
            other => info!(key = %self.key, outcome = other.as_ref(), "download finished"),
        }

        self.snapshot.lock().state = state;
        self.hub.publish(outcome.into_event());
        self.hub.publish(DownloadEvent::End);
        self.snapshot.lock().state = DownloadState::Ended;
        self.finished.send_replace(Some(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_maps_to_state_and_event() {
        let failed = Outcome::Failed(DownloadError::Cancelled);
        assert_eq!(failed.as_ref(), "failed");
        assert_eq!(failed.state(), DownloadState::Failed);
        assert_eq!(failed.into_event().as_ref(), "fail");

        let stopped = Outcome::Stopped(None);
        assert_eq!(stopped.state(), DownloadState::Stopped);
        assert!(matches!(
            stopped.into_event(),
            DownloadEvent::Stop { partial: None }
        ));

        assert_eq!(Outcome::Canceled.into_event().as_ref(), "cancel");
        assert_eq!(Outcome::NotFound.state(), DownloadState::NotFound);
    }
}
