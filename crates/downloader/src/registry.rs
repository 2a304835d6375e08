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
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    coordinator::{Coordinator, EngineContext},
    key::ContentKey,
    listener::DownloadListener,
    metrics::DOWNLOAD_ATTACHES,
    subscribers::SubscriberId,
    types::{DownloadRequest, DownloadSnapshot, DownloadState},
};

/// At most one live coordinator per content key.
///
/// The map lock covers only the check-and-insert in [`Self::start`] and the
/// removal of a finished coordinator; downloads themselves run outside it.
pub(crate) struct DownloadRegistry {
    ctx:     Arc<EngineContext>,
    active:  Mutex<HashMap<ContentKey, Arc<Coordinator>>>,
    next_id: AtomicU64,
}

impl DownloadRegistry {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn context(&self) -> &EngineContext { &self.ctx }

    /// Join the live download of the request's key, or start a new one.
    ///
    /// A coordinator that is being cancelled or has already finished is
    /// replaced rather than joined. The replacement waits for it to end
    /// before touching the key's files.
    pub(crate) fn start(
        self: &Arc<Self>,
        request: DownloadRequest,
        listener: Arc<dyn DownloadListener>,
    ) -> DownloadHandle {
        let key = request.content_key();
        let mut active = self.active.lock();

        if let Some(existing) = active.get(&key)
            && !existing.is_closing()
            && let Some(subscriber) = existing.attach(Arc::clone(&listener))
        {
            DOWNLOAD_ATTACHES.inc();
            debug!(
                %key,
                subscriber,
                subscribers = existing.subscriber_count(),
                "attached to in-flight download"
            );
            return DownloadHandle::new(Arc::clone(existing), subscriber);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (coordinator, subscriber) =
            Coordinator::new(id, request, Arc::clone(&self.ctx), listener);
        let previous = active.insert(key, Arc::clone(&coordinator));
        drop(active);

        let registry = Arc::downgrade(self);
        let task = Arc::clone(&coordinator);
        tokio::spawn(async move {
            task.run(previous).await;
            if let Some(registry) = registry.upgrade() {
                registry.remove(&task);
            }
        });

        DownloadHandle::new(coordinator, subscriber)
    }

    fn remove(&self, coordinator: &Coordinator) {
        let mut active = self.active.lock();
        if active
            .get(coordinator.key())
            .is_some_and(|current| current.id() == coordinator.id())
        {
            active.remove(coordinator.key());
        }
    }

    /// Number of downloads that have not ended yet.
    pub(crate) fn in_flight(&self) -> usize { self.active.lock().len() }

    /// Cancel every live download, whoever is subscribed.
    pub(crate) fn shutdown(&self) {
        let active: Vec<_> = self.active.lock().values().cloned().collect();
        for coordinator in active {
            coordinator.abort();
        }
    }
}

/// One subscriber's view of a download.
///
/// Dropping the handle does not cancel anything; the listener keeps
/// receiving events until `on_end`.
pub struct DownloadHandle {
    coordinator: Arc<Coordinator>,
    subscriber:  SubscriberId,
    released:    AtomicBool,
}

impl DownloadHandle {
    fn new(coordinator: Arc<Coordinator>, subscriber: SubscriberId) -> Self {
        Self {
            coordinator,
            subscriber,
            released: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn key(&self) -> &ContentKey { self.coordinator.key() }

    /// Withdraw this subscriber's interest.
    ///
    /// While other subscribers remain, this listener alone gets `on_cancel`
    /// and `on_end` and the download goes on. The last subscriber to cancel
    /// cancels the download. Repeated calls, and calls after the download
    /// reached its outcome, do nothing.
    pub fn cancel(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.coordinator.release(self.subscriber);
        }
    }

    /// Stop the download for everyone, keeping what was received so far.
    ///
    /// Meant for a streaming consumer that has read enough. Listeners get
    /// `on_stop` with the partial file.
    pub fn stop(&self) { self.coordinator.stop(); }

    #[must_use]
    pub fn snapshot(&self) -> DownloadSnapshot { self.coordinator.snapshot() }

    #[must_use]
    pub fn state(&self) -> DownloadState { self.coordinator.snapshot().state }

    /// Wait until the download has ended and return its outcome.
    pub async fn wait(&self) -> DownloadState { self.coordinator.finished().await }
}

impl fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("key", self.coordinator.key())
            .field("subscriber", &self.subscriber)
            .field("state", &self.state())
            .finish()
    }
}
