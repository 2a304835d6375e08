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
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::listener::{DownloadEvent, DownloadListener};

pub(crate) type SubscriberId = u64;

/// What happened when a subscriber withdrew its interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Others still want the download. The subscriber got `on_cancel` and
    /// `on_end` and was dropped.
    Detached,
    /// Nobody wants the download any more; the owner should cancel it. The
    /// subscriber stays attached to receive the terminal events.
    LastInterest,
    /// Unknown subscriber, repeated release, or the download already ended.
    Ignored,
}

struct Subscriber {
    id:         SubscriberId,
    tx:         mpsc::UnboundedSender<DownloadEvent>,
    interested: bool,
}

#[derive(Default)]
struct HubState {
    next_id:     SubscriberId,
    subscribers: Vec<Subscriber>,
    chunk_count: Option<usize>,
    /// Latest `(downloaded, total)` per chunk, replayed to late attachers.
    progress:    Vec<Option<(u64, u64)>>,
    terminal:    Option<DownloadEvent>,
    /// Set once the last interested subscriber released; no one may join.
    abandoned:   bool,
    ended:       bool,
}

impl HubState {
    fn insert(&mut self, listener: Arc<dyn DownloadListener>) -> SubscriberId {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_delivery(listener, rx);

        let id = self.next_id;
        self.next_id += 1;

        if let Some(chunk_count) = self.chunk_count {
            let _ = tx.send(DownloadEvent::Start { chunk_count });
            for (chunk_index, progress) in self.progress.iter().enumerate() {
                if let Some((downloaded, total)) = *progress {
                    let _ = tx.send(DownloadEvent::Progress {
                        chunk_index,
                        downloaded,
                        total,
                    });
                }
            }
        }
        if let Some(terminal) = self.terminal.clone() {
            let _ = tx.send(terminal);
        }
        if self.ended {
            let _ = tx.send(DownloadEvent::End);
            return id;
        }

        self.subscribers.push(Subscriber {
            id,
            tx,
            interested: true,
        });
        id
    }
}

/// Fan-out of one download's events to its listeners.
///
/// Each listener gets its own unbounded queue drained by a dedicated task,
/// so a slow callback only ever delays its own listener and per-listener
/// order always matches publish order. Attaching and publishing share one
/// lock, which makes the replay for a late attacher seamless with the live
/// events that follow it.
#[derive(Default)]
pub(crate) struct SubscriberHub {
    state: Mutex<HubState>,
}

impl SubscriberHub {
    /// A hub whose first subscriber is `listener`.
    pub(crate) fn with_subscriber(listener: Arc<dyn DownloadListener>) -> (Self, SubscriberId) {
        let hub = Self::default();
        let id = hub.state.lock().insert(listener);
        (hub, id)
    }

    /// Register `listener` and replay what it missed: `on_start` plus the
    /// latest progress of every chunk while in flight, or the terminal event
    /// and `on_end` once finished.
    ///
    /// Returns `None` once nobody is interested in the download any more; the
    /// caller has to start a new one.
    ///
    /// Must be called within a Tokio runtime.
    pub(crate) fn attach(&self, listener: Arc<dyn DownloadListener>) -> Option<SubscriberId> {
        let mut state = self.state.lock();
        if state.abandoned {
            return None;
        }
        Some(state.insert(listener))
    }

    /// Deliver `event` to every subscriber. `End` also drops all queues, so
    /// nothing can follow it.
    pub(crate) fn publish(&self, event: DownloadEvent) {
        let mut state = self.state.lock();
        if state.ended {
            return;
        }

        match &event {
            DownloadEvent::Start { chunk_count } => {
                state.chunk_count = Some(*chunk_count);
                state.progress = vec![None; *chunk_count];
            }
            DownloadEvent::Progress {
                chunk_index,
                downloaded,
                total,
            } => {
                if let Some(slot) = state.progress.get_mut(*chunk_index) {
                    *slot = Some((*downloaded, *total));
                }
            }
            DownloadEvent::End => state.ended = true,
            terminal => {
                if state.terminal.is_some() {
                    return;
                }
                state.terminal = Some(terminal.clone());
            }
        }

        for subscriber in &state.subscribers {
            let _ = subscriber.tx.send(event.clone());
        }
        if state.ended {
            state.subscribers.clear();
        }
    }

    /// Withdraw the interest of subscriber `id`.
    pub(crate) fn release(&self, id: SubscriberId) -> Release {
        let mut state = self.state.lock();
        if state.ended || state.terminal.is_some() {
            return Release::Ignored;
        }

        let Some(position) = state
            .subscribers
            .iter()
            .position(|s| s.id == id && s.interested)
        else {
            return Release::Ignored;
        };

        let others = state
            .subscribers
            .iter()
            .filter(|s| s.interested && s.id != id)
            .count();
        if others > 0 {
            let subscriber = state.subscribers.remove(position);
            let _ = subscriber.tx.send(DownloadEvent::Cancel);
            let _ = subscriber.tx.send(DownloadEvent::End);
            Release::Detached
        } else {
            state.subscribers[position].interested = false;
            state.abandoned = true;
            Release::LastInterest
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize { self.state.lock().subscribers.len() }
}

/// A panicking callback is logged and skipped; later events, `on_end`
/// included, are still delivered.
fn spawn_delivery(listener: Arc<dyn DownloadListener>, mut rx: mpsc::UnboundedReceiver<DownloadEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| event.dispatch(listener.as_ref())));
            if delivered.is_err() {
                warn!(event = event.as_ref(), "download listener panicked");
            }
            if event.is_end() {
                break;
            }
        }
    });
}
