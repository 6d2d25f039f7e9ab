//! Directory watch stream.

use futures::Stream;
use kite_types::KiteEvent;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Live events buffered for a watcher before Kontrol's pushes start to wait
/// on the consumer.
pub const LIVE_EVENT_CAPACITY: usize = 64;

/// Events for a Kontrol watch: first the kites that matched when the watch
/// started, then every later change pushed by Kontrol.
///
/// The snapshot is always drained before any live event, so a consumer
/// never sees a change before the state it applies to. The live side is
/// bounded: once [`LIVE_EVENT_CAPACITY`] events are waiting, delivery of
/// the next one stalls until the consumer catches up.
pub struct KiteWatcher {
    snapshot: VecDeque<KiteEvent>,
    live: mpsc::Receiver<KiteEvent>,
}

impl KiteWatcher {
    pub(crate) fn new(
        snapshot: impl IntoIterator<Item = KiteEvent>,
        live: mpsc::Receiver<KiteEvent>,
    ) -> Self {
        Self {
            snapshot: snapshot.into_iter().collect(),
            live,
        }
    }

    /// Number of snapshot events not yet consumed.
    pub fn snapshot_len(&self) -> usize {
        self.snapshot.len()
    }

    /// Next event. `None` once the watch is cancelled and drained.
    pub async fn next_event(&mut self) -> Option<KiteEvent> {
        match self.snapshot.pop_front() {
            Some(event) => Some(event),
            None => self.live.recv().await,
        }
    }

    /// Next event if one is available right now.
    pub fn try_next_event(&mut self) -> Option<KiteEvent> {
        self.snapshot
            .pop_front()
            .or_else(|| self.live.try_recv().ok())
    }

    /// Stop accepting live events. Events already received are still
    /// returned.
    pub fn cancel(&mut self) {
        self.live.close();
    }
}

impl Stream for KiteWatcher {
    type Item = KiteEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(event) = this.snapshot.pop_front() {
            return Poll::Ready(Some(event));
        }
        this.live.poll_recv(cx)
    }
}
