//! Event bus (component I).
//!
//! No metrics/event-bus crate appears anywhere in the reference corpus for
//! this stack, so this is a small hand-rolled bus atop a bounded
//! `tokio::sync::mpsc` channel plus a `tracing`-backed default sink — the
//! same ambient logging idiom the teacher uses pervasively
//! (`tracing::warn!`/`debug!` throughout `protocol/*`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::canonical::RepositoryId;
use crate::error::UpstreamOutcome;
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RequestReceived,
    CacheHit,
    CacheMiss,
    RefreshStarted,
    RefreshCompleted,
    RefreshFailed,
    FallbackStale,
    UpstreamUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    MissRefreshed,
    StaleFallback,
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub repository: RepositoryId,
    pub fingerprint: Option<Fingerprint>,
    pub bytes: u64,
    pub duration: Duration,
    pub upstream_status: Option<UpstreamOutcome>,
    pub cache_outcome: CacheOutcome,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Logs every event at `info`/`warn` via `tracing`, with structured fields
/// so a log pipeline can still answer the questions the event bus answers
/// in-process.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: Event) {
        match event.kind {
            EventKind::RefreshFailed | EventKind::UpstreamUnavailable => {
                tracing::warn!(
                    repository = %event.repository,
                    kind = ?event.kind,
                    upstream_status = ?event.upstream_status,
                    "goblet event"
                );
            }
            _ => {
                tracing::info!(
                    repository = %event.repository,
                    kind = ?event.kind,
                    bytes = event.bytes,
                    duration_ms = event.duration.as_millis() as u64,
                    "goblet event"
                );
            }
        }
    }
}

/// Bounded, non-blocking publisher. Honest about not being a true ring
/// buffer: on a full channel the event is dropped and counted, rather than
/// silently pretending to evict the oldest entry.
pub struct EventBus {
    sender: mpsc::Sender<Event>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            EventBus {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    pub fn publish(&self, event: Event) {
        if self.sender.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drives received events into a sink until the channel closes. Spawned
/// once at startup as a background task.
pub async fn run_event_loop(mut receiver: mpsc::Receiver<Event>, sink: impl EventSink) {
    while let Some(event) = receiver.recv().await {
        sink.emit(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            kind: EventKind::CacheHit,
            repository: RepositoryId::new("https/example.com/foo.git".to_string()),
            fingerprint: None,
            bytes: 42,
            duration: Duration::from_millis(5),
            upstream_status: None,
            cache_outcome: CacheOutcome::Hit,
        }
    }

    #[test]
    fn publish_succeeds_while_capacity_remains() {
        let (bus, _rx) = EventBus::new(4);
        bus.publish(sample_event());
        assert_eq!(bus.dropped_count(), 0);
    }

    #[test]
    fn publish_counts_drops_once_channel_is_full() {
        let (bus, _rx) = EventBus::new(1);
        bus.publish(sample_event());
        bus.publish(sample_event());
        bus.publish(sample_event());
        assert_eq!(bus.dropped_count(), 2);
    }

    #[tokio::test]
    async fn event_loop_drains_until_channel_closes() {
        let (bus, rx) = EventBus::new(4);
        bus.publish(sample_event());
        drop(bus);
        struct CountingSink(std::sync::Arc<AtomicU64>);
        #[async_trait]
        impl EventSink for CountingSink {
            async fn emit(&self, _event: Event) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        let count = std::sync::Arc::new(AtomicU64::new(0));
        run_event_loop(rx, CountingSink(count.clone())).await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
