// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-bus
#![deny(unsafe_code)]
//!
//! Per-delegation event fan-out. The Executor engine is the sole producer;
//! SSE handlers subscribe. The hub exists from admission time so an SSE
//! connection opened before START can never miss events, and a terminal
//! event is retained for a configurable window so late or reconnecting
//! subscribers receive exactly one synthetic replay.

/// Cooperative cancellation shared by the lease watchdog and the runner.
pub mod cancel;

pub use cancel::{CancelReason, CancelToken};

use awcp_core::ExecutorEvent;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default per-subscriber queue bound; a subscriber that falls this far
/// behind the producer is dropped rather than allowed to block it.
pub const DEFAULT_SUBSCRIBER_WATERMARK: usize = 1024;

/// Terminal state retained for replay after a delegation finishes.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    /// The terminal event (`done` or `error`) exactly as published.
    pub terminal: ExecutorEvent,
    /// When the terminal was published.
    pub completed_at: DateTime<Utc>,
}

/// What a subscriber gets back from [`EventHub::subscribe`].
#[derive(Debug)]
pub enum Subscription {
    /// The delegation is in flight; every subsequent event arrives here.
    Live(mpsc::Receiver<ExecutorEvent>),
    /// The delegation finished within the retention window; exactly one
    /// synthetic terminal event is replayed.
    Replay(ExecutorEvent),
    /// Unknown id (never registered, or retention elapsed).
    Unknown,
}

/// Aggregate hub counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Delegations with a live channel.
    pub live: usize,
    /// Retained completion records.
    pub completed: usize,
}

struct HubInner {
    live: HashMap<String, Vec<mpsc::Sender<ExecutorEvent>>>,
    completed: HashMap<String, CompletionRecord>,
}

/// Single-producer, multi-consumer event channels keyed by delegation id.
pub struct EventHub {
    inner: Mutex<HubInner>,
    watermark: usize,
    retention: Duration,
}

impl EventHub {
    /// Create a hub with the given per-subscriber queue bound and
    /// completion retention window.
    #[must_use]
    pub fn new(watermark: usize, retention_ms: u64) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                live: HashMap::new(),
                completed: HashMap::new(),
            }),
            watermark: watermark.max(1),
            retention: Duration::milliseconds(retention_ms as i64),
        }
    }

    /// Create the channel for a delegation. Called at admission time, before
    /// START can possibly arrive, so subscribe/START races are impossible.
    pub fn register(&self, delegation_id: &str) {
        let mut inner = self.lock();
        inner
            .live
            .entry(delegation_id.to_string())
            .or_default();
    }

    /// Drop a registered channel without publishing a terminal (admission
    /// was discarded before START).
    pub fn discard(&self, delegation_id: &str) {
        let mut inner = self.lock();
        inner.live.remove(delegation_id);
    }

    /// Publish an event to every attached subscriber.
    ///
    /// Terminal events additionally close the live channel and store a
    /// [`CompletionRecord`] for the retention window. Publishing to an
    /// unregistered id is a producer bug and is logged, not raised.
    pub fn publish(&self, delegation_id: &str, event: ExecutorEvent) {
        let mut inner = self.lock();
        sweep(&mut inner, self.retention);

        let Some(subscribers) = inner.live.get_mut(delegation_id) else {
            warn!(target: "awcp.bus", id = delegation_id, kind = event.kind(), "publish on unregistered delegation");
            return;
        };

        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: "awcp.bus", id = delegation_id, "dropping subscriber past watermark");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if event.is_terminal() {
            debug!(target: "awcp.bus", id = delegation_id, kind = event.kind(), "closing stream on terminal");
            inner.live.remove(delegation_id);
            inner.completed.insert(
                delegation_id.to_string(),
                CompletionRecord {
                    terminal: event,
                    completed_at: Utc::now(),
                },
            );
        }
    }

    /// Attach to a delegation's stream.
    #[must_use]
    pub fn subscribe(&self, delegation_id: &str) -> Subscription {
        let mut inner = self.lock();
        sweep(&mut inner, self.retention);

        if let Some(subscribers) = inner.live.get_mut(delegation_id) {
            let (tx, rx) = mpsc::channel(self.watermark);
            subscribers.push(tx);
            return Subscription::Live(rx);
        }
        if let Some(record) = inner.completed.get(delegation_id) {
            return Subscription::Replay(record.terminal.clone());
        }
        Subscription::Unknown
    }

    /// The retained completion record, if within the retention window.
    #[must_use]
    pub fn completion(&self, delegation_id: &str) -> Option<CompletionRecord> {
        let mut inner = self.lock();
        sweep(&mut inner, self.retention);
        inner.completed.get(delegation_id).cloned()
    }

    /// Returns `true` while the delegation has a live channel.
    #[must_use]
    pub fn is_live(&self, delegation_id: &str) -> bool {
        self.lock().live.contains_key(delegation_id)
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let mut inner = self.lock();
        sweep(&mut inner, self.retention);
        HubStats {
            live: inner.live.len(),
            completed: inner.completed.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sweep(inner: &mut HubInner, retention: Duration) {
    let cutoff = Utc::now() - retention;
    inner.completed.retain(|_, rec| rec.completed_at > cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;
    use awcp_core::{ErrorCode, ProtocolError};

    fn status(msg: &str) -> ExecutorEvent {
        ExecutorEvent::Status {
            message: msg.into(),
            substate: None,
        }
    }

    fn done() -> ExecutorEvent {
        ExecutorEvent::Done {
            summary: "finished".into(),
            highlights: vec![],
            snapshot_ids: vec![],
            recommended_snapshot_id: None,
        }
    }

    #[tokio::test]
    async fn live_subscriber_receives_producer_order() {
        let hub = EventHub::new(16, 60_000);
        hub.register("d-1");
        let Subscription::Live(mut rx) = hub.subscribe("d-1") else {
            panic!("expected live subscription");
        };

        hub.publish("d-1", status("one"));
        hub.publish("d-1", status("two"));
        hub.publish("d-1", done());

        let mut kinds = Vec::new();
        while let Some(ev) = rx.recv().await {
            kinds.push(ev.kind());
        }
        assert_eq!(kinds, vec!["status", "status", "done"]);
    }

    #[tokio::test]
    async fn subscriber_before_start_misses_nothing() {
        let hub = EventHub::new(16, 60_000);
        hub.register("d-1");
        // Subscribe first, publish later: the admission-time registration
        // guarantees this ordering works.
        let Subscription::Live(mut rx) = hub.subscribe("d-1") else {
            panic!("expected live subscription");
        };
        hub.publish("d-1", status("early"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind(), "status");
    }

    #[tokio::test]
    async fn terminal_closes_stream_and_replays() {
        let hub = EventHub::new(16, 60_000);
        hub.register("d-1");
        hub.publish("d-1", done());

        assert!(!hub.is_live("d-1"));
        match hub.subscribe("d-1") {
            Subscription::Replay(ev) => assert_eq!(ev.kind(), "done"),
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn unknown_id_is_unknown() {
        let hub = EventHub::new(16, 60_000);
        assert!(matches!(hub.subscribe("nope"), Subscription::Unknown));
    }

    #[test]
    fn retention_window_expires_replay() {
        let hub = EventHub::new(16, 0);
        hub.register("d-1");
        hub.publish(
            "d-1",
            ExecutorEvent::from_error(ProtocolError::new(ErrorCode::TaskFailed, "x")),
        );
        // Zero retention: the record is swept on the next access.
        assert!(matches!(hub.subscribe("d-1"), Subscription::Unknown));
        assert!(hub.completion("d-1").is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_blocking() {
        let hub = EventHub::new(2, 60_000);
        hub.register("d-1");
        let Subscription::Live(mut rx) = hub.subscribe("d-1") else {
            panic!("expected live subscription");
        };

        // Fill past the watermark without draining.
        hub.publish("d-1", status("1"));
        hub.publish("d-1", status("2"));
        hub.publish("d-1", status("3"));

        // The subscriber was dropped; it still drains what fit, then ends.
        assert_eq!(rx.recv().await.unwrap().kind(), "status");
        assert_eq!(rx.recv().await.unwrap().kind(), "status");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let hub = EventHub::new(16, 60_000);
        hub.register("d-1");
        let Subscription::Live(mut a) = hub.subscribe("d-1") else {
            panic!()
        };
        let Subscription::Live(mut b) = hub.subscribe("d-1") else {
            panic!()
        };
        hub.publish("d-1", done());
        assert_eq!(a.recv().await.unwrap().kind(), "done");
        assert_eq!(b.recv().await.unwrap().kind(), "done");
    }

    #[test]
    fn discard_forgets_without_completion() {
        let hub = EventHub::new(16, 60_000);
        hub.register("d-1");
        hub.discard("d-1");
        assert!(matches!(hub.subscribe("d-1"), Subscription::Unknown));
    }

    #[test]
    fn stats_track_live_and_completed() {
        let hub = EventHub::new(16, 60_000);
        hub.register("a");
        hub.register("b");
        hub.publish("b", done());
        let stats = hub.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.completed, 1);
    }
}
