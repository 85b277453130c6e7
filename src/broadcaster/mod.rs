//! Log Broadcaster.
//!
//! Process-wide multi-subscriber fan-out for per-conversation log and
//! status events. Grounded on the teacher's `events::EventBus` (a single
//! dispatcher owning a subscriber map) generalized from a single broadcast
//! channel to one bounded channel per subscriber, so a slow subscriber can
//! be dropped without affecting the others — the backpressure shape used
//! by a streaming deployment handler elsewhere in the retrieval pack.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

const INGEST_CAPACITY: usize = 1_000;
const SUBSCRIBER_CAPACITY: usize = 100;
const JANITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SUBSCRIBER_IDLE_LIMIT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Log,
    Status,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub conversation_id: String,
    pub kind: LineKind,
    pub text: String,
    pub at: DateTime<Utc>,
}

struct Subscriber {
    subject_id: String,
    sender: mpsc::Sender<LogMessage>,
    last_seen: Mutex<Instant>,
}

pub struct SubscriberHandle {
    pub subscriber_id: String,
    pub receiver: mpsc::Receiver<LogMessage>,
}

/// Shared state; cheap to clone (wraps `Arc`s), so every component that
/// needs to publish (executor, supervisor) or the streaming endpoint that
/// needs to subscribe can hold its own copy.
#[derive(Clone)]
pub struct LogBroadcaster {
    ingest_tx: mpsc::Sender<LogMessage>,
    subscribers: Arc<DashMap<String, Subscriber>>,
}

impl LogBroadcaster {
    /// Spawns the dispatcher task and returns the handle; callers are
    /// expected to also call `spawn_janitor` once at startup.
    pub fn spawn() -> (Self, tokio::task::JoinHandle<()>) {
        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_CAPACITY);
        let subscribers: Arc<DashMap<String, Subscriber>> = Arc::new(DashMap::new());
        let dispatcher_subscribers = subscribers.clone();

        let handle = tokio::spawn(Self::dispatch_loop(ingest_rx, dispatcher_subscribers));
        (Self { ingest_tx, subscribers }, handle)
    }

    pub fn spawn_janitor(&self) -> tokio::task::JoinHandle<()> {
        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(JANITOR_INTERVAL);
            loop {
                interval.tick().await;
                let now = Instant::now();
                subscribers.retain(|_, sub| {
                    now.duration_since(*sub.last_seen.lock()) < SUBSCRIBER_IDLE_LIMIT
                });
            }
        })
    }

    async fn dispatch_loop(
        mut ingest_rx: mpsc::Receiver<LogMessage>,
        subscribers: Arc<DashMap<String, Subscriber>>,
    ) {
        while let Some(message) = ingest_rx.recv().await {
            let mut dead = Vec::new();
            for entry in subscribers.iter() {
                if entry.value().subject_id != message.conversation_id {
                    continue;
                }
                match entry.value().sender.try_send(message.clone()) {
                    Ok(()) => {
                        *entry.value().last_seen.lock() = Instant::now();
                    }
                    Err(_) => {
                        dead.push(entry.key().clone());
                    }
                }
            }
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }

    pub fn register(&self, subscriber_id: impl Into<String>, subject_id: impl Into<String>) -> SubscriberHandle {
        let subscriber_id = subscriber_id.into();
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.insert(
            subscriber_id.clone(),
            Subscriber { subject_id: subject_id.into(), sender, last_seen: Mutex::new(Instant::now()) },
        );
        SubscriberHandle { subscriber_id, receiver }
    }

    pub fn unregister(&self, subscriber_id: &str) {
        self.subscribers.remove(subscriber_id);
    }

    fn enqueue(&self, message: LogMessage) {
        if self.ingest_tx.try_send(message).is_err() {
            warn!("log broadcaster ingest channel full, dropping message");
        }
    }

    pub fn broadcast_log(&self, conversation_id: impl Into<String>, line: impl Into<String>, kind: LineKind) {
        self.enqueue(LogMessage {
            conversation_id: conversation_id.into(),
            kind,
            text: line.into(),
            at: Utc::now(),
        });
    }

    pub fn broadcast_status(&self, conversation_id: impl Into<String>, status_text: impl Into<String>) {
        self.enqueue(LogMessage {
            conversation_id: conversation_id.into(),
            kind: LineKind::Status,
            text: status_text.into(),
            at: Utc::now(),
        });
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn delivers_only_to_matching_subject() {
        let (broadcaster, _dispatcher) = LogBroadcaster::spawn();
        let mut for_a = broadcaster.register("sub-a", "conv-a");
        let mut for_b = broadcaster.register("sub-b", "conv-b");

        broadcaster.broadcast_log("conv-a", "hello", LineKind::Log);

        let msg = timeout(Duration::from_secs(1), for_a.receiver.recv()).await.unwrap().unwrap();
        assert_eq!(msg.text, "hello");

        let nothing = timeout(Duration::from_millis(100), for_b.receiver.recv()).await;
        assert!(nothing.is_err(), "subscriber for a different subject must not receive the message");
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking_others() {
        let (broadcaster, _dispatcher) = LogBroadcaster::spawn();
        let slow = broadcaster.register("slow", "conv-a");
        let mut fast = broadcaster.register("fast", "conv-a");

        for i in 0..(SUBSCRIBER_CAPACITY + 10) {
            broadcaster.broadcast_log("conv-a", format!("line {i}"), LineKind::Log);
        }
        // Give the dispatcher a moment to drain the ingest channel.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let msg = timeout(Duration::from_secs(1), fast.receiver.recv()).await.unwrap();
        assert!(msg.is_some());
        drop(slow);
    }

    #[tokio::test]
    async fn unregister_removes_subscriber() {
        let (broadcaster, _dispatcher) = LogBroadcaster::spawn();
        broadcaster.register("sub-a", "conv-a");
        assert_eq!(broadcaster.subscriber_count(), 1);
        broadcaster.unregister("sub-a");
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
