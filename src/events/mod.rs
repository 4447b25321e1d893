//! Engine event bus.
//!
//! The operator notification channel: host state changes, worker restarts,
//! restart exhaustion, abandoned and dead-lettered messages. Publishing is
//! synchronous and never blocks (unbounded per-subscriber channels), so it is
//! safe from worker threads and from inside lock-free hot paths.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::host::HostState;
use crate::types::Error;

// =============================================================================
// Event Types
// =============================================================================

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "exit", content = "reason", rename_all = "snake_case")]
pub enum WorkerExit {
    /// Queue closed, recycling limit reached, or stop requested.
    Clean,
    /// A hook or the worker loop raised.
    Failed(String),
    /// Panic, or the worker process died.
    Crashed(String),
}

impl WorkerExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, WorkerExit::Clean)
    }
}

/// Something operators should know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    HostStateChanged {
        item: String,
        from: HostState,
        to: HostState,
        at: DateTime<Utc>,
    },
    WorkerExited {
        item: String,
        worker: u32,
        exit: WorkerExit,
    },
    WorkerRestarted {
        item: String,
        worker: u32,
        attempt: u32,
        delay_ms: u64,
    },
    RestartExhausted {
        item: String,
        restarts: u32,
    },
    MessageAbandoned {
        item: String,
        message_id: String,
    },
    MessageDeadLettered {
        item: String,
        message_id: String,
        reason: String,
        target: Option<String>,
    },
    HostFailed {
        item: String,
        reason: String,
    },
    ReloadCompleted {
        production: String,
        added: Vec<String>,
        replaced: Vec<String>,
        removed: Vec<String>,
        kept: Vec<String>,
    },
}

/// Subscription filter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    HostStateChanged,
    WorkerExited,
    WorkerRestarted,
    RestartExhausted,
    MessageAbandoned,
    MessageDeadLettered,
    HostFailed,
    ReloadCompleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::HostStateChanged => "host_state_changed",
            EventKind::WorkerExited => "worker_exited",
            EventKind::WorkerRestarted => "worker_restarted",
            EventKind::RestartExhausted => "restart_exhausted",
            EventKind::MessageAbandoned => "message_abandoned",
            EventKind::MessageDeadLettered => "message_dead_lettered",
            EventKind::HostFailed => "host_failed",
            EventKind::ReloadCompleted => "reload_completed",
        }
    }
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::HostStateChanged { .. } => EventKind::HostStateChanged,
            EngineEvent::WorkerExited { .. } => EventKind::WorkerExited,
            EngineEvent::WorkerRestarted { .. } => EventKind::WorkerRestarted,
            EngineEvent::RestartExhausted { .. } => EventKind::RestartExhausted,
            EngineEvent::MessageAbandoned { .. } => EventKind::MessageAbandoned,
            EngineEvent::MessageDeadLettered { .. } => EventKind::MessageDeadLettered,
            EngineEvent::HostFailed { .. } => EventKind::HostFailed,
            EngineEvent::ReloadCompleted { .. } => EventKind::ReloadCompleted,
        }
    }

    /// The surfaced error carried by fatal events.
    pub fn as_error(&self) -> Option<Error> {
        match self {
            EngineEvent::RestartExhausted { item, restarts } => Some(Error::RestartExhausted {
                item: item.clone(),
                restarts: *restarts,
            }),
            EngineEvent::MessageAbandoned { item, message_id } => Some(Error::AbandonedMessage {
                item: item.clone(),
                message_id: message_id.clone(),
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Subscriber Management
// =============================================================================

#[derive(Debug)]
struct Subscriber {
    id: u64,
    kinds: Option<HashSet<EventKind>>,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }
}

/// Subscription receipt for unsubscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBusStats {
    pub events_published: u64,
    pub deliveries: u64,
    pub active_subscribers: usize,
    pub by_kind: BTreeMap<String, u64>,
}

// =============================================================================
// EventBus
// =============================================================================

/// In-memory fan-out bus for [`EngineEvent`]s.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    stats: Mutex<EventBusStats>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every interested subscriber. Returns the delivery count.
    pub fn publish(&self, event: EngineEvent) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        let mut saw_closed = false;
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter().filter(|s| s.wants(kind)) {
                if subscriber.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    saw_closed = true;
                }
            }
        }
        if saw_closed {
            self.subscribers.write().retain(|s| !s.tx.is_closed());
        }
        let active = self.subscribers.read().len();

        let mut stats = self.stats.lock();
        stats.events_published += 1;
        stats.deliveries += delivered as u64;
        *stats.by_kind.entry(kind.as_str().to_string()).or_default() += 1;
        stats.active_subscribers = active;
        drop(stats);

        tracing::debug!(kind = kind.as_str(), delivered, "published engine event");
        delivered
    }

    /// Subscribe to the given kinds (all kinds when empty).
    pub fn subscribe(
        &self,
        kinds: &[EventKind],
    ) -> (Subscription, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kinds = (!kinds.is_empty()).then(|| kinds.iter().copied().collect());

        let mut subscribers = self.subscribers.write();
        subscribers.push(Subscriber { id, kinds, tx });
        self.stats.lock().active_subscribers = subscribers.len();

        (Subscription { id }, rx)
    }

    pub fn subscribe_all(&self) -> (Subscription, mpsc::UnboundedReceiver<EngineEvent>) {
        self.subscribe(&[])
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|s| s.id != subscription.id);
        self.stats.lock().active_subscribers = subscribers.len();
    }

    pub fn stats(&self) -> EventBusStats {
        self.stats.lock().clone()
    }

    /// Surfaced failures as typed errors: restart exhaustion and abandoned
    /// messages.
    pub fn subscribe_failures(&self) -> FailureReceiver {
        let (subscription, rx) =
            self.subscribe(&[EventKind::RestartExhausted, EventKind::MessageAbandoned]);
        FailureReceiver { subscription, rx }
    }
}

/// Receives [`Error::RestartExhausted`] and [`Error::AbandonedMessage`].
#[derive(Debug)]
pub struct FailureReceiver {
    subscription: Subscription,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl FailureReceiver {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Next failure. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Error> {
        while let Some(event) = self.rx.recv().await {
            if let Some(err) = event.as_error() {
                return Some(err);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exhausted(item: &str) -> EngineEvent {
        EngineEvent::RestartExhausted {
            item: item.to_string(),
            restarts: 2,
        }
    }

    #[test]
    fn test_publish_to_zero_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(exhausted("a")), 0);
        assert_eq!(bus.stats().events_published, 1);
    }

    #[tokio::test]
    async fn test_filtered_fan_out() {
        let bus = EventBus::new();
        let (_all, mut all_rx) = bus.subscribe_all();
        let (_fatal, mut fatal_rx) = bus.subscribe(&[EventKind::RestartExhausted]);

        let delivered = bus.publish(EngineEvent::HostFailed {
            item: "a".into(),
            reason: "boom".into(),
        });
        assert_eq!(delivered, 1);
        assert_eq!(bus.publish(exhausted("a")), 2);

        assert_eq!(all_rx.recv().await.unwrap().kind(), EventKind::HostFailed);
        assert_eq!(all_rx.recv().await.unwrap().kind(), EventKind::RestartExhausted);
        assert_eq!(fatal_rx.recv().await.unwrap(), exhausted("a"));
        assert!(fatal_rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_and_closed_receivers() {
        let bus = EventBus::new();
        let (sub, _rx) = bus.subscribe_all();
        let (_dropped, rx) = bus.subscribe_all();
        drop(rx);

        assert_eq!(bus.publish(exhausted("a")), 1);
        assert_eq!(bus.stats().active_subscribers, 1);

        bus.unsubscribe(&sub);
        assert_eq!(bus.publish(exhausted("a")), 0);
        assert_eq!(bus.stats().by_kind["restart_exhausted"], 2);
    }

    #[test]
    fn test_as_error() {
        let err = exhausted("adt-in").as_error().unwrap();
        assert!(matches!(err, Error::RestartExhausted { restarts: 2, .. }));

        let abandoned = EngineEvent::MessageAbandoned {
            item: "adt-in".into(),
            message_id: "m-1".into(),
        };
        assert_eq!(abandoned.as_error().unwrap().code(), "ABANDONED");
        assert!(EngineEvent::HostFailed {
            item: "a".into(),
            reason: "x".into()
        }
        .as_error()
        .is_none());
    }

    #[tokio::test]
    async fn test_failure_receiver_yields_typed_errors() {
        let bus = EventBus::new();
        let mut failures = bus.subscribe_failures();

        bus.publish(EngineEvent::HostFailed {
            item: "a".into(),
            reason: "boom".into(),
        });
        bus.publish(EngineEvent::MessageAbandoned {
            item: "a".into(),
            message_id: "m-7".into(),
        });
        bus.publish(exhausted("a"));

        let first = failures.recv().await.unwrap();
        assert!(matches!(first, Error::AbandonedMessage { ref message_id, .. } if message_id == "m-7"));
        let second = failures.recv().await.unwrap();
        assert!(matches!(second, Error::RestartExhausted { restarts: 2, .. }));

        bus.unsubscribe(failures.subscription());
        assert_eq!(bus.stats().active_subscribers, 0);
    }

    #[test]
    fn test_serde_is_tagged() {
        let json = serde_json::to_value(exhausted("adt-in")).unwrap();
        assert_eq!(json["kind"], "restart_exhausted");
        assert_eq!(json["item"], "adt-in");
    }
}
