//! In-process event bus decoupling ingestion from presentation.
//!
//! A thin wrapper over `tokio::sync::broadcast`: publish is
//! fire-and-forget (an event with no live subscriber is dropped and
//! counted, never an error), every current subscriber receives every
//! event, and a slow subscriber lags on its own receiver without ever
//! blocking the publisher. Nothing is persisted; there is no delivery
//! guarantee across process restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::{HierarchicalPath, ServiceStatus, TopicChangeKind};

/// Domain events carried on the bus.
#[derive(Debug, Clone)]
pub enum UnsEvent {
    /// A topic was seen for the first time.
    TopicDiscovered { topic: String, source_type: String },
    /// The auto-mapper resolved a hierarchy path for a topic. Assignment
    /// of the visible NSPath happens only when this event is consumed.
    TopicAutoMapped {
        topic: String,
        path: HierarchicalPath,
    },
    /// A durable topic record changed.
    TopicConfigurationChanged {
        topic: String,
        change: TopicChangeKind,
    },
    ConnectionStatusChanged {
        connection_id: String,
        old: ServiceStatus,
        new: ServiceStatus,
    },
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    dropped_no_subscriber: AtomicU64,
}

/// Point-in-time bus statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub dropped_no_subscriber: u64,
    pub subscribers: usize,
}

/// Single in-process publish/subscribe fabric. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UnsEvent>,
    counters: Arc<BusCounters>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            counters: Arc::new(BusCounters::default()),
        }
    }

    /// Publish an event to all current subscribers. Never fails: with no
    /// subscriber the event is dropped and counted.
    pub fn publish(&self, event: UnsEvent) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(event).is_err() {
            self.counters
                .dropped_no_subscriber
                .fetch_add(1, Ordering::Relaxed);
            trace!("event dropped: no subscribers");
        }
    }

    /// Subscribe to all events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<UnsEvent> {
        self.tx.subscribe()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped_no_subscriber: self.counters.dropped_no_subscriber.load(Ordering::Relaxed),
            subscribers: self.tx.receiver_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
