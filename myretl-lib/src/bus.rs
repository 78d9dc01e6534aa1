//! In-process message bus between source, init-load and target workers
//!
//! Fan-out happens on the publish path: every subscriber owns a bounded FIFO
//! and a published message is enqueued onto each subscriber whose name matches
//! the routing key (`"*"` broadcasts). Publishing never blocks — a full
//! subscriber queue drops the message and increments the drop counter, which
//! is the surfaced failure mode; sources tailing a binlog cannot be slowed
//! down.

use crate::events::RowEvent;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default per-subscriber queue capacity
pub const DEFAULT_BUS_CAPACITY: usize = 10_000;

/// Routing key that reaches every subscriber
pub const BROADCAST_KEY: &str = "*";

/// Control signals carried next to row events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Shutdown,
    Healthcheck,
}

#[derive(Debug, Clone)]
pub enum MessagePayload {
    /// A row event together with the mapping rule that routed it
    Event {
        mapping_key: String,
        event: RowEvent,
    },
    Control(ControlSignal),
}

/// A bus message tagged with its routing key
#[derive(Debug, Clone)]
pub struct Message {
    /// Name of the target worker this message is addressed to, or `"*"`
    pub target_name: String,
    /// Producing worker, for logs
    pub source: String,
    pub payload: MessagePayload,
}

impl Message {
    pub fn event(source: &str, target_name: &str, mapping_key: &str, event: RowEvent) -> Self {
        Self {
            target_name: target_name.to_string(),
            source: source.to_string(),
            payload: MessagePayload::Event {
                mapping_key: mapping_key.to_string(),
                event,
            },
        }
    }

    pub fn control(source: &str, target_name: &str, signal: ControlSignal) -> Self {
        Self {
            target_name: target_name.to_string(),
            source: source.to_string(),
            payload: MessagePayload::Control(signal),
        }
    }
}

/// Atomic bus counters
#[derive(Debug, Default)]
pub struct BusStats {
    published: AtomicU64,
    dropped: AtomicU64,
    depth: AtomicUsize,
    peak: AtomicUsize,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStatsSnapshot {
    pub published: u64,
    pub dropped: u64,
    pub depth: usize,
    pub peak: usize,
}

impl BusStats {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            depth: self.depth.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
        }
    }
}

/// Result of a publish: how many subscriber queues accepted the message and
/// how many dropped it because they were full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

impl PublishOutcome {
    pub fn is_dropped(&self) -> bool {
        self.dropped > 0
    }
}

struct SubscriberEntry {
    name: String,
    sender: mpsc::Sender<Message>,
}

/// Receiving end handed to a target worker
pub struct BusSubscriber {
    pub name: String,
    receiver: mpsc::Receiver<Message>,
    stats: Arc<BusStats>,
}

impl BusSubscriber {
    /// Wait for the next message addressed to this subscriber
    pub async fn recv(&mut self) -> Option<Message> {
        let message = self.receiver.recv().await;
        if message.is_some() {
            self.stats.depth.fetch_sub(1, Ordering::Relaxed);
        }
        message
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        match self.receiver.try_recv() {
            Ok(message) => {
                self.stats.depth.fetch_sub(1, Ordering::Relaxed);
                Some(message)
            }
            Err(_) => None,
        }
    }
}

/// Bounded, thread-safe publish/subscribe bus
pub struct MessageBus {
    capacity: usize,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    stats: Arc<BusStats>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            stats: Arc::new(BusStats::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> Arc<BusStats> {
        Arc::clone(&self.stats)
    }

    /// Register a subscriber. Messages published with `target_name` equal to
    /// `name` or `"*"` land in its queue.
    pub fn subscribe(&self, name: &str) -> BusSubscriber {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .expect("bus subscriber list poisoned")
            .push(SubscriberEntry {
                name: name.to_string(),
                sender,
            });
        debug!(subscriber = name, "bus subscriber registered");
        BusSubscriber {
            name: name.to_string(),
            receiver,
            stats: Arc::clone(&self.stats),
        }
    }

    /// Non-blocking publish. Full subscriber queues drop the message; the
    /// caller decides how loudly to report the drop.
    pub fn publish(&self, message: Message) -> PublishOutcome {
        let subscribers = self.subscribers.lock().expect("bus subscriber list poisoned");
        let mut outcome = PublishOutcome {
            delivered: 0,
            dropped: 0,
        };

        for entry in subscribers.iter() {
            if message.target_name != BROADCAST_KEY && entry.name != message.target_name {
                continue;
            }
            match entry.sender.try_send(message.clone()) {
                Ok(()) => {
                    outcome.delivered += 1;
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                    let depth = self.stats.depth.fetch_add(1, Ordering::Relaxed) + 1;
                    self.stats.peak.fetch_max(depth, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Subscriber is gone; treated as a drop
                    outcome.dropped += 1;
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        outcome
    }

    /// Broadcast the shutdown poison pill so every blocked dequeue returns.
    /// The cancellation token covers subscribers whose queue is full.
    pub fn publish_shutdown(&self, source: &str) {
        let outcome = self.publish(Message::control(source, BROADCAST_KEY, ControlSignal::Shutdown));
        if outcome.is_dropped() {
            warn!(
                dropped = outcome.dropped,
                "shutdown broadcast could not reach every subscriber queue"
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("bus subscriber list poisoned")
            .len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
