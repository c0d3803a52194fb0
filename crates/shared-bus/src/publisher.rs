//! # Event Publisher
//!
//! Defines the publishing side of the notification bus.

use crate::events::{EventFilter, Notification};
use crate::subscriber::{EventStream, Subscription, SubscriptionGuard};
use crate::DEFAULT_CHANNEL_CAPACITY;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Trait for publishing notifications to the bus.
///
/// This is the Notifier contract the engine consumes: fire-and-forget,
/// invoked strictly after the local commit. The engine never branches on
/// the return value.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a notification to the bus.
    ///
    /// # Returns
    ///
    /// The number of active subscribers that received it.
    async fn publish(&self, notification: Notification) -> usize;

    /// Get the total number of notifications published.
    fn events_published(&self) -> u64;
}

/// In-memory implementation of the notification bus.
///
/// Uses `tokio::sync::broadcast` for multi-producer, multi-consumer
/// semantics. Suitable for single-process operation; a deployment with
/// external webhook consumers would put a delivery adapter behind the
/// same trait.
pub struct InMemoryEventBus {
    /// Broadcast sender for notifications.
    sender: broadcast::Sender<Notification>,

    /// Active subscription count by topic.
    subscriptions: Arc<RwLock<HashMap<String, usize>>>,

    /// Total notifications published.
    events_published: AtomicU64,

    /// Channel capacity.
    capacity: usize,
}

impl InMemoryEventBus {
    /// Create a new in-memory bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new in-memory bus with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            events_published: AtomicU64::new(0),
            capacity,
        }
    }

    /// Subscribe to notifications matching a filter.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let receiver = self.sender.subscribe();
        let topic_key = format!("{:?}", filter.topics);

        {
            if let Ok(mut subs) = self.subscriptions.write() {
                *subs.entry(topic_key.clone()).or_insert(0) += 1;
            }
        }

        debug!(topics = ?filter.topics, "New subscription created");

        let guard = SubscriptionGuard::new(self.subscriptions.clone(), topic_key);
        Subscription::new(receiver, filter, guard)
    }

    /// Get a stream of notifications matching a filter.
    #[must_use]
    pub fn event_stream(&self, filter: EventFilter) -> EventStream {
        self.subscribe(filter).into_stream()
    }

    /// Get the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, notification: Notification) -> usize {
        let topic = notification.topic();
        let invoice_id = notification.invoice_id();

        // Always increment counter (publication was attempted)
        self.events_published.fetch_add(1, Ordering::Relaxed);

        match self.sender.send(notification) {
            Ok(receiver_count) => {
                debug!(
                    topic = ?topic,
                    invoice_id = %invoice_id,
                    receivers = receiver_count,
                    "Notification published"
                );
                receiver_count
            }
            Err(e) => {
                // No receivers - notification is dropped, which is fine
                // for a best-effort notifier.
                warn!(
                    topic = ?topic,
                    invoice_id = %invoice_id,
                    error = %e,
                    "Notification dropped (no receivers)"
                );
                0
            }
        }
    }

    fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }
}
