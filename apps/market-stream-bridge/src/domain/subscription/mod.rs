//! Subscription Registry
//!
//! Domain types for tracking which consumers want which topics.
//! Handles subscription ordering, removal safety and snapshot caching.
//!
//! # Design
//!
//! The registry tracks:
//! - An ordered list of subscribers per topic (delivery follows subscription order)
//! - The last delivered message per topic, for late joiners
//! - Which upstream join/leave changes a subscribe or unsubscribe requires
//!
//! Multiple consumers can share a topic while only one upstream join is
//! issued. The registry performs no I/O: callers apply the returned
//! [`TopicChange`] to the connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use super::market::{InboundMessage, Topic};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a subscriber.
pub type SubscriberId = u64;

/// Callback invoked for every message on a subscribed topic.
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Handle returned by [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriberId,
    topic: Topic,
}

impl SubscriptionHandle {
    /// Subscriber identifier.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Upstream change required after a registry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicChange {
    /// First subscriber for the topic; a join frame is needed.
    Joined(Topic),
    /// Last subscriber removed; a leave frame is needed.
    Left(Topic),
    /// No upstream change.
    Unchanged,
}

impl TopicChange {
    /// Check if there is no upstream change.
    #[must_use]
    pub const fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

/// Result of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered to this many callbacks.
    Delivered(usize),
    /// No subscription exists for the topic.
    UnknownTopic,
}

// =============================================================================
// Topic Entry
// =============================================================================

struct Subscriber {
    id: SubscriberId,
    callback: MessageCallback,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct TopicEntry {
    subscribers: Vec<Subscriber>,
    last_message: Option<InboundMessage>,
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Maps topics to ordered subscriber callbacks.
///
/// Callbacks run outside the registry lock, so a callback may subscribe or
/// unsubscribe (including itself) without deadlocking. A subscriber removed
/// while a dispatch is in flight is skipped.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use market_stream_bridge::domain::market::InboundMessage;
/// use market_stream_bridge::domain::subscription::{SubscriptionRegistry, TopicChange};
///
/// let registry = SubscriptionRegistry::new();
///
/// // First subscriber needs an upstream join
/// let (first, change) = registry.subscribe("AAPL.tick", Arc::new(|_msg: &InboundMessage| {}));
/// assert_eq!(change, TopicChange::Joined("AAPL.tick".to_string()));
///
/// // Second subscriber shares the topic
/// let (second, change) = registry.subscribe("AAPL.tick", Arc::new(|_msg: &InboundMessage| {}));
/// assert!(change.is_unchanged());
///
/// // Only the last unsubscribe leaves upstream
/// assert!(registry.unsubscribe(&first).is_unchanged());
/// assert_eq!(
///     registry.unsubscribe(&second),
///     TopicChange::Left("AAPL.tick".to_string())
/// );
/// ```
pub struct SubscriptionRegistry {
    topics: RwLock<HashMap<Topic, TopicEntry>>,
    next_id: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("SubscriptionRegistry")
            .field("topic_count", &stats.topic_count)
            .field("subscriber_count", &stats.subscriber_count)
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` under `topic`.
    ///
    /// Returns the handle and whether the topic needs an upstream join.
    pub fn subscribe(
        &self,
        topic: impl Into<Topic>,
        callback: MessageCallback,
    ) -> (SubscriptionHandle, TopicChange) {
        let topic = topic.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.topics.write();
        let entry = topics.entry(topic.clone()).or_default();
        let first = entry.subscribers.is_empty();

        entry.subscribers.push(Subscriber {
            id,
            callback,
            active: Arc::new(AtomicBool::new(true)),
        });

        let change = if first {
            TopicChange::Joined(topic.clone())
        } else {
            TopicChange::Unchanged
        };

        (SubscriptionHandle { id, topic }, change)
    }

    /// Remove the subscriber behind `handle`.
    ///
    /// Unknown or already-removed handles are ignored. Removing the last
    /// subscriber drops the topic entry, including its cached message.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> TopicChange {
        let mut topics = self.topics.write();

        let Some(entry) = topics.get_mut(&handle.topic) else {
            return TopicChange::Unchanged;
        };

        let Some(position) = entry.subscribers.iter().position(|s| s.id == handle.id) else {
            return TopicChange::Unchanged;
        };

        let removed = entry.subscribers.remove(position);
        removed.active.store(false, Ordering::Release);

        if entry.subscribers.is_empty() {
            topics.remove(&handle.topic);
            return TopicChange::Left(handle.topic.clone());
        }

        TopicChange::Unchanged
    }

    /// Deliver `message` to every subscriber of its topic, in subscription order.
    pub fn dispatch(&self, message: &InboundMessage) -> DispatchOutcome {
        let targets: Vec<(MessageCallback, Arc<AtomicBool>)> = {
            let mut topics = self.topics.write();
            let Some(entry) = topics.get_mut(&message.topic) else {
                return DispatchOutcome::UnknownTopic;
            };

            entry.last_message = Some(message.clone());
            entry
                .subscribers
                .iter()
                .map(|s| (Arc::clone(&s.callback), Arc::clone(&s.active)))
                .collect()
        };

        let mut delivered = 0;
        for (callback, active) in targets {
            if active.load(Ordering::Acquire) {
                callback(message);
                delivered += 1;
            }
        }

        DispatchOutcome::Delivered(delivered)
    }

    /// Last message delivered on `topic`, if the topic is active.
    #[must_use]
    pub fn snapshot(&self, topic: &str) -> Option<InboundMessage> {
        self.topics
            .read()
            .get(topic)
            .and_then(|entry| entry.last_message.clone())
    }

    /// Check if `topic` has at least one subscriber.
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.read().contains_key(topic)
    }

    /// Get all topics with active subscriptions.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<_> = self.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Check if no topic is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let topics = self.topics.read();
        RegistryStats {
            topic_count: topics.len(),
            subscriber_count: topics.values().map(|e| e.subscribers.len()).sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    /// Number of topics with at least one subscriber.
    pub topic_count: usize,
    /// Total subscribers across topics.
    pub subscriber_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
