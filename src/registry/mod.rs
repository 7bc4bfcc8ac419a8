//! Subscription registry
//!
//! Maps each topic name to the set of connections subscribed to it, with
//! a reverse index so a departing connection can leave every topic it
//! joined in one call. Both maps live under a single lock, so snapshot
//! reads never observe a half-applied membership change.
//!
//! Publishing never holds the lock while enqueuing: callers take a
//! point-in-time [`snapshot`](SubscriptionRegistry::snapshot) of a
//! topic's subscribers and release the lock before touching any queue.

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::{ConnectionId, Topic};

#[cfg(test)]
mod tests;

/// Result of a subscribe call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The connection is now subscribed
    Added,
    /// The connection was already subscribed; nothing changed
    AlreadySubscribed,
    /// The per-connection subscription limit was reached
    LimitExceeded,
}

struct Inner {
    /// topic -> subscribed connections
    topics: AHashMap<Topic, AHashSet<ConnectionId>>,
    /// connection -> topics it is subscribed to
    memberships: AHashMap<ConnectionId, AHashSet<Topic>>,
}

/// Thread-safe topic membership store
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
    /// Maximum subscriptions per connection (0 = unlimited)
    max_per_connection: usize,
}

impl SubscriptionRegistry {
    pub fn new(max_per_connection: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                topics: AHashMap::new(),
                memberships: AHashMap::new(),
            }),
            max_per_connection,
        }
    }

    /// Subscribe a connection to a topic. Idempotent: subscribing twice
    /// reports [`SubscribeOutcome::AlreadySubscribed`] and counts once.
    pub fn subscribe(&self, topic: &Topic, id: ConnectionId) -> SubscribeOutcome {
        let mut inner = self.inner.write();

        if self.max_per_connection > 0 {
            if let Some(topics) = inner.memberships.get(&id) {
                if !topics.contains(topic) && topics.len() >= self.max_per_connection {
                    return SubscribeOutcome::LimitExceeded;
                }
            }
        }

        let added = inner.topics.entry(topic.clone()).or_default().insert(id);
        if added {
            inner
                .memberships
                .entry(id)
                .or_default()
                .insert(topic.clone());
            SubscribeOutcome::Added
        } else {
            SubscribeOutcome::AlreadySubscribed
        }
    }

    /// Unsubscribe a connection from a topic. Idempotent: returns whether
    /// a subscription was actually removed. Unsubscribing from a topic
    /// that was never subscribed is not an error.
    pub fn unsubscribe(&self, topic: &str, id: ConnectionId) -> bool {
        let mut inner = self.inner.write();

        let removed = match inner.topics.get_mut(topic) {
            Some(subs) => subs.remove(&id),
            None => return false,
        };
        if !removed {
            return false;
        }

        // Empty topic entries are evicted eagerly
        if inner.topics.get(topic).map_or(false, |s| s.is_empty()) {
            inner.topics.remove(topic);
        }

        if let Some(topics) = inner.memberships.get_mut(&id) {
            topics.remove(topic);
            if topics.is_empty() {
                inner.memberships.remove(&id);
            }
        }

        true
    }

    /// Remove a connection from every topic it is subscribed to.
    /// Returns how many subscriptions were removed. Safe to call for a
    /// connection with no subscriptions.
    pub fn unsubscribe_all(&self, id: ConnectionId) -> usize {
        let mut inner = self.inner.write();

        let topics = match inner.memberships.remove(&id) {
            Some(topics) => topics,
            None => return 0,
        };

        for topic in &topics {
            let mut now_empty = false;
            if let Some(subs) = inner.topics.get_mut(topic.as_str()) {
                subs.remove(&id);
                now_empty = subs.is_empty();
            }
            if now_empty {
                inner.topics.remove(topic.as_str());
            }
        }

        topics.len()
    }

    /// Point-in-time copy of a topic's subscriber set. Membership changes
    /// after the snapshot do not affect the returned set.
    pub fn snapshot(&self, topic: &str) -> SmallVec<[ConnectionId; 16]> {
        let inner = self.inner.read();
        match inner.topics.get(topic) {
            Some(subs) => subs.iter().copied().collect(),
            None => SmallVec::new(),
        }
    }

    /// Number of topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.inner.read().topics.len()
    }

    /// Total number of (connection, topic) subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.read().memberships.values().map(|t| t.len()).sum()
    }
}
