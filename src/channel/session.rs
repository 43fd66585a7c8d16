//! Per-session delivery bookkeeping.

use crate::types::{Message, MessageId, SessionId, Timestamp};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Subscriber callback. Receives each delivered payload.
pub type MessageCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Ids already handed to the current callback.
///
/// Entries expire `ttl` after delivery. The capacity caps memory when a
/// burst of deliveries outpaces expiry, so an id can be evicted early.
/// Re-delivery is prevented by the cursor: every delivered id is at or
/// below `last_seen`, and reads only return ids above it. This set is a
/// second check, not the guarantee.
pub struct DeliveredSet {
    /// id -> expiry deadline (None if the ttl overflows the clock).
    entries: LruCache<MessageId, Option<Instant>>,
    ttl: Duration,
}

impl DeliveredSet {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn insert(&mut self, id: MessageId, now: Instant) {
        self.entries.put(id, now.checked_add(self.ttl));
    }

    pub fn contains(&self, id: MessageId, now: Instant) -> bool {
        match self.entries.peek(&id) {
            Some(Some(deadline)) => *deadline > now,
            Some(None) => true,
            None => false,
        }
    }

    /// Drop expired entries. Returns how many were removed.
    ///
    /// Every entry shares the same ttl, so insertion order is expiry order.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((_, Some(deadline))) = self.entries.peek_lru().map(|(id, d)| (*id, *d)) {
            if deadline > now {
                break;
            }
            self.entries.pop_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Polling progress and delivery state for one open channel.
pub struct SessionState {
    /// Highest id scanned. Never decreases.
    last_seen: MessageId,

    /// Earliest timestamp the current callback accepts.
    /// None until a callback is registered, so nothing is delivered.
    subscription_start: Option<Timestamp>,

    delivered: DeliveredSet,

    callback: Option<MessageCallback>,
}

impl SessionState {
    pub fn new(dedup_capacity: usize, dedup_ttl: Duration) -> Self {
        Self {
            last_seen: MessageId(0),
            subscription_start: None,
            delivered: DeliveredSet::new(dedup_capacity, dedup_ttl),
            callback: None,
        }
    }

    pub fn last_seen(&self) -> MessageId {
        self.last_seen
    }

    pub fn subscription_start(&self) -> Option<Timestamp> {
        self.subscription_start
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn delivered(&self) -> &DeliveredSet {
        &self.delivered
    }

    /// Install `callback`, accepting messages stamped at or after `since`.
    pub fn register(&mut self, callback: MessageCallback, since: Timestamp) {
        self.subscription_start = Some(since);
        self.callback = Some(callback);
    }

    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    /// Advance the cursor over `batch` and keep what the callback should see.
    ///
    /// The cursor moves for every message in the batch, delivered or not:
    /// a message stamped before the subscription started is passed over
    /// for good. Survivors come back sorted by timestamp.
    pub fn select(&mut self, session: &SessionId, batch: Vec<Message>, now: Instant) -> Vec<Message> {
        for message in &batch {
            if message.id > self.last_seen {
                self.last_seen = message.id;
            }
        }

        let Some(start) = self.subscription_start else {
            return Vec::new();
        };

        let mut eligible: Vec<Message> = batch
            .into_iter()
            .filter(|m| &m.sender != session)
            .filter(|m| !self.delivered.contains(m.id, now))
            .filter(|m| m.timestamp >= start)
            .collect();
        eligible.sort_by_key(|m| m.timestamp);
        eligible
    }

    /// Record that `id` is about to be delivered.
    ///
    /// Returns the callback to invoke, or None (recording nothing) when no
    /// callback is registered.
    pub fn begin_delivery(&mut self, id: MessageId, now: Instant) -> Option<MessageCallback> {
        let callback = self.callback.clone()?;
        self.delivered.insert(id, now);
        Some(callback)
    }

    /// Forget delivered ids past their ttl.
    pub fn expire_delivered(&mut self, now: Instant) -> usize {
        self.delivered.expire(now)
    }
}
