//! Message buffering for unresolved routing.
//!
//! One buffer instance serves all pending keys of its owner (shards for a
//! region, entities for a shard) under a single shared capacity. This is
//! backpressure by drop: when the cap is reached the newest arrival is
//! discarded, never an older one, and delivery continues for other keys.

use crate::types::DynMessage;
use std::collections::{HashMap, VecDeque};

pub(crate) struct MessageBuffer {
    queues: HashMap<String, VecDeque<DynMessage>>,
    total: usize,
    capacity: usize,
}

impl MessageBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queues: HashMap::new(),
            total: 0,
            capacity,
        }
    }

    /// Mark a key pending without buffering anything yet. Presence of the
    /// key is what marks routing for it as unresolved.
    pub(crate) fn open(&mut self, key: &str) {
        self.queues.entry(key.to_string()).or_default();
    }

    /// Whether the key is pending.
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.queues.contains_key(key)
    }

    /// Buffer a message under a pending key. Returns false when the shared
    /// cap is reached and the message was dropped.
    pub(crate) fn enqueue(&mut self, key: &str, message: DynMessage) -> bool {
        if self.total >= self.capacity {
            self.open(key);
            return false;
        }
        self.queues
            .entry(key.to_string())
            .or_default()
            .push_back(message);
        self.total += 1;
        true
    }

    /// Take every buffered message for a key, oldest first, and stop
    /// tracking the key.
    pub(crate) fn drain(&mut self, key: &str) -> VecDeque<DynMessage> {
        let queue = self.queues.remove(key).unwrap_or_default();
        self.total -= queue.len();
        queue
    }

    /// Discard everything buffered for a key. Returns how many messages
    /// were dropped.
    pub(crate) fn drop_key(&mut self, key: &str) -> usize {
        let dropped = self.queues.remove(key).map(|q| q.len()).unwrap_or(0);
        self.total -= dropped;
        dropped
    }

    /// Currently pending keys.
    pub(crate) fn keys(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Total buffered messages across all keys.
    pub(crate) fn total(&self) -> usize {
        self.total
    }

    /// Whether nothing is pending, buffered or merely marked.
    pub(crate) fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
