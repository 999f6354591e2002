//! In-memory journal for tests and single-process use.

use super::store::{EventStore, SnapshotRecord};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Process-local [`EventStore`] keeping every journal in memory.
///
/// Shared across nodes of an in-process cluster so a coordinator restarted
/// on another node recovers the same history.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    events: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    snapshots: Mutex<HashMap<String, SnapshotRecord>>,
}

impl MemoryJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events recorded under a persistence id.
    pub fn event_count(&self, persistence_id: &str) -> usize {
        self.events
            .lock()
            .get(persistence_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for MemoryJournal {
    async fn append(&self, persistence_id: &str, events: Vec<Vec<u8>>) -> Result<()> {
        self.events
            .lock()
            .entry(persistence_id.to_string())
            .or_default()
            .extend(events);
        Ok(())
    }

    async fn replay(&self, persistence_id: &str, from_sequence_nr: u64) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .events
            .lock()
            .get(persistence_id)
            .map(|log| log.iter().skip(from_sequence_nr as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn load_snapshot(&self, persistence_id: &str) -> Result<Option<SnapshotRecord>> {
        Ok(self.snapshots.lock().get(persistence_id).cloned())
    }

    async fn save_snapshot(&self, persistence_id: &str, snapshot: SnapshotRecord) -> Result<()> {
        self.snapshots
            .lock()
            .insert(persistence_id.to_string(), snapshot);
        Ok(())
    }
}
