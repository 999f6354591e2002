//! Durable event journal consumed by the coordinator and shards.
//!
//! The journal is an event-sourcing primitive: append events in order,
//! replay them on recovery, optionally bound replay with snapshots. The
//! implementation behind [`EventStore`] is external to this crate; a
//! process-local [`MemoryJournal`] ships for tests and single-process use.

mod memory;
mod store;

pub use memory::MemoryJournal;
pub use store::{EventStore, SnapshotRecord};
pub(crate) use store::{coordinator_persistence_id, shard_persistence_id};

use crate::error::{PersistenceError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Encode a journaled record.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| PersistenceError::Codec(e.to_string()).into())
}

/// Decode a journaled record.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| PersistenceError::Codec(e.to_string()).into())
}

/// Per-component view of the journal: tracks the sequence number and the
/// snapshot cadence for one persistence id.
pub(crate) struct Journaled {
    store: Arc<dyn EventStore>,
    persistence_id: String,
    sequence_nr: u64,
    events_since_snapshot: u64,
}

impl Journaled {
    pub(crate) fn new(store: Arc<dyn EventStore>, persistence_id: impl Into<String>) -> Self {
        Self {
            store,
            persistence_id: persistence_id.into(),
            sequence_nr: 0,
            events_since_snapshot: 0,
        }
    }

    /// Recover the latest snapshot (if any) and every event recorded after
    /// it, in order.
    pub(crate) async fn recover<S, E>(&mut self) -> Result<(Option<S>, Vec<E>)>
    where
        S: DeserializeOwned,
        E: DeserializeOwned,
    {
        let snapshot = self.store.load_snapshot(&self.persistence_id).await?;
        let (state, from) = match snapshot {
            Some(record) => (Some(decode::<S>(&record.bytes)?), record.sequence_nr),
            None => (None, 0),
        };
        self.sequence_nr = from;

        let raw = self.store.replay(&self.persistence_id, from).await?;
        let mut events = Vec::with_capacity(raw.len());
        for bytes in &raw {
            events.push(decode::<E>(bytes)?);
        }
        self.sequence_nr += events.len() as u64;
        self.events_since_snapshot = events.len() as u64;
        Ok((state, events))
    }

    /// Append one event durably. The caller applies the event to its state
    /// only after this returns: state changes are never taken without being
    /// recorded first.
    pub(crate) async fn persist<E: Serialize>(&mut self, event: &E) -> Result<()> {
        let bytes = encode(event)?;
        self.store.append(&self.persistence_id, vec![bytes]).await?;
        self.sequence_nr += 1;
        self.events_since_snapshot += 1;
        Ok(())
    }

    /// Save a snapshot of `state` if enough events accumulated since the
    /// last one. Fire-and-forget: success and failure are logged, neither
    /// affects correctness.
    pub(crate) fn save_snapshot_when_needed<S: Serialize>(&mut self, snapshot_after: u64, state: &S) {
        if snapshot_after == 0 || self.events_since_snapshot < snapshot_after {
            return;
        }
        let bytes = match encode(state) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    persistence_id = %self.persistence_id,
                    error = %e,
                    "Failed to encode snapshot"
                );
                return;
            }
        };
        self.events_since_snapshot = 0;

        let store = Arc::clone(&self.store);
        let persistence_id = self.persistence_id.clone();
        let record = SnapshotRecord {
            sequence_nr: self.sequence_nr,
            bytes,
        };
        tokio::spawn(async move {
            match store.save_snapshot(&persistence_id, record).await {
                Ok(()) => {
                    tracing::debug!(persistence_id = %persistence_id, "Snapshot saved");
                }
                Err(e) => {
                    tracing::warn!(
                        persistence_id = %persistence_id,
                        error = %e,
                        "Snapshot save failed"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum TestEvent {
        Added(String),
        Removed(String),
    }

    #[tokio::test]
    async fn test_persist_and_recover() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryJournal::new());

        let mut journal = Journaled::new(Arc::clone(&store), "test/1");
        journal
            .persist(&TestEvent::Added("a".into()))
            .await
            .unwrap();
        journal
            .persist(&TestEvent::Removed("a".into()))
            .await
            .unwrap();

        let mut fresh = Journaled::new(store, "test/1");
        let (state, events): (Option<Vec<String>>, Vec<TestEvent>) = fresh.recover().await.unwrap();
        assert!(state.is_none());
        assert_eq!(
            events,
            vec![TestEvent::Added("a".into()), TestEvent::Removed("a".into())]
        );
    }

    #[tokio::test]
    async fn test_snapshot_bounds_replay() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryJournal::new());

        let mut journal = Journaled::new(Arc::clone(&store), "test/2");
        for i in 0..3 {
            journal.persist(&TestEvent::Added(format!("e{i}"))).await.unwrap();
        }
        let snapshot_state: Vec<String> = vec!["e0".into(), "e1".into(), "e2".into()];
        journal.save_snapshot_when_needed(3, &snapshot_state);
        // Snapshot write is asynchronous.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        journal.persist(&TestEvent::Added("e3".into())).await.unwrap();

        let mut fresh = Journaled::new(store, "test/2");
        let (state, events): (Option<Vec<String>>, Vec<TestEvent>) = fresh.recover().await.unwrap();
        assert_eq!(state, Some(snapshot_state));
        assert_eq!(events, vec![TestEvent::Added("e3".into())]);
    }

    #[tokio::test]
    async fn test_snapshot_not_taken_below_threshold() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryJournal::new());
        let mut journal = Journaled::new(Arc::clone(&store), "test/3");
        journal.persist(&TestEvent::Added("a".into())).await.unwrap();
        journal.save_snapshot_when_needed(10, &vec!["a".to_string()]);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(store.load_snapshot("test/3").await.unwrap().is_none());
    }
}
