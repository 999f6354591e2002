//! The durable store contract.

use crate::error::Result;
use async_trait::async_trait;

/// A saved snapshot plus the sequence number of the last event it covers.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    /// Number of events folded into the snapshot. Replay resumes after it.
    pub sequence_nr: u64,

    /// Encoded state.
    pub bytes: Vec<u8>,
}

/// Append-only event log with optional snapshots, keyed by persistence id.
///
/// The coordinator derives its persistence id from the entity-type name;
/// each shard derives its own from the type name plus the shard id. Append
/// failures are fatal to the owning component; snapshot failures are not.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Append encoded events in order. Returns once every event is durable.
    async fn append(&self, persistence_id: &str, events: Vec<Vec<u8>>) -> Result<()>;

    /// Replay events recorded after the first `from_sequence_nr`, in order.
    async fn replay(&self, persistence_id: &str, from_sequence_nr: u64) -> Result<Vec<Vec<u8>>>;

    /// Load the latest snapshot, if one was saved.
    async fn load_snapshot(&self, persistence_id: &str) -> Result<Option<SnapshotRecord>>;

    /// Save a snapshot, replacing any previous one.
    async fn save_snapshot(&self, persistence_id: &str, snapshot: SnapshotRecord) -> Result<()>;
}

/// Persistence id of the coordinator for an entity type.
pub(crate) fn coordinator_persistence_id(type_name: &str) -> String {
    format!("coordinator/{type_name}")
}

/// Persistence id of one shard of an entity type.
pub(crate) fn shard_persistence_id(type_name: &str, shard_id: &str) -> String {
    format!("shard/{type_name}/{shard_id}")
}
