//! Error types for the sharding runtime.

use thiserror::Error;

/// Result type alias for sharding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sharding runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Message routing errors.
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Durable journal errors.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Shard allocation errors.
    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// Shard handoff errors.
    #[error("handoff error: {0}")]
    Handoff(#[from] HandoffError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The local region has terminated; the handle is no longer usable.
    #[error("region terminated")]
    RegionTerminated,

    /// A request to another component timed out.
    #[error("request timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Message routing errors. These are diagnostic only: the offending message
/// is dropped and delivery continues for everything else.
#[derive(Error, Debug)]
pub enum RoutingError {
    /// The shard extractor returned an empty shard id.
    #[error("empty shard id")]
    EmptyShardId,

    /// The entity extractor did not recognize the message.
    #[error("unroutable message")]
    UnroutableMessage,

    /// The entity extractor returned an empty entity id.
    #[error("empty entity id")]
    EmptyEntityId,
}

/// Durable journal errors.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Appending events to the journal failed. The owning component treats
    /// this as fatal and stops; supervision restarts and replays it.
    #[error("append failed for {persistence_id}: {reason}")]
    AppendFailed {
        persistence_id: String,
        reason: String,
    },

    /// Replaying events from the journal failed.
    #[error("replay failed for {persistence_id}: {reason}")]
    ReplayFailed {
        persistence_id: String,
        reason: String,
    },

    /// Snapshot load or save failed. Snapshots are a recovery optimization;
    /// save failures are logged and ignored.
    #[error("snapshot failed for {persistence_id}: {reason}")]
    SnapshotFailed {
        persistence_id: String,
        reason: String,
    },

    /// Encoding or decoding a journaled record failed.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Shard allocation errors.
#[derive(Error, Debug)]
pub enum AllocationError {
    /// No region is available to host the shard. The allocation is simply
    /// not completed this round; a later request tries again.
    #[error("no region available for shard {0}")]
    NoRegionAvailable(String),

    /// The allocation strategy failed.
    #[error("allocation strategy failed: {0}")]
    StrategyFailed(String),
}

/// Shard handoff errors.
#[derive(Error, Debug)]
pub enum HandoffError {
    /// Not every region acknowledged the begin-handoff phase in time.
    #[error("begin handoff timed out for shard {0}")]
    BeginTimeout(String),

    /// The owning region did not confirm shard stop in time.
    #[error("handoff timed out for shard {0}")]
    StopTimeout(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Persistence(PersistenceError::Codec(e.to_string()))
    }
}
