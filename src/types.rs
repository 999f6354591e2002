//! Core types used throughout the sharding runtime.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::net::SocketAddr;
use uuid::Uuid;

/// Identifier of an entity, unique within its shard. Opaque to the runtime.
pub type EntityId = String;

/// Identifier of a shard, a bucket of entities placed and relocated
/// together. Opaque to the runtime; the empty string is unroutable.
pub type ShardId = String;

/// Stable identity of one region instance. A restarted region gets a new
/// id, which is how instances are told apart across process restarts.
pub type RegionId = Uuid;

/// An application message in flight. Messages are dynamically typed; the
/// [`MessageExtractor`] capability tells the runtime how to route them.
pub type DynMessage = Box<dyn Any + Send>;

/// Routing capability supplied per entity type.
///
/// `extract_shard` classifies a message for region-level placement;
/// `try_extract_entity` splits it into the target entity id and the payload
/// actually handed to the entity. A message the extractor does not
/// understand is given back, tagged absent, and dropped with a diagnostic.
pub trait MessageExtractor: Send + Sync + 'static {
    /// Split a message into the target entity id and the entity payload.
    /// Returns the message back via `Err` when it cannot be routed.
    fn try_extract_entity(&self, message: DynMessage) -> Result<(EntityId, DynMessage), DynMessage>;

    /// Shard id for a message. An empty id marks the message unroutable.
    fn extract_shard(&self, message: &DynMessage) -> ShardId;
}

/// A cluster member as reported by the membership feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The member's address.
    pub addr: SocketAddr,

    /// Role tags carried by the member.
    pub roles: HashSet<String>,

    /// Monotonic join counter assigned by the membership feed. Lower means
    /// older; ties are broken by address.
    pub up_number: u64,
}

impl Member {
    /// Create a member with no roles.
    pub fn new(addr: SocketAddr, up_number: u64) -> Self {
        Self {
            addr,
            roles: HashSet::new(),
            up_number,
        }
    }

    /// Add a role tag.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Whether this member matches a role filter. `None` matches everyone.
    pub fn matches_role(&self, role: Option<&str>) -> bool {
        match role {
            Some(r) => self.roles.contains(r),
            None => true,
        }
    }

    /// Ordering key for oldest-member selection.
    pub fn age_key(&self) -> (u64, SocketAddr) {
        (self.up_number, self.addr)
    }
}

/// Entity count for one locally hosted shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    /// The shard.
    pub shard_id: ShardId,

    /// Number of entities currently running in it.
    pub entity_count: usize,
}
