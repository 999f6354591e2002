//! The shard actor: owns the entity actors of one shard id.

mod actor;
mod state;

pub use state::{ShardEvent, ShardState};
pub(crate) use actor::spawn_shard;

use crate::region::HandoffReply;
use crate::types::{DynMessage, EntityId, ShardId, ShardStats};
use tokio::sync::{mpsc, oneshot, watch};

/// Messages processed by a shard actor.
pub(crate) enum ShardMsg {
    /// An application message routed to this shard.
    Deliver(DynMessage),

    /// An entity requests graceful stop.
    Passivate {
        entity_id: EntityId,
        stop_message: DynMessage,
    },

    /// Stop every entity and confirm once drained. Sent by the owning
    /// region during rebalancing.
    HandOff {
        shard_id: ShardId,
        reply: mpsc::UnboundedSender<HandoffReply>,
    },

    /// Administrative entity-count query.
    GetStats { reply: oneshot::Sender<ShardStats> },

    /// Termination watch for a child entity fired.
    EntityTerminated(EntityId),

    /// Restart backoff for an entity elapsed.
    RestartEntity(EntityId),

    /// The handoff stopper saw every entity terminate.
    EntitiesDrained,
}

/// Region-side handle to a running shard actor.
#[derive(Clone)]
pub(crate) struct ShardHandle {
    tx: mpsc::UnboundedSender<ShardMsg>,
    terminated: watch::Receiver<bool>,
}

impl ShardHandle {
    /// Returns false when the shard actor already exited.
    pub(crate) fn send(&self, msg: ShardMsg) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Forward an application message, handing it back on failure so the
    /// caller can recreate the shard and retry instead of losing it.
    pub(crate) fn forward(&self, message: DynMessage) -> std::result::Result<(), DynMessage> {
        self.tx.send(ShardMsg::Deliver(message)).map_err(|e| match e.0 {
            ShardMsg::Deliver(message) => message,
            _ => unreachable!("forward only wraps Deliver"),
        })
    }

    pub(crate) fn terminated_rx(&self) -> watch::Receiver<bool> {
        self.terminated.clone()
    }
}
