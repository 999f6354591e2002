//! The coordinator: single elected owner of the shard location table.

mod actor;
mod state;

pub use state::{CoordinatorEvent, CoordinatorState};
pub(crate) use actor::{spawn_coordinator, CoordinatorSettings};

use crate::cluster::ClusterEvent;
use crate::region::RegionRef;
use crate::types::{RegionId, ShardId};
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Messages processed by the coordinator actor.
pub(crate) enum CoordinatorMsg {
    /// A region announces itself as a shard host.
    Register(RegionRef),

    /// A region announces itself as routing-only.
    RegisterProxy(RegionRef),

    /// A region asks where a shard lives. No reply while the shard is
    /// mid-rebalance; the region retries.
    GetShardHome { shard: ShardId, requester: RegionRef },

    /// A region confirms it hosts a shard; stops `HostShard` resends.
    ShardStarted { shard: ShardId, region: RegionId },

    /// A region asks to be drained of every shard it hosts.
    GracefulShutdownRequest(RegionRef),

    /// Administrative query: nodes with registered (non-proxy) regions.
    GetCurrentRegions {
        reply: oneshot::Sender<HashSet<SocketAddr>>,
    },

    /// The allocation strategy picked a region for a shard, or failed.
    AllocationResult {
        shard: ShardId,
        requester: Option<RegionRef>,
        region: Option<RegionRef>,
    },

    /// The allocation strategy picked shards to relocate.
    RebalancePick { shards: HashSet<ShardId> },

    /// A rebalance worker finished, successfully or not.
    RebalanceDone { shard: ShardId, ok: bool },

    /// Termination watch on a registered region or proxy fired.
    RegionExited(RegionId),

    /// The removal margin for a terminated region elapsed.
    TerminationDelayElapsed(RegionId),

    /// Membership change observed by the coordinator.
    ClusterChanged(ClusterEvent),

    /// Stop the coordinator (singleton moved elsewhere).
    Stop,
}

/// Handle to a running coordinator instance.
#[derive(Clone)]
pub(crate) struct CoordinatorRef {
    pub(crate) id: Uuid,
    pub(crate) tx: mpsc::UnboundedSender<CoordinatorMsg>,
    pub(crate) terminated: watch::Receiver<bool>,
}

impl CoordinatorRef {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Returns false when the coordinator instance already exited.
    pub(crate) fn send(&self, msg: CoordinatorMsg) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub(crate) fn terminated_rx(&self) -> watch::Receiver<bool> {
        self.terminated.clone()
    }
}

impl std::fmt::Debug for CoordinatorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorRef").field("id", &self.id).finish()
    }
}
