//! The region actor: per-node entry point of the delivery pipeline.

mod actor;
pub(crate) mod buffer;

pub(crate) use actor::{spawn_region, RegionSettings};

use crate::coordinator::CoordinatorRef;
use crate::types::{DynMessage, RegionId, ShardId, ShardStats};
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot, watch};

/// Replies flowing back to a rebalance worker during handoff.
#[derive(Debug)]
pub(crate) enum HandoffReply {
    /// A region acknowledged `BeginHandOff` and forgot the shard location.
    BeginAck { region: RegionId },

    /// The owning shard stopped all entities and terminated.
    Stopped,
}

/// Messages processed by a region actor.
pub(crate) enum RegionMsg {
    /// An application message entering the pipeline, from a local handle or
    /// forwarded by a peer region.
    Deliver(DynMessage),

    /// Registration accepted by the coordinator.
    RegisterAck { coordinator: CoordinatorRef },

    /// The coordinator resolved a shard location.
    ShardHome { shard: ShardId, region: RegionRef },

    /// The coordinator assigned a shard to this region.
    HostShard { shard: ShardId },

    /// First handoff phase: forget the shard location and ack.
    BeginHandOff {
        shard: ShardId,
        reply: mpsc::UnboundedSender<HandoffReply>,
    },

    /// Second handoff phase: stop the local shard and confirm.
    HandOff {
        shard: ShardId,
        reply: mpsc::UnboundedSender<HandoffReply>,
    },

    /// Drain this region: ask the coordinator to move every shard away,
    /// then terminate once nothing is hosted or buffered.
    GracefulShutdown,

    /// Administrative query: nodes currently hosting regions of this type.
    GetCurrentRegions {
        reply: oneshot::Sender<HashSet<SocketAddr>>,
    },

    /// Administrative query: entity counts of locally hosted shards.
    GetShardStats {
        reply: oneshot::Sender<Vec<ShardStats>>,
    },

    /// Termination watch on the cached coordinator fired.
    CoordinatorTerminated(uuid::Uuid),

    /// Termination watch on a remote region fired.
    RemoteRegionTerminated(RegionId),

    /// Termination watch on a local shard fired.
    ShardTerminated(ShardId),

    /// Restart backoff for a locally hosted shard elapsed.
    RestartShard(ShardId),
}

/// Location-transparent handle to a region instance.
///
/// Identity, not value: two refs are equal when they point at the same
/// region instance, and a restarted region is a different ref.
#[derive(Clone)]
pub struct RegionRef {
    pub(crate) id: RegionId,
    pub(crate) node: SocketAddr,
    pub(crate) tx: mpsc::UnboundedSender<RegionMsg>,
    pub(crate) terminated: watch::Receiver<bool>,
}

impl RegionRef {
    /// Stable id of the region instance.
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Node the region runs on.
    pub fn node(&self) -> SocketAddr {
        self.node
    }

    /// Whether the region instance has exited.
    pub fn is_terminated(&self) -> bool {
        crate::lifecycle::has_exited(&self.terminated)
    }

    /// Returns false when the region already exited.
    pub(crate) fn send(&self, msg: RegionMsg) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Forward an application message, handing it back on failure so the
    /// caller can buffer it instead of losing it.
    pub(crate) fn forward(&self, message: DynMessage) -> std::result::Result<(), DynMessage> {
        self.tx.send(RegionMsg::Deliver(message)).map_err(|e| match e.0 {
            RegionMsg::Deliver(message) => message,
            _ => unreachable!("forward only wraps Deliver"),
        })
    }

    pub(crate) fn terminated_rx(&self) -> watch::Receiver<bool> {
        self.terminated.clone()
    }
}

impl std::fmt::Debug for RegionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionRef")
            .field("id", &self.id)
            .field("node", &self.node)
            .finish()
    }
}

impl PartialEq for RegionRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RegionRef {}

impl std::hash::Hash for RegionRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for RegionRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RegionRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::lifecycle::{self, ExitGuard};
    use uuid::Uuid;

    /// A region stand-in whose inbox is driven directly by tests.
    pub(crate) struct FakeRegion {
        region: RegionRef,
        pub(crate) rx: mpsc::UnboundedReceiver<RegionMsg>,
        guard: Option<ExitGuard>,
    }

    impl FakeRegion {
        pub(crate) fn new(port: u16) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let (guard, terminated) = lifecycle::exit_pair();
            let region = RegionRef {
                id: Uuid::new_v4(),
                node: format!("127.0.0.1:{port}").parse().unwrap(),
                tx,
                terminated,
            };
            Self {
                region,
                rx,
                guard: Some(guard),
            }
        }

        pub(crate) fn region_ref(&self) -> RegionRef {
            self.region.clone()
        }

        /// Simulate the region instance dying: the termination signal fires
        /// and further sends to it fail.
        pub(crate) fn kill(&mut self) {
            self.guard.take();
            self.rx.close();
        }
    }
}
