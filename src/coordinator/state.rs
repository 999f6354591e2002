//! Durable coordinator state and its transition events.

use crate::types::{RegionId, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;

/// State-transition events of the coordinator. Every mutation of
/// [`CoordinatorState`] is one of these, appended durably before it takes
/// effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorEvent {
    /// A shard-hosting region registered.
    RegionRegistered { region: RegionId, node: SocketAddr },

    /// A routing-only region registered.
    RegionProxyRegistered { proxy: RegionId },

    /// A registered region is gone; its shards become unallocated.
    RegionTerminated { region: RegionId },

    /// A registered proxy is gone.
    RegionProxyTerminated { proxy: RegionId },

    /// A shard was assigned to a region.
    ShardHomeAllocated { shard: ShardId, region: RegionId },

    /// A shard was released after a completed handoff.
    ShardHomeDeallocated { shard: ShardId },
}

/// The shard location table, rebuilt on recovery by folding
/// [`CoordinatorEvent`]s over an optional snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorState {
    /// Current owner of each allocated shard. At most one per shard.
    pub shards: HashMap<ShardId, RegionId>,

    /// Shards hosted by each region, in allocation order.
    pub regions: HashMap<RegionId, Vec<ShardId>>,

    /// Node each registered region lives on.
    pub region_nodes: HashMap<RegionId, SocketAddr>,

    /// Routing-only registrants; never receive allocations.
    pub proxies: HashSet<RegionId>,

    /// Shards requested but not currently assigned anywhere.
    pub unallocated: BTreeSet<ShardId>,
}

impl CoordinatorState {
    /// Apply one event. Returns false when the event is inconsistent with
    /// the current state and was skipped; replay tolerates such events
    /// instead of halting recovery, and repeated application (an append
    /// whose callback never ran, replayed again) is harmless.
    pub fn apply(&mut self, event: &CoordinatorEvent) -> bool {
        match event {
            CoordinatorEvent::RegionRegistered { region, node } => {
                if self.regions.contains_key(region) {
                    return false;
                }
                self.regions.insert(*region, Vec::new());
                self.region_nodes.insert(*region, *node);
                true
            }
            CoordinatorEvent::RegionProxyRegistered { proxy } => self.proxies.insert(*proxy),
            CoordinatorEvent::RegionTerminated { region } => {
                let Some(owned) = self.regions.remove(region) else {
                    return false;
                };
                self.region_nodes.remove(region);
                for shard in owned {
                    self.shards.remove(&shard);
                    self.unallocated.insert(shard);
                }
                true
            }
            CoordinatorEvent::RegionProxyTerminated { proxy } => self.proxies.remove(proxy),
            CoordinatorEvent::ShardHomeAllocated { shard, region } => {
                if self.shards.contains_key(shard) {
                    return false;
                }
                let Some(owned) = self.regions.get_mut(region) else {
                    return false;
                };
                owned.push(shard.clone());
                self.shards.insert(shard.clone(), *region);
                self.unallocated.remove(shard);
                true
            }
            CoordinatorEvent::ShardHomeDeallocated { shard } => {
                let Some(region) = self.shards.remove(shard) else {
                    return false;
                };
                if let Some(owned) = self.regions.get_mut(&region) {
                    owned.retain(|s| s != shard);
                }
                self.unallocated.insert(shard.clone());
                true
            }
        }
    }

    /// Fold a recovered event sequence, skipping inconsistent entries.
    pub fn replay<'a>(&mut self, events: impl IntoIterator<Item = &'a CoordinatorEvent>) {
        for event in events {
            if !self.apply(event) {
                tracing::warn!(?event, "Skipping inconsistent event during replay");
            }
        }
    }

    /// Owner of a shard, if allocated.
    pub fn owner(&self, shard: &str) -> Option<RegionId> {
        self.shards.get(shard).copied()
    }

    /// Whether the id is a registered (non-proxy) region.
    pub fn has_region(&self, region: &RegionId) -> bool {
        self.regions.contains_key(region)
    }

    /// Shards currently owned by a region, in allocation order.
    pub fn shards_of(&self, region: &RegionId) -> &[ShardId] {
        self.regions.get(region).map(Vec::as_slice).unwrap_or(&[])
    }
}
