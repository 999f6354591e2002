//! Pluggable shard allocation and rebalancing policy.

use crate::error::{AllocationError, Result};
use crate::region::RegionRef;
use crate::types::ShardId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Current shard assignments as seen by the coordinator: every candidate
/// region with the shards it owns, in allocation order.
pub type Allocations = HashMap<RegionRef, Vec<ShardId>>;

/// Decides where shards live and when they move. Pure policy: the
/// coordinator owns the state and drives the protocol.
///
/// `allocate_shard` must return one of the regions present in `current`.
/// `rebalance` must only return shards not already in `in_progress` and may
/// return none. Both run outside the coordinator's message loop; results
/// re-enter it as messages, so a slow strategy never blocks the
/// coordinator.
#[async_trait]
pub trait AllocationStrategy: Send + Sync + 'static {
    /// Pick the region to host a newly requested shard. `requester` is the
    /// region that asked, when the request came from one.
    async fn allocate_shard(
        &self,
        requester: Option<&RegionRef>,
        shard: &ShardId,
        current: &Allocations,
    ) -> Result<RegionRef>;

    /// Pick shards to relocate given current assignments and the shards
    /// already mid-rebalance.
    async fn rebalance(
        &self,
        current: &Allocations,
        in_progress: &HashSet<ShardId>,
    ) -> HashSet<ShardId>;
}

/// Default policy: allocate to the region with the fewest shards; relocate
/// one shard from the most-loaded region when it leads the least-loaded by
/// at least `rebalance_threshold`. Ties break on the lowest region id.
#[derive(Debug, Clone)]
pub struct LeastLoadedStrategy {
    rebalance_threshold: usize,
    max_simultaneous_rebalances: usize,
}

impl LeastLoadedStrategy {
    /// Create the policy with explicit parameters.
    pub fn new(rebalance_threshold: usize, max_simultaneous_rebalances: usize) -> Self {
        Self {
            rebalance_threshold: rebalance_threshold.max(1),
            max_simultaneous_rebalances,
        }
    }
}

impl Default for LeastLoadedStrategy {
    fn default() -> Self {
        Self::new(1, 3)
    }
}

#[async_trait]
impl AllocationStrategy for LeastLoadedStrategy {
    async fn allocate_shard(
        &self,
        _requester: Option<&RegionRef>,
        shard: &ShardId,
        current: &Allocations,
    ) -> Result<RegionRef> {
        current
            .iter()
            .min_by_key(|(region, owned)| (owned.len(), region.id()))
            .map(|(region, _)| region.clone())
            .ok_or_else(|| AllocationError::NoRegionAvailable(shard.clone()).into())
    }

    async fn rebalance(
        &self,
        current: &Allocations,
        in_progress: &HashSet<ShardId>,
    ) -> HashSet<ShardId> {
        if in_progress.len() >= self.max_simultaneous_rebalances || current.len() < 2 {
            return HashSet::new();
        }

        // Loads are counted net of shards already on the move.
        let load = |owned: &Vec<ShardId>| owned.iter().filter(|s| !in_progress.contains(*s)).count();

        let most = current
            .iter()
            .max_by_key(|(region, owned)| (load(owned), std::cmp::Reverse(region.id())));
        let least = current
            .iter()
            .min_by_key(|(region, owned)| (load(owned), region.id()));

        if let (Some((_, most_owned)), Some((_, least_owned))) = (most, least) {
            let difference = load(most_owned).saturating_sub(load(least_owned));
            if difference >= self.rebalance_threshold {
                if let Some(pick) = most_owned.iter().find(|s| !in_progress.contains(*s)) {
                    return HashSet::from([pick.clone()]);
                }
            }
        }
        HashSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::testkit::FakeRegion;

    fn allocations(loads: &[(&FakeRegion, &[&str])]) -> Allocations {
        loads
            .iter()
            .map(|(region, shards)| {
                (
                    region.region_ref(),
                    shards.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_allocate_picks_least_loaded() {
        let a = FakeRegion::new(9000);
        let b = FakeRegion::new(9001);
        let strategy = LeastLoadedStrategy::default();

        let current = allocations(&[(&a, &["1", "2"]), (&b, &["3"])]);
        let picked = strategy
            .allocate_shard(Some(&a.region_ref()), &"4".to_string(), &current)
            .await
            .unwrap();
        assert_eq!(picked, b.region_ref());
    }

    #[tokio::test]
    async fn test_allocate_with_no_regions_fails() {
        let strategy = LeastLoadedStrategy::default();
        let result = strategy
            .allocate_shard(None, &"1".to_string(), &Allocations::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rebalance_moves_one_from_most_loaded() {
        let a = FakeRegion::new(9000);
        let b = FakeRegion::new(9001);
        let strategy = LeastLoadedStrategy::new(1, 3);

        let current = allocations(&[(&a, &["1", "2", "3"]), (&b, &[])]);
        let picked = strategy.rebalance(&current, &HashSet::new()).await;
        assert_eq!(picked.len(), 1);
        assert!(picked.iter().all(|s| ["1", "2", "3"].contains(&s.as_str())));
    }

    #[tokio::test]
    async fn test_rebalance_respects_threshold() {
        let a = FakeRegion::new(9000);
        let b = FakeRegion::new(9001);
        let strategy = LeastLoadedStrategy::new(3, 3);

        let current = allocations(&[(&a, &["1", "2"]), (&b, &[])]);
        assert!(strategy.rebalance(&current, &HashSet::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_rebalance_excludes_in_progress() {
        let a = FakeRegion::new(9000);
        let b = FakeRegion::new(9001);
        let strategy = LeastLoadedStrategy::new(1, 3);

        let current = allocations(&[(&a, &["1", "2"]), (&b, &[])]);
        let in_progress = HashSet::from(["1".to_string(), "2".to_string()]);
        // Everything on the move already counts as gone from the source.
        assert!(strategy.rebalance(&current, &in_progress).await.is_empty());
    }

    #[tokio::test]
    async fn test_rebalance_bounded_by_max_simultaneous() {
        let a = FakeRegion::new(9000);
        let b = FakeRegion::new(9001);
        let strategy = LeastLoadedStrategy::new(1, 1);

        let current = allocations(&[(&a, &["1", "2", "3"]), (&b, &[])]);
        let in_progress = HashSet::from(["9".to_string()]);
        assert!(strategy.rebalance(&current, &in_progress).await.is_empty());
    }
}
