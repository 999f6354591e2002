//! Coordinator actor implementation.
//!
//! All mutations of the durable location table follow one ordering:
//! snapshot-when-needed, then append, then apply and act. State changes and
//! their visible effects are never taken without being recorded first;
//! replay tolerates the converse (a recorded event whose effects were cut
//! short) because event application is idempotent.

use super::state::{CoordinatorEvent, CoordinatorState};
use super::{CoordinatorMsg, CoordinatorRef};
use crate::allocation::{AllocationStrategy, Allocations};
use crate::cluster::{ClusterEvent, MemberView, MembershipFeed};
use crate::config::ShardingConfig;
use crate::error::Result;
use crate::journal::{coordinator_persistence_id, EventStore, Journaled};
use crate::lifecycle;
use crate::rebalance::{spawn_worker, RebalancePlan};
use crate::region::{RegionMsg, RegionRef};
use crate::types::{RegionId, ShardId};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Dependencies of one coordinator instance.
pub(crate) struct CoordinatorSettings {
    pub type_name: String,
    pub config: ShardingConfig,
    pub store: Arc<dyn EventStore>,
    pub feed: Arc<dyn MembershipFeed>,
    pub strategy: Arc<dyn AllocationStrategy>,
}

/// Spawn a coordinator instance. Exactly one runs cluster-wide per entity
/// type; election is the caller's concern.
pub(crate) fn spawn_coordinator(settings: CoordinatorSettings) -> CoordinatorRef {
    let (tx, rx) = mpsc::unbounded_channel();
    let (guard, terminated) = lifecycle::exit_pair();
    let self_ref = CoordinatorRef {
        id: Uuid::new_v4(),
        tx: tx.clone(),
        terminated,
    };

    let subscription = settings.feed.subscribe();
    let journal = Journaled::new(
        Arc::clone(&settings.store),
        coordinator_persistence_id(&settings.type_name),
    );
    let actor = Coordinator {
        type_name: settings.type_name,
        config: settings.config,
        strategy: settings.strategy,
        self_ref: self_ref.clone(),
        self_tx: tx,
        journal,
        state: CoordinatorState::default(),
        live: HashMap::new(),
        watched: HashSet::new(),
        members: MemberView::new(None, subscription.members),
        pending_alloc: HashSet::new(),
        rebalancing: HashSet::new(),
        graceful: HashSet::new(),
        unacked_host: HashMap::new(),
    };

    tokio::spawn(async move {
        let _guard = guard;
        actor.run(rx, subscription.events).await;
    });
    self_ref
}

struct Coordinator {
    type_name: String,
    config: ShardingConfig,
    strategy: Arc<dyn AllocationStrategy>,
    self_ref: CoordinatorRef,
    self_tx: mpsc::UnboundedSender<CoordinatorMsg>,
    journal: Journaled,
    state: CoordinatorState,
    /// Usable refs of registered regions and proxies. Recovered state may
    /// name regions with no live ref yet; they stay unreachable until they
    /// re-register or their member leaves.
    live: HashMap<RegionId, RegionRef>,
    watched: HashSet<RegionId>,
    members: MemberView,
    pending_alloc: HashSet<ShardId>,
    rebalancing: HashSet<ShardId>,
    graceful: HashSet<RegionId>,
    unacked_host: HashMap<ShardId, RegionRef>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<CoordinatorMsg>,
        mut events: mpsc::UnboundedReceiver<ClusterEvent>,
    ) {
        if let Err(e) = self.recover().await {
            tracing::error!(type_name = %self.type_name, error = %e, "Coordinator recovery failed");
            return;
        }
        tracing::info!(
            type_name = %self.type_name,
            regions = self.state.regions.len(),
            shards = self.state.shards.len(),
            "Coordinator started"
        );

        let mut rebalance_tick = tokio::time::interval(self.config.rebalance_interval);
        rebalance_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut host_resend_tick = tokio::time::interval(self.config.shard_start_timeout);
        host_resend_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut feed_open = true;

        loop {
            let step = tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(CoordinatorMsg::Stop) => {
                        tracing::info!(type_name = %self.type_name, "Coordinator stopping");
                        break;
                    }
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                maybe = events.recv(), if feed_open => match maybe {
                    Some(event) => self.cluster_changed(event).await,
                    None => {
                        feed_open = false;
                        Ok(())
                    }
                },
                _ = rebalance_tick.tick() => {
                    self.rebalance_tick();
                    Ok(())
                }
                _ = host_resend_tick.tick() => {
                    self.resend_unacked_hosts();
                    Ok(())
                }
            };
            if let Err(e) = step {
                // Without a durable record the table cannot be trusted;
                // stop and let the singleton manager restart and replay.
                tracing::error!(type_name = %self.type_name, error = %e, "Coordinator stopping");
                break;
            }
        }
    }

    async fn handle(&mut self, msg: CoordinatorMsg) -> Result<()> {
        match msg {
            CoordinatorMsg::Register(region) => self.register(region, false).await,
            CoordinatorMsg::RegisterProxy(proxy) => self.register(proxy, true).await,
            CoordinatorMsg::GetShardHome { shard, requester } => {
                self.get_shard_home(shard, requester);
                Ok(())
            }
            CoordinatorMsg::ShardStarted { shard, region } => {
                if self.unacked_host.get(&shard).map(RegionRef::id) == Some(region) {
                    self.unacked_host.remove(&shard);
                }
                Ok(())
            }
            CoordinatorMsg::GracefulShutdownRequest(region) => {
                self.graceful_shutdown_request(region);
                Ok(())
            }
            CoordinatorMsg::GetCurrentRegions { reply } => {
                self.get_current_regions(reply);
                Ok(())
            }
            CoordinatorMsg::AllocationResult {
                shard,
                requester,
                region,
            } => self.allocation_result(shard, requester, region).await,
            CoordinatorMsg::RebalancePick { shards } => {
                for shard in shards {
                    self.start_rebalance(shard);
                }
                Ok(())
            }
            CoordinatorMsg::RebalanceDone { shard, ok } => self.rebalance_done(shard, ok).await,
            CoordinatorMsg::RegionExited(region) => self.region_exited(region).await,
            CoordinatorMsg::TerminationDelayElapsed(region) => {
                if self.is_live(&region) {
                    Ok(())
                } else {
                    self.terminate_region(region).await
                }
            }
            CoordinatorMsg::ClusterChanged(event) => self.cluster_changed(event).await,
            CoordinatorMsg::Stop => Ok(()),
        }
    }

    /// Rebuild the table from snapshot and events, then deal with regions
    /// whose member is already gone.
    async fn recover(&mut self) -> Result<()> {
        let (snapshot, events): (Option<CoordinatorState>, Vec<CoordinatorEvent>) =
            self.journal.recover().await?;
        self.state = snapshot.unwrap_or_default();
        self.state.replay(&events);

        let known: Vec<RegionId> = self
            .state
            .regions
            .keys()
            .chain(self.state.proxies.iter())
            .copied()
            .collect();
        for region in known {
            let node_up = self
                .state
                .region_nodes
                .get(&region)
                .map(|addr| self.members.contains(addr))
                .unwrap_or(false);
            if !node_up {
                let _ = self.self_tx.send(CoordinatorMsg::TerminationDelayElapsed(region));
            }
        }
        Ok(())
    }

    async fn register(&mut self, region: RegionRef, proxy: bool) -> Result<()> {
        let id = region.id();
        let known = if proxy {
            self.state.proxies.contains(&id)
        } else {
            self.state.has_region(&id)
        };

        if !known {
            // A new instance on a node that still carries dead registrants
            // supersedes them: the old instances cannot come back.
            let stale: Vec<RegionId> = self
                .state
                .region_nodes
                .iter()
                .filter(|(rid, addr)| **addr == region.node() && !self.is_live(rid))
                .map(|(rid, _)| *rid)
                .collect();
            for old in stale {
                tracing::info!(region = %old, node = %region.node(), "Superseded by new registration");
                self.terminate_region(old).await?;
            }

            let event = if proxy {
                CoordinatorEvent::RegionProxyRegistered { proxy: id }
            } else {
                CoordinatorEvent::RegionRegistered {
                    region: id,
                    node: region.node(),
                }
            };
            self.persist(event).await?;
            tracing::info!(region = %id, node = %region.node(), proxy, "Region registered");
        } else {
            tracing::debug!(region = %id, proxy, "Region re-registered");
        }

        self.live.insert(id, region.clone());
        if self.watched.insert(id) {
            let tx = self.self_tx.clone();
            lifecycle::notify_on_exit(region.terminated_rx(), move || {
                let _ = tx.send(CoordinatorMsg::RegionExited(id));
            });
        }
        region.send(RegionMsg::RegisterAck {
            coordinator: self.self_ref.clone(),
        });

        // The first host makes every waiting shard allocatable.
        if !proxy && self.state.regions.len() == 1 {
            for shard in self.state.unallocated.clone() {
                self.start_allocation(shard, None);
            }
        }
        Ok(())
    }

    fn get_shard_home(&mut self, shard: ShardId, requester: RegionRef) {
        if self.rebalancing.contains(&shard) {
            // Routing is paused for this shard; the region retries.
            tracing::debug!(shard_id = %shard, "Shard home request during rebalance, no reply");
            return;
        }
        if let Some(owner) = self.state.owner(&shard) {
            match self.live.get(&owner) {
                Some(home) if !home.is_terminated() => {
                    requester.send(RegionMsg::ShardHome {
                        shard,
                        region: home.clone(),
                    });
                }
                _ => {
                    tracing::debug!(
                        shard_id = %shard,
                        region = %owner,
                        "Owner has not re-registered, no reply"
                    );
                }
            }
            return;
        }
        self.start_allocation(shard, Some(requester));
    }

    /// Kick the allocation strategy for an unassigned shard. The result
    /// re-enters the mailbox; at most one attempt runs per shard.
    fn start_allocation(&mut self, shard: ShardId, requester: Option<RegionRef>) {
        if self.pending_alloc.contains(&shard) || self.state.owner(&shard).is_some() {
            return;
        }
        let current = self.allocation_view(true);
        if current.is_empty() {
            tracing::debug!(shard_id = %shard, "No region available, allocation deferred");
            return;
        }
        self.pending_alloc.insert(shard.clone());

        let strategy = Arc::clone(&self.strategy);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let region = match strategy
                .allocate_shard(requester.as_ref(), &shard, &current)
                .await
            {
                Ok(region) => Some(region),
                Err(e) => {
                    tracing::warn!(shard_id = %shard, error = %e, "Shard allocation failed");
                    None
                }
            };
            let _ = tx.send(CoordinatorMsg::AllocationResult {
                shard,
                requester,
                region,
            });
        });
    }

    async fn allocation_result(
        &mut self,
        shard: ShardId,
        requester: Option<RegionRef>,
        region: Option<RegionRef>,
    ) -> Result<()> {
        self.pending_alloc.remove(&shard);

        // A concurrent request may have allocated meanwhile; just answer.
        if let Some(owner) = self.state.owner(&shard) {
            if let (Some(requester), Some(home)) = (requester, self.live.get(&owner)) {
                requester.send(RegionMsg::ShardHome {
                    shard,
                    region: home.clone(),
                });
            }
            return Ok(());
        }
        let Some(region) = region else {
            return Ok(());
        };
        if !self.state.has_region(&region.id())
            || self.graceful.contains(&region.id())
            || region.is_terminated()
        {
            tracing::warn!(
                shard_id = %shard,
                region = %region.id(),
                "Allocation strategy returned an unusable region"
            );
            return Ok(());
        }

        self.persist(CoordinatorEvent::ShardHomeAllocated {
            shard: shard.clone(),
            region: region.id(),
        })
        .await?;
        tracing::info!(shard_id = %shard, region = %region.id(), "Shard home allocated");

        self.unacked_host.insert(shard.clone(), region.clone());
        region.send(RegionMsg::HostShard {
            shard: shard.clone(),
        });
        if let Some(requester) = requester {
            requester.send(RegionMsg::ShardHome { shard, region });
        }
        Ok(())
    }

    fn graceful_shutdown_request(&mut self, region: RegionRef) {
        let id = region.id();
        if !self.state.has_region(&id) {
            return;
        }
        if self.graceful.insert(id) {
            tracing::info!(region = %id, "Graceful shutdown requested");
        }
        for shard in self.state.shards_of(&id).to_vec() {
            self.start_rebalance(shard);
        }
    }

    fn rebalance_tick(&mut self) {
        // Failed graceful drains are retried here.
        for region in self.graceful.clone() {
            for shard in self.state.shards_of(&region).to_vec() {
                self.start_rebalance(shard);
            }
        }

        let current = self.allocation_view(false);
        if current.is_empty() {
            return;
        }
        let strategy = Arc::clone(&self.strategy);
        let in_progress = self.rebalancing.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let shards = strategy.rebalance(&current, &in_progress).await;
            if !shards.is_empty() {
                let _ = tx.send(CoordinatorMsg::RebalancePick { shards });
            }
        });
    }

    fn start_rebalance(&mut self, shard: ShardId) {
        if self.rebalancing.contains(&shard) {
            return;
        }
        let Some(owner) = self.state.owner(&shard) else {
            return;
        };
        let Some(from) = self.live.get(&owner).filter(|r| !r.is_terminated()) else {
            return;
        };
        self.rebalancing.insert(shard.clone());
        tracing::info!(shard_id = %shard, from = %owner, "Rebalance started");

        let regions: Vec<RegionRef> = self
            .live
            .values()
            .filter(|r| !r.is_terminated())
            .cloned()
            .collect();
        spawn_worker(
            RebalancePlan {
                shard,
                from: from.clone(),
                regions,
                timeout: self.config.handoff_timeout,
            },
            self.self_tx.clone(),
        );
    }

    async fn rebalance_done(&mut self, shard: ShardId, ok: bool) -> Result<()> {
        self.rebalancing.remove(&shard);
        if ok {
            if self.state.owner(&shard).is_some() {
                self.persist(CoordinatorEvent::ShardHomeDeallocated {
                    shard: shard.clone(),
                })
                .await?;
                tracing::info!(shard_id = %shard, "Shard home deallocated");
            }
            // Immediately eligible again; allocate without waiting for the
            // next request.
            self.start_allocation(shard, None);
        } else if let Some(owner) = self.state.owner(&shard) {
            if self.graceful.remove(&owner) {
                tracing::debug!(region = %owner, "Graceful drain failed, awaiting re-request");
            }
        }
        Ok(())
    }

    async fn region_exited(&mut self, region: RegionId) -> Result<()> {
        self.live.remove(&region);
        self.watched.remove(&region);
        self.unacked_host.retain(|_, home| home.id() != region);

        let member_up = self
            .state
            .region_nodes
            .get(&region)
            .map(|addr| self.members.contains(addr))
            .unwrap_or(false);

        if member_up && !self.config.removal_margin.is_zero() {
            // The node looks alive; give a possible restart or delayed
            // removal signal time before reallocating everything.
            tracing::info!(
                region = %region,
                margin = ?self.config.removal_margin,
                "Region terminated, delaying reaction"
            );
            let tx = self.self_tx.clone();
            let margin = self.config.removal_margin;
            tokio::spawn(async move {
                tokio::time::sleep(margin).await;
                let _ = tx.send(CoordinatorMsg::TerminationDelayElapsed(region));
            });
            Ok(())
        } else {
            self.terminate_region(region).await
        }
    }

    async fn terminate_region(&mut self, region: RegionId) -> Result<()> {
        if self.state.proxies.contains(&region) {
            self.persist(CoordinatorEvent::RegionProxyTerminated { proxy: region })
                .await?;
            tracing::info!(proxy = %region, "Proxy terminated");
            self.live.remove(&region);
            return Ok(());
        }
        if !self.state.has_region(&region) {
            return Ok(());
        }

        let owned = self.state.shards_of(&region).to_vec();
        self.persist(CoordinatorEvent::RegionTerminated { region })
            .await?;
        tracing::info!(region = %region, shards = owned.len(), "Region terminated");

        self.live.remove(&region);
        self.graceful.remove(&region);
        for shard in owned {
            self.rebalancing.remove(&shard);
            self.unacked_host.remove(&shard);
            self.start_allocation(shard, None);
        }
        Ok(())
    }

    async fn cluster_changed(&mut self, event: ClusterEvent) -> Result<()> {
        self.members.apply(&event);
        if let ClusterEvent::MemberRemoved(member) = event {
            // Dead registrants on the removed node were waiting out the
            // margin (or never re-registered after recovery); react now.
            let gone: Vec<RegionId> = self
                .state
                .region_nodes
                .iter()
                .filter(|(rid, addr)| **addr == member.addr && !self.is_live(rid))
                .map(|(rid, _)| *rid)
                .collect();
            for region in gone {
                self.terminate_region(region).await?;
            }
        }
        Ok(())
    }

    fn resend_unacked_hosts(&mut self) {
        for (shard, region) in &self.unacked_host {
            if region.is_terminated() {
                continue;
            }
            tracing::debug!(shard_id = %shard, region = %region.id(), "Resending host request");
            region.send(RegionMsg::HostShard {
                shard: shard.clone(),
            });
        }
    }

    fn get_current_regions(&self, reply: oneshot::Sender<HashSet<SocketAddr>>) {
        let nodes: HashSet<SocketAddr> = self
            .state
            .regions
            .keys()
            .filter_map(|region| self.state.region_nodes.get(region))
            .copied()
            .collect();
        let _ = reply.send(nodes);
    }

    /// Assignments handed to the strategy: regions with a usable ref,
    /// optionally excluding ones being drained (new allocations never go
    /// to a shutting-down region; rebalancing still considers them).
    fn allocation_view(&self, exclude_graceful: bool) -> Allocations {
        self.state
            .regions
            .iter()
            .filter(|(id, _)| !(exclude_graceful && self.graceful.contains(*id)))
            .filter_map(|(id, owned)| {
                self.live
                    .get(id)
                    .filter(|r| !r.is_terminated())
                    .map(|r| (r.clone(), owned.clone()))
            })
            .collect()
    }

    fn is_live(&self, region: &RegionId) -> bool {
        self.live
            .get(region)
            .map(|r| !r.is_terminated())
            .unwrap_or(false)
    }

    async fn persist(&mut self, event: CoordinatorEvent) -> Result<()> {
        self.journal
            .save_snapshot_when_needed(self.config.snapshot_after, &self.state);
        self.journal.persist(&event).await?;
        if !self.state.apply(&event) {
            tracing::debug!(?event, "Event had no effect");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::LeastLoadedStrategy;
    use crate::cluster::LocalMembership;
    use crate::journal::MemoryJournal;
    use crate::region::testkit::FakeRegion;
    use crate::region::HandoffReply;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryJournal>,
        feed: Arc<LocalMembership>,
        coordinator: CoordinatorRef,
    }

    fn fixture(config: ShardingConfig) -> Fixture {
        let store = Arc::new(MemoryJournal::new());
        let feed = Arc::new(LocalMembership::new());
        let coordinator = spawn_coordinator(CoordinatorSettings {
            type_name: "orders".into(),
            config,
            store: Arc::clone(&store) as Arc<dyn EventStore>,
            feed: Arc::clone(&feed) as Arc<dyn MembershipFeed>,
            strategy: Arc::new(LeastLoadedStrategy::new(1, 3)),
        });
        Fixture {
            store,
            feed,
            coordinator,
        }
    }

    fn quick_config() -> ShardingConfig {
        ShardingConfig::new()
            .with_rebalance_interval(Duration::from_millis(100))
            .with_shard_start_timeout(Duration::from_millis(200))
            .with_handoff_timeout(Duration::from_secs(2))
    }

    async fn recv_from(
        region: &mut FakeRegion,
        timeout: Duration,
    ) -> Option<RegionMsg> {
        tokio::time::timeout(timeout, region.rx.recv()).await.ok()?
    }

    async fn register(fx: &Fixture, region: &mut FakeRegion) {
        fx.coordinator
            .send(CoordinatorMsg::Register(region.region_ref()));
        match recv_from(region, Duration::from_secs(2)).await {
            Some(RegionMsg::RegisterAck { .. }) => {}
            other => panic!("expected RegisterAck, got {}", msg_name(other)),
        }
    }

    fn msg_name(msg: Option<RegionMsg>) -> &'static str {
        match msg {
            None => "nothing",
            Some(RegionMsg::Deliver(_)) => "Deliver",
            Some(RegionMsg::RegisterAck { .. }) => "RegisterAck",
            Some(RegionMsg::ShardHome { .. }) => "ShardHome",
            Some(RegionMsg::HostShard { .. }) => "HostShard",
            Some(RegionMsg::BeginHandOff { .. }) => "BeginHandOff",
            Some(RegionMsg::HandOff { .. }) => "HandOff",
            _ => "other",
        }
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let fx = fixture(quick_config());
        let mut region = FakeRegion::new(9000);
        fx.feed.member_up("127.0.0.1:9000".parse().unwrap(), []);

        register(&fx, &mut region).await;
        register(&fx, &mut region).await;

        // Two acks, one recorded event.
        assert_eq!(fx.store.event_count("coordinator/orders"), 1);
    }

    #[tokio::test]
    async fn test_single_region_gets_requested_shard() {
        let fx = fixture(quick_config());
        let mut region = FakeRegion::new(9000);
        register(&fx, &mut region).await;

        fx.coordinator.send(CoordinatorMsg::GetShardHome {
            shard: "7".into(),
            requester: region.region_ref(),
        });

        // The only region wins the allocation: it is told to host the
        // shard and gets the location answer.
        let mut saw_host = false;
        let mut saw_home = false;
        while !(saw_host && saw_home) {
            match recv_from(&mut region, Duration::from_secs(2)).await {
                Some(RegionMsg::HostShard { shard }) => {
                    assert_eq!(shard, "7");
                    saw_host = true;
                    fx.coordinator.send(CoordinatorMsg::ShardStarted {
                        shard,
                        region: region.region_ref().id(),
                    });
                }
                Some(RegionMsg::ShardHome { shard, region: home }) => {
                    assert_eq!(shard, "7");
                    assert_eq!(home, region.region_ref());
                    saw_home = true;
                }
                other => panic!("unexpected message: {}", msg_name(other)),
            }
        }

        // A second request answers from the table without re-allocating.
        let events_before = fx.store.event_count("coordinator/orders");
        fx.coordinator.send(CoordinatorMsg::GetShardHome {
            shard: "7".into(),
            requester: region.region_ref(),
        });
        loop {
            match recv_from(&mut region, Duration::from_secs(2)).await {
                Some(RegionMsg::ShardHome { shard, .. }) => {
                    assert_eq!(shard, "7");
                    break;
                }
                // A stale HostShard resend may still be queued.
                Some(RegionMsg::HostShard { .. }) => {}
                other => panic!("expected ShardHome, got {}", msg_name(other)),
            }
        }
        assert_eq!(fx.store.event_count("coordinator/orders"), events_before);
    }

    #[tokio::test]
    async fn test_host_shard_is_resent_until_acked() {
        let fx = fixture(quick_config());
        let mut region = FakeRegion::new(9000);
        register(&fx, &mut region).await;

        fx.coordinator.send(CoordinatorMsg::GetShardHome {
            shard: "1".into(),
            requester: region.region_ref(),
        });

        let mut host_count = 0;
        for _ in 0..6 {
            match recv_from(&mut region, Duration::from_secs(2)).await {
                Some(RegionMsg::HostShard { .. }) => {
                    host_count += 1;
                    if host_count == 2 {
                        break;
                    }
                }
                Some(RegionMsg::ShardHome { .. }) => {}
                other => panic!("unexpected message: {}", msg_name(other)),
            }
        }
        assert_eq!(host_count, 2, "HostShard was not resent");

        fx.coordinator.send(CoordinatorMsg::ShardStarted {
            shard: "1".into(),
            region: region.region_ref().id(),
        });
    }

    #[tokio::test]
    async fn test_terminated_region_shards_move() {
        let fx = fixture(quick_config());
        let addr_a: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        fx.feed.member_up(addr_a, []);
        fx.feed.member_up("127.0.0.1:9001".parse().unwrap(), []);

        let mut a = FakeRegion::new(9000);
        let mut b = FakeRegion::new(9001);
        register(&fx, &mut a).await;

        fx.coordinator.send(CoordinatorMsg::GetShardHome {
            shard: "3".into(),
            requester: a.region_ref(),
        });
        loop {
            match recv_from(&mut a, Duration::from_secs(2)).await {
                Some(RegionMsg::HostShard { shard }) => {
                    fx.coordinator.send(CoordinatorMsg::ShardStarted {
                        shard,
                        region: a.region_ref().id(),
                    });
                    break;
                }
                Some(_) => {}
                None => panic!("expected HostShard"),
            }
        }

        register(&fx, &mut b).await;

        // Region A dies; its member is removed. The shard lands on B.
        a.kill();
        fx.feed.member_removed(addr_a);

        loop {
            match recv_from(&mut b, Duration::from_secs(2)).await {
                Some(RegionMsg::HostShard { shard }) => {
                    assert_eq!(shard, "3");
                    break;
                }
                Some(_) => {}
                None => panic!("expected HostShard on surviving region"),
            }
        }
    }

    #[tokio::test]
    async fn test_graceful_shutdown_drains_region() {
        let fx = fixture(
            quick_config().with_rebalance_interval(Duration::from_secs(60)),
        );
        let mut a = FakeRegion::new(9000);
        let mut b = FakeRegion::new(9001);
        register(&fx, &mut a).await;

        // Shard 3 lives on A.
        fx.coordinator.send(CoordinatorMsg::GetShardHome {
            shard: "3".into(),
            requester: a.region_ref(),
        });
        loop {
            match recv_from(&mut a, Duration::from_secs(2)).await {
                Some(RegionMsg::HostShard { shard }) => {
                    fx.coordinator.send(CoordinatorMsg::ShardStarted {
                        shard,
                        region: a.region_ref().id(),
                    });
                    break;
                }
                Some(_) => {}
                None => panic!("expected HostShard"),
            }
        }
        register(&fx, &mut b).await;

        fx.coordinator
            .send(CoordinatorMsg::GracefulShutdownRequest(a.region_ref()));

        // Handoff protocol: both regions forget, then A stops the shard.
        let mut begin_acked = 0;
        for region in [&mut a, &mut b] {
            loop {
                match recv_from(region, Duration::from_secs(2)).await {
                    Some(RegionMsg::BeginHandOff { shard, reply }) => {
                        assert_eq!(shard, "3");
                        reply
                            .send(HandoffReply::BeginAck {
                                region: region.region_ref().id(),
                            })
                            .unwrap();
                        begin_acked += 1;
                        break;
                    }
                    Some(_) => {}
                    None => panic!("expected BeginHandOff"),
                }
            }
        }
        assert_eq!(begin_acked, 2);

        loop {
            match recv_from(&mut a, Duration::from_secs(2)).await {
                Some(RegionMsg::HandOff { shard, reply }) => {
                    assert_eq!(shard, "3");
                    reply.send(HandoffReply::Stopped).unwrap();
                    break;
                }
                Some(_) => {}
                None => panic!("expected HandOff"),
            }
        }

        // The drained region is excluded from reallocation: B hosts it.
        loop {
            match recv_from(&mut b, Duration::from_secs(5)).await {
                Some(RegionMsg::HostShard { shard }) => {
                    assert_eq!(shard, "3");
                    break;
                }
                Some(_) => {}
                None => panic!("expected HostShard on remaining region"),
            }
        }
    }

    #[tokio::test]
    async fn test_recovery_rebuilds_table() {
        let config = quick_config();
        let fx = fixture(config.clone());
        let mut region = FakeRegion::new(9000);
        fx.feed.member_up("127.0.0.1:9000".parse().unwrap(), []);
        register(&fx, &mut region).await;

        fx.coordinator.send(CoordinatorMsg::GetShardHome {
            shard: "5".into(),
            requester: region.region_ref(),
        });
        loop {
            match recv_from(&mut region, Duration::from_secs(2)).await {
                Some(RegionMsg::HostShard { shard }) => {
                    fx.coordinator.send(CoordinatorMsg::ShardStarted {
                        shard,
                        region: region.region_ref().id(),
                    });
                    break;
                }
                Some(_) => {}
                None => panic!("expected HostShard"),
            }
        }

        // Stop and restart the coordinator over the same journal.
        fx.coordinator.send(CoordinatorMsg::Stop);
        lifecycle::wait_for_exit(fx.coordinator.terminated_rx()).await;

        let restarted = spawn_coordinator(CoordinatorSettings {
            type_name: "orders".into(),
            config,
            store: Arc::clone(&fx.store) as Arc<dyn EventStore>,
            feed: Arc::clone(&fx.feed) as Arc<dyn MembershipFeed>,
            strategy: Arc::new(LeastLoadedStrategy::new(1, 3)),
        });

        // The region re-registers (same instance id) and the recovered
        // assignment answers immediately, with no new allocation event.
        let events_before = fx.store.event_count("coordinator/orders");
        restarted.send(CoordinatorMsg::Register(region.region_ref()));
        loop {
            match recv_from(&mut region, Duration::from_secs(2)).await {
                Some(RegionMsg::RegisterAck { .. }) => break,
                Some(_) => {}
                None => panic!("expected RegisterAck"),
            }
        }
        restarted.send(CoordinatorMsg::GetShardHome {
            shard: "5".into(),
            requester: region.region_ref(),
        });
        loop {
            match recv_from(&mut region, Duration::from_secs(2)).await {
                Some(RegionMsg::ShardHome { shard, region: home }) => {
                    assert_eq!(shard, "5");
                    assert_eq!(home, region.region_ref());
                    break;
                }
                Some(_) => {}
                None => panic!("expected ShardHome"),
            }
        }
        assert_eq!(fx.store.event_count("coordinator/orders"), events_before);
    }
}
