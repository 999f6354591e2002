//! Region actor implementation.

use super::buffer::MessageBuffer;
use super::{HandoffReply, RegionMsg, RegionRef};
use crate::cluster::{ClusterEvent, MemberView, MembershipFeed};
use crate::coordinator::{CoordinatorMsg, CoordinatorRef};
use crate::error::RoutingError;
use crate::lifecycle;
use crate::shard::{spawn_shard, ShardHandle, ShardMsg};
use crate::sharding::{CoordinatorDirectory, TypeRuntime};
use crate::types::{DynMessage, RegionId, ShardId, ShardStats};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Dependencies of one region instance.
pub(crate) struct RegionSettings {
    pub runtime: Arc<TypeRuntime>,
    pub node: SocketAddr,
    pub feed: Arc<dyn MembershipFeed>,
    pub directory: Arc<CoordinatorDirectory>,
    /// Routing-only: never hosts shards, never receives allocations.
    pub proxy_only: bool,
}

/// Spawn the region actor for this node and entity type.
pub(crate) fn spawn_region(settings: RegionSettings) -> RegionRef {
    let (tx, rx) = mpsc::unbounded_channel();
    let (guard, terminated) = lifecycle::exit_pair();
    let self_ref = RegionRef {
        id: Uuid::new_v4(),
        node: settings.node,
        tx,
        terminated,
    };

    let subscription = settings.feed.subscribe();
    let members = MemberView::new(settings.runtime.config.role.clone(), subscription.members);
    let buffer_capacity = settings.runtime.config.buffer_capacity;
    let actor = RegionActor {
        runtime: settings.runtime,
        directory: settings.directory,
        proxy_only: settings.proxy_only,
        self_ref: self_ref.clone(),
        coordinator: None,
        watched_coordinator: None,
        members,
        current_oldest: None,
        region_by_shard: HashMap::new(),
        remote_shards: HashMap::new(),
        watched_regions: HashSet::new(),
        local_shards: HashMap::new(),
        buffers: MessageBuffer::new(buffer_capacity),
        handing_off: HashSet::new(),
        graceful: false,
    };

    tokio::spawn(async move {
        let _guard = guard;
        actor.run(rx, subscription.events).await;
    });
    self_ref
}

struct RegionActor {
    runtime: Arc<TypeRuntime>,
    directory: Arc<CoordinatorDirectory>,
    proxy_only: bool,
    self_ref: RegionRef,
    coordinator: Option<CoordinatorRef>,
    watched_coordinator: Option<Uuid>,
    members: MemberView,
    current_oldest: Option<SocketAddr>,
    /// Soft location knowledge, partial and rebuildable. Lost entries are
    /// simply re-requested from the coordinator.
    region_by_shard: HashMap<ShardId, RegionRef>,
    remote_shards: HashMap<RegionId, HashSet<ShardId>>,
    watched_regions: HashSet<RegionId>,
    local_shards: HashMap<ShardId, ShardHandle>,
    buffers: MessageBuffer,
    handing_off: HashSet<ShardId>,
    graceful: bool,
}

impl RegionActor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<RegionMsg>,
        mut events: mpsc::UnboundedReceiver<ClusterEvent>,
    ) {
        tracing::info!(
            type_name = %self.runtime.type_name,
            region = %self.self_ref.id(),
            node = %self.self_ref.node(),
            proxy = self.proxy_only,
            "Region started"
        );
        self.current_oldest = self.members.oldest().map(|m| m.addr);
        self.register();

        let mut retry = tokio::time::interval(self.runtime.config.retry_interval);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut feed_open = true;

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                maybe = events.recv(), if feed_open => match maybe {
                    Some(event) => self.cluster_changed(event),
                    None => feed_open = false,
                },
                _ = retry.tick() => self.retry_tick(),
            }
            if self.graceful && self.local_shards.is_empty() && self.buffers.is_empty() {
                tracing::info!(
                    type_name = %self.runtime.type_name,
                    region = %self.self_ref.id(),
                    "Region drained, terminating"
                );
                break;
            }
        }
    }

    fn handle(&mut self, msg: RegionMsg) {
        match msg {
            RegionMsg::Deliver(message) => self.deliver(message),
            RegionMsg::RegisterAck { coordinator } => self.register_ack(coordinator),
            RegionMsg::ShardHome { shard, region } => self.shard_home(shard, region),
            RegionMsg::HostShard { shard } => self.host_shard(shard),
            RegionMsg::BeginHandOff { shard, reply } => self.begin_hand_off(shard, &reply),
            RegionMsg::HandOff { shard, reply } => self.hand_off(shard, reply),
            RegionMsg::GracefulShutdown => {
                if !self.graceful {
                    tracing::info!(region = %self.self_ref.id(), "Graceful shutdown requested");
                    self.graceful = true;
                }
                self.send_graceful_request();
            }
            RegionMsg::GetCurrentRegions { reply } => match &self.coordinator {
                Some(coordinator) => {
                    coordinator.send(CoordinatorMsg::GetCurrentRegions { reply });
                }
                None => {
                    let _ = reply.send(HashSet::new());
                }
            },
            RegionMsg::GetShardStats { reply } => self.shard_stats(reply),
            RegionMsg::CoordinatorTerminated(id) => {
                if self.watched_coordinator == Some(id) {
                    tracing::info!(region = %self.self_ref.id(), "Coordinator lost");
                    self.coordinator = None;
                    self.watched_coordinator = None;
                }
            }
            RegionMsg::RemoteRegionTerminated(region) => self.remote_region_terminated(region),
            RegionMsg::ShardTerminated(shard) => self.shard_terminated(shard),
            RegionMsg::RestartShard(shard) => self.restart_shard(shard),
        }
    }

    // ---- delivery ----

    fn deliver(&mut self, message: DynMessage) {
        let shard = self.runtime.extractor.extract_shard(&message);
        if shard.is_empty() {
            tracing::warn!(
                type_name = %self.runtime.type_name,
                error = %RoutingError::EmptyShardId,
                "Dropping message"
            );
            return;
        }
        match self.region_by_shard.get(&shard).cloned() {
            Some(home) if home == self.self_ref => self.deliver_local(&shard, message),
            Some(home) => {
                // Fast path: forward straight to the owning region.
                if let Err(message) = home.forward(message) {
                    // The remote died under us; buffer until the watch
                    // notice purges the mapping and a new home is resolved.
                    self.region_by_shard.remove(&shard);
                    self.buffer_unresolved(shard, message);
                }
            }
            None => self.buffer_unresolved(shard, message),
        }
    }

    fn deliver_local(&mut self, shard: &ShardId, message: DynMessage) {
        let handle = self.get_or_create_shard(shard);
        if let Err(message) = handle.forward(message) {
            // Stale handle: the shard exited but the notice is still in our
            // inbox. Recreate once and retry.
            self.local_shards.remove(shard);
            let fresh = self.get_or_create_shard(shard);
            if fresh.forward(message).is_err() {
                tracing::warn!(shard_id = %shard, "Local shard unavailable, dropping message");
            }
        }
    }

    fn buffer_unresolved(&mut self, shard: ShardId, message: DynMessage) {
        if !self.buffers.contains(&shard) {
            // One outstanding location request per shard; later messages
            // just queue behind it.
            self.request_shard_home(shard.clone());
        }
        if !self.buffers.enqueue(&shard, message) {
            tracing::debug!(
                shard_id = %shard,
                capacity = self.runtime.config.buffer_capacity,
                "Region buffer full, dropping message"
            );
        }
    }

    fn flush(&mut self, shard: &ShardId) {
        let queued = self.buffers.drain(shard);
        if queued.is_empty() {
            return;
        }
        tracing::debug!(shard_id = %shard, count = queued.len(), "Delivering buffered messages");
        match self.region_by_shard.get(shard).cloned() {
            Some(home) if home == self.self_ref => {
                for message in queued {
                    self.deliver_local(shard, message);
                }
            }
            Some(home) => {
                for message in queued {
                    if home.forward(message).is_err() {
                        tracing::debug!(shard_id = %shard, "Remote region gone during flush");
                        break;
                    }
                }
            }
            None => {
                tracing::debug!(shard_id = %shard, "Location lost before flush, dropping buffer");
            }
        }
    }

    // ---- coordinator protocol ----

    fn register(&mut self) {
        let Some(oldest) = self.members.oldest() else {
            tracing::debug!(type_name = %self.runtime.type_name, "No matching members yet");
            return;
        };
        let Some(coordinator) = self.directory.resolve(&self.runtime.type_name, oldest.addr)
        else {
            tracing::debug!(
                type_name = %self.runtime.type_name,
                oldest = %oldest.addr,
                "Coordinator not reachable yet"
            );
            return;
        };
        let msg = if self.proxy_only {
            CoordinatorMsg::RegisterProxy(self.self_ref.clone())
        } else {
            CoordinatorMsg::Register(self.self_ref.clone())
        };
        coordinator.send(msg);
    }

    fn register_ack(&mut self, coordinator: CoordinatorRef) {
        if self.watched_coordinator != Some(coordinator.id()) {
            let id = coordinator.id();
            let tx = self.self_ref.tx.clone();
            lifecycle::notify_on_exit(coordinator.terminated_rx(), move || {
                let _ = tx.send(RegionMsg::CoordinatorTerminated(id));
            });
            self.watched_coordinator = Some(id);
            tracing::debug!(region = %self.self_ref.id(), "Registered with coordinator");
        }
        self.coordinator = Some(coordinator);

        for shard in self.buffers.keys() {
            self.request_shard_home(shard);
        }
        if self.graceful {
            self.send_graceful_request();
        }
    }

    fn request_shard_home(&self, shard: ShardId) {
        if let Some(coordinator) = &self.coordinator {
            coordinator.send(CoordinatorMsg::GetShardHome {
                shard,
                requester: self.self_ref.clone(),
            });
        }
    }

    fn shard_home(&mut self, shard: ShardId, region: RegionRef) {
        if self.handing_off.contains(&shard) {
            return;
        }
        tracing::debug!(shard_id = %shard, region = %region.id(), "Shard home resolved");
        self.region_by_shard.insert(shard.clone(), region.clone());

        if region == self.self_ref {
            self.get_or_create_shard(&shard);
        } else {
            self.remote_shards
                .entry(region.id())
                .or_default()
                .insert(shard.clone());
            if self.watched_regions.insert(region.id()) {
                let id = region.id();
                let tx = self.self_ref.tx.clone();
                lifecycle::notify_on_exit(region.terminated_rx(), move || {
                    let _ = tx.send(RegionMsg::RemoteRegionTerminated(id));
                });
            }
        }
        self.flush(&shard);
    }

    fn host_shard(&mut self, shard: ShardId) {
        if self.proxy_only {
            tracing::warn!(shard_id = %shard, "Proxy asked to host a shard, ignoring");
            return;
        }
        self.region_by_shard
            .insert(shard.clone(), self.self_ref.clone());
        self.get_or_create_shard(&shard);
        self.flush(&shard);
        if let Some(coordinator) = &self.coordinator {
            coordinator.send(CoordinatorMsg::ShardStarted {
                shard,
                region: self.self_ref.id(),
            });
        }
    }

    fn begin_hand_off(&mut self, shard: ShardId, reply: &mpsc::UnboundedSender<HandoffReply>) {
        tracing::debug!(shard_id = %shard, "Handoff beginning, forgetting location");
        if let Some(home) = self.region_by_shard.remove(&shard) {
            if home != self.self_ref {
                if let Some(shards) = self.remote_shards.get_mut(&home.id()) {
                    shards.remove(&shard);
                }
            }
        }
        let _ = reply.send(HandoffReply::BeginAck {
            region: self.self_ref.id(),
        });
    }

    fn hand_off(&mut self, shard: ShardId, reply: mpsc::UnboundedSender<HandoffReply>) {
        // Messages buffered since BeginHandOff may have been forwarded here
        // by other regions; replaying them after relocation would reorder.
        let dropped = self.buffers.drop_key(&shard);
        if dropped > 0 {
            tracing::warn!(shard_id = %shard, count = dropped, "Dropped buffered messages on handoff");
        }
        match self.local_shards.get(&shard) {
            Some(handle) => {
                self.handing_off.insert(shard.clone());
                handle.send(ShardMsg::HandOff {
                    shard_id: shard,
                    reply,
                });
            }
            None => {
                let _ = reply.send(HandoffReply::Stopped);
            }
        }
    }

    fn send_graceful_request(&self) {
        if let Some(coordinator) = &self.coordinator {
            coordinator.send(CoordinatorMsg::GracefulShutdownRequest(
                self.self_ref.clone(),
            ));
        }
    }

    // ---- liveness ----

    fn cluster_changed(&mut self, event: ClusterEvent) {
        self.members.apply(&event);
        let oldest = self.members.oldest().map(|m| m.addr);
        if oldest != self.current_oldest {
            // The coordinator moves with the oldest member: drop the cached
            // ref and start over.
            tracing::info!(
                region = %self.self_ref.id(),
                oldest = ?oldest,
                "Oldest member changed, re-registering"
            );
            self.current_oldest = oldest;
            self.coordinator = None;
            self.watched_coordinator = None;
            self.register();
        }
    }

    fn remote_region_terminated(&mut self, region: RegionId) {
        self.watched_regions.remove(&region);
        if let Some(shards) = self.remote_shards.remove(&region) {
            tracing::debug!(
                region = %region,
                count = shards.len(),
                "Purging locations of terminated region"
            );
            for shard in shards {
                self.region_by_shard.remove(&shard);
            }
        }
    }

    fn shard_terminated(&mut self, shard: ShardId) {
        self.local_shards.remove(&shard);
        if self.handing_off.remove(&shard) {
            tracing::debug!(shard_id = %shard, "Shard stopped after handoff");
            return;
        }
        tracing::warn!(shard_id = %shard, "Shard terminated unexpectedly");
        if self.runtime.config.remember_entities {
            let backoff = self.runtime.config.entity_restart_backoff;
            let tx = self.self_ref.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let _ = tx.send(RegionMsg::RestartShard(shard));
            });
        }
        // Without entity remembering the shard is recreated lazily by the
        // next message; nothing to do now.
    }

    fn restart_shard(&mut self, shard: ShardId) {
        if self.graceful || self.handing_off.contains(&shard) {
            return;
        }
        if self.region_by_shard.get(&shard) == Some(&self.self_ref)
            && !self.local_shards.contains_key(&shard)
        {
            tracing::info!(shard_id = %shard, "Restarting shard");
            self.get_or_create_shard(&shard);
        }
    }

    fn retry_tick(&mut self) {
        if self.coordinator.is_none() {
            self.register();
            return;
        }
        for shard in self.buffers.keys() {
            self.request_shard_home(shard);
        }
        if self.graceful {
            self.send_graceful_request();
        }
    }

    // ---- local shards ----

    fn get_or_create_shard(&mut self, shard: &ShardId) -> ShardHandle {
        if let Some(handle) = self.local_shards.get(shard) {
            return handle.clone();
        }
        tracing::info!(
            type_name = %self.runtime.type_name,
            shard_id = %shard,
            "Starting shard"
        );
        let handle = spawn_shard(Arc::clone(&self.runtime), shard.clone());
        let tx = self.self_ref.tx.clone();
        let id = shard.clone();
        lifecycle::notify_on_exit(handle.terminated_rx(), move || {
            let _ = tx.send(RegionMsg::ShardTerminated(id));
        });
        self.local_shards.insert(shard.clone(), handle.clone());
        handle
    }

    fn shard_stats(&self, reply: oneshot::Sender<Vec<ShardStats>>) {
        let handles: Vec<ShardHandle> = self.local_shards.values().cloned().collect();
        tokio::spawn(async move {
            let mut stats = Vec::with_capacity(handles.len());
            for handle in handles {
                let (tx, rx) = oneshot::channel();
                if handle.send(ShardMsg::GetStats { reply: tx }) {
                    if let Ok(Ok(shard)) =
                        tokio::time::timeout(Duration::from_secs(1), rx).await
                    {
                        stats.push(shard);
                    }
                }
            }
            let _ = reply.send(stats);
        });
    }
}
