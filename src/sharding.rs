//! Node-level front end: register entity types, obtain routable handles.

use crate::allocation::{AllocationStrategy, LeastLoadedStrategy};
use crate::cluster::{MemberView, MembershipFeed};
use crate::config::ShardingConfig;
use crate::coordinator::{spawn_coordinator, CoordinatorMsg, CoordinatorRef, CoordinatorSettings};
use crate::entity::{EntityFactory, StopEntity, StopMessageFactory};
use crate::error::{Error, Result};
use crate::journal::EventStore;
use crate::lifecycle;
use crate::region::{spawn_region, RegionMsg, RegionRef, RegionSettings};
use crate::types::{DynMessage, MessageExtractor, ShardStats};
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, OnceCell};
use uuid::Uuid;

/// Everything the runtime knows about one registered entity type, shared by
/// its region and shards.
pub(crate) struct TypeRuntime {
    pub type_name: String,
    pub extractor: Arc<dyn MessageExtractor>,
    pub factory: EntityFactory,
    pub stop_message: StopMessageFactory,
    pub config: ShardingConfig,
    pub store: Arc<dyn EventStore>,
}

/// Where regions find the coordinator of a type: the coordinator is always
/// assumed colocated with the oldest matching member, and whoever hosts the
/// singleton publishes it here under its own node. This registry is the
/// in-process stand-in for transport-level addressing.
#[derive(Default)]
pub struct CoordinatorDirectory {
    entries: DashMap<(String, SocketAddr), CoordinatorRef>,
}

impl CoordinatorDirectory {
    /// Create an empty directory, shared by every node of a cluster.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn publish(&self, type_name: &str, node: SocketAddr, coordinator: CoordinatorRef) {
        self.entries
            .insert((type_name.to_string(), node), coordinator);
    }

    /// Remove a published coordinator, but only the expected instance: a
    /// successor may have published under the same key meanwhile.
    pub(crate) fn retract(&self, type_name: &str, node: SocketAddr, id: Uuid) {
        self.entries
            .remove_if(&(type_name.to_string(), node), |_, c| c.id() == id);
    }

    pub(crate) fn resolve(&self, type_name: &str, node: SocketAddr) -> Option<CoordinatorRef> {
        self.entries
            .get(&(type_name.to_string(), node))
            .map(|entry| entry.value().clone())
            .filter(|c| !lifecycle::has_exited(&c.terminated))
    }
}

/// Definition of an entity type: how to create entities, how to route
/// messages to them, how to stop them, and how to place their shards.
pub struct EntityType {
    name: String,
    factory: EntityFactory,
    extractor: Arc<dyn MessageExtractor>,
    stop_message: StopMessageFactory,
    strategy: Option<Arc<dyn AllocationStrategy>>,
}

impl EntityType {
    /// Define a type. The default stop message is [`StopEntity`], which the
    /// entity runtime honors by itself.
    pub fn new(
        name: impl Into<String>,
        factory: EntityFactory,
        extractor: Arc<dyn MessageExtractor>,
    ) -> Self {
        Self {
            name: name.into(),
            factory,
            extractor,
            stop_message: Arc::new(|| Box::new(StopEntity)),
            strategy: None,
        }
    }

    /// Use a custom stop message for passivation-by-default and handoff.
    /// Entities answer it by returning [`crate::Flow::Stop`].
    pub fn with_stop_message(mut self, stop_message: StopMessageFactory) -> Self {
        self.stop_message = stop_message;
        self
    }

    /// Use a custom allocation strategy instead of the least-loaded
    /// default.
    pub fn with_allocation_strategy(mut self, strategy: Arc<dyn AllocationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

struct NodeInner {
    node: SocketAddr,
    feed: Arc<dyn MembershipFeed>,
    store: Arc<dyn EventStore>,
    directory: Arc<CoordinatorDirectory>,
    config: ShardingConfig,
    types: DashMap<String, Arc<OnceCell<ShardingHandle>>>,
}

/// Per-node entry point of the sharding runtime.
///
/// Registering a type is init-once per name: concurrent and repeated
/// `start` calls for the same type share one creation and get the same
/// handle back.
#[derive(Clone)]
pub struct ClusterSharding {
    inner: Arc<NodeInner>,
}

impl ClusterSharding {
    /// Wire up the runtime for one node. Nodes of the same in-process
    /// cluster share the feed, the store, and the directory.
    pub fn new(
        node: SocketAddr,
        feed: Arc<dyn MembershipFeed>,
        store: Arc<dyn EventStore>,
        directory: Arc<CoordinatorDirectory>,
        config: ShardingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                node,
                feed,
                store,
                directory,
                config,
                types: DashMap::new(),
            }),
        }
    }

    /// This node's address.
    pub fn node(&self) -> SocketAddr {
        self.inner.node
    }

    /// Register an entity type on this node and get its routable handle.
    /// The first registration under a name wins; later calls return the
    /// existing handle.
    pub async fn start(&self, entity_type: EntityType) -> Result<ShardingHandle> {
        self.start_internal(entity_type, false).await
    }

    /// Register a routing-only handle for a type hosted on other nodes.
    pub async fn start_proxy(
        &self,
        type_name: impl Into<String>,
        extractor: Arc<dyn MessageExtractor>,
    ) -> Result<ShardingHandle> {
        let entity_type = EntityType::new(
            type_name,
            Arc::new(|_: &crate::types::EntityId| -> Box<dyn crate::entity::Entity> {
                unreachable!("proxies never create entities")
            }),
            extractor,
        );
        self.start_internal(entity_type, true).await
    }

    async fn start_internal(
        &self,
        entity_type: EntityType,
        proxy_only: bool,
    ) -> Result<ShardingHandle> {
        let cell = self
            .inner
            .types
            .entry(entity_type.name.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let handle = cell
            .get_or_try_init(|| async { self.start_type(entity_type, proxy_only) })
            .await?;
        Ok(handle.clone())
    }

    fn start_type(&self, entity_type: EntityType, proxy_only: bool) -> Result<ShardingHandle> {
        if entity_type.name.is_empty() {
            return Err(Error::Config("entity type name must not be empty".into()));
        }
        let strategy = entity_type.strategy.unwrap_or_else(|| {
            Arc::new(LeastLoadedStrategy::new(
                self.inner.config.rebalance_threshold,
                self.inner.config.max_simultaneous_rebalances,
            ))
        });
        let runtime = Arc::new(TypeRuntime {
            type_name: entity_type.name.clone(),
            extractor: entity_type.extractor,
            factory: entity_type.factory,
            stop_message: entity_type.stop_message,
            config: self.inner.config.clone(),
            store: Arc::clone(&self.inner.store),
        });

        // Only hosting nodes take a turn at running the coordinator.
        if !proxy_only {
            spawn_singleton_manager(SingletonSettings {
                node: self.inner.node,
                type_name: entity_type.name.clone(),
                config: self.inner.config.clone(),
                store: Arc::clone(&self.inner.store),
                feed: Arc::clone(&self.inner.feed),
                directory: Arc::clone(&self.inner.directory),
                strategy,
            });
        }

        let region = spawn_region(RegionSettings {
            runtime,
            node: self.inner.node,
            feed: Arc::clone(&self.inner.feed),
            directory: Arc::clone(&self.inner.directory),
            proxy_only,
        });
        Ok(ShardingHandle {
            type_name: entity_type.name.into(),
            region,
        })
    }
}

/// Routable handle for one entity type on one node.
#[derive(Clone)]
pub struct ShardingHandle {
    type_name: Arc<str>,
    region: RegionRef,
}

impl ShardingHandle {
    /// The entity type this handle routes for.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The local region behind this handle.
    pub fn region(&self) -> &RegionRef {
        &self.region
    }

    /// Send an application message into the delivery pipeline. Delivery is
    /// best effort, at most once; the error only reports a dead region.
    pub fn send(&self, message: DynMessage) -> Result<()> {
        self.region
            .forward(message)
            .map_err(|_| Error::RegionTerminated)
    }

    /// Ask the coordinator to relocate every local shard, then terminate
    /// the local region once it holds nothing.
    pub fn graceful_shutdown(&self) {
        self.region.send(RegionMsg::GracefulShutdown);
    }

    /// Nodes currently hosting registered regions of this type.
    pub async fn current_regions(&self) -> Result<HashSet<SocketAddr>> {
        let (tx, rx) = oneshot::channel();
        if !self.region.send(RegionMsg::GetCurrentRegions { reply: tx }) {
            return Err(Error::RegionTerminated);
        }
        rx.await.map_err(|_| Error::Timeout)
    }

    /// Entity counts of the shards hosted on this node.
    pub async fn shard_stats(&self) -> Result<Vec<ShardStats>> {
        let (tx, rx) = oneshot::channel();
        if !self.region.send(RegionMsg::GetShardStats { reply: tx }) {
            return Err(Error::RegionTerminated);
        }
        rx.await.map_err(|_| Error::Timeout)
    }
}

struct SingletonSettings {
    node: SocketAddr,
    type_name: String,
    config: ShardingConfig,
    store: Arc<dyn EventStore>,
    feed: Arc<dyn MembershipFeed>,
    directory: Arc<CoordinatorDirectory>,
    strategy: Arc<dyn AllocationStrategy>,
}

/// Oldest-member singleton keeper: runs the coordinator while this node is
/// the oldest matching member, hands it over when it stops being that.
fn spawn_singleton_manager(settings: SingletonSettings) {
    tokio::spawn(async move {
        let subscription = settings.feed.subscribe();
        let mut members = MemberView::new(settings.config.role.clone(), subscription.members);
        let mut events = subscription.events;
        let mut running: Option<CoordinatorRef> = None;
        // The periodic pass also restarts an instance that crashed while we
        // still hold the singleton.
        let mut recheck = tokio::time::interval(settings.config.retry_interval);
        recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            evaluate(&settings, &members, &mut running);
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => {
                        members.apply(&event);
                    }
                    None => break,
                },
                _ = recheck.tick() => {}
            }
        }
        if let Some(coordinator) = running.take() {
            settings
                .directory
                .retract(&settings.type_name, settings.node, coordinator.id());
            coordinator.send(CoordinatorMsg::Stop);
        }
    });
}

fn evaluate(
    settings: &SingletonSettings,
    members: &MemberView,
    running: &mut Option<CoordinatorRef>,
) {
    // A crashed instance is restarted here as long as we still hold the
    // singleton; its replacement recovers from the journal.
    if let Some(coordinator) = running.as_ref() {
        if lifecycle::has_exited(&coordinator.terminated) {
            settings
                .directory
                .retract(&settings.type_name, settings.node, coordinator.id());
            *running = None;
        }
    }

    let is_oldest = members.oldest().map(|m| m.addr) == Some(settings.node);
    match (is_oldest, running.is_some()) {
        (true, false) => {
            tracing::info!(
                type_name = %settings.type_name,
                node = %settings.node,
                "Oldest member, starting coordinator"
            );
            let coordinator = spawn_coordinator(CoordinatorSettings {
                type_name: settings.type_name.clone(),
                config: settings.config.clone(),
                store: Arc::clone(&settings.store),
                feed: Arc::clone(&settings.feed),
                strategy: Arc::clone(&settings.strategy),
            });
            settings
                .directory
                .publish(&settings.type_name, settings.node, coordinator.clone());
            *running = Some(coordinator);
        }
        (false, true) => {
            let coordinator = running.take().expect("checked above");
            tracing::info!(
                type_name = %settings.type_name,
                node = %settings.node,
                "No longer oldest, stopping coordinator"
            );
            settings
                .directory
                .retract(&settings.type_name, settings.node, coordinator.id());
            coordinator.send(CoordinatorMsg::Stop);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalMembership;
    use crate::entity::{Entity, EntityContext, Flow};
    use crate::journal::MemoryJournal;
    use crate::types::{EntityId, ShardId};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl Entity for Noop {
        async fn receive(&mut self, _message: DynMessage, _ctx: &EntityContext) -> Flow {
            Flow::Continue
        }
    }

    struct NoopExtractor;

    impl MessageExtractor for NoopExtractor {
        fn try_extract_entity(
            &self,
            message: DynMessage,
        ) -> std::result::Result<(EntityId, DynMessage), DynMessage> {
            Ok(("e".into(), message))
        }

        fn extract_shard(&self, _message: &DynMessage) -> ShardId {
            "s".into()
        }
    }

    fn test_node(port: u16) -> ClusterSharding {
        let feed = Arc::new(LocalMembership::new());
        feed.member_up(format!("127.0.0.1:{port}").parse().unwrap(), []);
        ClusterSharding::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            feed,
            Arc::new(MemoryJournal::new()),
            CoordinatorDirectory::new(),
            ShardingConfig::default(),
        )
    }

    fn noop_type(name: &str) -> EntityType {
        EntityType::new(
            name,
            Arc::new(|_: &EntityId| -> Box<dyn Entity> { Box::new(Noop) }),
            Arc::new(NoopExtractor),
        )
    }

    #[tokio::test]
    async fn test_start_is_init_once_per_type() {
        let sharding = test_node(9100);
        let first = sharding.start(noop_type("orders")).await.unwrap();
        let second = sharding.start(noop_type("orders")).await.unwrap();
        assert_eq!(first.region(), second.region());

        let other = sharding.start(noop_type("payments")).await.unwrap();
        assert_ne!(first.region(), other.region());
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_creation() {
        let sharding = test_node(9101);
        let a = sharding.clone();
        let b = sharding.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.start(noop_type("orders")).await.unwrap() }),
            tokio::spawn(async move { b.start(noop_type("orders")).await.unwrap() }),
        );
        assert_eq!(first.unwrap().region(), second.unwrap().region());
    }

    #[tokio::test]
    async fn test_empty_type_name_is_rejected() {
        let sharding = test_node(9102);
        assert!(sharding.start(noop_type("")).await.is_err());
    }

    #[tokio::test]
    async fn test_directory_retract_is_instance_scoped() {
        let directory = CoordinatorDirectory::new();
        let node: SocketAddr = "127.0.0.1:9103".parse().unwrap();
        let store: Arc<dyn EventStore> = Arc::new(MemoryJournal::new());
        let feed: Arc<dyn MembershipFeed> = Arc::new(LocalMembership::new());

        let first = spawn_coordinator(CoordinatorSettings {
            type_name: "orders".into(),
            config: ShardingConfig::default(),
            store: Arc::clone(&store),
            feed: Arc::clone(&feed),
            strategy: Arc::new(LeastLoadedStrategy::default()),
        });
        let second = spawn_coordinator(CoordinatorSettings {
            type_name: "orders".into(),
            config: ShardingConfig::default(),
            store,
            feed,
            strategy: Arc::new(LeastLoadedStrategy::default()),
        });

        directory.publish("orders", node, first.clone());
        directory.publish("orders", node, second.clone());
        // Retracting the superseded instance leaves the successor in place.
        directory.retract("orders", node, first.id());
        let resolved = directory.resolve("orders", node).unwrap();
        assert_eq!(resolved.id(), second.id());

        first.send(CoordinatorMsg::Stop);
        second.send(CoordinatorMsg::Stop);
        // A terminated coordinator stops resolving.
        crate::lifecycle::wait_for_exit(second.terminated_rx()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(directory.resolve("orders", node).is_none());
    }
}
