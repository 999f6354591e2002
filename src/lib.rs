//! Entity sharding with coordinated placement and graceful handoff.
//!
//! This crate distributes many stateful, uniquely-identified entities
//! across cooperating nodes, routes messages to the right entity no matter
//! where the caller is, and relocates whole shards (buckets of entities)
//! between nodes as membership changes. At most one live instance of an
//! entity ever runs cluster-wide.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                 ShardingHandle.send               │
//! └───────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌───────────────────────────────────────────────────┐
//! │ Region (one per node)                             │
//! │  • local shard   → deliver                        │
//! │  • remote shard  → forward to owning region       │
//! │  • unknown shard → buffer, ask the coordinator    │
//! └───────────────────────────────────────────────────┘
//!        │                                   ▲
//!        ▼                                   │ ShardHome / HostShard
//! ┌──────────────┐    ┌─────────────────────────────┐
//! │ Shard        │    │ Coordinator (one, elected)  │
//! │  entity      │    │  durable shard→region table │
//! │  lifecycle   │    │  allocation + rebalancing   │
//! └──────────────┘    └─────────────────────────────┘
//! ```
//!
//! The coordinator records every placement decision in an event-sourced
//! journal before acting on it, so a restarted coordinator recovers the
//! exact table. Rebalancing uses a three-party handoff (every region
//! forgets the location, the owner drains the shard, the coordinator
//! reallocates) so a shard never runs in two places at once.
//!
//! Cluster membership, the durable store, and singleton election are
//! consumed through the [`MembershipFeed`], [`EventStore`], and
//! [`CoordinatorDirectory`] seams; in-process implementations ship for
//! tests and single-process clusters.
//!
//! # Example
//!
//! ```rust,ignore
//! use drover::{ClusterSharding, CoordinatorDirectory, EntityType, LocalMembership,
//!              MemoryJournal, ShardingConfig};
//! use std::sync::Arc;
//!
//! let feed = Arc::new(LocalMembership::new());
//! let store = Arc::new(MemoryJournal::new());
//! let directory = CoordinatorDirectory::new();
//!
//! let node = "127.0.0.1:9000".parse()?;
//! feed.member_up(node, []);
//! let sharding = ClusterSharding::new(node, feed, store, directory,
//!                                     ShardingConfig::default());
//!
//! let counters = sharding
//!     .start(EntityType::new("counters", factory, extractor))
//!     .await?;
//! counters.send(Box::new(Increment { counter_id: "c-17".into() }))?;
//! ```

pub mod allocation;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod journal;
pub mod region;
pub mod shard;
pub mod sharding;
pub mod testing;
pub mod types;

mod lifecycle;
mod rebalance;

pub use allocation::{AllocationStrategy, Allocations, LeastLoadedStrategy};
pub use cluster::{ClusterEvent, LocalMembership, MembershipFeed, MembershipSubscription};
pub use config::ShardingConfig;
pub use coordinator::{CoordinatorEvent, CoordinatorState};
pub use entity::{Entity, EntityContext, EntityFactory, Flow, StopEntity, StopMessageFactory};
pub use error::{AllocationError, Error, HandoffError, PersistenceError, Result, RoutingError};
pub use journal::{EventStore, MemoryJournal, SnapshotRecord};
pub use region::RegionRef;
pub use shard::{ShardEvent, ShardState};
pub use sharding::{ClusterSharding, CoordinatorDirectory, EntityType, ShardingHandle};
pub use types::{DynMessage, EntityId, Member, MessageExtractor, RegionId, ShardId, ShardStats};
