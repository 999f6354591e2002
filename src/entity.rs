//! Entity actors and their runtime.
//!
//! An entity is application code keyed by [`EntityId`], created lazily by
//! its shard on first message and addressed only through the delivery
//! pipeline. The runtime wraps each entity in its own task; the shard holds
//! the sender and a termination signal.

use crate::lifecycle;
use crate::shard::ShardMsg;
use crate::types::{DynMessage, EntityId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// What the entity wants to happen after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep running.
    Continue,

    /// Stop this entity. Used to honor a custom stop message during
    /// passivation or handoff.
    Stop,
}

/// Application logic of one entity.
#[async_trait]
pub trait Entity: Send + 'static {
    /// Handle one message. Messages arrive one at a time, in order.
    async fn receive(&mut self, message: DynMessage, ctx: &EntityContext) -> Flow;
}

/// Creates the entity behind an id. Called by the shard on first message
/// and again on every restart.
pub type EntityFactory = Arc<dyn Fn(&EntityId) -> Box<dyn Entity> + Send + Sync>;

/// Produces the stop message sent to entities during passivation-by-default
/// and handoff. Cloned per recipient since messages are not `Clone`.
pub type StopMessageFactory = Arc<dyn Fn() -> DynMessage + Send + Sync>;

/// Built-in stop message, honored by the entity runtime itself: an entity
/// receiving it stops without its `receive` being called. Entity types with
/// shutdown work of their own configure a custom stop message instead and
/// answer it with [`Flow::Stop`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StopEntity;

/// What an entity knows about itself and its owning shard.
pub struct EntityContext {
    entity_id: EntityId,
    shard: mpsc::UnboundedSender<ShardMsg>,
}

impl EntityContext {
    /// This entity's id.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Request graceful stop. The shard buffers new messages for this
    /// entity and delivers `stop_message`; if messages arrive before the
    /// entity actually terminates it is restarted with them intact.
    pub fn passivate(&self, stop_message: DynMessage) {
        let _ = self.shard.send(ShardMsg::Passivate {
            entity_id: self.entity_id.clone(),
            stop_message,
        });
    }
}

/// Shard-side handle to a running entity.
#[derive(Clone)]
pub(crate) struct EntityRef {
    tx: mpsc::UnboundedSender<DynMessage>,
    terminated: watch::Receiver<bool>,
}

impl EntityRef {
    /// Deliver a payload, handing it back when the entity already exited so
    /// the shard can buffer it instead of losing it.
    pub(crate) fn send(&self, message: DynMessage) -> std::result::Result<(), DynMessage> {
        self.tx.send(message).map_err(|e| e.0)
    }

    pub(crate) fn terminated_rx(&self) -> watch::Receiver<bool> {
        self.terminated.clone()
    }
}

/// Spawn the runtime task for one entity.
pub(crate) fn spawn_entity(
    entity_id: EntityId,
    factory: &EntityFactory,
    shard: mpsc::UnboundedSender<ShardMsg>,
) -> EntityRef {
    let (tx, mut rx) = mpsc::unbounded_channel::<DynMessage>();
    let (guard, terminated) = lifecycle::exit_pair();
    let mut entity = factory(&entity_id);
    let ctx = EntityContext {
        entity_id: entity_id.clone(),
        shard,
    };

    tokio::spawn(async move {
        let _guard = guard;
        while let Some(message) = rx.recv().await {
            if message.downcast_ref::<StopEntity>().is_some() {
                break;
            }
            if entity.receive(message, &ctx).await == Flow::Stop {
                break;
            }
        }
        tracing::debug!(entity_id = %ctx.entity_id, "Entity stopped");
    });

    EntityRef { tx, terminated }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::wait_for_exit;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Collector {
        seen: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl Entity for Collector {
        async fn receive(&mut self, message: DynMessage, _ctx: &EntityContext) -> Flow {
            if let Ok(n) = message.downcast::<u32>() {
                if *n == u32::MAX {
                    return Flow::Stop;
                }
                self.seen.lock().push(*n);
            }
            Flow::Continue
        }
    }

    fn collector_factory(seen: Arc<Mutex<Vec<u32>>>) -> EntityFactory {
        Arc::new(move |_id: &EntityId| -> Box<dyn Entity> {
            Box::new(Collector {
                seen: Arc::clone(&seen),
            })
        })
    }

    fn shard_sink() -> mpsc::UnboundedSender<ShardMsg> {
        mpsc::unbounded_channel().0
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let entity = spawn_entity("e1".into(), &collector_factory(Arc::clone(&seen)), shard_sink());

        for n in 0..10u32 {
            assert!(entity.send(Box::new(n)).is_ok());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stop_entity_terminates_without_delivery() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let entity = spawn_entity("e1".into(), &collector_factory(Arc::clone(&seen)), shard_sink());

        entity.send(Box::new(StopEntity)).unwrap();
        tokio::time::timeout(Duration::from_secs(1), wait_for_exit(entity.terminated_rx()))
            .await
            .unwrap();
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_flow_stop_terminates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let entity = spawn_entity("e1".into(), &collector_factory(seen), shard_sink());

        entity.send(Box::new(u32::MAX)).unwrap();
        tokio::time::timeout(Duration::from_secs(1), wait_for_exit(entity.terminated_rx()))
            .await
            .unwrap();
        assert!(entity.send(Box::new(1u32)).is_err());
    }
}
