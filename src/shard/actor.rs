//! Shard actor implementation.

use super::state::{ShardEvent, ShardState};
use super::{ShardHandle, ShardMsg};
use crate::entity::{spawn_entity, EntityRef};
use crate::error::{Result, RoutingError};
use crate::journal::Journaled;
use crate::lifecycle;
use crate::region::buffer::MessageBuffer;
use crate::region::HandoffReply;
use crate::sharding::TypeRuntime;
use crate::types::{DynMessage, EntityId, ShardId, ShardStats};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Whether the actor keeps running after a message.
enum Step {
    Continue,
    Stop,
}

/// Spawn the actor for one shard. When entity remembering is enabled the
/// actor first replays its journal and re-instantiates every remembered
/// entity; messages arriving meanwhile wait in its inbox.
pub(crate) fn spawn_shard(runtime: Arc<TypeRuntime>, shard_id: ShardId) -> ShardHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (guard, terminated) = lifecycle::exit_pair();

    let journal = runtime.config.remember_entities.then(|| {
        Journaled::new(
            Arc::clone(&runtime.store),
            crate::journal::shard_persistence_id(&runtime.type_name, &shard_id),
        )
    });

    let actor = ShardActor {
        shard_id: shard_id.clone(),
        buffers: MessageBuffer::new(runtime.config.buffer_capacity),
        runtime,
        self_tx: tx.clone(),
        entities: HashMap::new(),
        passivating: HashSet::new(),
        remembered: ShardState::default(),
        journal,
        handoff_reply: None,
    };

    tokio::spawn(async move {
        let _guard = guard;
        actor.run(rx).await;
    });

    ShardHandle { tx, terminated }
}

struct ShardActor {
    shard_id: ShardId,
    runtime: Arc<TypeRuntime>,
    self_tx: mpsc::UnboundedSender<ShardMsg>,
    entities: HashMap<EntityId, EntityRef>,
    buffers: MessageBuffer,
    passivating: HashSet<EntityId>,
    remembered: ShardState,
    journal: Option<Journaled>,
    handoff_reply: Option<mpsc::UnboundedSender<HandoffReply>>,
}

impl ShardActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ShardMsg>) {
        if let Err(e) = self.recover().await {
            tracing::error!(shard_id = %self.shard_id, error = %e, "Shard recovery failed");
            return;
        }

        while let Some(msg) = rx.recv().await {
            let step = match msg {
                ShardMsg::Deliver(message) => self.deliver(message).await,
                ShardMsg::Passivate {
                    entity_id,
                    stop_message,
                } => {
                    self.passivate(entity_id, stop_message);
                    Ok(Step::Continue)
                }
                ShardMsg::HandOff { shard_id, reply } => self.hand_off(shard_id, reply),
                ShardMsg::GetStats { reply } => {
                    let _ = reply.send(ShardStats {
                        shard_id: self.shard_id.clone(),
                        entity_count: self.entities.len(),
                    });
                    Ok(Step::Continue)
                }
                ShardMsg::EntityTerminated(entity_id) => self.entity_terminated(entity_id).await,
                ShardMsg::RestartEntity(entity_id) => {
                    self.restart_entity(entity_id);
                    Ok(Step::Continue)
                }
                ShardMsg::EntitiesDrained => {
                    if let Some(reply) = self.handoff_reply.take() {
                        let _ = reply.send(HandoffReply::Stopped);
                    }
                    tracing::info!(shard_id = %self.shard_id, "Shard handed off");
                    Ok(Step::Stop)
                }
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break,
                Err(e) => {
                    // An append failure means in-memory state can no longer
                    // be trusted; stop and let supervision replay us.
                    tracing::error!(shard_id = %self.shard_id, error = %e, "Shard stopping");
                    break;
                }
            }
        }
    }

    /// Replay the journal and bring every remembered entity back up before
    /// the first message is processed.
    async fn recover(&mut self) -> Result<()> {
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        let (snapshot, events): (Option<ShardState>, Vec<ShardEvent>) = journal.recover().await?;
        self.remembered = snapshot.unwrap_or_default();
        for event in &events {
            self.remembered.apply(event);
        }
        if !self.remembered.entities.is_empty() {
            tracing::info!(
                shard_id = %self.shard_id,
                entities = self.remembered.entities.len(),
                "Restarting remembered entities"
            );
            for entity_id in self.remembered.entities.clone() {
                self.start_entity(entity_id);
            }
        }
        Ok(())
    }

    async fn deliver(&mut self, message: DynMessage) -> Result<Step> {
        let (entity_id, payload) = match self.runtime.extractor.try_extract_entity(message) {
            Ok(extracted) => extracted,
            Err(_) => {
                tracing::warn!(
                    shard_id = %self.shard_id,
                    error = %RoutingError::UnroutableMessage,
                    "Dropping message"
                );
                return Ok(Step::Continue);
            }
        };
        if entity_id.is_empty() {
            tracing::warn!(
                shard_id = %self.shard_id,
                error = %RoutingError::EmptyEntityId,
                "Dropping message"
            );
            return Ok(Step::Continue);
        }
        if self.handoff_reply.is_some() {
            tracing::debug!(shard_id = %self.shard_id, %entity_id, "Dropping message during handoff");
            return Ok(Step::Continue);
        }

        if self.buffers.contains(&entity_id) {
            self.buffer(&entity_id, payload);
            return Ok(Step::Continue);
        }

        if let Some(entity) = self.entities.get(&entity_id) {
            if let Err(payload) = entity.send(payload) {
                // Terminated but the watch notice has not arrived yet; park
                // the message until the restart decision is made.
                self.buffers.open(&entity_id);
                self.buffer(&entity_id, payload);
            }
            return Ok(Step::Continue);
        }

        // First message for this entity: create it.
        if self.journal.is_some() && !self.remembered.contains(&entity_id) {
            // The started fact must be durable before anything depends on
            // restart-recovery, so buffer until the append returns.
            self.buffers.open(&entity_id);
            self.buffer(&entity_id, payload);
            self.persist(ShardEvent::EntityStarted {
                entity_id: entity_id.clone(),
            })
            .await?;
            self.start_entity(entity_id.clone());
            self.flush(&entity_id);
        } else {
            let entity = self.start_entity(entity_id);
            let _ = entity.send(payload);
        }
        Ok(Step::Continue)
    }

    fn passivate(&mut self, entity_id: EntityId, stop_message: DynMessage) {
        if self.handoff_reply.is_some() {
            return;
        }
        let Some(entity) = self.entities.get(&entity_id) else {
            tracing::debug!(shard_id = %self.shard_id, %entity_id, "Passivate for unknown entity");
            return;
        };
        if self.buffers.contains(&entity_id) {
            // Already stopping or starting; ignore the repeat request.
            return;
        }
        self.buffers.open(&entity_id);
        self.passivating.insert(entity_id);
        let _ = entity.send(stop_message);
    }

    async fn entity_terminated(&mut self, entity_id: EntityId) -> Result<Step> {
        if self.handoff_reply.is_some() {
            self.entities.remove(&entity_id);
            return Ok(Step::Continue);
        }
        self.entities.remove(&entity_id);

        if self.passivating.remove(&entity_id) {
            let queued = self.buffers.drain(&entity_id);
            if queued.is_empty() {
                // Clean stop; only now is the entity gone for good.
                if self.journal.is_some() {
                    self.persist(ShardEvent::EntityStopped {
                        entity_id: entity_id.clone(),
                    })
                    .await?;
                }
                tracing::debug!(shard_id = %self.shard_id, %entity_id, "Entity passivated");
            } else {
                // Messages raced the stop: the entity never observably left.
                tracing::debug!(
                    shard_id = %self.shard_id,
                    %entity_id,
                    queued = queued.len(),
                    "Restarting entity after passivation race"
                );
                let entity = self.start_entity(entity_id);
                for message in queued {
                    let _ = entity.send(message);
                }
            }
            return Ok(Step::Continue);
        }

        // Unexpected termination.
        if self.journal.is_some() {
            tracing::warn!(
                shard_id = %self.shard_id,
                %entity_id,
                backoff = ?self.runtime.config.entity_restart_backoff,
                "Entity terminated unexpectedly, scheduling restart"
            );
            self.buffers.open(&entity_id);
            let tx = self.self_tx.clone();
            let backoff = self.runtime.config.entity_restart_backoff;
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let _ = tx.send(ShardMsg::RestartEntity(entity_id));
            });
        } else {
            tracing::debug!(shard_id = %self.shard_id, %entity_id, "Entity terminated");
            self.buffers.drop_key(&entity_id);
        }
        Ok(Step::Continue)
    }

    fn restart_entity(&mut self, entity_id: EntityId) {
        if self.handoff_reply.is_some() || self.entities.contains_key(&entity_id) {
            return;
        }
        self.start_entity(entity_id.clone());
        self.flush(&entity_id);
    }

    fn hand_off(
        &mut self,
        shard_id: ShardId,
        reply: mpsc::UnboundedSender<HandoffReply>,
    ) -> Result<Step> {
        if shard_id != self.shard_id {
            tracing::warn!(
                shard_id = %self.shard_id,
                requested = %shard_id,
                "Handoff for foreign shard ignored"
            );
            return Ok(Step::Continue);
        }
        if self.handoff_reply.is_some() {
            return Ok(Step::Continue);
        }
        if self.entities.is_empty() {
            let _ = reply.send(HandoffReply::Stopped);
            return Ok(Step::Stop);
        }

        tracing::info!(
            shard_id = %self.shard_id,
            entities = self.entities.len(),
            "Handoff started, stopping all entities"
        );
        self.handoff_reply = Some(reply);

        // The stopper delivers the stop message to every entity and reports
        // back once each one has terminated.
        let entities: Vec<EntityRef> = self.entities.values().cloned().collect();
        let stop_message = Arc::clone(&self.runtime.stop_message);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            for entity in &entities {
                let _ = entity.send(stop_message());
            }
            for entity in &entities {
                lifecycle::wait_for_exit(entity.terminated_rx()).await;
            }
            let _ = tx.send(ShardMsg::EntitiesDrained);
        });
        Ok(Step::Continue)
    }

    fn start_entity(&mut self, entity_id: EntityId) -> &EntityRef {
        let entity = spawn_entity(
            entity_id.clone(),
            &self.runtime.factory,
            self.self_tx.clone(),
        );
        let tx = self.self_tx.clone();
        let id = entity_id.clone();
        lifecycle::notify_on_exit(entity.terminated_rx(), move || {
            let _ = tx.send(ShardMsg::EntityTerminated(id));
        });
        self.entities.entry(entity_id).or_insert(entity)
    }

    fn buffer(&mut self, entity_id: &str, payload: DynMessage) {
        if !self.buffers.enqueue(entity_id, payload) {
            tracing::warn!(
                shard_id = %self.shard_id,
                entity_id,
                capacity = self.runtime.config.buffer_capacity,
                "Entity buffer full, dropping message"
            );
        }
    }

    fn flush(&mut self, entity_id: &str) {
        let queued = self.buffers.drain(entity_id);
        if let Some(entity) = self.entities.get(entity_id) {
            for message in queued {
                let _ = entity.send(message);
            }
        }
    }

    async fn persist(&mut self, event: ShardEvent) -> Result<()> {
        let journal = self.journal.as_mut().expect("persist without journal");
        journal.save_snapshot_when_needed(self.runtime.config.snapshot_after, &self.remembered);
        journal.persist(&event).await?;
        self.remembered.apply(&event);
        Ok(())
    }
}
