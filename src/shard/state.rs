//! Durable per-shard entity bookkeeping.

use crate::types::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Events recorded by a shard when entity remembering is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardEvent {
    /// An entity was started for the first time.
    EntityStarted { entity_id: EntityId },

    /// An entity stopped for good (passivated with nothing pending).
    EntityStopped { entity_id: EntityId },
}

/// The set of entities a shard knows to be running, rebuilt on restart by
/// folding [`ShardEvent`]s over an optional snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    /// Entities to re-instantiate after a shard restart.
    pub entities: BTreeSet<EntityId>,
}

impl ShardState {
    /// Apply one event. Replayed events may repeat after an interrupted
    /// append callback; application is idempotent.
    pub fn apply(&mut self, event: &ShardEvent) {
        match event {
            ShardEvent::EntityStarted { entity_id } => {
                self.entities.insert(entity_id.clone());
            }
            ShardEvent::EntityStopped { entity_id } => {
                self.entities.remove(entity_id);
            }
        }
    }

    /// Whether the entity is currently remembered as running.
    pub fn contains(&self, entity_id: &str) -> bool {
        self.entities.contains(entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str) -> ShardEvent {
        ShardEvent::EntityStarted {
            entity_id: id.into(),
        }
    }

    fn stopped(id: &str) -> ShardEvent {
        ShardEvent::EntityStopped {
            entity_id: id.into(),
        }
    }

    #[test]
    fn test_fold_is_deterministic() {
        let events = vec![started("a"), started("b"), stopped("a"), started("c")];

        let mut first = ShardState::default();
        let mut second = ShardState::default();
        for event in &events {
            first.apply(event);
            second.apply(event);
        }
        assert_eq!(first, second);
        assert!(first.contains("b"));
        assert!(first.contains("c"));
        assert!(!first.contains("a"));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut state = ShardState::default();
        state.apply(&started("a"));
        state.apply(&started("a"));
        assert_eq!(state.entities.len(), 1);

        state.apply(&stopped("a"));
        state.apply(&stopped("a"));
        assert!(state.entities.is_empty());
    }
}
