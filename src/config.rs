//! Configuration types for the sharding runtime.

use std::time::Duration;

/// Main configuration for one sharding node.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Only cluster members carrying this role participate in hosting
    /// shards for the type. `None` means every member participates.
    pub role: Option<String>,

    /// Total number of messages a region or shard may hold buffered across
    /// all pending keys. Overflow drops the newest arrival.
    pub buffer_capacity: usize,

    /// Interval at which a region retries coordinator registration and
    /// re-requests homes for still-buffered shards.
    pub retry_interval: Duration,

    /// Upper bound for each handoff phase (begin-handoff acks, shard stop).
    pub handoff_timeout: Duration,

    /// How long the coordinator waits for a `ShardStarted` ack before
    /// resending `HostShard`. Resent indefinitely.
    pub shard_start_timeout: Duration,

    /// Record started entities durably so a restarted shard brings them
    /// back up before processing new messages.
    pub remember_entities: bool,

    /// Backoff before restarting an entity (or a shard) that terminated
    /// unexpectedly while entity-remembering is enabled.
    pub entity_restart_backoff: Duration,

    /// Save a snapshot after this many persisted events to bound replay.
    pub snapshot_after: u64,

    /// Interval of the coordinator's rebalance tick.
    pub rebalance_interval: Duration,

    /// Minimum difference between the most- and least-loaded region before
    /// the default allocation strategy relocates a shard.
    pub rebalance_threshold: usize,

    /// Maximum number of shard relocations in flight at once.
    pub max_simultaneous_rebalances: usize,

    /// Grace period before the coordinator reacts to a terminated region
    /// whose member is still in the cluster view. Zero reacts immediately.
    pub removal_margin: Duration,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            role: None,
            buffer_capacity: 100_000,
            retry_interval: Duration::from_secs(2),
            handoff_timeout: Duration::from_secs(60),
            shard_start_timeout: Duration::from_secs(10),
            remember_entities: false,
            entity_restart_backoff: Duration::from_secs(10),
            snapshot_after: 1000,
            rebalance_interval: Duration::from_secs(10),
            rebalance_threshold: 1,
            max_simultaneous_rebalances: 3,
            removal_margin: Duration::ZERO,
        }
    }
}

impl ShardingConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict shard hosting to members carrying the given role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the shared buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the region retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the handoff phase timeout.
    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    /// Set the shard-start ack timeout.
    pub fn with_shard_start_timeout(mut self, timeout: Duration) -> Self {
        self.shard_start_timeout = timeout;
        self
    }

    /// Enable or disable entity remembering.
    pub fn with_remember_entities(mut self, enabled: bool) -> Self {
        self.remember_entities = enabled;
        self
    }

    /// Set the entity restart backoff.
    pub fn with_entity_restart_backoff(mut self, backoff: Duration) -> Self {
        self.entity_restart_backoff = backoff;
        self
    }

    /// Set how many events are persisted between snapshots.
    pub fn with_snapshot_after(mut self, events: u64) -> Self {
        self.snapshot_after = events;
        self
    }

    /// Set the rebalance tick interval.
    pub fn with_rebalance_interval(mut self, interval: Duration) -> Self {
        self.rebalance_interval = interval;
        self
    }

    /// Set the rebalance threshold.
    pub fn with_rebalance_threshold(mut self, threshold: usize) -> Self {
        self.rebalance_threshold = threshold;
        self
    }

    /// Set the maximum number of simultaneous rebalances.
    pub fn with_max_simultaneous_rebalances(mut self, max: usize) -> Self {
        self.max_simultaneous_rebalances = max;
        self
    }

    /// Set the removal margin.
    pub fn with_removal_margin(mut self, margin: Duration) -> Self {
        self.removal_margin = margin;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ShardingConfig::default();
        assert!(config.role.is_none());
        assert_eq!(config.buffer_capacity, 100_000);
        assert_eq!(config.rebalance_threshold, 1);
        assert_eq!(config.removal_margin, Duration::ZERO);
    }

    #[test]
    fn test_builder_methods() {
        let config = ShardingConfig::new()
            .with_role("sharding")
            .with_buffer_capacity(64)
            .with_remember_entities(true)
            .with_rebalance_interval(Duration::from_millis(200))
            .with_removal_margin(Duration::from_secs(5));

        assert_eq!(config.role.as_deref(), Some("sharding"));
        assert_eq!(config.buffer_capacity, 64);
        assert!(config.remember_entities);
        assert_eq!(config.rebalance_interval, Duration::from_millis(200));
        assert_eq!(config.removal_margin, Duration::from_secs(5));
    }
}
