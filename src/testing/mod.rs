//! Testing utilities and end-to-end scenarios for the sharding runtime.
//!
//! The scenario suites drive whole in-process clusters (shared membership
//! feed, journal, and coordinator directory) through allocation,
//! forwarding, rebalancing, graceful shutdown, and coordinator failover.

mod utils;

pub use utils::wait_for_result;
