//! Cluster membership as consumed by the sharding runtime.
//!
//! Membership tracking and failure detection live outside this crate; the
//! runtime consumes them as an ordered feed of up/removed events plus a
//! current snapshot, filtered by role. [`LocalMembership`] is the bundled
//! in-process feed used by tests and single-process clusters.

mod events;
mod feed;
mod view;

pub use events::ClusterEvent;
pub use feed::{LocalMembership, MembershipFeed, MembershipSubscription};
pub(crate) use view::MemberView;
