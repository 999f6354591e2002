//! Cluster membership events.

use crate::types::Member;
use std::net::SocketAddr;

/// Events delivered by the membership feed, in cluster order.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A member joined the cluster and is ready to take work.
    MemberUp(Member),

    /// A member left the cluster, gracefully or not. There is no further
    /// signal for it; consumers react here.
    MemberRemoved(Member),
}

impl ClusterEvent {
    /// The address of the member this event concerns.
    pub fn addr(&self) -> SocketAddr {
        match self {
            ClusterEvent::MemberUp(m) => m.addr,
            ClusterEvent::MemberRemoved(m) => m.addr,
        }
    }

    /// Whether this is a join-type event.
    pub fn is_up(&self) -> bool {
        matches!(self, ClusterEvent::MemberUp(_))
    }
}
