//! The membership feed contract and the bundled in-process feed.

use super::events::ClusterEvent;
use crate::types::Member;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// A subscription: the full current member set, then incremental events.
pub struct MembershipSubscription {
    /// Members at subscription time, unfiltered.
    pub members: Vec<Member>,

    /// Ordered up/removed events from this point on.
    pub events: mpsc::UnboundedReceiver<ClusterEvent>,
}

/// Source of cluster membership. Implemented outside the crate for real
/// clusters; [`LocalMembership`] covers tests and single-process use.
pub trait MembershipFeed: Send + Sync + 'static {
    /// Subscribe to membership changes.
    fn subscribe(&self) -> MembershipSubscription;
}

#[derive(Default)]
struct FeedState {
    members: HashMap<SocketAddr, Member>,
    subscribers: Vec<mpsc::UnboundedSender<ClusterEvent>>,
    next_up_number: u64,
}

/// In-process membership feed with explicit mutators.
///
/// Join order is tracked with a monotonic counter so oldest-member
/// selection is well defined. There is no reachability signal; consumers
/// degrade to reacting without one.
#[derive(Default)]
pub struct LocalMembership {
    state: Mutex<FeedState>,
}

impl LocalMembership {
    /// Create an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring a member up with the given roles. Re-announcing an existing
    /// address is a no-op.
    pub fn member_up(&self, addr: SocketAddr, roles: impl IntoIterator<Item = String>) {
        let mut state = self.state.lock();
        if state.members.contains_key(&addr) {
            return;
        }
        state.next_up_number += 1;
        let mut member = Member::new(addr, state.next_up_number);
        member.roles = roles.into_iter().collect();
        state.members.insert(addr, member.clone());
        tracing::info!(%addr, up_number = member.up_number, "Member up");
        Self::publish(&mut state, ClusterEvent::MemberUp(member));
    }

    /// Remove a member. Unknown addresses are ignored.
    pub fn member_removed(&self, addr: SocketAddr) {
        let mut state = self.state.lock();
        if let Some(member) = state.members.remove(&addr) {
            tracing::info!(%addr, "Member removed");
            Self::publish(&mut state, ClusterEvent::MemberRemoved(member));
        }
    }

    /// Current members, unordered.
    pub fn members(&self) -> Vec<Member> {
        self.state.lock().members.values().cloned().collect()
    }

    fn publish(state: &mut FeedState, event: ClusterEvent) {
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl MembershipFeed for LocalMembership {
    fn subscribe(&self) -> MembershipSubscription {
        let mut state = self.state.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);
        MembershipSubscription {
            members: state.members.values().cloned().collect(),
            events: rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_then_events() {
        let feed = LocalMembership::new();
        feed.member_up(addr(9000), ["sharding".to_string()]);

        let mut sub = feed.subscribe();
        assert_eq!(sub.members.len(), 1);

        feed.member_up(addr(9001), []);
        feed.member_removed(addr(9000));

        let first = sub.events.recv().await.unwrap();
        assert!(first.is_up());
        assert_eq!(first.addr(), addr(9001));

        let second = sub.events.recv().await.unwrap();
        assert!(!second.is_up());
        assert_eq!(second.addr(), addr(9000));
    }

    #[tokio::test]
    async fn test_up_numbers_are_monotonic() {
        let feed = LocalMembership::new();
        feed.member_up(addr(9000), []);
        feed.member_up(addr(9001), []);

        let mut members = feed.members();
        members.sort_by_key(|m| m.addr);
        assert!(members[0].up_number < members[1].up_number);
    }

    #[tokio::test]
    async fn test_duplicate_up_is_ignored() {
        let feed = LocalMembership::new();
        feed.member_up(addr(9000), []);
        let mut sub = feed.subscribe();
        feed.member_up(addr(9000), []);
        feed.member_removed(addr(9000));

        // Only the removal should arrive.
        let event = sub.events.recv().await.unwrap();
        assert!(!event.is_up());
    }
}
