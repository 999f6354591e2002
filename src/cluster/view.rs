//! Role-filtered, age-ordered view over membership events.

use super::events::ClusterEvent;
use crate::types::Member;
use std::collections::HashMap;
use std::net::SocketAddr;

/// The member set a consumer has seen so far, filtered by role.
///
/// Fed from a subscription snapshot plus its event stream; answers the two
/// questions the runtime asks: "who is the oldest matching member" and "is
/// this address still up".
pub(crate) struct MemberView {
    role: Option<String>,
    members: HashMap<SocketAddr, Member>,
}

impl MemberView {
    pub(crate) fn new(role: Option<String>, snapshot: Vec<Member>) -> Self {
        let mut view = Self {
            role,
            members: HashMap::new(),
        };
        for member in snapshot {
            view.insert(member);
        }
        view
    }

    fn insert(&mut self, member: Member) {
        if member.matches_role(self.role.as_deref()) {
            self.members.insert(member.addr, member);
        }
    }

    /// Apply one feed event. Returns true when the view changed.
    pub(crate) fn apply(&mut self, event: &ClusterEvent) -> bool {
        match event {
            ClusterEvent::MemberUp(member) => {
                if member.matches_role(self.role.as_deref()) {
                    self.members.insert(member.addr, member.clone());
                    true
                } else {
                    false
                }
            }
            ClusterEvent::MemberRemoved(member) => self.members.remove(&member.addr).is_some(),
        }
    }

    /// The oldest matching member, if any.
    pub(crate) fn oldest(&self) -> Option<&Member> {
        self.members.values().min_by_key(|m| m.age_key())
    }

    /// Whether the address is currently an up member of the view.
    pub(crate) fn contains(&self, addr: &SocketAddr) -> bool {
        self.members.contains_key(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_oldest_tracks_removals() {
        let mut view = MemberView::new(
            None,
            vec![Member::new(addr(9000), 1), Member::new(addr(9001), 2)],
        );
        assert_eq!(view.oldest().unwrap().addr, addr(9000));

        view.apply(&ClusterEvent::MemberRemoved(Member::new(addr(9000), 1)));
        assert_eq!(view.oldest().unwrap().addr, addr(9001));

        view.apply(&ClusterEvent::MemberRemoved(Member::new(addr(9001), 2)));
        assert!(view.oldest().is_none());
    }

    #[test]
    fn test_role_filter_excludes_members() {
        let matching = Member::new(addr(9000), 2).with_role("sharding");
        let other = Member::new(addr(9001), 1);
        let mut view = MemberView::new(Some("sharding".into()), vec![other.clone()]);
        assert!(view.oldest().is_none());

        view.apply(&ClusterEvent::MemberUp(matching.clone()));
        // The older non-matching member never enters the view.
        assert_eq!(view.oldest().unwrap().addr, matching.addr);
        assert!(!view.contains(&other.addr));
    }
}
