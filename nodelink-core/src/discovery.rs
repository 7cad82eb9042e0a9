//! Membership lookups consumed by the transport.
//!
//! The membership/gossip algorithm itself lives elsewhere; the transport
//! only needs fast in-memory answers about who is currently known.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{Member, NodeId};

/// Read-only view of cluster membership.
///
/// All methods must be cheap: they are called from socket drivers and the
/// keepalive loop on every relevant event.
pub trait Discovery: Send + Sync + 'static {
    /// Look up a known member by id.
    fn get_member(&self, node_id: &NodeId) -> Option<Member>;

    /// Whether `node_id` is currently a known member.
    fn is_known_member(&self, node_id: &NodeId) -> bool {
        self.get_member(node_id).is_some()
    }

    /// Snapshot of every known member, the local node included.
    fn all_known_members(&self) -> HashMap<NodeId, Member>;

    /// The local node's own member record.
    fn local_member(&self) -> Member;

    /// Whether `node_id` identifies the local node.
    fn is_local_node_id(&self, node_id: &NodeId) -> bool {
        self.local_member().node_id == *node_id
    }
}

/// In-memory membership registry.
///
/// Used by the `nodelink-node` binary (members come from the command line)
/// and by tests that add and remove members to drive the transport.
#[derive(Debug)]
pub struct StaticDiscovery {
    local: Member,
    members: RwLock<HashMap<NodeId, Member>>,
}

impl StaticDiscovery {
    /// Create a registry that knows only the local member.
    pub fn new(local: Member) -> Self {
        let mut members = HashMap::new();
        members.insert(local.node_id.clone(), local.clone());
        Self {
            local,
            members: RwLock::new(members),
        }
    }

    /// Create a registry with the local member plus `peers`.
    pub fn with_members(local: Member, peers: impl IntoIterator<Item = Member>) -> Self {
        let discovery = Self::new(local);
        for peer in peers {
            discovery.add_member(peer);
        }
        discovery
    }

    /// Add or replace a member. Returns the previous record, if any.
    pub fn add_member(&self, member: Member) -> Option<Member> {
        self.members.write().insert(member.node_id.clone(), member)
    }

    /// Forget a member. The local member cannot be removed.
    pub fn remove_member(&self, node_id: &NodeId) -> Option<Member> {
        if *node_id == self.local.node_id {
            return None;
        }
        self.members.write().remove(node_id)
    }
}

impl Discovery for StaticDiscovery {
    fn get_member(&self, node_id: &NodeId) -> Option<Member> {
        self.members.read().get(node_id).cloned()
    }

    fn is_known_member(&self, node_id: &NodeId) -> bool {
        self.members.read().contains_key(node_id)
    }

    fn all_known_members(&self) -> HashMap<NodeId, Member> {
        self.members.read().clone()
    }

    fn local_member(&self) -> Member {
        self.local.clone()
    }

    fn is_local_node_id(&self, node_id: &NodeId) -> bool {
        self.local.node_id == *node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> Member {
        Member::new("local", "127.0.0.1", 7000)
    }

    #[test]
    fn test_local_member_is_known() {
        let discovery = StaticDiscovery::new(local());
        assert!(discovery.is_known_member(&NodeId::new("local")));
        assert!(discovery.is_local_node_id(&NodeId::new("local")));
        assert_eq!(discovery.all_known_members().len(), 1);
    }

    #[test]
    fn test_add_and_remove_member() {
        let discovery = StaticDiscovery::new(local());
        let peer = Member::new("peer", "127.0.0.1", 7001);
        assert!(discovery.add_member(peer.clone()).is_none());
        assert_eq!(discovery.get_member(&peer.node_id), Some(peer.clone()));

        assert_eq!(discovery.remove_member(&peer.node_id), Some(peer.clone()));
        assert!(!discovery.is_known_member(&peer.node_id));
    }

    #[test]
    fn test_local_member_cannot_be_removed() {
        let discovery = StaticDiscovery::new(local());
        assert!(discovery.remove_member(&NodeId::new("local")).is_none());
        assert!(discovery.is_known_member(&NodeId::new("local")));
    }

    #[test]
    fn test_with_members() {
        let discovery = StaticDiscovery::with_members(
            local(),
            [
                Member::new("a", "127.0.0.1", 7001),
                Member::new("b", "127.0.0.1", 7002),
            ],
        );
        assert_eq!(discovery.all_known_members().len(), 3);
        assert!(!discovery.is_local_node_id(&NodeId::new("a")));
    }
}
