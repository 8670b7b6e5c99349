// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;

use driftboard_core::{NodeId, RoomId};
use serde::{Deserialize, Serialize};

/// Membership view of one replication room.
///
/// The quorum size is derived on demand instead of stored, so it can never
/// drift out of sync with the member set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub self_node: NodeId,
    pub room: RoomId,
    members: BTreeSet<NodeId>,
}

impl ClusterConfig {
    /// A fresh cluster containing only the local node.
    pub fn solo(self_node: NodeId, room: RoomId) -> Self {
        let members = BTreeSet::from([self_node.clone()]);
        Self {
            self_node,
            room,
            members,
        }
    }

    pub fn with_members(
        self_node: NodeId,
        room: RoomId,
        members: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        let mut config = Self::solo(self_node, room);
        for member in members {
            config.members.insert(member);
        }
        config
    }

    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    /// Remote members, excluding the local node.
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.members.iter().filter(|member| **member != self.self_node)
    }

    /// Minimum number of nodes, including the local one, required to commit:
    /// `floor(n / 2) + 1`.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Returns `true` when the node was not yet a member.
    pub fn add_member(&mut self, node: NodeId) -> bool {
        self.members.insert(node)
    }

    /// Returns `true` when the node was a member. The local node cannot be
    /// removed.
    pub fn remove_member(&mut self, node: &NodeId) -> bool {
        if *node == self.self_node {
            return false;
        }
        self.members.remove(node)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }
}

#[cfg(test)]
mod tests {
    use driftboard_core::{NodeId, RoomId};

    use super::ClusterConfig;

    #[test]
    fn quorum_tracks_membership() {
        let mut config = ClusterConfig::solo(NodeId::new("node-a"), RoomId::new("room-1"));
        assert_eq!(config.quorum_size(), 1);

        config.add_member(NodeId::new("node-b"));
        assert_eq!(config.quorum_size(), 2);

        config.add_member(NodeId::new("node-c"));
        assert_eq!(config.quorum_size(), 2);

        config.add_member(NodeId::new("node-d"));
        assert_eq!(config.quorum_size(), 3);

        config.remove_member(&NodeId::new("node-d"));
        config.remove_member(&NodeId::new("node-c"));
        assert_eq!(config.quorum_size(), 2);
    }

    #[test]
    fn local_node_cannot_be_removed() {
        let mut config = ClusterConfig::solo(NodeId::new("node-a"), RoomId::new("room-1"));
        assert!(!config.remove_member(&NodeId::new("node-a")));
        assert!(config.contains(&NodeId::new("node-a")));
    }
}
