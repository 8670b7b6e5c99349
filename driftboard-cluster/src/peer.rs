// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;
use std::time::Instant;

use driftboard_core::NodeId;
use thiserror::Error;

/// Lifecycle of one remote peer.
///
/// Transitions only ever follow the edges encoded in
/// [`PeerState::can_transition`]; everything else is a [`PeerError`].
/// `Quarantined` is terminal short of a manual rejoin under a fresh node id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Authenticating,
    Synchronizing,
    Active,
    Disconnecting,
    Disconnected,
    Rejoining,
    Quarantined,
}

impl PeerState {
    pub fn can_transition(self, to: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, to),
            (Connecting, Authenticating)
                | (Connecting, Disconnected)
                | (Authenticating, Synchronizing)
                | (Authenticating, Disconnected)
                | (Synchronizing, Active)
                | (Synchronizing, Disconnected)
                | (Synchronizing, Quarantined)
                | (Active, Disconnecting)
                | (Active, Disconnected)
                | (Active, Quarantined)
                | (Disconnecting, Disconnected)
                | (Disconnected, Rejoining)
                | (Rejoining, Synchronizing)
                | (Rejoining, Disconnected)
        )
    }

    /// States in which the peer counts towards cluster membership and the
    /// quorum size.
    pub fn is_member(self) -> bool {
        use PeerState::*;
        matches!(
            self,
            Synchronizing | Active | Disconnecting | Disconnected | Rejoining
        )
    }

    pub fn is_connected(self) -> bool {
        use PeerState::*;
        matches!(self, Synchronizing | Active)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PeerError {
    #[error("illegal peer state transition {from:?} -> {to:?} for {node}")]
    IllegalTransition {
        node: NodeId,
        from: PeerState,
        to: PeerState,
    },

    #[error("peer {0} is unknown")]
    Unknown(NodeId),

    #[error("peer {0} is quarantined and cannot rejoin")]
    Quarantined(NodeId),

    #[error("peer {0} exhausted its {1} reconnect attempts")]
    ReconnectExhausted(NodeId, u8),
}

/// Everything the lifecycle manager tracks about one remote peer.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub node: NodeId,
    pub user: String,
    pub state: PeerState,
    pub last_seen: Instant,
    /// Highest committed log index this peer has confirmed receiving.
    pub last_synced_index: u64,
    pub capabilities: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    pub reconnect_attempts: u8,
    /// Set when the peer entered `Disconnected`, cleared on rejoin.
    pub disconnected_at: Option<Instant>,
}

impl PeerInfo {
    pub fn new(
        node: NodeId,
        user: String,
        capabilities: BTreeSet<String>,
        permissions: BTreeSet<String>,
        now: Instant,
    ) -> Self {
        Self {
            node,
            user,
            state: PeerState::Connecting,
            last_seen: now,
            last_synced_index: 0,
            capabilities,
            permissions,
            reconnect_attempts: 0,
            disconnected_at: None,
        }
    }

    /// Move to `to`, enforcing the legal transition edges.
    pub fn advance(&mut self, to: PeerState) -> Result<(), PeerError> {
        if !self.state.can_transition(to) {
            return Err(PeerError::IllegalTransition {
                node: self.node.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Instant;

    use assert_matches::assert_matches;
    use driftboard_core::NodeId;

    use super::{PeerError, PeerInfo, PeerState};

    fn peer() -> PeerInfo {
        PeerInfo::new(
            NodeId::new("node-b"),
            "mallory".to_string(),
            BTreeSet::new(),
            BTreeSet::new(),
            Instant::now(),
        )
    }

    #[test]
    fn happy_path_walks_every_edge() {
        let mut peer = peer();
        for state in [
            PeerState::Authenticating,
            PeerState::Synchronizing,
            PeerState::Active,
            PeerState::Disconnecting,
            PeerState::Disconnected,
            PeerState::Rejoining,
            PeerState::Synchronizing,
            PeerState::Active,
        ] {
            peer.advance(state).unwrap();
        }
        assert_eq!(peer.state, PeerState::Active);
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let mut peer = peer();
        assert_matches!(
            peer.advance(PeerState::Active),
            Err(PeerError::IllegalTransition { .. })
        );

        // Quarantine is terminal.
        peer.advance(PeerState::Authenticating).unwrap();
        peer.advance(PeerState::Synchronizing).unwrap();
        peer.advance(PeerState::Quarantined).unwrap();
        assert_matches!(
            peer.advance(PeerState::Rejoining),
            Err(PeerError::IllegalTransition { .. })
        );
    }

    #[test]
    fn membership_follows_state() {
        assert!(!PeerState::Connecting.is_member());
        assert!(!PeerState::Authenticating.is_member());
        assert!(PeerState::Active.is_member());
        assert!(PeerState::Disconnected.is_member());
        assert!(!PeerState::Quarantined.is_member());
    }
}
