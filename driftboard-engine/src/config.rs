// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use driftboard_cluster::PeerConfig;
use driftboard_consensus::RaftTimings;
use driftboard_core::{NodeId, RoomId};

/// How often the consensus state machine is driven forward. Well below the
/// smallest election timeout so deadlines are observed promptly.
pub const CONSENSUS_TICK_INTERVAL: Duration = Duration::from_millis(25);

/// How often the peer manager sweeps for silent and expired peers.
pub const PEER_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Log length above which committed entries are folded into the persisted
/// snapshot.
pub const COMPACTION_THRESHOLD: usize = 512;

/// Configuration of one collaborating node.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub self_node: NodeId,
    pub room: RoomId,
    /// Display identity of the local user, shared with peers on join.
    pub user: String,
    pub raft: RaftTimings,
    pub peers: PeerConfig,
}

impl EngineConfig {
    pub fn new(self_node: NodeId, room: RoomId, user: impl Into<String>) -> Self {
        Self {
            self_node,
            room,
            user: user.into(),
            raft: RaftTimings::default(),
            peers: PeerConfig::default(),
        }
    }
}
