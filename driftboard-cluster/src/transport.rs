// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;

use driftboard_consensus::{LogEntry, RaftMessage};
use driftboard_core::{NodeId, OperationMeta, to_canonical_bytes};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything that travels between peers, multiplexed over one logical
/// channel.
///
/// The transport provides no delivery, ordering or uniqueness guarantee;
/// every handler behind this enum tolerates duplicates, reordering and
/// indefinite delay.
#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Consensus protocol traffic.
    Raft(RaftMessage),
    /// A node asks to join the room.
    JoinRequest {
        user: String,
        capabilities: BTreeSet<String>,
        permissions: BTreeSet<String>,
    },
    /// Admission granted; carries the current cluster view.
    JoinAccept {
        members: BTreeSet<NodeId>,
        leader: Option<NodeId>,
        commit_index: u64,
    },
    /// Admission denied.
    JoinReject { reason: String },
    /// One batch of committed log entries for a synchronizing peer.
    SyncBatch {
        entries: Vec<LogEntry>,
        /// Commit index at send time, for progress reporting.
        commit_index: u64,
    },
    /// The peer confirms everything up to `synced_to`.
    SyncAck { synced_to: u64 },
    /// All committed entries have been sent.
    SyncDone { last_index: u64 },
    /// Cluster-level liveness signal, distinct from the leader heartbeat.
    Heartbeat { timestamp: u64 },
    /// Opportunistic low-latency copy of a just-committed operation. Never
    /// the authority path: a peer that misses it catches up through log
    /// replication.
    OperationBroadcast { operation: OperationMeta },
    /// Graceful departure.
    Leave,
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        to_canonical_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        ciborium::de::from_reader(bytes).map_err(|err| DecodeError::Envelope(err.to_string()))
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Raft(_) => "raft",
            Envelope::JoinRequest { .. } => "join_request",
            Envelope::JoinAccept { .. } => "join_accept",
            Envelope::JoinReject { .. } => "join_reject",
            Envelope::SyncBatch { .. } => "sync_batch",
            Envelope::SyncAck { .. } => "sync_ack",
            Envelope::SyncDone { .. } => "sync_done",
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::OperationBroadcast { .. } => "operation_broadcast",
            Envelope::Leave => "leave",
        }
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to decode envelope: {0}")]
    Envelope(String),
}

/// One received message with its sender attached by the transport.
#[derive(Clone, Debug)]
pub struct Incoming {
    pub from: NodeId,
    pub envelope: Envelope,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub connected_peers: usize,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    Disconnected(NodeId),

    #[error("transport channel closed")]
    ChannelClosed,
}

/// The consumed transport contract.
///
/// Fire-and-forget sends over an unordered, at-most-once-but-possibly-
/// duplicated channel. Incoming traffic is delivered through a channel the
/// concrete implementation hands to the engine at construction; correctness
/// never relies on transport ordering.
pub trait Transport: Send + Sync {
    /// Send to one peer. Failure only means the peer is not currently
    /// connected; delivery is never guaranteed either way.
    fn send(&self, to: &NodeId, envelope: Envelope) -> Result<(), TransportError>;

    /// Best-effort send to every connected peer.
    fn broadcast(&self, envelope: Envelope);

    /// Node ids currently connected.
    fn peers(&self) -> Vec<NodeId>;

    fn stats(&self) -> TransportStats;
}
