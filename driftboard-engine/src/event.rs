// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use driftboard_core::{Connection, Element, EntityId, NodeId, OperationId, ThreatActor};
use driftboard_ot::ConflictKind;

/// Events emitted to the UI layer.
///
/// `StateUpdated` always carries the full collections, never a delta, so
/// any consumer can treat every event as authoritative truth.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    StateInitialized,
    StateUpdated {
        elements: BTreeMap<EntityId, Element>,
        threat_actors: BTreeMap<EntityId, ThreatActor>,
        connections: BTreeMap<EntityId, Connection>,
    },
    PeerJoined {
        node: NodeId,
    },
    PeerLeft {
        node: NodeId,
    },
    LeadershipChanged {
        is_leader: bool,
        leader: Option<NodeId>,
    },
    SyncStatusChanged {
        is_syncing: bool,
        /// Fraction of the committed log streamed so far, in `0.0..=1.0`.
        progress: f64,
    },
    ConnectionStatusChanged {
        is_connected: bool,
        peer_count: usize,
    },
    ConflictResolved {
        operation: OperationId,
        kind: ConflictKind,
    },
    ErrorOccurred {
        error: String,
        context: String,
    },
}
