// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use driftboard_core::NodeId;
use tracing::{debug, warn};

use crate::peer::{PeerError, PeerInfo, PeerState};

/// Timers and bounds of the peer lifecycle.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Cadence at which heartbeats are sent and expected.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is marked disconnected.
    pub peer_timeout: Duration,
    /// How long a disconnected peer is retained before final removal.
    pub grace_period: Duration,
    /// Silence after which a peer counts as unreachable for partition
    /// detection. Longer than `peer_timeout` so a single slow peer never
    /// looks like a partition.
    pub partition_threshold: Duration,
    /// Reconnect attempts tolerated before the peer is dropped for good.
    pub max_reconnect_attempts: u8,
    /// Committed entries shipped per synchronization batch.
    pub sync_batch_size: usize,
    /// Pause between consecutive sync batches.
    pub sync_batch_delay: Duration,
    /// Failed synchronization rounds tolerated before quarantine.
    pub max_sync_attempts: u8,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            peer_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(30),
            partition_threshold: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            sync_batch_size: 50,
            sync_batch_delay: Duration::from_millis(50),
            max_sync_attempts: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveReason {
    Graceful,
    TimedOut,
    AttemptsExhausted,
    Quarantined,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuarantineReason {
    ChecksumMismatch,
    SyncFailure,
}

/// Observations the engine must act on.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    /// A new peer passed admission and entered synchronization.
    Admitted { node: NodeId },
    /// A disconnected peer came back inside the grace period; resume its
    /// sync from the given committed index instead of a full resync.
    Rejoining { node: NodeId, resume_from: u64 },
    /// A peer finished synchronizing and participates fully.
    Activated { node: NodeId },
    /// A peer went silent past the timeout but is retained for now.
    Disconnected { node: NodeId },
    /// A peer was finally removed.
    Left { node: NodeId, reason: LeaveReason },
    /// The member set changed; the consensus quorum must be recomputed.
    MembershipChanged { members: BTreeSet<NodeId> },
    /// Cluster-wide stability flipped.
    StabilityChanged { stable: bool, unreachable: usize },
    /// A peer was quarantined for an integrity or sync failure.
    Quarantined {
        node: NodeId,
        reason: QuarantineReason,
    },
}

/// Tracks every remote peer of one room.
#[derive(Debug)]
pub struct PeerManager {
    self_node: NodeId,
    config: PeerConfig,
    peers: HashMap<NodeId, PeerInfo>,
    /// Node ids barred from rejoining without manual intervention.
    quarantined: BTreeSet<NodeId>,
    stable: bool,
}

impl PeerManager {
    pub fn new(self_node: NodeId, config: PeerConfig) -> Self {
        Self {
            self_node,
            config,
            peers: HashMap::new(),
            quarantined: BTreeSet::new(),
            stable: true,
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    pub fn get(&self, node: &NodeId) -> Option<&PeerInfo> {
        self.peers.get(node)
    }

    /// Members of the cluster: the local node plus every peer in a
    /// membership-counting state.
    pub fn members(&self) -> BTreeSet<NodeId> {
        let mut members = BTreeSet::from([self.self_node.clone()]);
        members.extend(
            self.peers
                .values()
                .filter(|peer| peer.state.is_member())
                .map(|peer| peer.node.clone()),
        );
        members
    }

    /// Peers currently reachable.
    pub fn connected_peers(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.state.is_connected())
            .count()
    }

    /// Admit a joining peer, or resume a disconnected one.
    ///
    /// A brand-new peer walks `connecting → authenticating → synchronizing`
    /// here; admission is a capability check, there is no cryptographic
    /// identity layer. A peer returning inside its grace period resumes as
    /// `rejoining` with its reconnect counter bumped.
    pub fn admit(
        &mut self,
        node: NodeId,
        user: String,
        capabilities: BTreeSet<String>,
        permissions: BTreeSet<String>,
        now: Instant,
    ) -> Result<Vec<PeerEvent>, PeerError> {
        if self.quarantined.contains(&node) {
            return Err(PeerError::Quarantined(node));
        }

        if let Some(peer) = self.peers.get_mut(&node) {
            if peer.state == PeerState::Disconnected {
                return self.rejoin(node, now);
            }
            // A duplicate join request from a live peer is transport noise.
            debug!(%node, state = ?peer.state, "ignoring duplicate join request");
            return Ok(Vec::new());
        }

        let mut peer = PeerInfo::new(node.clone(), user, capabilities, permissions, now);
        peer.advance(PeerState::Authenticating)?;
        peer.advance(PeerState::Synchronizing)?;
        self.peers.insert(node.clone(), peer);

        debug!(%node, "admitted new peer");
        Ok(vec![
            PeerEvent::Admitted { node },
            PeerEvent::MembershipChanged {
                members: self.members(),
            },
        ])
    }

    /// Record an already-established member learned from a join accept,
    /// skipping the admission walk: the peer is live and synchronized on
    /// the other side of the handshake.
    pub fn observe_member(&mut self, node: NodeId, now: Instant) -> Vec<PeerEvent> {
        if node == self.self_node
            || self.quarantined.contains(&node)
            || self.peers.contains_key(&node)
        {
            return Vec::new();
        }

        let mut peer = PeerInfo::new(node.clone(), String::new(), BTreeSet::new(), BTreeSet::new(), now);
        peer.state = PeerState::Active;
        self.peers.insert(node, peer);

        vec![PeerEvent::MembershipChanged {
            members: self.members(),
        }]
    }

    fn rejoin(&mut self, node: NodeId, now: Instant) -> Result<Vec<PeerEvent>, PeerError> {
        let max_attempts = self.config.max_reconnect_attempts;
        let peer = self
            .peers
            .get_mut(&node)
            .ok_or_else(|| PeerError::Unknown(node.clone()))?;

        peer.reconnect_attempts += 1;
        if peer.reconnect_attempts > max_attempts {
            warn!(%node, "reconnect attempts exhausted, dropping peer");
            self.peers.remove(&node);
            return Err(PeerError::ReconnectExhausted(node, max_attempts));
        }

        peer.advance(PeerState::Rejoining)?;
        peer.advance(PeerState::Synchronizing)?;
        peer.last_seen = now;
        peer.disconnected_at = None;
        let resume_from = peer.last_synced_index;

        debug!(%node, resume_from, "peer rejoining inside grace period");
        Ok(vec![PeerEvent::Rejoining { node, resume_from }])
    }

    /// A peer completed synchronization.
    pub fn mark_active(&mut self, node: &NodeId, now: Instant) -> Result<Vec<PeerEvent>, PeerError> {
        let peer = self
            .peers
            .get_mut(node)
            .ok_or_else(|| PeerError::Unknown(node.clone()))?;
        peer.advance(PeerState::Active)?;
        peer.last_seen = now;
        Ok(vec![PeerEvent::Activated { node: node.clone() }])
    }

    /// Record a heartbeat or any other sign of life.
    pub fn record_heartbeat(&mut self, node: &NodeId, now: Instant) -> Vec<PeerEvent> {
        let Some(peer) = self.peers.get_mut(node) else {
            return Vec::new();
        };
        peer.last_seen = now;

        if peer.state == PeerState::Disconnected {
            // The blip healed on its own; resume without a join round-trip.
            return match self.rejoin(node.clone(), now) {
                Ok(events) => events,
                Err(PeerError::ReconnectExhausted(node, reason_attempts)) => {
                    debug!(%node, attempts = reason_attempts, "dropping peer after final reconnect");
                    vec![
                        PeerEvent::Left {
                            node,
                            reason: LeaveReason::AttemptsExhausted,
                        },
                        PeerEvent::MembershipChanged {
                            members: self.members(),
                        },
                    ]
                }
                Err(_) => Vec::new(),
            };
        }
        Vec::new()
    }

    /// Record the highest committed index a peer confirmed.
    pub fn record_synced_index(&mut self, node: &NodeId, index: u64) {
        if let Some(peer) = self.peers.get_mut(node) {
            peer.last_synced_index = peer.last_synced_index.max(index);
        }
    }

    /// A peer announced a graceful leave: no grace period, immediate removal.
    pub fn graceful_leave(&mut self, node: &NodeId) -> Vec<PeerEvent> {
        if self.peers.remove(node).is_none() {
            return Vec::new();
        }
        debug!(%node, "peer left gracefully");
        vec![
            PeerEvent::Left {
                node: node.clone(),
                reason: LeaveReason::Graceful,
            },
            PeerEvent::MembershipChanged {
                members: self.members(),
            },
        ]
    }

    /// Quarantine a peer after an integrity or synchronization failure.
    /// Irrecoverable without a manual rejoin under a fresh identity.
    pub fn quarantine(&mut self, node: &NodeId, reason: QuarantineReason) -> Vec<PeerEvent> {
        if self.peers.remove(node).is_none() {
            return Vec::new();
        }

        warn!(%node, ?reason, "quarantining peer");
        // Removal from membership is the part that matters; the barred id
        // set is what makes quarantine stick across rejoin attempts.
        self.quarantined.insert(node.clone());

        vec![
            PeerEvent::Quarantined {
                node: node.clone(),
                reason,
            },
            PeerEvent::Left {
                node: node.clone(),
                reason: LeaveReason::Quarantined,
            },
            PeerEvent::MembershipChanged {
                members: self.members(),
            },
        ]
    }

    /// Periodic maintenance: time out silent peers, expel peers whose grace
    /// period lapsed, and re-evaluate cluster stability.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerEvent> {
        let mut events = Vec::new();

        // Silent connected peers become disconnected but stay members.
        for peer in self.peers.values_mut() {
            let silent = now.saturating_duration_since(peer.last_seen) > self.config.peer_timeout;
            if silent
                && matches!(
                    peer.state,
                    PeerState::Synchronizing | PeerState::Active | PeerState::Disconnecting
                )
            {
                debug!(node = %peer.node, "peer unseen past timeout, marking disconnected");
                peer.state = PeerState::Disconnected;
                peer.disconnected_at = Some(now);
                events.push(PeerEvent::Disconnected {
                    node: peer.node.clone(),
                });
            }
        }

        // Disconnected peers past their grace period are finally removed.
        let expired: Vec<NodeId> = self
            .peers
            .values()
            .filter(|peer| {
                peer.state == PeerState::Disconnected
                    && peer.disconnected_at.is_some_and(|at| {
                        now.saturating_duration_since(at) > self.config.grace_period
                    })
            })
            .map(|peer| peer.node.clone())
            .collect();
        for node in expired {
            warn!(%node, "grace period expired, removing peer");
            self.peers.remove(&node);
            events.push(PeerEvent::Left {
                node,
                reason: LeaveReason::TimedOut,
            });
            events.push(PeerEvent::MembershipChanged {
                members: self.members(),
            });
        }

        events.extend(self.check_partition(now));
        events
    }

    /// Declare a partition when more than half of the known peers have been
    /// silent past the partition threshold.
    fn check_partition(&mut self, now: Instant) -> Vec<PeerEvent> {
        let known = self.peers.len();
        let unreachable = self
            .peers
            .values()
            .filter(|peer| {
                now.saturating_duration_since(peer.last_seen) > self.config.partition_threshold
            })
            .count();

        let stable = known == 0 || unreachable * 2 <= known;
        if stable == self.stable {
            return Vec::new();
        }

        self.stable = stable;
        if stable {
            debug!("cluster stability restored");
        } else {
            warn!(unreachable, known, "network partition suspected");
        }
        vec![PeerEvent::StabilityChanged {
            stable,
            unreachable,
        }]
    }
}
