// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use driftboard_core::{NodeId, OperationMeta, StateSnapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::log::{Log, LogEntry};
use crate::message::RaftMessage;

/// Consecutive failed elections tolerated before a lone submitter is allowed
/// to elect itself. Kept small so single-user editing never blocks for long.
pub const MAX_FAILED_ELECTIONS: u32 = 3;

/// Maximum number of entries shipped in one `AppendEntries`.
const MAX_REPLICATION_BATCH: usize = 64;

/// Protocol timers.
///
/// The joined window is deliberately wider than the base window: a freshly
/// joined node that already knows about peers should wait for the existing
/// leader's heartbeat instead of triggering a needless election.
#[derive(Clone, Debug)]
pub struct RaftTimings {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub joined_election_timeout_min: Duration,
    pub joined_election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RaftTimings {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            joined_election_timeout_min: Duration::from_millis(300),
            joined_election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Side effects requested by the state machine.
///
/// The caller owns all IO: sending messages, handing committed operations to
/// the materializer, attaching the current state snapshot where one is
/// needed.
#[derive(Clone, Debug, PartialEq)]
pub enum RaftEffect {
    Send {
        to: NodeId,
        message: RaftMessage,
    },
    Broadcast {
        message: RaftMessage,
    },
    /// Entries newly committed by quorum acknowledgement, in log order.
    Committed {
        entries: Vec<LogEntry>,
    },
    /// The leader changed (or was lost).
    LeadershipChanged {
        leader: Option<NodeId>,
        term: u64,
        is_self: bool,
    },
    /// An election round expired without a winner.
    ElectionFailed {
        term: u64,
        consecutive_failures: u32,
    },
    /// A follower is too far behind the compacted log; the caller must send
    /// it an `InstallSnapshot` carrying the current materialized state.
    SendSnapshot {
        to: NodeId,
        last_included_index: u64,
        last_included_term: u64,
    },
    /// A received snapshot must replace the local materialized state.
    InstallState {
        snapshot: StateSnapshot,
        last_included_index: u64,
    },
    /// A peer shipped content failing checksum verification.
    IntegrityViolation {
        peer: NodeId,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    #[error("not the leader; current leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },
}

/// The replicated-log state machine for one room.
pub struct ConsensusLog {
    config: ClusterConfig,
    timings: RaftTimings,
    role: Role,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    log: Log,
    commit_index: u64,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    votes: BTreeSet<NodeId>,
    election_deadline: Instant,
    next_heartbeat: Instant,
    failed_elections: u32,
    rng: StdRng,
}

impl ConsensusLog {
    pub fn new(config: ClusterConfig, timings: RaftTimings, now: Instant) -> Self {
        Self::with_log(config, timings, Log::new(), now)
    }

    /// Resume from a log rebuilt out of persisted state.
    pub fn with_log(
        config: ClusterConfig,
        timings: RaftTimings,
        log: Log,
        now: Instant,
    ) -> Self {
        let commit_index = log.last_index();
        let mut consensus = Self {
            config,
            timings,
            role: Role::Follower,
            current_term: log.last_term(),
            voted_for: None,
            leader: None,
            log,
            commit_index,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: BTreeSet::new(),
            election_deadline: now,
            next_heartbeat: now,
            failed_elections: 0,
            rng: StdRng::from_entropy(),
        };
        consensus.reset_election_deadline(now);
        consensus
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn leader_hint(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn failed_elections(&self) -> u32 {
        self.failed_elections
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Fold committed entries up to `index` into the compaction baseline,
    /// typically after the snapshot has been persisted.
    pub fn compact_to(&mut self, index: u64) {
        let index = index.min(self.commit_index);
        self.log.compact_to(index);
    }

    /// Replace the member set after a peer joined or was finally removed.
    ///
    /// Shrinking membership can lower the quorum below the number of already
    /// collected acknowledgements, so the commit index is re-evaluated here.
    pub fn set_members(&mut self, members: BTreeSet<NodeId>, now: Instant) -> Vec<RaftEffect> {
        let mut effects = Vec::new();

        let previous_len = self.config.members().len();
        let added: Vec<NodeId> = members
            .iter()
            .filter(|member| !self.config.contains(member))
            .cloned()
            .collect();
        let removed: Vec<NodeId> = self
            .config
            .members()
            .iter()
            .filter(|member| !members.contains(*member))
            .cloned()
            .collect();

        for node in &removed {
            self.config.remove_member(node);
            self.next_index.remove(node);
            self.match_index.remove(node);
            self.votes.remove(node);
        }
        for node in added {
            self.config.add_member(node.clone());
            if self.role == Role::Leader {
                self.next_index.insert(node.clone(), self.log.last_index() + 1);
                self.match_index.insert(node, 0);
            }
        }

        // A node that learned about peers for the first time backs off its
        // election deadline into the widened window.
        if previous_len == 1 && self.config.members().len() > 1 {
            self.reset_election_deadline(now);
        }

        if self.role == Role::Leader {
            if let Some(entries) = self.advance_commit() {
                effects.push(RaftEffect::Committed { entries });
            }
        }

        effects
    }

    /// Submit a local operation for replication. Only valid on the leader;
    /// a node with definitively no reachable leader elects itself rather
    /// than blocking single-user editing.
    pub fn submit_operation(
        &mut self,
        operation: OperationMeta,
        connected_peers: usize,
        now: Instant,
    ) -> Result<(u64, Vec<RaftEffect>), SubmitError> {
        let mut effects = Vec::new();

        if self.role != Role::Leader {
            let isolated =
                connected_peers == 0 || self.failed_elections > MAX_FAILED_ELECTIONS;
            if !isolated {
                return Err(SubmitError::NotLeader {
                    leader: self.leader.clone(),
                });
            }

            debug!(
                connected_peers,
                failed_elections = self.failed_elections,
                "no reachable leader, electing self"
            );
            effects.extend(self.become_leader(self.current_term + 1, now));
        }

        let index = self.log.last_index() + 1;
        let entry = LogEntry::new(self.current_term, index, operation);
        self.log.append(entry);

        effects.extend(self.replicate_to_all(now));
        if let Some(entries) = self.advance_commit() {
            effects.push(RaftEffect::Committed { entries });
        }

        Ok((index, effects))
    }

    /// Install a run of already-committed entries received through peer
    /// synchronization, contiguous with the local log. Entries with gaps or
    /// duplicates are dropped; the caller is expected to have verified
    /// checksums.
    pub fn install_committed(&mut self, entries: Vec<LogEntry>) -> Vec<RaftEffect> {
        let mut highest = self.commit_index;
        for entry in entries {
            if entry.index != self.log.last_index() + 1 {
                continue;
            }
            highest = highest.max(entry.index);
            self.log.append(entry);
        }

        if highest <= self.commit_index {
            return Vec::new();
        }
        self.commit_index = highest;
        let newly_committed = self.log.mark_committed_up_to(highest);
        if newly_committed.is_empty() {
            return Vec::new();
        }
        vec![RaftEffect::Committed {
            entries: newly_committed,
        }]
    }

    /// Advance protocol timers.
    pub fn tick(&mut self, now: Instant) -> Vec<RaftEffect> {
        match self.role {
            Role::Leader => {
                if now >= self.next_heartbeat {
                    self.next_heartbeat = now + self.timings.heartbeat_interval;
                    self.replicate_to_all(now)
                } else {
                    Vec::new()
                }
            }
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline {
                    self.start_election(now)
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Feed one received protocol message.
    pub fn handle_message(
        &mut self,
        from: &NodeId,
        message: RaftMessage,
        now: Instant,
    ) -> Vec<RaftEffect> {
        if !self.config.contains(from) {
            debug!(%from, "dropping consensus message from non-member");
            return Vec::new();
        }

        match message {
            RaftMessage::RequestVote {
                term,
                last_log_index,
                last_log_term,
            } => self.handle_request_vote(from, term, last_log_index, last_log_term, now),
            RaftMessage::VoteResponse { term, granted } => {
                self.handle_vote_response(from, term, granted, now)
            }
            RaftMessage::AppendEntries {
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                from,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                now,
            ),
            RaftMessage::AppendResponse {
                term,
                success,
                match_index,
            } => self.handle_append_response(from, term, success, match_index, now),
            RaftMessage::InstallSnapshot {
                term,
                last_included_index,
                last_included_term,
                snapshot,
            } => self.handle_install_snapshot(
                from,
                term,
                last_included_index,
                last_included_term,
                snapshot,
                now,
            ),
        }
    }

    fn handle_request_vote(
        &mut self,
        from: &NodeId,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
        now: Instant,
    ) -> Vec<RaftEffect> {
        let mut effects = Vec::new();

        if term > self.current_term {
            effects.extend(self.become_follower(term, None, now));
        }

        // Candidate log must be at least as up-to-date: compare by last
        // entry term first, then by last entry index.
        let up_to_date = (last_log_term, last_log_index)
            >= (self.log.last_term(), self.log.last_index());
        let granted = term >= self.current_term
            && up_to_date
            && self
                .voted_for
                .as_ref()
                .is_none_or(|candidate| candidate == from);

        if granted {
            self.voted_for = Some(from.clone());
            self.reset_election_deadline(now);
        }

        debug!(%from, term, granted, "vote requested");
        effects.push(RaftEffect::Send {
            to: from.clone(),
            message: RaftMessage::VoteResponse {
                term: self.current_term,
                granted,
            },
        });
        effects
    }

    fn handle_vote_response(
        &mut self,
        from: &NodeId,
        term: u64,
        granted: bool,
        now: Instant,
    ) -> Vec<RaftEffect> {
        let mut effects = Vec::new();

        if term > self.current_term {
            return self.become_follower(term, None, now);
        }
        if self.role != Role::Candidate || term != self.current_term || !granted {
            return effects;
        }

        self.votes.insert(from.clone());
        if self.votes.len() >= self.config.quorum_size() {
            effects.extend(self.become_leader(self.current_term, now));
        }
        effects
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        from: &NodeId,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        now: Instant,
    ) -> Vec<RaftEffect> {
        let mut effects = Vec::new();

        if term < self.current_term {
            effects.push(RaftEffect::Send {
                to: from.clone(),
                message: RaftMessage::AppendResponse {
                    term: self.current_term,
                    success: false,
                    match_index: 0,
                },
            });
            return effects;
        }

        // Valid leader for this term: follow it and push the election out.
        effects.extend(self.become_follower(term, Some(from.clone()), now));
        self.failed_elections = 0;

        if entries.iter().any(|entry| !entry.verify()) {
            warn!(%from, "append entries failed checksum verification");
            effects.push(RaftEffect::IntegrityViolation { peer: from.clone() });
            effects.push(RaftEffect::Send {
                to: from.clone(),
                message: RaftMessage::AppendResponse {
                    term: self.current_term,
                    success: false,
                    match_index: 0,
                },
            });
            return effects;
        }

        // Consistency check on the entry preceding the batch.
        if prev_log_index > 0 && self.log.term_of(prev_log_index) != Some(prev_log_term) {
            debug!(
                %from,
                prev_log_index,
                "rejecting append entries, log mismatch"
            );
            effects.push(RaftEffect::Send {
                to: from.clone(),
                message: RaftMessage::AppendResponse {
                    term: self.current_term,
                    success: false,
                    match_index: 0,
                },
            });
            return effects;
        }

        for entry in entries {
            match self.log.term_of(entry.index) {
                // Duplicate delivery of an entry we already hold.
                Some(existing_term) if existing_term == entry.term => continue,
                // Divergent suffix left over from a deposed leader.
                Some(_) => {
                    self.log.truncate_from(entry.index);
                    self.log.append(entry);
                }
                None => self.log.append(entry),
            }
        }

        let match_index = self.log.last_index();
        if leader_commit > self.commit_index {
            let commit_to = leader_commit.min(match_index);
            self.commit_index = commit_to;
            let newly_committed = self.log.mark_committed_up_to(commit_to);
            if !newly_committed.is_empty() {
                effects.push(RaftEffect::Committed {
                    entries: newly_committed,
                });
            }
        }

        effects.push(RaftEffect::Send {
            to: from.clone(),
            message: RaftMessage::AppendResponse {
                term: self.current_term,
                success: true,
                match_index,
            },
        });
        effects
    }

    fn handle_append_response(
        &mut self,
        from: &NodeId,
        term: u64,
        success: bool,
        match_index: u64,
        now: Instant,
    ) -> Vec<RaftEffect> {
        let mut effects = Vec::new();

        if term > self.current_term {
            return self.become_follower(term, None, now);
        }
        if self.role != Role::Leader || term != self.current_term {
            return effects;
        }

        if success {
            self.match_index.insert(from.clone(), match_index);
            self.next_index.insert(from.clone(), match_index + 1);
            if let Some(entries) = self.advance_commit() {
                effects.push(RaftEffect::Committed { entries });
            }
            // Ship the remainder straight away if the follower is behind.
            if match_index < self.log.last_index() {
                effects.extend(self.replicate_to(from));
            }
        } else {
            // Back the follower's cursor up one entry and retry; repeated
            // rejections walk back to the divergence point and the follower
            // truncates from there.
            let next = self
                .next_index
                .get(from)
                .copied()
                .unwrap_or(self.log.last_index() + 1);
            self.next_index.insert(from.clone(), next.saturating_sub(1).max(1));
            effects.extend(self.replicate_to(from));
        }
        effects
    }

    fn handle_install_snapshot(
        &mut self,
        from: &NodeId,
        term: u64,
        last_included_index: u64,
        last_included_term: u64,
        snapshot: StateSnapshot,
        now: Instant,
    ) -> Vec<RaftEffect> {
        let mut effects = Vec::new();

        if term < self.current_term {
            effects.push(RaftEffect::Send {
                to: from.clone(),
                message: RaftMessage::AppendResponse {
                    term: self.current_term,
                    success: false,
                    match_index: 0,
                },
            });
            return effects;
        }

        effects.extend(self.become_follower(term, Some(from.clone()), now));

        if !snapshot.verify() {
            warn!(%from, "received snapshot failed checksum verification");
            effects.push(RaftEffect::IntegrityViolation { peer: from.clone() });
            return effects;
        }

        if last_included_index > self.commit_index {
            self.log.reset_to(last_included_index, last_included_term);
            self.commit_index = last_included_index;
            effects.push(RaftEffect::InstallState {
                snapshot,
                last_included_index,
            });
        }

        effects.push(RaftEffect::Send {
            to: from.clone(),
            message: RaftMessage::AppendResponse {
                term: self.current_term,
                success: true,
                match_index: self.log.last_index(),
            },
        });
        effects
    }

    fn start_election(&mut self, now: Instant) -> Vec<RaftEffect> {
        let mut effects = Vec::new();

        if self.role == Role::Candidate {
            self.failed_elections += 1;
            effects.push(RaftEffect::ElectionFailed {
                term: self.current_term,
                consecutive_failures: self.failed_elections,
            });
        }

        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.config.self_node.clone());
        self.votes = BTreeSet::from([self.config.self_node.clone()]);
        if self.leader.take().is_some() {
            effects.push(RaftEffect::LeadershipChanged {
                leader: None,
                term: self.current_term,
                is_self: false,
            });
        }
        self.reset_election_deadline(now);

        debug!(term = self.current_term, "starting election");

        if self.votes.len() >= self.config.quorum_size() {
            // Single-node room: the election is already won.
            effects.extend(self.become_leader(self.current_term, now));
            return effects;
        }

        effects.push(RaftEffect::Broadcast {
            message: RaftMessage::RequestVote {
                term: self.current_term,
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            },
        });
        effects
    }

    fn become_leader(&mut self, term: u64, now: Instant) -> Vec<RaftEffect> {
        self.current_term = term;
        self.role = Role::Leader;
        self.leader = Some(self.config.self_node.clone());
        self.voted_for = Some(self.config.self_node.clone());
        self.failed_elections = 0;
        self.next_heartbeat = now + self.timings.heartbeat_interval;

        self.next_index.clear();
        self.match_index.clear();
        for peer in self.config.peers().cloned().collect::<Vec<_>>() {
            self.next_index.insert(peer.clone(), self.log.last_index() + 1);
            self.match_index.insert(peer, 0);
        }

        debug!(term = self.current_term, "became leader");

        let mut effects = vec![RaftEffect::LeadershipChanged {
            leader: self.leader.clone(),
            term: self.current_term,
            is_self: true,
        }];
        // Announce leadership immediately with a heartbeat round.
        effects.extend(self.replicate_to_all(now));
        effects
    }

    fn become_follower(
        &mut self,
        term: u64,
        leader: Option<NodeId>,
        now: Instant,
    ) -> Vec<RaftEffect> {
        let mut effects = Vec::new();

        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }

        let was_leader_or_candidate = self.role != Role::Follower;
        self.role = Role::Follower;
        self.votes.clear();

        let leader_changed = leader.is_some() && leader != self.leader;
        if leader_changed || was_leader_or_candidate {
            if let Some(leader) = &leader {
                self.leader = Some(leader.clone());
            }
            if leader_changed {
                effects.push(RaftEffect::LeadershipChanged {
                    leader: self.leader.clone(),
                    term: self.current_term,
                    is_self: false,
                });
            }
        }
        self.reset_election_deadline(now);
        effects
    }

    /// One replication round towards every peer; doubles as the heartbeat.
    fn replicate_to_all(&mut self, now: Instant) -> Vec<RaftEffect> {
        self.next_heartbeat = now + self.timings.heartbeat_interval;
        let peers: Vec<NodeId> = self.config.peers().cloned().collect();
        peers
            .into_iter()
            .flat_map(|peer| self.replicate_to(&peer))
            .collect()
    }

    fn replicate_to(&mut self, peer: &NodeId) -> Vec<RaftEffect> {
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);

        // The follower needs entries we already compacted away.
        if next <= self.log.snapshot_index() {
            return vec![RaftEffect::SendSnapshot {
                to: peer.clone(),
                last_included_index: self.log.snapshot_index(),
                last_included_term: self.log.snapshot_term(),
            }];
        }

        let prev_log_index = next - 1;
        let Some(prev_log_term) = self.log.term_of(prev_log_index) else {
            return Vec::new();
        };

        vec![RaftEffect::Send {
            to: peer.clone(),
            message: RaftMessage::AppendEntries {
                term: self.current_term,
                prev_log_index,
                prev_log_term,
                entries: self.log.entries_from(next, MAX_REPLICATION_BATCH),
                leader_commit: self.commit_index,
            },
        }]
    }

    /// Commit every index replicated on a quorum, restricted to entries from
    /// the current term; older-term entries commit only transitively.
    fn advance_commit(&mut self) -> Option<Vec<LogEntry>> {
        let quorum = self.config.quorum_size();
        let mut target = self.commit_index;

        for index in (self.commit_index + 1..=self.log.last_index()).rev() {
            if self.log.term_of(index) != Some(self.current_term) {
                continue;
            }
            // The local log always counts towards the quorum.
            let replicated = 1 + self
                .match_index
                .values()
                .filter(|match_index| **match_index >= index)
                .count();
            if replicated >= quorum {
                target = index;
                break;
            }
        }

        if target <= self.commit_index {
            return None;
        }
        self.commit_index = target;
        let newly_committed = self.log.mark_committed_up_to(target);
        (!newly_committed.is_empty()).then_some(newly_committed)
    }

    fn reset_election_deadline(&mut self, now: Instant) {
        // Widen the window as soon as peers are known to exist.
        let (min, max) = if self.config.members().len() > 1 {
            (
                self.timings.joined_election_timeout_min,
                self.timings.joined_election_timeout_max,
            )
        } else {
            (
                self.timings.election_timeout_min,
                self.timings.election_timeout_max,
            )
        };
        let jitter = self
            .rng
            .gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        self.election_deadline = now + Duration::from_millis(jitter);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::{Duration, Instant};

    use assert_matches::assert_matches;
    use driftboard_core::{
        CausalityClock, EntityId, NodeId, Operation, OperationId, OperationMeta, RoomId,
    };

    use super::{ConsensusLog, RaftEffect, RaftTimings, Role, SubmitError};
    use crate::config::ClusterConfig;
    use crate::message::RaftMessage;

    fn operation(author: &NodeId, counter: u64) -> OperationMeta {
        let mut clock = CausalityClock::new();
        clock.tick(author);
        OperationMeta::new(
            OperationId::from_parts(author, counter),
            author.clone(),
            RoomId::new("room-1"),
            counter * 10,
            clock,
            Operation::DeleteElement {
                element_id: EntityId::new("element-1"),
            },
        )
    }

    fn node(name: &str, members: &[&str], now: Instant) -> ConsensusLog {
        let config = ClusterConfig::with_members(
            NodeId::new(name),
            RoomId::new("room-1"),
            members.iter().map(|member| NodeId::new(*member)),
        );
        ConsensusLog::new(config, RaftTimings::default(), now)
    }

    /// Advance far past any election window.
    fn past_deadline(now: Instant) -> Instant {
        now + Duration::from_secs(2)
    }

    fn first_broadcast(effects: &[RaftEffect]) -> RaftMessage {
        effects
            .iter()
            .find_map(|effect| match effect {
                RaftEffect::Broadcast { message } => Some(message.clone()),
                _ => None,
            })
            .expect("expected a broadcast effect")
    }

    #[test]
    fn single_node_elects_itself_on_timeout() {
        let now = Instant::now();
        let mut consensus = node("node-a", &["node-a"], now);
        assert_eq!(consensus.role(), Role::Follower);

        let effects = consensus.tick(past_deadline(now));
        assert_eq!(consensus.role(), Role::Leader);
        assert_matches!(
            effects.first(),
            Some(RaftEffect::LeadershipChanged { is_self: true, .. })
        );
    }

    #[test]
    fn single_node_commits_immediately() {
        let now = Instant::now();
        let mut consensus = node("node-a", &["node-a"], now);
        consensus.tick(past_deadline(now));

        let author = NodeId::new("node-a");
        let (index, effects) = consensus
            .submit_operation(operation(&author, 1), 0, past_deadline(now))
            .unwrap();

        assert_eq!(index, 1);
        assert_eq!(consensus.commit_index(), 1);
        assert!(
            effects
                .iter()
                .any(|effect| matches!(effect, RaftEffect::Committed { entries } if entries.len() == 1))
        );
    }

    #[test]
    fn follower_submission_fails_with_leader_hint() {
        let now = Instant::now();
        let mut follower = node("node-b", &["node-a", "node-b", "node-c"], now);

        // Learn about the leader through a heartbeat.
        let heartbeat = RaftMessage::AppendEntries {
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        follower.handle_message(&NodeId::new("node-a"), heartbeat, now);

        let author = NodeId::new("node-b");
        let result = follower.submit_operation(operation(&author, 1), 2, now);
        assert_eq!(
            result.unwrap_err(),
            SubmitError::NotLeader {
                leader: Some(NodeId::new("node-a")),
            }
        );
    }

    #[test]
    fn isolated_follower_elects_itself_to_stay_writable() {
        let now = Instant::now();
        let mut follower = node("node-b", &["node-a", "node-b", "node-c"], now);

        let author = NodeId::new("node-b");
        // Zero connected peers: the offline-first path must engage.
        let (index, _) = follower
            .submit_operation(operation(&author, 1), 0, now)
            .unwrap();

        assert_eq!(index, 1);
        assert_eq!(follower.role(), Role::Leader);
    }

    #[test]
    fn three_node_election_and_replication() {
        let now = Instant::now();
        let mut node_a = node("node-a", &["node-a", "node-b", "node-c"], now);
        let mut node_b = node("node-b", &["node-a", "node-b", "node-c"], now);

        // A times out and campaigns.
        let effects = node_a.tick(past_deadline(now));
        assert_eq!(node_a.role(), Role::Candidate);
        let request_vote = first_broadcast(&effects);

        // B grants the vote.
        let reply = node_b.handle_message(&NodeId::new("node-a"), request_vote, now);
        let vote = reply
            .iter()
            .find_map(|effect| match effect {
                RaftEffect::Send { to, message } if *to == NodeId::new("node-a") => {
                    Some(message.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_matches!(vote, RaftMessage::VoteResponse { granted: true, .. });

        // A reaches quorum (its own vote plus B's).
        let effects = node_a.handle_message(&NodeId::new("node-b"), vote, now);
        assert_eq!(node_a.role(), Role::Leader);
        assert!(effects.iter().any(|effect| matches!(
            effect,
            RaftEffect::LeadershipChanged { is_self: true, .. }
        )));

        // Replicate one operation to B and commit on its acknowledgement.
        let author = NodeId::new("node-a");
        let (_, effects) = node_a
            .submit_operation(operation(&author, 1), 2, now)
            .unwrap();
        let append = effects
            .iter()
            .find_map(|effect| match effect {
                RaftEffect::Send { to, message } if *to == NodeId::new("node-b") => {
                    Some(message.clone())
                }
                _ => None,
            })
            .unwrap();

        let reply = node_b.handle_message(&NodeId::new("node-a"), append, now);
        assert_eq!(node_b.log().last_index(), 1);
        let response = reply
            .iter()
            .find_map(|effect| match effect {
                RaftEffect::Send { message, .. } => Some(message.clone()),
                _ => None,
            })
            .unwrap();

        let effects = node_a.handle_message(&NodeId::new("node-b"), response, now);
        assert_eq!(node_a.commit_index(), 1);
        assert!(
            effects
                .iter()
                .any(|effect| matches!(effect, RaftEffect::Committed { .. }))
        );
    }

    #[test]
    fn vote_denied_when_candidate_log_is_stale() {
        let now = Instant::now();
        let mut voter = node("node-b", &["node-a", "node-b", "node-c"], now);

        // The voter holds a committed entry from term 1.
        let author = NodeId::new("node-a");
        let append = RaftMessage::AppendEntries {
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![crate::log::LogEntry::new(1, 1, operation(&author, 1))],
            leader_commit: 1,
        };
        voter.handle_message(&NodeId::new("node-a"), append, now);

        // A candidate with an empty log asks for a vote in a later term.
        let effects = voter.handle_message(
            &NodeId::new("node-c"),
            RaftMessage::RequestVote {
                term: 2,
                last_log_index: 0,
                last_log_term: 0,
            },
            now,
        );

        let response = effects
            .iter()
            .find_map(|effect| match effect {
                RaftEffect::Send { message, .. } => Some(message.clone()),
                _ => None,
            })
            .unwrap();
        assert_matches!(response, RaftMessage::VoteResponse { granted: false, .. });
    }

    #[test]
    fn at_most_one_vote_per_term() {
        let now = Instant::now();
        let mut voter = node("node-c", &["node-a", "node-b", "node-c"], now);

        let request = |term| RaftMessage::RequestVote {
            term,
            last_log_index: 0,
            last_log_term: 0,
        };

        let effects = voter.handle_message(&NodeId::new("node-a"), request(2), now);
        let first = effects
            .iter()
            .find_map(|effect| match effect {
                RaftEffect::Send { message, .. } => Some(message.clone()),
                _ => None,
            })
            .unwrap();
        assert_matches!(first, RaftMessage::VoteResponse { granted: true, .. });

        // Same term, different candidate: denied.
        let effects = voter.handle_message(&NodeId::new("node-b"), request(2), now);
        let second = effects
            .iter()
            .find_map(|effect| match effect {
                RaftEffect::Send { message, .. } => Some(message.clone()),
                _ => None,
            })
            .unwrap();
        assert_matches!(second, RaftMessage::VoteResponse { granted: false, .. });
    }

    #[test]
    fn follower_truncates_divergent_suffix() {
        let now = Instant::now();
        let mut follower = node("node-b", &["node-a", "node-b", "node-c"], now);
        let author_b = NodeId::new("node-b");
        let author_a = NodeId::new("node-a");

        // The follower holds two uncommitted entries from a deposed term-1
        // leader.
        let stale = RaftMessage::AppendEntries {
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                crate::log::LogEntry::new(1, 1, operation(&author_b, 1)),
                crate::log::LogEntry::new(1, 2, operation(&author_b, 2)),
            ],
            leader_commit: 0,
        };
        follower.handle_message(&NodeId::new("node-c"), stale, now);
        assert_eq!(follower.log().last_index(), 2);

        // The new term-2 leader replicates a different entry at index 1.
        let fresh = RaftMessage::AppendEntries {
            term: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![crate::log::LogEntry::new(2, 1, operation(&author_a, 9))],
            leader_commit: 1,
        };
        follower.handle_message(&NodeId::new("node-a"), fresh, now);

        assert_eq!(follower.log().last_index(), 1);
        assert_eq!(follower.log().get(1).unwrap().term, 2);
        assert_eq!(follower.commit_index(), 1);
    }

    #[test]
    fn corrupted_entries_are_rejected_and_flagged() {
        let now = Instant::now();
        let mut follower = node("node-b", &["node-a", "node-b"], now);
        let author = NodeId::new("node-a");

        let mut entry = crate::log::LogEntry::new(1, 1, operation(&author, 1));
        entry.term = 3; // breaks the entry checksum

        let effects = follower.handle_message(
            &NodeId::new("node-a"),
            RaftMessage::AppendEntries {
                term: 3,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry],
                leader_commit: 0,
            },
            now,
        );

        assert!(effects.iter().any(|effect| matches!(
            effect,
            RaftEffect::IntegrityViolation { peer } if *peer == NodeId::new("node-a")
        )));
        assert_eq!(follower.log().last_index(), 0);
    }

    #[test]
    fn membership_shrink_can_unblock_commits() {
        let now = Instant::now();
        let mut leader = node("node-a", &["node-a", "node-b", "node-c"], now);

        // Become leader with B's vote.
        leader.tick(past_deadline(now));
        leader.handle_message(
            &NodeId::new("node-b"),
            RaftMessage::VoteResponse {
                term: leader.current_term(),
                granted: true,
            },
            now,
        );
        assert_eq!(leader.role(), Role::Leader);

        // B and C vanish before acknowledging; the entry stays uncommitted.
        let author = NodeId::new("node-a");
        leader
            .submit_operation(operation(&author, 1), 2, now)
            .unwrap();
        assert_eq!(leader.commit_index(), 0);

        // Their final removal recomputes the quorum and commits.
        let effects = leader.set_members(BTreeSet::from([NodeId::new("node-a")]), now);
        assert_eq!(leader.commit_index(), 1);
        assert!(
            effects
                .iter()
                .any(|effect| matches!(effect, RaftEffect::Committed { .. }))
        );
    }

    #[test]
    fn repeated_election_failures_permit_self_election() {
        let now = Instant::now();
        let mut consensus = node("node-a", &["node-a", "node-b", "node-c"], now);

        // Let several election rounds expire unanswered. The first tick
        // starts the initial campaign; each one after that records a failure.
        let mut later = now;
        for _ in 0..super::MAX_FAILED_ELECTIONS + 2 {
            later = past_deadline(later);
            consensus.tick(later);
        }
        assert!(consensus.failed_elections() > super::MAX_FAILED_ELECTIONS);

        let author = NodeId::new("node-a");
        // One reachable peer, but elections keep failing: still self-elects.
        let (_, effects) = consensus
            .submit_operation(operation(&author, 1), 1, later)
            .unwrap();
        assert_eq!(consensus.role(), Role::Leader);
        assert!(effects.iter().any(|effect| matches!(
            effect,
            RaftEffect::LeadershipChanged { is_self: true, .. }
        )));
    }
}
