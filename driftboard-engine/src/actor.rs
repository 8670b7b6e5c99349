// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use driftboard_cluster::{
    Envelope, Incoming, PeerError, PeerEvent, PeerManager, QuarantineReason, SyncSession,
    Transport,
};
use driftboard_consensus::{
    ClusterConfig, ConsensusLog, LogEntry, MAX_FAILED_ELECTIONS, RaftEffect, RaftMessage,
    SubmitError,
};
use driftboard_core::{
    CausalityClock, EntityId, NodeId, Operation, OperationId, OperationMeta, StateSnapshot,
    validate_operation,
};
use driftboard_store::{EventStore, SnapshotStore};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{COMPACTION_THRESHOLD, CONSENSUS_TICK_INTERVAL, EngineConfig,
    PEER_SWEEP_INTERVAL};
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::materializer::Materializer;
use crate::mutation::Mutation;
use crate::orchestrator::EngineStatus;

/// How one mutation resolved inside the actor.
enum MutationOutcome {
    /// Validation failed; answered with `false`.
    Rejected,
    /// Held in the partition queue; answered with `true` (accepted).
    Queued,
    /// Committed synchronously (single-node quorum).
    Committed,
    /// Appended and replicating; answered once committed.
    AwaitingCommit(u64),
}

/// Requests from the public handle.
pub(crate) enum ToEngineActor {
    Mutate {
        mutation: Mutation,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<StateSnapshot>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// The single task owning all mutable replication state of one room.
///
/// Every mutation entry point, message handler and timer runs through the
/// `select!` loop in [`EngineActor::run`] one at a time; that loop is the
/// mutual-exclusion boundary that keeps the log and the materialized state
/// from ever being observed torn.
pub(crate) struct EngineActor<S> {
    config: EngineConfig,
    consensus: ConsensusLog,
    peers: PeerManager,
    materializer: Materializer,
    store: S,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<EngineEvent>,
    clock: CausalityClock,
    operation_counter: u64,
    /// Operations held back while the cluster is partitioned, in submission
    /// order.
    partition_queue: VecDeque<OperationMeta>,
    /// Callers whose operations await quorum acknowledgement, keyed by log
    /// index.
    pending_replies: Vec<(u64, oneshot::Sender<Result<bool, EngineError>>)>,
    /// Outbound synchronization sessions, one per joining peer.
    sync_sessions: HashMap<NodeId, SyncSession>,
    snapshot_dirty: bool,
}

impl<S> EngineActor<S>
where
    S: SnapshotStore + EventStore + Send + 'static,
{
    pub(crate) fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        store: S,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let cluster = ClusterConfig::solo(config.self_node.clone(), config.room.clone());
        let consensus = ConsensusLog::new(cluster, config.raft.clone(), Instant::now());
        let peers = PeerManager::new(config.self_node.clone(), config.peers.clone());

        Self {
            config,
            consensus,
            peers,
            materializer: Materializer::new(),
            store,
            transport,
            events,
            clock: CausalityClock::new(),
            operation_counter: 0,
            partition_queue: VecDeque::new(),
            pending_replies: Vec::new(),
            sync_sessions: HashMap::new(),
            snapshot_dirty: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut inbox: mpsc::Receiver<ToEngineActor>,
        mut incoming: mpsc::UnboundedReceiver<Incoming>,
        token: CancellationToken,
    ) {
        self.bootstrap();

        let mut consensus_tick = interval(CONSENSUS_TICK_INTERVAL);
        let mut heartbeat_tick = interval(self.config.peers.heartbeat_interval);
        let mut sweep_tick = interval(PEER_SWEEP_INTERVAL);
        let mut sync_pump = interval(self.config.peers.sync_batch_delay);
        let mut transport_open = true;

        let shutdown_reply = loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break None,

                message = inbox.recv() => match message {
                    Some(ToEngineActor::Shutdown { reply }) => break Some(reply),
                    Some(message) => self.handle_api(message),
                    None => break None,
                },

                received = incoming.recv(), if transport_open => match received {
                    Some(received) => self.handle_incoming(received),
                    // The transport went away; keep serving local edits.
                    None => transport_open = false,
                },

                _ = consensus_tick.tick() => {
                    let effects = self.consensus.tick(Instant::now());
                    self.handle_raft_effects(effects);
                },

                _ = heartbeat_tick.tick() => {
                    self.transport.broadcast(Envelope::Heartbeat {
                        timestamp: now_millis(),
                    });
                },

                _ = sweep_tick.tick() => {
                    let events = self.peers.sweep(Instant::now());
                    self.handle_peer_events(events);
                },

                _ = sync_pump.tick() => self.pump_sync_sessions(),
            }
        };

        // Announce a graceful departure so peers skip the reconnect grace
        // period for us.
        self.transport.broadcast(Envelope::Leave);

        // Dropping the interval timers with the actor guarantees nothing
        // fires after this point.
        debug!(node = %self.config.self_node, "engine actor stopped");
        if let Some(reply) = shutdown_reply {
            reply.send(()).ok();
        }
    }

    /// Seed state from persistence and announce ourselves to the room.
    fn bootstrap(&mut self) {
        match self.store.load_state(&self.config.room) {
            Ok(Some(snapshot)) => {
                debug!(version = snapshot.version, "recovered persisted snapshot");
                self.materializer = Materializer::from_snapshot(snapshot);
            }
            Ok(None) => {}
            Err(err) => self.emit_error(err.to_string(), "snapshot recovery"),
        }

        // The event log is a best-effort seed on top of the snapshot; every
        // apply is idempotent at the state level, so overlap is harmless.
        match self.store.load_events(&self.config.room) {
            Ok(operations) => {
                let now = now_millis();
                for operation in operations {
                    self.materializer.apply(&operation, now);
                }
            }
            Err(err) => self.emit_error(err.to_string(), "event recovery"),
        }

        self.emit(EngineEvent::StateInitialized);

        if !self.transport.peers().is_empty() {
            self.transport.broadcast(Envelope::JoinRequest {
                user: self.config.user.clone(),
                capabilities: Default::default(),
                permissions: Default::default(),
            });
        }
    }

    fn handle_api(&mut self, message: ToEngineActor) {
        match message {
            ToEngineActor::Mutate { mutation, reply } => match self.handle_mutation(mutation) {
                // Quorum acknowledgement is still outstanding; the caller is
                // answered when the commit index reaches the entry.
                Ok(MutationOutcome::AwaitingCommit(index)) => {
                    self.pending_replies.push((index, reply));
                }
                Ok(MutationOutcome::Committed) | Ok(MutationOutcome::Queued) => {
                    reply.send(Ok(true)).ok();
                }
                Ok(MutationOutcome::Rejected) => {
                    reply.send(Ok(false)).ok();
                }
                Err(err) => {
                    reply.send(Err(err)).ok();
                }
            },
            ToEngineActor::Snapshot { reply } => {
                reply.send(self.materializer.snapshot().clone()).ok();
            }
            ToEngineActor::Status { reply } => {
                reply.send(self.status()).ok();
            }
            // Handled by the run loop.
            ToEngineActor::Shutdown { .. } => {}
        }
    }

    fn status(&self) -> EngineStatus {
        let snapshot = self.materializer.snapshot();
        EngineStatus {
            node: self.config.self_node.clone(),
            room: self.config.room.clone(),
            is_leader: self.consensus.is_leader(),
            leader: self.consensus.leader_hint().cloned(),
            term: self.consensus.current_term(),
            commit_index: self.consensus.commit_index(),
            members: self.peers.members(),
            quorum_size: self.consensus.config().quorum_size(),
            stable: self.peers.is_stable(),
            connected_peers: self.peers.connected_peers(),
            version: snapshot.version,
        }
    }

    fn handle_mutation(&mut self, mutation: Mutation) -> Result<MutationOutcome, EngineError> {
        let operations = match self.build_operations(mutation) {
            Ok(operations) => operations,
            Err(missing) => {
                debug!(%missing, "mutation references a missing entity");
                return Ok(MutationOutcome::Rejected);
            }
        };

        let mut highest_index = None;
        for operation in operations {
            let meta = self.new_meta(operation);

            if !self.peers.is_stable() {
                debug!(id = %meta.id, "cluster unstable, queueing operation");
                self.partition_queue.push_back(meta);
                continue;
            }

            let (index, effects) = self
                .consensus
                .submit_operation(meta, self.peers.connected_peers(), Instant::now())
                .map_err(|SubmitError::NotLeader { leader }| EngineError::NotLeader { leader })?;
            highest_index = Some(index);
            self.handle_raft_effects(effects);
        }

        match highest_index {
            // Everything was queued for after the partition.
            None => Ok(MutationOutcome::Queued),
            Some(index) if index <= self.consensus.commit_index() => {
                Ok(MutationOutcome::Committed)
            }
            Some(index) => Ok(MutationOutcome::AwaitingCommit(index)),
        }
    }

    /// Validate the mutation against current state and expand it into one
    /// operation per mutated field.
    ///
    /// A missing entity is returned as an error value and becomes a `false`
    /// success flag, uniformly across update, delete and move.
    fn build_operations(&self, mutation: Mutation) -> Result<Vec<Operation>, EntityId> {
        let snapshot = self.materializer.snapshot();

        match mutation {
            Mutation::CreateElement { element } => Ok(vec![Operation::InsertElement { element }]),
            Mutation::UpdateElement {
                element_id,
                properties,
            } => {
                let element = snapshot
                    .elements
                    .get(&element_id)
                    .ok_or_else(|| element_id.clone())?;
                Ok(properties
                    .into_iter()
                    .map(|(key, value)| {
                        let previous = element.properties.get(&key).cloned();
                        Operation::UpdateElementProperty {
                            element_id: element_id.clone(),
                            key,
                            previous,
                            value,
                        }
                    })
                    .collect())
            }
            Mutation::DeleteElement { element_id } => {
                if !snapshot.elements.contains_key(&element_id) {
                    return Err(element_id);
                }
                Ok(vec![Operation::DeleteElement { element_id }])
            }
            Mutation::MoveElement { element_id, to } => {
                let element = snapshot
                    .elements
                    .get(&element_id)
                    .ok_or_else(|| element_id.clone())?;
                Ok(vec![Operation::MoveElement {
                    element_id,
                    from: element.position,
                    to,
                }])
            }
            Mutation::ResizeElement { element_id, to } => {
                let element = snapshot
                    .elements
                    .get(&element_id)
                    .ok_or_else(|| element_id.clone())?;
                Ok(vec![Operation::ResizeElement {
                    element_id,
                    from: element.size,
                    to,
                }])
            }
            Mutation::CreateThreatActor { actor } => {
                Ok(vec![Operation::InsertThreatActor { actor }])
            }
            Mutation::UpdateThreatActor {
                actor_id,
                properties,
            } => {
                let actor = snapshot
                    .threat_actors
                    .get(&actor_id)
                    .ok_or_else(|| actor_id.clone())?;
                Ok(properties
                    .into_iter()
                    .map(|(key, value)| {
                        let previous = actor.properties.get(&key).cloned();
                        Operation::UpdateThreatActor {
                            actor_id: actor_id.clone(),
                            key,
                            previous,
                            value,
                        }
                    })
                    .collect())
            }
            Mutation::DeleteThreatActor { actor_id } => {
                if !snapshot.threat_actors.contains_key(&actor_id) {
                    return Err(actor_id);
                }
                Ok(vec![Operation::DeleteThreatActor { actor_id }])
            }
            Mutation::CreateConnection { connection } => {
                if !snapshot.elements.contains_key(&connection.source) {
                    return Err(connection.source);
                }
                if !snapshot.elements.contains_key(&connection.target) {
                    return Err(connection.target);
                }
                Ok(vec![Operation::CreateConnection { connection }])
            }
            Mutation::UpdateConnection {
                connection_id,
                properties,
            } => {
                let connection = snapshot
                    .connections
                    .get(&connection_id)
                    .ok_or_else(|| connection_id.clone())?;
                Ok(properties
                    .into_iter()
                    .map(|(key, value)| {
                        let previous = connection.properties.get(&key).cloned();
                        Operation::UpdateConnection {
                            connection_id: connection_id.clone(),
                            key,
                            previous,
                            value,
                        }
                    })
                    .collect())
            }
            Mutation::DeleteConnection { connection_id } => {
                if !snapshot.connections.contains_key(&connection_id) {
                    return Err(connection_id);
                }
                Ok(vec![Operation::DeleteConnection { connection_id }])
            }
        }
    }

    fn new_meta(&mut self, operation: Operation) -> OperationMeta {
        self.clock.tick(&self.config.self_node);
        self.operation_counter += 1;
        OperationMeta::new(
            OperationId::from_parts(&self.config.self_node, self.operation_counter),
            self.config.self_node.clone(),
            self.config.room.clone(),
            now_millis(),
            self.clock.clone(),
            operation,
        )
    }

    fn handle_incoming(&mut self, received: Incoming) {
        let Incoming { from, envelope } = received;

        match envelope {
            Envelope::Raft(message) => {
                // Consensus traffic doubles as a liveness signal.
                let events = self.peers.record_heartbeat(&from, Instant::now());
                self.handle_peer_events(events);
                let effects = self.consensus.handle_message(&from, message, Instant::now());
                self.handle_raft_effects(effects);
            }
            Envelope::JoinRequest {
                user,
                capabilities,
                permissions,
            } => match self.peers.admit(from.clone(), user, capabilities, permissions, Instant::now()) {
                Ok(events) => {
                    let accept = Envelope::JoinAccept {
                        members: self.peers.members(),
                        leader: self.consensus.leader_hint().cloned(),
                        commit_index: self.consensus.commit_index(),
                    };
                    if let Err(err) = self.transport.send(&from, accept) {
                        debug!(%from, %err, "failed to answer join request");
                    }
                    self.handle_peer_events(events);
                }
                Err(PeerError::Quarantined(node)) => {
                    let reject = Envelope::JoinReject {
                        reason: format!("node {node} is quarantined"),
                    };
                    let _ = self.transport.send(&from, reject);
                }
                Err(err) => debug!(%from, %err, "join request not admitted"),
            },
            Envelope::JoinAccept {
                members,
                leader,
                commit_index,
            } => {
                debug!(%from, ?leader, commit_index, "join accepted");
                let mut events = Vec::new();
                for member in members {
                    events.extend(self.peers.observe_member(member, Instant::now()));
                }
                self.handle_peer_events(events);
                if commit_index > self.consensus.commit_index() {
                    self.emit(EngineEvent::SyncStatusChanged {
                        is_syncing: true,
                        progress: 0.0,
                    });
                }
            }
            Envelope::JoinReject { reason } => {
                self.emit_error(reason, "join rejected");
            }
            Envelope::SyncBatch {
                entries,
                commit_index,
            } => self.handle_sync_batch(from, entries, commit_index),
            Envelope::SyncAck { synced_to } => {
                self.peers.record_synced_index(&from, synced_to);
            }
            Envelope::SyncDone { .. } => {
                self.emit(EngineEvent::SyncStatusChanged {
                    is_syncing: false,
                    progress: 1.0,
                });
            }
            Envelope::Heartbeat { .. } => {
                let events = self.peers.record_heartbeat(&from, Instant::now());
                self.handle_peer_events(events);
            }
            Envelope::OperationBroadcast { operation } => {
                if let Err(err) = validate_operation(&operation, &self.config.room) {
                    warn!(%from, %err, "rejecting broadcast operation");
                    let events = self
                        .peers
                        .quarantine(&from, QuarantineReason::ChecksumMismatch);
                    self.handle_peer_events(events);
                    return;
                }
                self.apply_operation(&operation);
            }
            Envelope::Leave => {
                let events = self.peers.graceful_leave(&from);
                self.handle_peer_events(events);
            }
        }
    }

    fn handle_sync_batch(&mut self, from: NodeId, entries: Vec<LogEntry>, commit_index: u64) {
        if entries.iter().any(|entry| !entry.verify()) {
            warn!(%from, "sync batch failed integrity verification");
            let events = self
                .peers
                .quarantine(&from, QuarantineReason::ChecksumMismatch);
            self.handle_peer_events(events);
            return;
        }

        let effects = self.consensus.install_committed(entries);
        self.handle_raft_effects(effects);

        let progress = if commit_index == 0 {
            1.0
        } else {
            (self.consensus.commit_index() as f64 / commit_index as f64).min(1.0)
        };
        self.emit(EngineEvent::SyncStatusChanged {
            is_syncing: progress < 1.0,
            progress,
        });

        let _ = self.transport.send(
            &from,
            Envelope::SyncAck {
                synced_to: self.consensus.commit_index(),
            },
        );
    }

    fn handle_raft_effects(&mut self, effects: Vec<RaftEffect>) {
        for effect in effects {
            match effect {
                RaftEffect::Send { to, message } => {
                    if let Err(err) = self.transport.send(&to, Envelope::Raft(message)) {
                        debug!(%to, %err, "dropped consensus message");
                    }
                }
                RaftEffect::Broadcast { message } => {
                    self.transport.broadcast(Envelope::Raft(message));
                }
                RaftEffect::Committed { entries } => self.apply_committed(entries),
                RaftEffect::LeadershipChanged {
                    leader, is_self, ..
                } => {
                    if !is_self {
                        // Losing leadership orphans unacknowledged entries;
                        // callers are told to retry rather than left hanging.
                        for (_, reply) in self.pending_replies.drain(..) {
                            reply.send(Ok(false)).ok();
                        }
                    }
                    self.emit(EngineEvent::LeadershipChanged {
                        is_leader: is_self,
                        leader,
                    });
                }
                RaftEffect::ElectionFailed {
                    consecutive_failures,
                    ..
                } => {
                    // Failing elections with nobody reachable is the normal
                    // offline condition; failing them against a reachable
                    // cluster is worth surfacing.
                    if consecutive_failures > MAX_FAILED_ELECTIONS
                        && self.peers.connected_peers() > 0
                    {
                        self.emit_error(
                            format!("{consecutive_failures} consecutive elections failed"),
                            "consensus",
                        );
                    }
                }
                RaftEffect::SendSnapshot {
                    to,
                    last_included_index,
                    last_included_term,
                } => {
                    let message = RaftMessage::InstallSnapshot {
                        term: self.consensus.current_term(),
                        last_included_index,
                        last_included_term,
                        snapshot: self.materializer.snapshot().clone(),
                    };
                    let _ = self.transport.send(&to, Envelope::Raft(message));
                }
                RaftEffect::InstallState { snapshot, .. } => {
                    debug!(version = snapshot.version, "installing received snapshot");
                    self.materializer.replace(snapshot);
                    self.persist_snapshot();
                    self.emit_state_updated();
                }
                RaftEffect::IntegrityViolation { peer } => {
                    let events = self
                        .peers
                        .quarantine(&peer, QuarantineReason::ChecksumMismatch);
                    self.handle_peer_events(events);
                }
            }
        }
    }

    /// Apply freshly committed entries to the materialized state.
    fn apply_committed(&mut self, entries: Vec<LogEntry>) {
        let mut state_changed = false;

        for entry in entries {
            let operation = entry.operation;

            if operation.author != self.config.self_node {
                self.clock.merge(&operation.clock, &self.config.self_node);
            }

            let applied = self.materializer.apply(&operation, now_millis());
            state_changed |= applied.changed;
            for kind in applied.conflicts {
                self.emit(EngineEvent::ConflictResolved {
                    operation: operation.id.clone(),
                    kind,
                });
            }

            // Fast path for peers: push the committed operation directly,
            // ahead of the next replication round. Authority stays with the
            // log.
            if operation.author == self.config.self_node {
                self.transport.broadcast(Envelope::OperationBroadcast {
                    operation: operation.clone(),
                });
            }

            if let Err(err) = self
                .store
                .append_events(&self.config.room, std::slice::from_ref(&operation))
            {
                self.emit_error(err.to_string(), "event persistence");
            }
        }

        if state_changed || self.snapshot_dirty {
            self.persist_snapshot();
        }
        if state_changed {
            self.emit_state_updated();
        }
        self.drain_pending_replies();
        self.maybe_compact();
    }

    /// Answer callers whose entries the advancing commit index has covered.
    fn drain_pending_replies(&mut self) {
        let commit_index = self.consensus.commit_index();
        let mut index = 0;
        while index < self.pending_replies.len() {
            if self.pending_replies[index].0 <= commit_index {
                let (_, reply) = self.pending_replies.swap_remove(index);
                reply.send(Ok(true)).ok();
            } else {
                index += 1;
            }
        }
    }

    /// Apply one operation received outside the commit path (opportunistic
    /// broadcast); the applied-id set keeps the eventual log replication of
    /// the same operation from applying twice.
    fn apply_operation(&mut self, operation: &OperationMeta) {
        if operation.author != self.config.self_node {
            self.clock.merge(&operation.clock, &self.config.self_node);
        }

        let applied = self.materializer.apply(operation, now_millis());
        for kind in applied.conflicts {
            self.emit(EngineEvent::ConflictResolved {
                operation: operation.id.clone(),
                kind,
            });
        }
        if applied.changed {
            self.persist_snapshot();
            self.emit_state_updated();
        }
    }

    fn handle_peer_events(&mut self, events: Vec<PeerEvent>) {
        for event in events {
            match event {
                PeerEvent::Admitted { node } => {
                    self.sync_sessions
                        .insert(node.clone(), SyncSession::new(node.clone(), 0));
                    self.emit(EngineEvent::PeerJoined { node });
                    self.emit_connection_status();
                }
                PeerEvent::Rejoining { node, resume_from } => {
                    self.sync_sessions
                        .insert(node.clone(), SyncSession::new(node, resume_from));
                    self.emit(EngineEvent::SyncStatusChanged {
                        is_syncing: true,
                        progress: 0.0,
                    });
                    self.emit_connection_status();
                }
                PeerEvent::Activated { .. } => {
                    self.emit(EngineEvent::SyncStatusChanged {
                        is_syncing: false,
                        progress: 1.0,
                    });
                }
                PeerEvent::Disconnected { .. } => self.emit_connection_status(),
                PeerEvent::Left { node, .. } => {
                    self.sync_sessions.remove(&node);
                    self.emit(EngineEvent::PeerLeft { node });
                    self.emit_connection_status();
                }
                PeerEvent::MembershipChanged { members } => {
                    let effects = self.consensus.set_members(members, Instant::now());
                    self.handle_raft_effects(effects);
                }
                PeerEvent::StabilityChanged { stable, .. } => {
                    self.emit_connection_status();
                    if stable {
                        self.flush_partition_queue();
                    }
                }
                PeerEvent::Quarantined { node, reason } => {
                    let error = match reason {
                        QuarantineReason::ChecksumMismatch => EngineError::Integrity(node),
                        QuarantineReason::SyncFailure => EngineError::SyncTimeout(node),
                    };
                    self.emit_error(error.to_string(), "peer lifecycle");
                }
            }
        }
    }

    /// Once stability returns, queued operations are submitted strictly in
    /// their original submission order.
    fn flush_partition_queue(&mut self) {
        debug!(
            queued = self.partition_queue.len(),
            "stability restored, flushing queued operations"
        );
        while let Some(meta) = self.partition_queue.pop_front() {
            match self
                .consensus
                .submit_operation(meta.clone(), self.peers.connected_peers(), Instant::now())
            {
                Ok((_, effects)) => self.handle_raft_effects(effects),
                Err(SubmitError::NotLeader { leader }) => {
                    // Put it back and wait for a leader; order is preserved.
                    self.partition_queue.push_front(meta);
                    self.emit_error(
                        format!("queued operations await leader {leader:?}"),
                        "partition recovery",
                    );
                    break;
                }
            }
        }
    }

    /// Ship one batch per active sync session; the pump interval provides
    /// the inter-batch delay.
    fn pump_sync_sessions(&mut self) {
        if self.sync_sessions.is_empty() {
            return;
        }

        let batch_size = self.config.peers.sync_batch_size;
        let max_attempts = self.config.peers.max_sync_attempts;
        let commit_index = self.consensus.commit_index();

        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for (node, session) in self.sync_sessions.iter_mut() {
            // A cursor below the compaction baseline cannot be served from
            // the log any more; ship the snapshot instead and resume the
            // stream behind it.
            let snapshot_floor = self.consensus.log().snapshot_index();
            if snapshot_floor > 0 && session.cursor() <= snapshot_floor {
                let message = RaftMessage::InstallSnapshot {
                    term: self.consensus.current_term(),
                    last_included_index: snapshot_floor,
                    last_included_term: self.consensus.log().snapshot_term(),
                    snapshot: self.materializer.snapshot().clone(),
                };
                let _ = self.transport.send(node, Envelope::Raft(message));
                session.skip_to(snapshot_floor + 1);
                continue;
            }

            let batch_start = session.cursor();
            match session.next_batch(self.consensus.log(), batch_size) {
                Some(entries) if entries.is_empty() => completed.push(node.clone()),
                Some(entries) => {
                    let envelope = Envelope::SyncBatch {
                        entries,
                        commit_index,
                    };
                    if self.transport.send(node, envelope).is_err() {
                        session.rewind(batch_start);
                        if session.record_failure(max_attempts) {
                            failed.push(node.clone());
                        }
                    } else {
                        let _ = self.events.send(EngineEvent::SyncStatusChanged {
                            is_syncing: true,
                            progress: session.progress(commit_index),
                        });
                    }
                }
                None => {
                    let _ = self.transport.send(
                        node,
                        Envelope::SyncDone {
                            last_index: commit_index,
                        },
                    );
                    completed.push(node.clone());
                }
            }
        }

        let mut peer_events = Vec::new();
        for node in completed {
            self.sync_sessions.remove(&node);
            match self.peers.mark_active(&node, Instant::now()) {
                Ok(events) => peer_events.extend(events),
                // The peer may have left or timed out mid-sync.
                Err(err) => debug!(%node, %err, "could not activate synced peer"),
            }
        }
        for node in failed {
            error!(%node, "synchronization failed repeatedly, quarantining peer");
            self.sync_sessions.remove(&node);
            peer_events.extend(self.peers.quarantine(&node, QuarantineReason::SyncFailure));
        }
        self.handle_peer_events(peer_events);
    }

    fn persist_snapshot(&mut self) {
        match self
            .store
            .save_state(&self.config.room, self.materializer.snapshot())
        {
            Ok(()) => self.snapshot_dirty = false,
            Err(err) => {
                // In-memory state is authoritative either way; the write is
                // retried on the next commit.
                warn!(%err, "snapshot persistence failed");
                self.snapshot_dirty = true;
                self.emit_error(err.to_string(), "snapshot persistence");
            }
        }
    }

    fn maybe_compact(&mut self) {
        if self.snapshot_dirty || self.consensus.log().len() <= COMPACTION_THRESHOLD {
            return;
        }
        let commit_index = self.consensus.commit_index();
        self.consensus.compact_to(commit_index);
        debug!(commit_index, "folded committed entries into the snapshot");
    }

    fn emit(&self, event: EngineEvent) {
        // A send error only means nobody is subscribed right now.
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: String, context: impl Into<String>) {
        self.emit(EngineEvent::ErrorOccurred {
            error,
            context: context.into(),
        });
    }

    fn emit_state_updated(&self) {
        let snapshot = self.materializer.snapshot();
        self.emit(EngineEvent::StateUpdated {
            elements: snapshot.elements.clone(),
            threat_actors: snapshot.threat_actors.clone(),
            connections: snapshot.connections.clone(),
        });
    }

    fn emit_connection_status(&self) {
        let stats = self.transport.stats();
        self.emit(EngineEvent::ConnectionStatusChanged {
            is_connected: stats.connected_peers > 0,
            peer_count: stats.connected_peers,
        });
    }
}
