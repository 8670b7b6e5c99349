// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use driftboard_cluster::{Incoming, Transport};
use driftboard_core::{
    Connection, Dimensions, Element, EntityId, NodeId, Position, PropertyValue, RoomId,
    StateSnapshot, ThreatActor,
};
use driftboard_store::{EventStore, SnapshotStore};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actor::{EngineActor, ToEngineActor};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::mutation::Mutation;

/// Capacity of the API request channel.
const API_CHANNEL_SIZE: usize = 64;

/// Capacity of the event broadcast channel; a slow subscriber that lags
/// this far behind loses the oldest events and resynchronizes from the next
/// full `StateUpdated`.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Point-in-time view of the engine, for status surfaces and tests.
#[derive(Clone, Debug)]
pub struct EngineStatus {
    pub node: NodeId,
    pub room: RoomId,
    pub is_leader: bool,
    pub leader: Option<NodeId>,
    pub term: u64,
    pub commit_index: u64,
    pub members: BTreeSet<NodeId>,
    pub quorum_size: usize,
    pub stable: bool,
    pub connected_peers: usize,
    pub version: u64,
}

/// Handle to one room's replication engine.
///
/// Construction spawns the actor task that owns all state; the handle only
/// passes messages. Dropping the handle without calling [`shutdown`]
/// cancels the actor through its token.
///
/// [`shutdown`]: Orchestrator::shutdown
pub struct Orchestrator {
    inbox: mpsc::Sender<ToEngineActor>,
    events: broadcast::Sender<EngineEvent>,
    token: CancellationToken,
    actor: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Spawn the engine for one room over the given transport and store.
    ///
    /// `incoming` is the receiving half the concrete transport delivers
    /// messages through; it is unbounded because transports send from
    /// synchronous contexts.
    pub fn spawn<S>(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        incoming: mpsc::UnboundedReceiver<Incoming>,
        store: S,
    ) -> Self
    where
        S: SnapshotStore + EventStore + Send + 'static,
    {
        let (inbox_tx, inbox_rx) = mpsc::channel(API_CHANNEL_SIZE);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let token = CancellationToken::new();

        let actor = EngineActor::new(config, transport, store, events_tx.clone());
        let actor = tokio::spawn(actor.run(inbox_rx, incoming, token.clone()));

        Self {
            inbox: inbox_tx,
            events: events_tx,
            token,
            actor: Some(actor),
        }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn create_element(&self, element: Element) -> Result<bool, EngineError> {
        self.mutate(Mutation::CreateElement { element }).await
    }

    pub async fn update_element(
        &self,
        element_id: EntityId,
        properties: BTreeMap<String, PropertyValue>,
    ) -> Result<bool, EngineError> {
        self.mutate(Mutation::UpdateElement {
            element_id,
            properties,
        })
        .await
    }

    pub async fn delete_element(&self, element_id: EntityId) -> Result<bool, EngineError> {
        self.mutate(Mutation::DeleteElement { element_id }).await
    }

    pub async fn move_element(
        &self,
        element_id: EntityId,
        to: Position,
    ) -> Result<bool, EngineError> {
        self.mutate(Mutation::MoveElement { element_id, to }).await
    }

    pub async fn resize_element(
        &self,
        element_id: EntityId,
        to: Dimensions,
    ) -> Result<bool, EngineError> {
        self.mutate(Mutation::ResizeElement { element_id, to }).await
    }

    pub async fn create_threat_actor(&self, actor: ThreatActor) -> Result<bool, EngineError> {
        self.mutate(Mutation::CreateThreatActor { actor }).await
    }

    pub async fn update_threat_actor(
        &self,
        actor_id: EntityId,
        properties: BTreeMap<String, PropertyValue>,
    ) -> Result<bool, EngineError> {
        self.mutate(Mutation::UpdateThreatActor {
            actor_id,
            properties,
        })
        .await
    }

    pub async fn delete_threat_actor(&self, actor_id: EntityId) -> Result<bool, EngineError> {
        self.mutate(Mutation::DeleteThreatActor { actor_id }).await
    }

    pub async fn create_connection(&self, connection: Connection) -> Result<bool, EngineError> {
        self.mutate(Mutation::CreateConnection { connection }).await
    }

    pub async fn update_connection(
        &self,
        connection_id: EntityId,
        properties: BTreeMap<String, PropertyValue>,
    ) -> Result<bool, EngineError> {
        self.mutate(Mutation::UpdateConnection {
            connection_id,
            properties,
        })
        .await
    }

    pub async fn delete_connection(&self, connection_id: EntityId) -> Result<bool, EngineError> {
        self.mutate(Mutation::DeleteConnection { connection_id }).await
    }

    /// Submit one mutation and await its success flag.
    pub async fn mutate(&self, mutation: Mutation) -> Result<bool, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inbox
            .send(ToEngineActor::Mutate {
                mutation,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::Terminated)?;
        reply_rx.await.map_err(|_| EngineError::Terminated)?
    }

    /// Current materialized state.
    pub async fn snapshot(&self) -> Result<StateSnapshot, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inbox
            .send(ToEngineActor::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| EngineError::Terminated)?;
        reply_rx.await.map_err(|_| EngineError::Terminated)
    }

    /// Current engine status.
    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inbox
            .send(ToEngineActor::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::Terminated)?;
        reply_rx.await.map_err(|_| EngineError::Terminated)
    }

    /// Stop the actor and wait for it to wind down. All timers die with it.
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .inbox
            .send(ToEngineActor::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        self.token.cancel();
        if let Some(actor) = self.actor.take() {
            let _ = actor.await;
        }
        Ok(())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
