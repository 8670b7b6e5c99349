// SPDX-License-Identifier: MIT OR Apache-2.0

use driftboard_core::{OperationMeta, RoomId, StateSnapshot};
use thiserror::Error;

pub trait SnapshotStore {
    /// Load the persisted snapshot of a room, if any.
    fn load_state(&self, room: &RoomId) -> Result<Option<StateSnapshot>, StoreError>;

    /// Persist the snapshot of a room, replacing any previous one.
    fn save_state(&mut self, room: &RoomId, snapshot: &StateSnapshot) -> Result<(), StoreError>;
}

pub trait EventStore {
    /// Load the persisted operation tail of a room, in append order.
    fn load_events(&self, room: &RoomId) -> Result<Vec<OperationMeta>, StoreError>;

    /// Append operations to the room's event log.
    fn append_events(
        &mut self,
        room: &RoomId,
        operations: &[OperationMeta],
    ) -> Result<(), StoreError>;
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("error occurred in snapshot store: {0}")]
    Snapshot(String),

    #[error("error occurred in event store: {0}")]
    Events(String),
}
