// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;

use driftboard_core::{OperationMeta, RoomId, StateSnapshot};

use crate::traits::{EventStore, SnapshotStore, StoreError};

/// Volatile store, used in tests and as the default when no durable backend
/// is wired up.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: HashMap<RoomId, StateSnapshot>,
    events: HashMap<RoomId, Vec<OperationMeta>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn load_state(&self, room: &RoomId) -> Result<Option<StateSnapshot>, StoreError> {
        Ok(self.snapshots.get(room).cloned())
    }

    fn save_state(&mut self, room: &RoomId, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        self.snapshots.insert(room.clone(), snapshot.clone());
        Ok(())
    }
}

impl EventStore for MemoryStore {
    fn load_events(&self, room: &RoomId) -> Result<Vec<OperationMeta>, StoreError> {
        Ok(self.events.get(room).cloned().unwrap_or_default())
    }

    fn append_events(
        &mut self,
        room: &RoomId,
        operations: &[OperationMeta],
    ) -> Result<(), StoreError> {
        self.events
            .entry(room.clone())
            .or_default()
            .extend(operations.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use driftboard_core::{RoomId, StateSnapshot};

    use super::MemoryStore;
    use crate::traits::SnapshotStore;

    #[test]
    fn snapshot_round_trip() {
        let mut store = MemoryStore::new();
        let room = RoomId::new("room-1");
        assert!(store.load_state(&room).unwrap().is_none());

        let snapshot = StateSnapshot::new();
        store.save_state(&room, &snapshot).unwrap();
        assert_eq!(store.load_state(&room).unwrap(), Some(snapshot));
    }
}
