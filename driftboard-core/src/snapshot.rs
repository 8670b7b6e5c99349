// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::ids::EntityId;
use crate::model::{Connection, Element, ThreatActor};
use crate::operation::Operation;
use crate::to_canonical_bytes;

/// The materialized, canonical collaborative state.
///
/// Version and checksum move atomically with every content mutation. The
/// checksum is a pure function of the three collections, so two nodes that
/// applied the same committed operations agree on it regardless of arrival
/// order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub elements: BTreeMap<EntityId, Element>,
    pub threat_actors: BTreeMap<EntityId, ThreatActor>,
    pub connections: BTreeMap<EntityId, Connection>,
    pub version: u64,
    /// Unix milliseconds of the last applied mutation.
    pub last_modified: u64,
    pub checksum: Checksum,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSnapshot {
    pub fn new() -> Self {
        let mut snapshot = Self {
            elements: BTreeMap::new(),
            threat_actors: BTreeMap::new(),
            connections: BTreeMap::new(),
            version: 0,
            last_modified: 0,
            checksum: Checksum::new(b""),
        };
        snapshot.checksum = snapshot.content_checksum();
        snapshot
    }

    /// Checksum over the collections only, not the version counter.
    pub fn content_checksum(&self) -> Checksum {
        let bytes = to_canonical_bytes(&(&self.elements, &self.threat_actors, &self.connections));
        Checksum::new(bytes)
    }

    /// Verify the carried checksum against the carried content.
    pub fn verify(&self) -> bool {
        self.content_checksum() == self.checksum
    }

    /// Apply one committed operation to the collections.
    ///
    /// Returns `true` when state changed; version, `last_modified` and the
    /// checksum are updated in the same call. Operations referencing entities
    /// that no longer exist apply as no-ops: after a delete-wins transform
    /// both sides must converge without an error path.
    pub fn apply(&mut self, operation: &Operation, now: u64) -> bool {
        let changed = self.apply_content(operation);

        if changed {
            self.version += 1;
            self.last_modified = now;
            self.checksum = self.content_checksum();
        }

        changed
    }

    fn apply_content(&mut self, operation: &Operation) -> bool {
        match operation {
            Operation::InsertElement { element } => {
                if self.elements.contains_key(&element.id) {
                    return false;
                }
                self.elements.insert(element.id.clone(), element.clone());
                true
            }
            Operation::DeleteElement { element_id } => {
                if self.elements.remove(element_id).is_none() {
                    return false;
                }
                // Connections cannot dangle: drop every edge touching the
                // removed element.
                self.connections
                    .retain(|_, connection| {
                        connection.source != *element_id && connection.target != *element_id
                    });
                true
            }
            Operation::MoveElement { element_id, to, .. } => {
                match self.elements.get_mut(element_id) {
                    Some(element) if element.position != *to => {
                        element.position = *to;
                        true
                    }
                    _ => false,
                }
            }
            Operation::ResizeElement { element_id, to, .. } => {
                match self.elements.get_mut(element_id) {
                    Some(element) if element.size != *to => {
                        element.size = *to;
                        true
                    }
                    _ => false,
                }
            }
            Operation::UpdateElementProperty {
                element_id,
                key,
                value,
                ..
            } => match self.elements.get_mut(element_id) {
                Some(element) => {
                    element.properties.insert(key.clone(), value.clone()) != Some(value.clone())
                }
                None => false,
            },
            Operation::InsertThreatActor { actor } => {
                if self.threat_actors.contains_key(&actor.id) {
                    return false;
                }
                self.threat_actors.insert(actor.id.clone(), actor.clone());
                true
            }
            Operation::DeleteThreatActor { actor_id } => {
                self.threat_actors.remove(actor_id).is_some()
            }
            Operation::UpdateThreatActor {
                actor_id,
                key,
                value,
                ..
            } => match self.threat_actors.get_mut(actor_id) {
                Some(actor) => {
                    actor.properties.insert(key.clone(), value.clone()) != Some(value.clone())
                }
                None => false,
            },
            Operation::CreateConnection { connection } => {
                if self.connections.contains_key(&connection.id) {
                    return false;
                }
                // Both endpoints have to exist; a connection racing an element
                // delete resolves in favour of the delete.
                if !self.elements.contains_key(&connection.source)
                    || !self.elements.contains_key(&connection.target)
                {
                    return false;
                }
                self.connections
                    .insert(connection.id.clone(), connection.clone());
                true
            }
            Operation::DeleteConnection { connection_id } => {
                self.connections.remove(connection_id).is_some()
            }
            Operation::UpdateConnection {
                connection_id,
                key,
                value,
                ..
            } => match self.connections.get_mut(connection_id) {
                Some(connection) => {
                    connection.properties.insert(key.clone(), value.clone()) != Some(value.clone())
                }
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ids::EntityId;
    use crate::model::{Connection, Dimensions, Element, ElementKind, Position};
    use crate::operation::Operation;

    use super::StateSnapshot;

    fn element(id: &str) -> Element {
        Element::new(
            EntityId::new(id),
            ElementKind::Process,
            Position::new(0.0, 0.0),
            Dimensions::new(100.0, 50.0),
        )
    }

    #[test]
    fn apply_bumps_version_and_checksum_together() {
        let mut snapshot = StateSnapshot::new();
        let before = snapshot.checksum;

        let changed = snapshot.apply(
            &Operation::InsertElement {
                element: element("element-1"),
            },
            1_000,
        );

        assert!(changed);
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.last_modified, 1_000);
        assert_ne!(snapshot.checksum, before);
        assert!(snapshot.verify());
    }

    #[test]
    fn update_on_missing_entity_is_a_noop() {
        let mut snapshot = StateSnapshot::new();

        let changed = snapshot.apply(
            &Operation::MoveElement {
                element_id: EntityId::new("ghost"),
                from: Position::new(0.0, 0.0),
                to: Position::new(50.0, 50.0),
            },
            1_000,
        );

        assert!(!changed);
        assert_eq!(snapshot.version, 0);
    }

    #[test]
    fn deleting_an_element_drops_its_connections() {
        let mut snapshot = StateSnapshot::new();
        snapshot.apply(
            &Operation::InsertElement {
                element: element("element-1"),
            },
            1,
        );
        snapshot.apply(
            &Operation::InsertElement {
                element: element("element-2"),
            },
            2,
        );
        snapshot.apply(
            &Operation::CreateConnection {
                connection: Connection::new(
                    EntityId::new("connection-1"),
                    EntityId::new("element-1"),
                    EntityId::new("element-2"),
                ),
            },
            3,
        );
        assert_eq!(snapshot.connections.len(), 1);

        snapshot.apply(
            &Operation::DeleteElement {
                element_id: EntityId::new("element-1"),
            },
            4,
        );

        assert!(snapshot.connections.is_empty());
        assert!(snapshot.verify());
    }

    #[test]
    fn identical_content_yields_identical_checksums() {
        let mut snapshot_a = StateSnapshot::new();
        let mut snapshot_b = StateSnapshot::new();

        for (snapshot, order) in [(&mut snapshot_a, [1, 2]), (&mut snapshot_b, [2, 1])] {
            for index in order {
                snapshot.apply(
                    &Operation::InsertElement {
                        element: element(&format!("element-{index}")),
                    },
                    10,
                );
            }
        }

        // Arrival order differs, content is equal.
        assert_eq!(snapshot_a.checksum, snapshot_b.checksum);
    }
}
