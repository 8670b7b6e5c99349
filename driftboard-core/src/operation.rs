// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::Checksum;
use crate::clock::CausalityClock;
use crate::ids::{EntityId, NodeId, OperationId, RoomId};
use crate::model::{Connection, Dimensions, Element, Position, PropertyValue, ThreatActor};
use crate::to_canonical_bytes;

/// The mutation vocabulary of the diagram.
///
/// Every variant carries the minimal before/after data the transform engine
/// needs to make two concurrent instances commute. Operations are immutable
/// once created; a transform produces a rewritten copy for application and
/// leaves the original untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    InsertElement {
        element: Element,
    },
    DeleteElement {
        element_id: EntityId,
    },
    MoveElement {
        element_id: EntityId,
        from: Position,
        to: Position,
    },
    ResizeElement {
        element_id: EntityId,
        from: Dimensions,
        to: Dimensions,
    },
    UpdateElementProperty {
        element_id: EntityId,
        key: String,
        previous: Option<PropertyValue>,
        value: PropertyValue,
    },
    InsertThreatActor {
        actor: ThreatActor,
    },
    DeleteThreatActor {
        actor_id: EntityId,
    },
    UpdateThreatActor {
        actor_id: EntityId,
        key: String,
        previous: Option<PropertyValue>,
        value: PropertyValue,
    },
    CreateConnection {
        connection: Connection,
    },
    DeleteConnection {
        connection_id: EntityId,
    },
    UpdateConnection {
        connection_id: EntityId,
        key: String,
        previous: Option<PropertyValue>,
        value: PropertyValue,
    },
}

impl Operation {
    /// The entity this operation mutates.
    pub fn target(&self) -> &EntityId {
        match self {
            Operation::InsertElement { element } => &element.id,
            Operation::DeleteElement { element_id } => element_id,
            Operation::MoveElement { element_id, .. } => element_id,
            Operation::ResizeElement { element_id, .. } => element_id,
            Operation::UpdateElementProperty { element_id, .. } => element_id,
            Operation::InsertThreatActor { actor } => &actor.id,
            Operation::DeleteThreatActor { actor_id } => actor_id,
            Operation::UpdateThreatActor { actor_id, .. } => actor_id,
            Operation::CreateConnection { connection } => &connection.id,
            Operation::DeleteConnection { connection_id } => connection_id,
            Operation::UpdateConnection { connection_id, .. } => connection_id,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Operation::DeleteElement { .. }
                | Operation::DeleteThreatActor { .. }
                | Operation::DeleteConnection { .. }
        )
    }

    /// The canvas position this operation places an entity at, if any.
    ///
    /// Used by the spatial-conflict rule: inserts place at the element's
    /// position, moves place at their destination.
    pub fn placement(&self) -> Option<Position> {
        match self {
            Operation::InsertElement { element } => Some(element.position),
            Operation::MoveElement { to, .. } => Some(*to),
            _ => None,
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::InsertElement { .. } => "insert_element",
            Operation::DeleteElement { .. } => "delete_element",
            Operation::MoveElement { .. } => "move_element",
            Operation::ResizeElement { .. } => "resize_element",
            Operation::UpdateElementProperty { .. } => "update_element_property",
            Operation::InsertThreatActor { .. } => "insert_threat_actor",
            Operation::DeleteThreatActor { .. } => "delete_threat_actor",
            Operation::UpdateThreatActor { .. } => "update_threat_actor",
            Operation::CreateConnection { .. } => "create_connection",
            Operation::DeleteConnection { .. } => "delete_connection",
            Operation::UpdateConnection { .. } => "update_connection",
        }
    }
}

/// An [`Operation`] wrapped with everything replication needs to know about
/// it: identity, provenance, causality snapshot and an integrity checksum.
///
/// Created once by the author node. The only legal mutation afterwards is
/// appending to `transformed_against` during conflict resolution; the
/// checksum deliberately excludes that list so it stays verifiable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationMeta {
    pub id: OperationId,
    pub author: NodeId,
    pub room: RoomId,
    /// Creation time in unix milliseconds, as claimed by the author.
    pub timestamp: u64,
    /// Causality-clock snapshot taken at creation.
    pub clock: CausalityClock,
    /// Ids of operations this one has already been transformed against.
    pub transformed_against: Vec<OperationId>,
    pub checksum: Checksum,
    pub operation: Operation,
}

impl OperationMeta {
    pub fn new(
        id: OperationId,
        author: NodeId,
        room: RoomId,
        timestamp: u64,
        clock: CausalityClock,
        operation: Operation,
    ) -> Self {
        let checksum = content_checksum(&id, &author, &room, timestamp, &clock, &operation);

        Self {
            id,
            author,
            room,
            timestamp,
            clock,
            transformed_against: Vec::new(),
            checksum,
            operation,
        }
    }

    /// Verify the integrity checksum against the carried content.
    pub fn verify(&self) -> bool {
        content_checksum(
            &self.id,
            &self.author,
            &self.room,
            self.timestamp,
            &self.clock,
            &self.operation,
        ) == self.checksum
    }

    /// Record that this operation was transformed against `other`.
    pub fn record_transformed_against(&mut self, other: &OperationId) {
        if !self.transformed_against.contains(other) {
            self.transformed_against.push(other.clone());
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        to_canonical_bytes(self)
    }
}

fn content_checksum(
    id: &OperationId,
    author: &NodeId,
    room: &RoomId,
    timestamp: u64,
    clock: &CausalityClock,
    operation: &Operation,
) -> Checksum {
    let bytes = to_canonical_bytes(&(id, author, room, timestamp, clock, operation));
    Checksum::new(bytes)
}

/// Validate an operation received from a peer before it may touch local
/// state: the checksum must match the content and the room must be ours.
pub fn validate_operation(meta: &OperationMeta, room: &RoomId) -> Result<(), OperationError> {
    if !meta.verify() {
        return Err(OperationError::ChecksumMismatch(meta.id.clone()));
    }
    if meta.room != *room {
        return Err(OperationError::RoomMismatch(
            meta.id.clone(),
            meta.room.clone(),
            room.clone(),
        ));
    }
    Ok(())
}

#[derive(Error, Debug)]
pub enum OperationError {
    #[error("operation {0} failed integrity verification")]
    ChecksumMismatch(OperationId),

    #[error("operation {0} belongs to room {1}, expected {2}")]
    RoomMismatch(OperationId, RoomId, RoomId),
}

#[cfg(test)]
mod tests {
    use crate::clock::CausalityClock;
    use crate::ids::{EntityId, NodeId, OperationId, RoomId};
    use crate::model::{Dimensions, Element, ElementKind, Position};

    use super::{Operation, OperationMeta};

    fn meta(operation: Operation) -> OperationMeta {
        let author = NodeId::new("node-a");
        let mut clock = CausalityClock::new();
        clock.tick(&author);

        OperationMeta::new(
            OperationId::from_parts(&author, 1),
            author,
            RoomId::new("room-1"),
            1_000,
            clock,
            operation,
        )
    }

    #[test]
    fn checksum_verifies_untampered_content() {
        let element = Element::new(
            EntityId::new("element-1"),
            ElementKind::Process,
            Position::new(10.0, 20.0),
            Dimensions::new(120.0, 60.0),
        );
        let meta = meta(Operation::InsertElement { element });
        assert!(meta.verify());
    }

    #[test]
    fn checksum_detects_tampered_content() {
        let mut meta = meta(Operation::DeleteElement {
            element_id: EntityId::new("element-1"),
        });
        meta.timestamp += 1;
        assert!(!meta.verify());
    }

    #[test]
    fn validation_rejects_foreign_rooms() {
        let meta = meta(Operation::DeleteElement {
            element_id: EntityId::new("element-1"),
        });

        assert!(super::validate_operation(&meta, &RoomId::new("room-1")).is_ok());
        assert!(super::validate_operation(&meta, &RoomId::new("room-2")).is_err());
    }

    #[test]
    fn transform_bookkeeping_does_not_invalidate_checksum() {
        let mut meta = meta(Operation::DeleteElement {
            element_id: EntityId::new("element-1"),
        });
        let other = OperationId::from_parts(&NodeId::new("node-b"), 7);

        meta.record_transformed_against(&other);
        meta.record_transformed_against(&other);

        assert_eq!(meta.transformed_against, vec![other]);
        assert!(meta.verify());
    }
}
