// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use driftboard_core::{
    Connection, Dimensions, Element, EntityId, Position, PropertyValue, ThreatActor,
};

/// One caller-facing mutation.
///
/// Updates carry a map of changed properties; the engine turns every entry
/// into its own operation so that unrelated fields from two concurrent
/// updates commute.
#[derive(Clone, Debug)]
pub enum Mutation {
    CreateElement {
        element: Element,
    },
    UpdateElement {
        element_id: EntityId,
        properties: BTreeMap<String, PropertyValue>,
    },
    DeleteElement {
        element_id: EntityId,
    },
    MoveElement {
        element_id: EntityId,
        to: Position,
    },
    ResizeElement {
        element_id: EntityId,
        to: Dimensions,
    },
    CreateThreatActor {
        actor: ThreatActor,
    },
    UpdateThreatActor {
        actor_id: EntityId,
        properties: BTreeMap<String, PropertyValue>,
    },
    DeleteThreatActor {
        actor_id: EntityId,
    },
    CreateConnection {
        connection: Connection,
    },
    UpdateConnection {
        connection_id: EntityId,
        properties: BTreeMap<String, PropertyValue>,
    },
    DeleteConnection {
        connection_id: EntityId,
    },
}
