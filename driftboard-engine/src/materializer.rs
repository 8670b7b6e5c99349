// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{HashSet, VecDeque};

use driftboard_core::{CausalOrder, Operation, OperationId, OperationMeta, StateSnapshot};
use driftboard_ot::{ConflictKind, Transformed, transform};
use tracing::debug;

/// How many recently applied operations are retained for concurrency
/// checks. Operations further back are causally settled for every peer that
/// is still inside its reconnect grace period.
const CONCURRENCY_WINDOW: usize = 128;

/// Result of applying one operation.
#[derive(Clone, Debug, Default)]
pub struct Applied {
    /// Whether the materialized state changed.
    pub changed: bool,
    /// Conflicts resolved on the way in.
    pub conflicts: Vec<ConflictKind>,
}

/// Owns the canonical collections and applies operations to them exactly
/// once.
///
/// Incoming operations are checked against the recent window via the
/// causality clock; concurrent pairs run through the transform engine
/// before application, and an already-applied operation that the transform
/// decides against is compensated so both arrival orders converge.
#[derive(Debug, Default)]
pub struct Materializer {
    snapshot: StateSnapshot,
    applied: HashSet<OperationId>,
    window: VecDeque<OperationMeta>,
}

impl Materializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot,
            applied: HashSet::new(),
            window: VecDeque::new(),
        }
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn has_applied(&self, id: &OperationId) -> bool {
        self.applied.contains(id)
    }

    /// Replace the whole state, as part of snapshot installation.
    pub fn replace(&mut self, snapshot: StateSnapshot) {
        self.snapshot = snapshot;
        self.applied.clear();
        self.window.clear();
    }

    /// Apply one operation idempotently.
    ///
    /// Re-applying an id that was already applied (for example once via
    /// direct peer broadcast and once via log replication) changes nothing.
    pub fn apply(&mut self, incoming: &OperationMeta, now: u64) -> Applied {
        if self.applied.contains(&incoming.id) {
            return Applied::default();
        }

        let mut effective = incoming.clone();
        let mut conflicts = Vec::new();
        let mut changed = false;
        let mut dropped = false;

        for other in self.window.iter_mut() {
            if effective.transformed_against.contains(&other.id)
                || other.transformed_against.contains(&effective.id)
            {
                continue;
            }
            if effective.clock.causal_cmp(&other.clock) != CausalOrder::Concurrent {
                continue;
            }

            let pair = transform(&effective, other);
            let other_id = other.id.clone();
            effective.record_transformed_against(&other_id);
            other.record_transformed_against(&effective.id);

            if let Some(kind) = pair.conflict {
                debug!(incoming = %effective.id, against = %other_id, ?kind, "resolved conflict");
                conflicts.push(kind);
            }

            // The counterpart is already materialized; if the transform
            // decided against it, fix the state up so both arrival orders
            // converge.
            changed |= Self::compensate(&mut self.snapshot, other, &pair.right, now);

            match pair.left {
                Transformed::Unchanged(_) => {}
                Transformed::Rewritten(operation) => effective.operation = operation,
                Transformed::Noop => {
                    dropped = true;
                    break;
                }
            }
        }

        if !dropped {
            changed |= self.snapshot.apply(&effective.operation, now);
        }

        self.applied.insert(incoming.id.clone());
        self.window.push_back(effective);
        if self.window.len() > CONCURRENCY_WINDOW {
            self.window.pop_front();
        }

        Applied { changed, conflicts }
    }

    /// Rewrite history for an already-applied operation the transform ruled
    /// against.
    fn compensate(
        snapshot: &mut StateSnapshot,
        original: &OperationMeta,
        outcome: &Transformed,
        now: u64,
    ) -> bool {
        match outcome {
            Transformed::Unchanged(_) => false,
            Transformed::Noop => match &original.operation {
                // A losing connection creation has to be taken back out;
                // losing property updates are simply overwritten by the
                // winner's application.
                Operation::CreateConnection { connection } => snapshot.apply(
                    &Operation::DeleteConnection {
                        connection_id: connection.id.clone(),
                    },
                    now,
                ),
                _ => false,
            },
            Transformed::Rewritten(rewritten) => match rewritten {
                // The element exists already; only its placement moved.
                Operation::InsertElement { element } => snapshot.apply(
                    &Operation::MoveElement {
                        element_id: element.id.clone(),
                        from: element.position,
                        to: element.position,
                    },
                    now,
                ),
                other => snapshot.apply(other, now),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use driftboard_core::{
        CausalityClock, Connection, Dimensions, Element, ElementKind, EntityId, NodeId, Operation,
        OperationId, OperationMeta, Position, PropertyValue, RoomId,
    };

    use super::Materializer;

    fn meta(
        node: &str,
        counter: u64,
        timestamp: u64,
        clock: CausalityClock,
        operation: Operation,
    ) -> OperationMeta {
        let author = NodeId::new(node);
        OperationMeta::new(
            OperationId::from_parts(&author, counter),
            author,
            RoomId::new("room-1"),
            timestamp,
            clock,
            operation,
        )
    }

    fn clock_of(entries: &[(&str, u64)]) -> CausalityClock {
        let mut clock = CausalityClock::new();
        for (node, count) in entries {
            for _ in 0..*count {
                clock.tick(&NodeId::new(*node));
            }
        }
        clock
    }

    fn insert_element(id: &str) -> Operation {
        Operation::InsertElement {
            element: Element::new(
                EntityId::new(id),
                ElementKind::Process,
                Position::new(0.0, 0.0),
                Dimensions::new(100.0, 50.0),
            ),
        }
    }

    #[test]
    fn reapplying_an_operation_changes_nothing() {
        let mut materializer = Materializer::new();
        let operation = meta(
            "node-a",
            1,
            100,
            clock_of(&[("node-a", 1)]),
            insert_element("element-1"),
        );

        let first = materializer.apply(&operation, 100);
        assert!(first.changed);
        let version = materializer.snapshot().version;
        let checksum = materializer.snapshot().checksum;

        let second = materializer.apply(&operation, 200);
        assert!(!second.changed);
        assert_eq!(materializer.snapshot().version, version);
        assert_eq!(materializer.snapshot().checksum, checksum);
    }

    #[test]
    fn concurrent_moves_converge_regardless_of_arrival_order() {
        let insert = meta(
            "node-a",
            1,
            50,
            clock_of(&[("node-a", 1)]),
            insert_element("element-1"),
        );
        // Both sides observed the insert, then moved concurrently with equal
        // timestamps.
        let move_a = meta(
            "node-a",
            2,
            100,
            clock_of(&[("node-a", 2)]),
            Operation::MoveElement {
                element_id: EntityId::new("element-1"),
                from: Position::new(0.0, 0.0),
                to: Position::new(100.0, 0.0),
            },
        );
        let move_b = meta(
            "node-b",
            1,
            100,
            clock_of(&[("node-a", 1), ("node-b", 1)]),
            Operation::MoveElement {
                element_id: EntityId::new("element-1"),
                from: Position::new(0.0, 0.0),
                to: Position::new(0.0, 100.0),
            },
        );

        let mut first_order = Materializer::new();
        for operation in [&insert, &move_a, &move_b] {
            first_order.apply(operation, 100);
        }

        let mut second_order = Materializer::new();
        for operation in [&insert, &move_b, &move_a] {
            second_order.apply(operation, 100);
        }

        let position = first_order
            .snapshot()
            .elements
            .get(&EntityId::new("element-1"))
            .unwrap()
            .position;
        assert_eq!(position, Position::new(50.0, 50.0));
        assert_eq!(
            first_order.snapshot().checksum,
            second_order.snapshot().checksum
        );
    }

    #[test]
    fn delete_wins_in_both_arrival_orders() {
        let insert = meta(
            "node-a",
            1,
            50,
            clock_of(&[("node-a", 1)]),
            insert_element("element-1"),
        );
        let update = meta(
            "node-a",
            2,
            100,
            clock_of(&[("node-a", 2)]),
            Operation::UpdateElementProperty {
                element_id: EntityId::new("element-1"),
                key: "label".to_string(),
                previous: None,
                value: PropertyValue::from("updated"),
            },
        );
        let delete = meta(
            "node-b",
            1,
            100,
            clock_of(&[("node-a", 1), ("node-b", 1)]),
            Operation::DeleteElement {
                element_id: EntityId::new("element-1"),
            },
        );

        for order in [[&insert, &update, &delete], [&insert, &delete, &update]] {
            let mut materializer = Materializer::new();
            for operation in order {
                materializer.apply(operation, 100);
            }
            assert!(
                materializer.snapshot().elements.is_empty(),
                "delete must win in every arrival order"
            );
        }
    }

    #[test]
    fn losing_duplicate_connection_is_compensated_away() {
        let insert_1 = meta(
            "node-a",
            1,
            10,
            clock_of(&[("node-a", 1)]),
            insert_element("element-1"),
        );
        let insert_2 = meta(
            "node-a",
            2,
            20,
            clock_of(&[("node-a", 2)]),
            insert_element("element-2"),
        );

        let connection = |id: &str| Connection {
            id: EntityId::new(id),
            source: EntityId::new("element-1"),
            target: EntityId::new("element-2"),
            properties: Default::default(),
        };
        // The later creation (connection-2) arrives first.
        let winner = meta(
            "node-a",
            3,
            100,
            clock_of(&[("node-a", 3)]),
            Operation::CreateConnection {
                connection: connection("connection-1"),
            },
        );
        let loser = meta(
            "node-b",
            1,
            200,
            clock_of(&[("node-a", 2), ("node-b", 1)]),
            Operation::CreateConnection {
                connection: connection("connection-2"),
            },
        );

        let mut materializer = Materializer::new();
        materializer.apply(&insert_1, 10);
        materializer.apply(&insert_2, 20);
        materializer.apply(&loser, 200);
        materializer.apply(&winner, 200);

        let connections: BTreeSet<_> = materializer
            .snapshot()
            .connections
            .keys()
            .cloned()
            .collect();
        assert_eq!(connections, BTreeSet::from([EntityId::new("connection-1")]));
    }
}
