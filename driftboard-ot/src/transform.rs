// SPDX-License-Identifier: MIT OR Apache-2.0

use driftboard_core::{Operation, OperationMeta, Position};
use tracing::debug;

/// Two independent entities placed closer than this are considered visually
/// overlapping.
pub const MIN_SPATIAL_DISTANCE: f64 = 50.0;

/// Fixed offset applied to the later of two spatially conflicting placements.
pub const OVERLAP_OFFSET_X: f64 = 30.0;
pub const OVERLAP_OFFSET_Y: f64 = 30.0;

/// What happened to one side of a transformed pair.
#[derive(Clone, Debug, PartialEq)]
pub enum Transformed {
    /// Apply as authored.
    Unchanged(Operation),
    /// Apply this rewritten form instead.
    Rewritten(Operation),
    /// Do not apply at all.
    Noop,
}

impl Transformed {
    /// The operation to apply, if any.
    pub fn effective(&self) -> Option<&Operation> {
        match self {
            Transformed::Unchanged(operation) | Transformed::Rewritten(operation) => {
                Some(operation)
            }
            Transformed::Noop => None,
        }
    }
}

/// Which rule resolved a conflicting pair. Reported upward so the UI layer
/// can surface what happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    DeleteWins,
    MergedMove,
    MergedResize,
    PropertyLastWriterWins,
    DuplicateConnection,
    SpatialOverlap,
}

/// Result of transforming a concurrent pair.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformPair {
    pub left: Transformed,
    pub right: Transformed,
    /// `None` when the pair was independent and both sides apply unchanged.
    pub conflict: Option<ConflictKind>,
}

impl TransformPair {
    fn independent(left: &OperationMeta, right: &OperationMeta) -> Self {
        Self {
            left: Transformed::Unchanged(left.operation.clone()),
            right: Transformed::Unchanged(right.operation.clone()),
            conflict: None,
        }
    }
}

/// Returns `true` when `a` is the later operation of the pair.
///
/// Later timestamp wins; equal timestamps are broken by lexical comparison
/// of the operation ids. This exact chain is what keeps replicas from
/// diverging, so it is applied verbatim everywhere a winner is picked.
fn is_later(a: &OperationMeta, b: &OperationMeta) -> bool {
    (a.timestamp, &a.id) > (b.timestamp, &b.id)
}

/// Transform two concurrent operations so they commute.
///
/// Dispatch runs in priority order; the first matching rule decides the
/// pair. Callers are responsible for only passing operations the causality
/// clock reported as concurrent.
pub fn transform(left: &OperationMeta, right: &OperationMeta) -> TransformPair {
    let same_target = left.operation.target() == right.operation.target();

    // Rule 1: a delete beats any concurrent update on the same entity.
    if same_target {
        if let Some(pair) = delete_wins(left, right) {
            return pair;
        }
    }

    // Rule 2: two moves of the same element merge into one destination.
    if same_target {
        if let Some(pair) = merge_moves(left, right) {
            return pair;
        }
    }

    // Rule 3: two resizes of the same element take the per-dimension maximum.
    if same_target {
        if let Some(pair) = merge_resizes(left, right) {
            return pair;
        }
    }

    // Rule 4: property updates on the same entity; same key resolves to the
    // last writer, different keys commute.
    if same_target {
        if let Some(pair) = resolve_property_updates(left, right) {
            return pair;
        }
    }

    // Rule 5: duplicate connection between the same endpoints.
    if let Some(pair) = resolve_duplicate_connections(left, right) {
        return pair;
    }

    // Rule 6: placements of independent entities that would visually overlap.
    if !same_target {
        if let Some(pair) = resolve_spatial_overlap(left, right) {
            return pair;
        }
    }

    // Rule 7: truly independent, both apply unchanged.
    TransformPair::independent(left, right)
}

fn is_update_like(operation: &Operation) -> bool {
    matches!(
        operation,
        Operation::MoveElement { .. }
            | Operation::ResizeElement { .. }
            | Operation::UpdateElementProperty { .. }
            | Operation::UpdateThreatActor { .. }
            | Operation::UpdateConnection { .. }
    )
}

fn delete_wins(left: &OperationMeta, right: &OperationMeta) -> Option<TransformPair> {
    let pair = if left.operation.is_delete() && is_update_like(&right.operation) {
        TransformPair {
            left: Transformed::Unchanged(left.operation.clone()),
            right: Transformed::Noop,
            conflict: Some(ConflictKind::DeleteWins),
        }
    } else if right.operation.is_delete() && is_update_like(&left.operation) {
        TransformPair {
            left: Transformed::Noop,
            right: Transformed::Unchanged(right.operation.clone()),
            conflict: Some(ConflictKind::DeleteWins),
        }
    } else {
        return None;
    };

    debug!(
        left = %left.id,
        right = %right.id,
        "delete wins over concurrent update"
    );
    Some(pair)
}

fn merge_moves(left: &OperationMeta, right: &OperationMeta) -> Option<TransformPair> {
    let (
        Operation::MoveElement {
            element_id,
            from: left_from,
            to: left_to,
        },
        Operation::MoveElement {
            from: right_from,
            to: right_to,
            ..
        },
    ) = (&left.operation, &right.operation)
    else {
        return None;
    };

    // Both sides saw the element at the same spot before moving it; if the
    // claims disagree the lexically smaller id provides the common origin.
    let origin = if left.id < right.id {
        *left_from
    } else {
        *right_from
    };

    // Timestamp-weighted average of the two displacement vectors. The
    // weights and the two-term sums are symmetric in the pair, so argument
    // order cannot change the merged destination.
    let left_weight = 1.0 / (left.timestamp as f64 + 1.0);
    let right_weight = 1.0 / (right.timestamp as f64 + 1.0);
    let total = left_weight + right_weight;

    let (left_dx, left_dy) = left_from.displacement_to(left_to);
    let (right_dx, right_dy) = right_from.displacement_to(right_to);

    let merged = origin.offset_by(
        (left_weight * left_dx + right_weight * right_dx) / total,
        (left_weight * left_dy + right_weight * right_dy) / total,
    );

    let rewritten = Operation::MoveElement {
        element_id: element_id.clone(),
        from: origin,
        to: merged,
    };

    debug!(element = %element_id, ?merged, "merged concurrent moves");

    Some(TransformPair {
        left: Transformed::Rewritten(rewritten.clone()),
        right: Transformed::Rewritten(rewritten),
        conflict: Some(ConflictKind::MergedMove),
    })
}

fn merge_resizes(left: &OperationMeta, right: &OperationMeta) -> Option<TransformPair> {
    let (
        Operation::ResizeElement {
            element_id,
            from: left_from,
            to: left_to,
        },
        Operation::ResizeElement {
            from: right_from,
            to: right_to,
            ..
        },
    ) = (&left.operation, &right.operation)
    else {
        return None;
    };

    let merged = left_to.max_per_dimension(right_to);

    Some(TransformPair {
        left: Transformed::Rewritten(Operation::ResizeElement {
            element_id: element_id.clone(),
            from: *left_from,
            to: merged,
        }),
        right: Transformed::Rewritten(Operation::ResizeElement {
            element_id: element_id.clone(),
            from: *right_from,
            to: merged,
        }),
        conflict: Some(ConflictKind::MergedResize),
    })
}

fn property_key(operation: &Operation) -> Option<&str> {
    match operation {
        Operation::UpdateElementProperty { key, .. }
        | Operation::UpdateThreatActor { key, .. }
        | Operation::UpdateConnection { key, .. } => Some(key),
        _ => None,
    }
}

fn resolve_property_updates(left: &OperationMeta, right: &OperationMeta) -> Option<TransformPair> {
    let left_key = property_key(&left.operation)?;
    let right_key = property_key(&right.operation)?;

    // Updates of different kinds never share a target id space in practice;
    // guard anyway so a property update on an element is never matched
    // against one on a connection.
    if std::mem::discriminant(&left.operation) != std::mem::discriminant(&right.operation) {
        return None;
    }

    if left_key != right_key {
        // Different properties on the same entity commute.
        return Some(TransformPair::independent(left, right));
    }

    let pair = if is_later(left, right) {
        TransformPair {
            left: Transformed::Unchanged(left.operation.clone()),
            right: Transformed::Noop,
            conflict: Some(ConflictKind::PropertyLastWriterWins),
        }
    } else {
        TransformPair {
            left: Transformed::Noop,
            right: Transformed::Unchanged(right.operation.clone()),
            conflict: Some(ConflictKind::PropertyLastWriterWins),
        }
    };

    debug!(
        key = left_key,
        left = %left.id,
        right = %right.id,
        "last writer wins on property update"
    );
    Some(pair)
}

fn resolve_duplicate_connections(
    left: &OperationMeta,
    right: &OperationMeta,
) -> Option<TransformPair> {
    let (
        Operation::CreateConnection {
            connection: left_connection,
        },
        Operation::CreateConnection {
            connection: right_connection,
        },
    ) = (&left.operation, &right.operation)
    else {
        return None;
    };

    if left_connection.source != right_connection.source
        || left_connection.target != right_connection.target
    {
        return None;
    }

    // The earlier creation survives; `is_later` gives the loser.
    let pair = if is_later(left, right) {
        TransformPair {
            left: Transformed::Noop,
            right: Transformed::Unchanged(right.operation.clone()),
            conflict: Some(ConflictKind::DuplicateConnection),
        }
    } else {
        TransformPair {
            left: Transformed::Unchanged(left.operation.clone()),
            right: Transformed::Noop,
            conflict: Some(ConflictKind::DuplicateConnection),
        }
    };

    Some(pair)
}

fn offset_placement(operation: &Operation) -> Option<Operation> {
    match operation {
        Operation::InsertElement { element } => {
            let mut element = element.clone();
            element.position = element.position.offset_by(OVERLAP_OFFSET_X, OVERLAP_OFFSET_Y);
            Some(Operation::InsertElement { element })
        }
        Operation::MoveElement {
            element_id,
            from,
            to,
        } => Some(Operation::MoveElement {
            element_id: element_id.clone(),
            from: *from,
            to: to.offset_by(OVERLAP_OFFSET_X, OVERLAP_OFFSET_Y),
        }),
        _ => None,
    }
}

fn resolve_spatial_overlap(left: &OperationMeta, right: &OperationMeta) -> Option<TransformPair> {
    let left_placement: Position = left.operation.placement()?;
    let right_placement: Position = right.operation.placement()?;

    if left_placement.distance_to(&right_placement) >= MIN_SPATIAL_DISTANCE {
        return None;
    }

    // The later placement steps aside.
    let pair = if is_later(left, right) {
        TransformPair {
            left: Transformed::Rewritten(offset_placement(&left.operation)?),
            right: Transformed::Unchanged(right.operation.clone()),
            conflict: Some(ConflictKind::SpatialOverlap),
        }
    } else {
        TransformPair {
            left: Transformed::Unchanged(left.operation.clone()),
            right: Transformed::Rewritten(offset_placement(&right.operation)?),
            conflict: Some(ConflictKind::SpatialOverlap),
        }
    };

    debug!(
        left = %left.id,
        right = %right.id,
        "offset later placement to avoid visual overlap"
    );
    Some(pair)
}
