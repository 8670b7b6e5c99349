// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// Position of an element on the diagram canvas.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Displacement vector from `self` to `other`.
    pub fn displacement_to(&self, other: &Position) -> (f64, f64) {
        (other.x - self.x, other.y - self.y)
    }

    pub fn offset_by(&self, dx: f64, dy: f64) -> Position {
        Position::new(self.x + dx, self.y + dy)
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        let (dx, dy) = self.displacement_to(other);
        (dx * dx + dy * dy).sqrt()
    }
}

/// Width and height of an element.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: f64,
    pub height: f64,
}

impl Dimensions {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Per-dimension maximum of two requested sizes.
    pub fn max_per_dimension(&self, other: &Dimensions) -> Dimensions {
        Dimensions::new(self.width.max(other.width), self.height.max(other.height))
    }
}

/// Shape vocabulary of the threat-model canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    Process,
    DataStore,
    ExternalEntity,
    TrustBoundary,
}

/// Scalar attribute value of an element, threat actor or connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Boolean(bool),
    Float(f64),
    Integer(i64),
    String(String),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

/// One shape on the diagram canvas.
///
/// All mutable scalar attributes (label, notes, classification, ..) live in
/// `properties` so that two concurrent updates touching different keys
/// commute without a transform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: EntityId,
    pub kind: ElementKind,
    pub position: Position,
    pub size: Dimensions,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Element {
    pub fn new(id: EntityId, kind: ElementKind, position: Position, size: Dimensions) -> Self {
        Self {
            id,
            kind,
            position,
            size,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// A threat actor tracked alongside the diagram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreatActor {
    pub id: EntityId,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl ThreatActor {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// A directed connection (data flow) between two elements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: EntityId,
    pub source: EntityId,
    pub target: EntityId,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Connection {
    pub fn new(id: EntityId, source: EntityId, target: EntityId) -> Self {
        Self {
            id,
            source,
            target,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}
