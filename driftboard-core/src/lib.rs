// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod checksum;
pub mod clock;
pub mod ids;
pub mod model;
pub mod operation;
mod serde;
pub mod snapshot;

pub use checksum::{CHECKSUM_LEN, Checksum, ChecksumError};
pub use clock::{CausalOrder, CausalityClock};
pub use ids::{EntityId, NodeId, OperationId, RoomId};
pub use model::{
    Connection, Dimensions, Element, ElementKind, Position, PropertyValue, ThreatActor,
};
pub use operation::{Operation, OperationError, OperationMeta, validate_operation};
pub use snapshot::StateSnapshot;

/// Encode a value into its canonical CBOR representation.
///
/// All checksums and wire messages are derived from this encoding. Map-typed
/// fields are `BTreeMap`s throughout, so the byte output is identical on
/// every node for identical content.
pub fn to_canonical_bytes<T: ::serde::Serialize>(value: &T) -> Vec<u8> {
    let mut bytes = Vec::new();

    ciborium::ser::into_writer(value, &mut bytes)
        // We can be sure that all values in this workspace are serializable and _if_ ciborium
        // still fails then because of something really bad ..
        .expect("CBOR encoder failed due to a critical IO error");

    bytes
}
