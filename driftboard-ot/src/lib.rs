// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairwise operational transform for concurrent diagram operations.
//!
//! [`transform`] is only ever invoked for two operations the causality clock
//! reports as concurrent; everything already ordered by the consensus log
//! bypasses this crate. The dispatch rules run in a fixed priority order and
//! every winner/loser decision is a pure function of the two operations'
//! content, so any two nodes observing the same pair resolve it identically.

mod transform;

pub use transform::{
    ConflictKind, MIN_SPATIAL_DISTANCE, OVERLAP_OFFSET_X, OVERLAP_OFFSET_Y, TransformPair,
    Transformed, transform,
};
