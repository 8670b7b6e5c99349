// SPDX-License-Identifier: MIT OR Apache-2.0

use driftboard_core::NodeId;
use driftboard_store::StoreError;
use thiserror::Error;

/// Failures crossing the public engine boundary.
///
/// Recoverable local conditions (a missing entity, a storage retry) never
/// surface here: they come back as a `false` success flag or an
/// `error_occurred` event instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not the leader; current leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("received content from {0} failed integrity verification")]
    Integrity(NodeId),

    #[error("peer {0} failed to complete synchronization")]
    SyncTimeout(NodeId),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("engine is shut down")]
    Terminated,
}
