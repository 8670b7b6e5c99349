// SPDX-License-Identifier: MIT OR Apache-2.0

//! Peer lifecycle management and the transport boundary.
//!
//! Tracks every remote participant through an explicit state machine,
//! detects partitions from heartbeat silence, streams the committed log to
//! joining peers in bounded batches and quarantines peers that ship corrupt
//! data. Like the consensus crate this one is sans-IO: the engine feeds it
//! observations and executes the [`PeerEvent`]s it returns.

pub mod manager;
pub mod peer;
pub mod sync;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod transport;

pub use manager::{LeaveReason, PeerConfig, PeerEvent, PeerManager, QuarantineReason};
pub use peer::{PeerError, PeerInfo, PeerState};
pub use sync::{SyncSession, SyncStatus};
pub use transport::{
    DecodeError, Envelope, Incoming, Transport, TransportError, TransportStats,
};
