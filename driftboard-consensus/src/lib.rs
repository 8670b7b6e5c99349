// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raft-style consensus log.
//!
//! The sole path by which an operation becomes authoritative: the leader
//! appends it, replicates it, and commits it once a quorum acknowledged.
//! [`ConsensusLog`] is a sans-IO state machine: it never touches a socket
//! or a timer itself. Callers feed it received messages and clock ticks and
//! execute the [`RaftEffect`]s it returns, which keeps the whole protocol
//! deterministic under test.

pub mod config;
pub mod log;
pub mod message;
pub mod raft;

pub use config::ClusterConfig;
pub use log::{Log, LogEntry};
pub use message::RaftMessage;
pub use raft::{
    ConsensusLog, MAX_FAILED_ELECTIONS, RaftEffect, RaftTimings, Role, SubmitError,
};
