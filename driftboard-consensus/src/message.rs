// SPDX-License-Identifier: MIT OR Apache-2.0

use driftboard_core::StateSnapshot;
use serde::{Deserialize, Serialize};

use crate::log::LogEntry;

/// Consensus protocol messages.
///
/// The sender identity travels outside this enum, attached by the transport
/// layer, so a forged `from` field can never contradict the channel it
/// arrived on. An `AppendEntries` with no entries is the leader heartbeat.
#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    VoteResponse {
        term: u64,
        granted: bool,
    },
    AppendEntries {
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendResponse {
        term: u64,
        success: bool,
        /// Highest index known replicated on the responder; only meaningful
        /// when `success` is `true`.
        match_index: u64,
    },
    InstallSnapshot {
        term: u64,
        last_included_index: u64,
        last_included_term: u64,
        snapshot: StateSnapshot,
    },
}

impl RaftMessage {
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. } => *term,
        }
    }

    /// `true` for an empty `AppendEntries`.
    pub fn is_heartbeat(&self) -> bool {
        matches!(
            self,
            RaftMessage::AppendEntries { entries, .. } if entries.is_empty()
        )
    }
}
