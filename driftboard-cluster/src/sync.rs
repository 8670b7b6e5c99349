// SPDX-License-Identifier: MIT OR Apache-2.0

use driftboard_core::NodeId;
use driftboard_consensus::{Log, LogEntry};

/// Progress of one peer synchronization session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Active,
    Complete,
    Failed,
}

/// Streams the committed log to one peer in bounded batches.
///
/// The session is complete once every committed entry has been *sent*, not
/// acknowledged; acknowledgements only move the peer's resume cursor. One
/// batch is produced per pump tick, which gives the inter-batch delay
/// without the session owning a timer.
#[derive(Clone, Debug)]
pub struct SyncSession {
    pub peer: NodeId,
    /// Next log index to send.
    cursor: u64,
    status: SyncStatus,
    attempts: u8,
}

impl SyncSession {
    /// Start a session resuming after `resume_from` (0 for a full sync).
    pub fn new(peer: NodeId, resume_from: u64) -> Self {
        Self {
            peer,
            cursor: resume_from + 1,
            status: SyncStatus::Pending,
            attempts: 0,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Fraction of the committed log already streamed, in `0.0..=1.0`.
    pub fn progress(&self, commit_index: u64) -> f64 {
        if commit_index == 0 {
            return 1.0;
        }
        ((self.cursor - 1).min(commit_index) as f64) / (commit_index as f64)
    }

    /// Produce the next batch of committed entries, or `None` when the
    /// session just finished.
    ///
    /// Returns an empty vector while the session is already complete or
    /// failed.
    pub fn next_batch(&mut self, log: &Log, batch_size: usize) -> Option<Vec<LogEntry>> {
        match self.status {
            SyncStatus::Complete | SyncStatus::Failed => return Some(Vec::new()),
            SyncStatus::Pending => self.status = SyncStatus::Active,
            SyncStatus::Active => {}
        }

        let entries = log.committed_from(self.cursor, batch_size);
        if entries.is_empty() {
            self.status = SyncStatus::Complete;
            return None;
        }

        self.cursor = entries
            .last()
            .map(|entry| entry.index + 1)
            .unwrap_or(self.cursor);
        Some(entries)
    }

    /// Step the cursor back to where a failed batch started so the entries
    /// are retried instead of skipped.
    pub fn rewind(&mut self, cursor: u64) {
        self.cursor = self.cursor.min(cursor);
    }

    /// Jump the cursor forward past entries that were delivered another way,
    /// such as a snapshot install covering the compacted log prefix.
    pub fn skip_to(&mut self, cursor: u64) {
        self.cursor = self.cursor.max(cursor);
    }

    /// Record one failed round; returns `true` once the failure ceiling is
    /// reached and the peer should be quarantined.
    pub fn record_failure(&mut self, max_attempts: u8) -> bool {
        self.attempts += 1;
        if self.attempts >= max_attempts {
            self.status = SyncStatus::Failed;
            true
        } else {
            self.status = SyncStatus::Pending;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use driftboard_consensus::{Log, LogEntry};
    use driftboard_core::{
        CausalityClock, EntityId, NodeId, Operation, OperationId, OperationMeta, RoomId,
    };

    use super::{SyncSession, SyncStatus};

    fn committed_log(entries: u64) -> Log {
        let author = NodeId::new("node-a");
        let mut log = Log::new();
        for index in 1..=entries {
            let operation = OperationMeta::new(
                OperationId::from_parts(&author, index),
                author.clone(),
                RoomId::new("room-1"),
                index,
                CausalityClock::new(),
                Operation::DeleteElement {
                    element_id: EntityId::new("element-1"),
                },
            );
            log.append(LogEntry::new(1, index, operation));
        }
        log.mark_committed_up_to(entries);
        log
    }

    #[test]
    fn streams_in_fixed_size_batches() {
        let log = committed_log(120);
        let mut session = SyncSession::new(NodeId::new("node-b"), 0);

        let first = session.next_batch(&log, 50).unwrap();
        assert_eq!(first.len(), 50);
        assert_eq!(first.first().unwrap().index, 1);

        let second = session.next_batch(&log, 50).unwrap();
        assert_eq!(second.len(), 50);

        let third = session.next_batch(&log, 50).unwrap();
        assert_eq!(third.len(), 20);

        assert!(session.next_batch(&log, 50).is_none());
        assert_eq!(session.status(), SyncStatus::Complete);
    }

    #[test]
    fn resumes_after_last_synced_index() {
        let log = committed_log(60);
        let mut session = SyncSession::new(NodeId::new("node-b"), 40);

        let batch = session.next_batch(&log, 50).unwrap();
        assert_eq!(batch.first().unwrap().index, 41);
        assert_eq!(batch.len(), 20);
    }

    #[test]
    fn progress_reaches_one_when_done() {
        let log = committed_log(10);
        let mut session = SyncSession::new(NodeId::new("node-b"), 0);
        assert_eq!(session.progress(10), 0.0);

        session.next_batch(&log, 50);
        assert_eq!(session.progress(10), 1.0);
    }

    #[test]
    fn failure_ceiling_flags_quarantine() {
        let mut session = SyncSession::new(NodeId::new("node-b"), 0);
        assert!(!session.record_failure(3));
        assert!(!session.record_failure(3));
        assert!(session.record_failure(3));
        assert_eq!(session.status(), SyncStatus::Failed);
    }

    #[test]
    fn rewinding_a_failed_batch_retries_the_same_entries() {
        let log = committed_log(60);
        let mut session = SyncSession::new(NodeId::new("node-b"), 0);

        let start = session.cursor();
        let first = session.next_batch(&log, 50).unwrap();
        assert_eq!(first.first().unwrap().index, 1);

        // The send failed; the next round must ship the same batch again.
        session.rewind(start);
        assert!(!session.record_failure(3));
        let retried = session.next_batch(&log, 50).unwrap();
        assert_eq!(retried.first().unwrap().index, 1);
        assert_eq!(retried.len(), 50);
    }
}
