// SPDX-License-Identifier: MIT OR Apache-2.0

use driftboard_core::{Checksum, OperationMeta, to_canonical_bytes};
use serde::{Deserialize, Serialize};

/// One slot in the replicated log.
///
/// Appended only by the current leader; a follower may overwrite a divergent
/// suffix while reconciling. The checksum covers term, index and operation,
/// not the `committed` flag, which changes as the commit index advances.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub operation: OperationMeta,
    pub committed: bool,
    pub checksum: Checksum,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, operation: OperationMeta) -> Self {
        let checksum = entry_checksum(term, index, &operation);
        Self {
            term,
            index,
            operation,
            committed: false,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        entry_checksum(self.term, self.index, &self.operation) == self.checksum
            && self.operation.verify()
    }
}

fn entry_checksum(term: u64, index: u64, operation: &OperationMeta) -> Checksum {
    Checksum::new(to_canonical_bytes(&(term, index, operation)))
}

/// Append-only entry container with a compaction baseline.
///
/// Indices are 1-based. Entries at or below `snapshot_index` have been folded
/// into a persisted state snapshot and dropped from memory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|entry| entry.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Term of the entry at `index`; the compaction baseline answers for the
    /// snapshot boundary itself.
    pub fn term_of(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|entry| entry.term)
    }

    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Drop every entry at `index` and beyond.
    pub fn truncate_from(&mut self, index: u64) {
        if index <= self.snapshot_index {
            return;
        }
        self.entries
            .truncate((index - self.snapshot_index - 1) as usize);
    }

    /// Entries starting at `from` (inclusive), at most `max`.
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        if from <= self.snapshot_index {
            return Vec::new();
        }
        let start = (from - self.snapshot_index - 1) as usize;
        self.entries
            .iter()
            .skip(start)
            .take(max)
            .cloned()
            .collect()
    }

    /// Mark everything up to `index` committed, returning the entries that
    /// were newly committed by this call, in log order.
    pub fn mark_committed_up_to(&mut self, index: u64) -> Vec<LogEntry> {
        let mut newly_committed = Vec::new();
        for entry in &mut self.entries {
            if entry.index > index {
                break;
            }
            if !entry.committed {
                entry.committed = true;
                newly_committed.push(entry.clone());
            }
        }
        newly_committed
    }

    /// Committed entries starting at `from` (inclusive), at most `max`. Used
    /// by peer synchronization, which streams committed state only.
    pub fn committed_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        self.entries_from(from, max)
            .into_iter()
            .take_while(|entry| entry.committed)
            .collect()
    }

    /// Fold entries up to `index` into the compaction baseline.
    pub fn compact_to(&mut self, index: u64) {
        if index <= self.snapshot_index {
            return;
        }
        let Some(term) = self.term_of(index) else {
            return;
        };
        let keep_from = (index - self.snapshot_index) as usize;
        self.entries.drain(..keep_from.min(self.entries.len()));
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replace the whole log with a snapshot baseline, as part of snapshot
    /// installation on a far-behind follower.
    pub fn reset_to(&mut self, snapshot_index: u64, snapshot_term: u64) {
        self.entries.clear();
        self.snapshot_index = snapshot_index;
        self.snapshot_term = snapshot_term;
    }
}

#[cfg(test)]
mod tests {
    use driftboard_core::{
        CausalityClock, EntityId, NodeId, Operation, OperationId, OperationMeta, RoomId,
    };

    use super::{Log, LogEntry};

    fn entry(term: u64, index: u64) -> LogEntry {
        let author = NodeId::new("node-a");
        let operation = OperationMeta::new(
            OperationId::from_parts(&author, index),
            author,
            RoomId::new("room-1"),
            index * 100,
            CausalityClock::new(),
            Operation::DeleteElement {
                element_id: EntityId::new("element-1"),
            },
        );
        LogEntry::new(term, index, operation)
    }

    #[test]
    fn appends_and_reads_back() {
        let mut log = Log::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));

        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.get(1).unwrap().index, 1);
        assert!(log.get(3).is_none());
    }

    #[test]
    fn truncates_divergent_suffix() {
        let mut log = Log::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(2, 3));

        log.truncate_from(2);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.term_of(1), Some(1));
    }

    #[test]
    fn commit_marks_each_entry_once() {
        let mut log = Log::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));

        let first = log.mark_committed_up_to(2);
        assert_eq!(first.len(), 2);

        let second = log.mark_committed_up_to(2);
        assert!(second.is_empty());
    }

    #[test]
    fn compaction_preserves_tail_and_terms() {
        let mut log = Log::new();
        for index in 1..=4 {
            log.append(entry(1, index));
        }
        log.mark_committed_up_to(4);

        log.compact_to(2);
        assert_eq!(log.snapshot_index(), 2);
        assert_eq!(log.term_of(2), Some(1));
        assert!(log.get(2).is_none());
        assert_eq!(log.get(3).unwrap().index, 3);
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn entry_checksum_detects_tampering() {
        let mut tampered = entry(1, 1);
        assert!(tampered.verify());
        tampered.term = 9;
        assert!(!tampered.verify());
    }
}
