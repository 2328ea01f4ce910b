//! In-memory Raft log with snapshot bookkeeping
//!
//! The log stores only entries strictly after the snapshot point; the pair
//! `(snapshot_index, snapshot_term)` stands in for the discarded prefix.
//! Indexes are 1-based and strictly monotonic.

use serde::{Deserialize, Serialize};

use crate::raft::message::LogEntry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last entry, or the snapshot point when the log is empty.
    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// Term of the last entry, or the snapshot term when the log is empty.
    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Term at `index`: the snapshot term at the snapshot point, the entry
    /// term within the log, `None` for discarded or absent positions.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    /// The entry stored at `index`, if it is within the retained suffix.
    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        let pos = (index - self.snapshot_index) as usize - 1;
        self.entries.get(pos)
    }

    /// All retained entries with index >= `from`.
    pub fn entries_from(&self, from: u64) -> &[LogEntry] {
        if from > self.last_index() {
            return &[];
        }
        let from = from.max(self.snapshot_index + 1);
        let pos = (from - self.snapshot_index) as usize - 1;
        &self.entries[pos..]
    }

    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: &[LogEntry]) {
        self.entries.extend_from_slice(entries);
    }

    /// Drop every entry with index >= `from`.
    pub fn truncate_from(&mut self, from: u64) {
        if from <= self.snapshot_index {
            self.entries.clear();
            return;
        }
        let pos = (from - self.snapshot_index) as usize - 1;
        self.entries.truncate(pos);
    }

    /// Discard entries up to and including `index` and record the snapshot
    /// point. When `index` is past the retained suffix the whole log goes.
    pub fn compact_to(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.index == index)
        {
            self.entries.drain(..=pos);
        } else {
            self.entries.clear();
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Discard the whole log and restart from a snapshot point that
    /// diverges from the retained entries.
    pub fn reset_to(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// First retained index carrying `term`, used to answer conflict probes.
    pub fn first_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries.iter().find(|e| e.term == term).map(|e| e.index)
    }

    /// Does the position `(prev_index, prev_term)` match this log?
    ///
    /// Matches at the log beginning, at the snapshot point, or at a retained
    /// entry with the same term.
    pub fn matches(&self, prev_index: u64, prev_term: u64) -> bool {
        if prev_index == 0 {
            return true;
        }
        if prev_index == self.snapshot_index && prev_term == self.snapshot_term {
            return true;
        }
        self.entry(prev_index).map(|e| e.term) == Some(prev_term)
    }

    /// Whether a candidate log described by `(last_index, last_term)` is at
    /// least as up-to-date as this one.
    pub fn up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        if self.last_term() == last_term {
            self.last_index() <= last_index
        } else {
            self.last_term() < last_term
        }
    }
}
