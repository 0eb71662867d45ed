use serde::{Deserialize, Serialize};

/// A single replicated command together with the term it was proposed in.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub command: String,
}

/// The append-only command log, indexed from 1. Index 0 stands for the
/// empty prefix before the first entry.
#[derive(Debug, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild the in-memory log from recovered records.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    /// Append entries in order and return the new last index.
    pub fn append(&mut self, entries: &[LogEntry]) -> u64 {
        self.entries.extend_from_slice(entries);
        self.last_index()
    }

    pub fn at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`, with 0 standing in for the empty prefix.
    pub fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            0
        } else {
            self.at(index).map(|e| e.term).unwrap_or(0)
        }
    }

    /// Remove every entry with an index >= `index`.
    pub fn truncate_suffix_from(&mut self, index: u64) {
        self.entries.truncate(index.saturating_sub(1) as usize);
    }

    /// Log-matching check: a follower accepts entries only if its log
    /// already contains the leader's previous entry.
    pub fn matches_at(&self, prev_index: u64, prev_term: u64) -> bool {
        prev_index == 0
            || (prev_index <= self.last_index() && self.term_at(prev_index) == prev_term)
    }

    /// Cloned suffix starting at `index`, used to build AppendEntries
    /// payloads. Empty when the peer is already caught up.
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        if index == 0 || index > self.last_index() {
            return Vec::new();
        }
        self.entries[index as usize - 1..].to_vec()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
