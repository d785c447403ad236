use serde::{Deserialize, Serialize};

use super::RaftError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, command: Vec<u8>) -> Self {
        Self { term, command }
    }

    fn sentinel() -> Self {
        Self {
            term: 0,
            command: Vec::new(),
        }
    }
}

/// The replicated log. Index 0 always holds a sentinel entry with term 0, so
/// real entries are 1-indexed and `prev_log_index = 0` always matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry::sentinel()],
        }
    }

    /// Rebuilds a log from restored entries, checking the sentinel.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, RaftError> {
        match entries.first() {
            Some(first) if first.term == 0 => Ok(Self { entries }),
            Some(first) => Err(RaftError::CorruptState(format!(
                "log sentinel has term {}",
                first.term
            ))),
            None => Err(RaftError::CorruptState("log has no sentinel".to_string())),
        }
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64 - 1
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Number of slots including the sentinel, i.e. `last_index() + 1`.
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entries.get(index as usize).map(|e| e.term)
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.entries.get(index as usize)
    }

    pub fn append(&mut self, entry: LogEntry) -> u64 {
        self.entries.push(entry);
        self.last_index()
    }

    pub fn extend<I: IntoIterator<Item = LogEntry>>(&mut self, entries: I) {
        self.entries.extend(entries);
    }

    /// Discards `index` and everything after it. The sentinel can never be
    /// removed.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), RaftError> {
        if index < 1 {
            return Err(RaftError::CorruptState(
                "attempted to truncate the log sentinel".to_string(),
            ));
        }

        if index < self.len() {
            self.entries.truncate(index as usize);
        }

        Ok(())
    }

    /// Clones entries from `start` onward, at most `max_entries` of them and
    /// stopping before the commands exceed `max_bytes`. The first entry is
    /// always included so an oversized command still goes out on its own.
    pub fn entries_from(&self, start: u64, max_entries: usize, max_bytes: usize) -> Vec<LogEntry> {
        let Some(tail) = self.entries.get(start as usize..) else {
            return Vec::new();
        };

        let mut bytes = 0;
        let mut batch = Vec::new();
        for entry in tail.iter().take(max_entries.max(1)) {
            bytes += entry.command.len();
            if !batch.is_empty() && bytes > max_bytes {
                break;
            }
            batch.push(entry.clone());
        }
        batch
    }

    /// Clones the entries in `(after, through]`.
    pub fn entries_between(&self, after: u64, through: u64) -> Vec<(u64, LogEntry)> {
        let end = through.min(self.last_index());
        ((after + 1)..=end)
            .filter_map(|i| self.get_entry(i).map(|e| (i, e.clone())))
            .collect()
    }

    /// Walks backwards from `index` to the first index holding the same term.
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return self.len();
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Highest real index (> 0) whose entry carries `term`.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        (1..self.len())
            .rev()
            .find(|&i| self.term_at(i) == Some(term))
    }

    pub(crate) fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
