//! Run history — the in-memory, append-only record of every cycle in this
//! process, handed to the archiver exactly once at shutdown.

use serde::{Deserialize, Serialize};

use snapfeed_core::CycleResult;

/// Append-only, ordered by cycle completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunHistory {
    entries: Vec<CycleResult>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, cycle: CycleResult) {
        self.entries.push(cycle);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&CycleResult> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[CycleResult] {
        &self.entries
    }

    /// Consume the history into an archive payload. `None` when empty.
    pub fn into_payload(self) -> Option<ArchivePayload> {
        let metadata = self.entries.last()?.clone();
        Some(ArchivePayload {
            entries: self.entries,
            metadata,
        })
    }
}

/// Serialized archive body: every cycle, plus the latest one as `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivePayload {
    pub entries: Vec<CycleResult>,
    pub metadata: CycleResult,
}

impl ArchivePayload {
    /// The metadata entry must equal the last history entry.
    pub fn is_consistent(&self) -> bool {
        self.entries.last() == Some(&self.metadata)
    }
}
