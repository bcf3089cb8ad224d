use std::collections::BTreeSet;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use super::ids::BatchId;
use super::record::Record;
use crate::fetch::FetchError;

/// Result of fetching one batch, produced once per batch per pass.
#[derive(Debug)]
pub enum FetchOutcome {
    Success { batch: BatchId, records: Vec<Record> },
    Failure { batch: BatchId, last_error: FetchError },
}

impl FetchOutcome {
    pub fn batch(&self) -> BatchId {
        match self {
            FetchOutcome::Success { batch, .. } | FetchOutcome::Failure { batch, .. } => *batch,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }
}

/// Aggregate of one gate-approved cycle.
///
/// `captured_at` is when the cycle started fetching, not when it was stored.
/// `fetched_count` counts batches whose final outcome was a success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResult {
    pub captured_at: DateTime<FixedOffset>,
    pub records: Vec<Record>,
    pub failed_batches: BTreeSet<BatchId>,
    pub fetched_count: usize,
    pub total_expected: usize,
}

impl CycleResult {
    pub fn empty(captured_at: DateTime<FixedOffset>, total_expected: usize) -> Self {
        Self {
            captured_at,
            records: Vec::new(),
            failed_batches: BTreeSet::new(),
            fetched_count: 0,
            total_expected,
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// True when no records at all were obtained.
    pub fn has_no_records(&self) -> bool {
        self.records.is_empty()
    }

    /// True when every expected batch succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed_batches.is_empty() && self.fetched_count == self.total_expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2025, 4, 21, 10, 15, 0)
            .unwrap()
    }

    #[test]
    fn empty_cycle_has_no_records_and_is_incomplete_when_batches_expected() {
        let cycle = CycleResult::empty(ts(), 3);
        assert!(cycle.has_no_records());
        assert!(!cycle.is_complete());
        assert_eq!(cycle.record_count(), 0);
    }

    #[test]
    fn serializes_with_camel_case_counters() {
        let mut cycle = CycleResult::empty(ts(), 2);
        cycle.records.push(Record::new(json!({"symbol": "ABC"})));
        cycle.fetched_count = 1;
        cycle.failed_batches.insert(BatchId(2));

        let value = serde_json::to_value(&cycle).unwrap();
        assert_eq!(value["fetchedCount"], 1);
        assert_eq!(value["totalExpected"], 2);
        assert_eq!(value["failedBatches"], json!([2]));
        assert_eq!(value["records"][0]["symbol"], "ABC");
    }

    #[test]
    fn outcome_reports_its_batch() {
        let ok = FetchOutcome::Success { batch: BatchId(7), records: vec![] };
        let failed = FetchOutcome::Failure {
            batch: BatchId(9),
            last_error: FetchError::Transport("reset".into()),
        };
        assert_eq!(ok.batch(), BatchId(7));
        assert!(ok.is_success());
        assert_eq!(failed.batch(), BatchId(9));
        assert!(!failed.is_success());
    }
}
