//! Concurrency coordinator — fans one cycle's batches out over a bounded
//! worker pool and folds the outcomes back into a single `CycleResult`.
//!
//! Two passes per cycle:
//! - primary: every batch, on a pool of `primary_workers` threads;
//! - retry: only the batches that failed, on a fresh pool of
//!   `retry_workers` threads. There is never a third pass.
//!
//! Outcomes are collected in completion order through a channel; the
//! accumulator is owned by the collecting thread, so workers share nothing
//! mutable. Every task is bounded by the fetcher's timeout times its attempt
//! count, so waiting for a pass to drain cannot hang.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use tracing::{error, info, warn};

use snapfeed_core::{
    fetch_batch, BatchId, BatchSource, Clock, CycleResult, FetchError, FetchOutcome, Record,
    RetryPolicy,
};

/// Which fan-out pass an outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Primary,
    Retry,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::Primary => write!(f, "primary"),
            Pass::Retry => write!(f, "retry"),
        }
    }
}

/// Folds fetch outcomes into one cycle aggregate.
#[derive(Debug)]
pub struct CycleAccumulator {
    captured_at: DateTime<FixedOffset>,
    total_expected: usize,
    records: Vec<Record>,
    fetched: usize,
    failed: BTreeMap<BatchId, FetchError>,
}

impl CycleAccumulator {
    pub fn new(captured_at: DateTime<FixedOffset>, total_expected: usize) -> Self {
        Self {
            captured_at,
            total_expected,
            records: Vec::new(),
            fetched: 0,
            failed: BTreeMap::new(),
        }
    }

    /// Fold in one outcome. A success for a previously failed batch clears
    /// its failure; a failure replaces the batch's last error.
    pub fn absorb(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Success { batch, records } => {
                self.failed.remove(&batch);
                self.fetched += 1;
                self.records.extend(records);
            }
            FetchOutcome::Failure { batch, last_error } => {
                self.failed.insert(batch, last_error);
            }
        }
    }

    pub fn failed_batches(&self) -> Vec<BatchId> {
        self.failed.keys().copied().collect()
    }

    pub fn last_errors(&self) -> &BTreeMap<BatchId, FetchError> {
        &self.failed
    }

    pub fn finish(self) -> CycleResult {
        CycleResult {
            captured_at: self.captured_at,
            records: self.records,
            failed_batches: self.failed.into_keys().collect(),
            fetched_count: self.fetched,
            total_expected: self.total_expected,
        }
    }
}

pub struct Coordinator {
    source: Arc<dyn BatchSource>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    primary_workers: usize,
    retry_workers: usize,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn BatchSource>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        primary_workers: usize,
        retry_workers: usize,
    ) -> Self {
        Self {
            source,
            policy,
            clock,
            primary_workers: primary_workers.max(1),
            retry_workers: retry_workers.max(1),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch every batch, retry the failures once, and aggregate.
    ///
    /// Partial failure is not an error: permanently failed batches are
    /// reported in `failed_batches`.
    pub fn run_cycle(&self, batch_ids: &[BatchId]) -> CycleResult {
        let captured_at = self.clock.now();
        let mut acc = CycleAccumulator::new(captured_at, batch_ids.len());

        info!(
            batches = batch_ids.len(),
            workers = self.primary_workers,
            source = self.source.name(),
            "cycle started"
        );
        for outcome in self.fan_out(batch_ids, self.primary_workers, Pass::Primary) {
            acc.absorb(outcome);
        }

        let retry_ids = acc.failed_batches();
        if !retry_ids.is_empty() {
            info!(
                failed = retry_ids.len(),
                workers = self.retry_workers,
                "retrying failed batches"
            );
            for outcome in self.fan_out(&retry_ids, self.retry_workers, Pass::Retry) {
                acc.absorb(outcome);
            }
        }

        for (batch, err) in acc.last_errors() {
            warn!(batch = %batch, error = %err, "batch failed after retry pass");
        }

        let result = acc.finish();
        info!(
            fetched = result.fetched_count,
            expected = result.total_expected,
            records = result.record_count(),
            failed = result.failed_batches.len(),
            "cycle fetched"
        );
        result
    }

    /// Run one pass over `batch_ids` on a private pool of `workers` threads,
    /// returning outcomes in completion order.
    pub fn fan_out(&self, batch_ids: &[BatchId], workers: usize, pass: Pass) -> Vec<FetchOutcome> {
        if batch_ids.is_empty() {
            return Vec::new();
        }

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(move |i| format!("snapfeed-{pass}-{i}"))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                error!(pass = %pass, error = %e, "failed to build worker pool; pass abandoned");
                return abandon(batch_ids, &e.to_string());
            }
        };

        let (tx, rx) = mpsc::channel();
        for &batch in batch_ids {
            let tx = tx.clone();
            let source = Arc::clone(&self.source);
            let clock = Arc::clone(&self.clock);
            let policy = self.policy;
            pool.spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    fetch_batch(source.as_ref(), batch, &policy, clock.as_ref())
                }))
                .unwrap_or_else(|_| FetchOutcome::Failure {
                    batch,
                    last_error: FetchError::Submission("fetch task panicked".into()),
                });
                // The receiver outlives every task in this pass.
                let _ = tx.send(outcome);
            });
        }
        drop(tx);

        rx.iter().collect()
    }
}

fn abandon(batch_ids: &[BatchId], reason: &str) -> Vec<FetchOutcome> {
    batch_ids
        .iter()
        .map(|&batch| FetchOutcome::Failure {
            batch,
            last_error: FetchError::Submission(reason.to_string()),
        })
        .collect()
}
