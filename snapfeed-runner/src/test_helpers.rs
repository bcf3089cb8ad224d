//! Test doubles for the pipeline's injected seams.
//!
//! Compiled for this crate's unit tests and, behind the `test-helpers`
//! feature, for its integration tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{FixedOffset, TimeZone};
use serde_json::json;

use snapfeed_core::{BatchId, BatchSource, FetchError, ManualClock, Record};

use crate::upload::{UploadError, UploadSink};

/// Local offset used throughout the tests (+05:30).
pub const TEST_OFFSET_MINUTES: i32 = 330;

/// Manual clock at the given local time.
pub fn manual_clock(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> ManualClock {
    let offset = FixedOffset::east_opt(TEST_OFFSET_MINUTES * 60).expect("valid test offset");
    let start = offset
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .expect("valid test timestamp");
    ManualClock::new(start)
}

type RecordCount = Box<dyn Fn(BatchId) -> usize + Send + Sync>;

/// Scripted [`BatchSource`]: per-batch failure budgets, attempt counting,
/// and in-flight tracking to observe pool bounds.
pub struct ScriptedSource {
    records_for: RecordCount,
    fail_first: HashMap<BatchId, u32>,
    always_fail: HashSet<BatchId>,
    panic_on: HashSet<BatchId>,
    attempt_delay: Duration,
    attempts: Mutex<HashMap<BatchId, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    /// Every batch succeeds with `records_for(batch)` records.
    pub fn new(records_for: impl Fn(BatchId) -> usize + Send + Sync + 'static) -> Self {
        Self {
            records_for: Box::new(records_for),
            fail_first: HashMap::new(),
            always_fail: HashSet::new(),
            panic_on: HashSet::new(),
            attempt_delay: Duration::ZERO,
            attempts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail the first `n` attempts for `batch`.
    pub fn fail_first(mut self, batch: BatchId, n: u32) -> Self {
        self.fail_first.insert(batch, n);
        self
    }

    /// Fail every attempt for `batch`.
    pub fn always_fail(mut self, batch: BatchId) -> Self {
        self.always_fail.insert(batch);
        self
    }

    pub fn panic_on(mut self, batch: BatchId) -> Self {
        self.panic_on.insert(batch);
        self
    }

    /// Hold each attempt for `delay` of real time.
    pub fn with_attempt_delay(mut self, delay: Duration) -> Self {
        self.attempt_delay = delay;
        self
    }

    pub fn attempts(&self, batch: BatchId) -> u32 {
        self.attempts
            .lock()
            .map(|a| a.get(&batch).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().map(|a| a.values().sum()).unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BatchSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch_once(&self, batch: BatchId) -> Result<Vec<Record>, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self
                .attempts
                .lock()
                .map_err(|_| FetchError::Transport("attempt log poisoned".into()))?;
            let n = attempts.entry(batch).or_insert(0);
            *n += 1;
            *n
        };

        if !self.attempt_delay.is_zero() {
            std::thread::sleep(self.attempt_delay);
        }
        if self.panic_on.contains(&batch) {
            panic!("scripted panic for batch {batch}");
        }
        if self.always_fail.contains(&batch) {
            return Err(FetchError::UpstreamStatus { status: 503 });
        }
        if self.fail_first.get(&batch).is_some_and(|&n| attempt <= n) {
            return Err(FetchError::Transport("connection reset".into()));
        }

        Ok((0..(self.records_for)(batch))
            .map(|i| Record::new(json!({ "batch": batch.get(), "i": i })))
            .collect())
    }
}

/// Upload sink that records every path and returns a fixed link, or fails.
pub struct RecordingSink {
    fail: bool,
    uploads: Mutex<Vec<PathBuf>>,
}

impl RecordingSink {
    pub fn ok() -> Self {
        Self {
            fail: false,
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

impl UploadSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn upload(&self, path: &Path) -> Result<String, UploadError> {
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push(path.to_path_buf());
        }
        if self.fail {
            return Err(UploadError::Rejected("scripted upload failure".into()));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("https://files.test/{name}"))
    }
}
