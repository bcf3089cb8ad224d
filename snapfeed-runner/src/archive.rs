//! Archival exporter — runs once at shutdown.
//!
//! Serializes the run history as `{ entries, metadata }` JSON, compresses it
//! with zstd, writes it under a local-date file name, and hands it to the
//! upload sink. Nothing here may take the process down: every failure is
//! logged and reported in the returned [`ArchiveOutcome`].
//!
//! After a successful upload, a `{ date, file_name, link, summary }` entry is
//! added to the daily ledger, but only at or after the summary cutoff hour so
//! a partial day is not recorded as the day's summary. After a failed
//! upload, the summary goes to the fallback ledger instead.

use std::fs::{self, OpenOptions};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use snapfeed_core::Clock;

use crate::history::{ArchivePayload, RunHistory};
use crate::persistence::{DailyLedger, LedgerInsert, DATE_KEY_FORMAT};
use crate::upload::UploadSink;

/// Zstd level for archive files.
const ZSTD_LEVEL: i32 = 3;

/// Archive file extension.
pub const ARCHIVE_EXTENSION: &str = "json.zst";

/// Run suffixes tried after the base name is taken (`_r2` .. `_r99`).
const MAX_RUN_SUFFIX: u32 = 99;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode archive: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("zstd error: {0}")]
    Compression(std::io::Error),

    #[error("archive {0} already exists")]
    Exists(PathBuf),

    #[error("no free archive name for {0} in {1}")]
    NamesExhausted(String, PathBuf),

    #[error("archive metadata does not match its last entry")]
    Inconsistent,
}

/// How archive files are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveNaming {
    /// `21-04-2025.json.zst`
    #[default]
    Daily,
    /// `21-04-2025_15.json.zst`
    Hourly,
}

pub fn archive_file_name(at: &DateTime<FixedOffset>, naming: ArchiveNaming) -> String {
    let date = at.format(DATE_KEY_FORMAT);
    match naming {
        ArchiveNaming::Daily => format!("{date}.{ARCHIVE_EXTENSION}"),
        ArchiveNaming::Hourly => format!("{date}_{:02}.{ARCHIVE_EXTENSION}", at.hour()),
    }
}

/// The `run`-th name for a base archive name: the base itself for run 1,
/// `21-04-2025_r2.json.zst` for run 2, and so on.
pub fn run_file_name(base: &str, run: u32) -> String {
    if run <= 1 {
        return base.to_string();
    }
    let suffix = format!(".{ARCHIVE_EXTENSION}");
    let stem = base.strip_suffix(suffix.as_str()).unwrap_or(base);
    format!("{stem}_r{run}{suffix}")
}

/// Serialize, compress, and write `payload` to a new file at `path`.
///
/// An existing file is never replaced: the write fails with
/// [`ArchiveError::Exists`]. A partially written file is removed.
pub fn write_archive(path: &Path, payload: &ArchivePayload) -> Result<(), ArchiveError> {
    let json = serde_json::to_vec(payload)?;
    let compressed =
        zstd::encode_all(Cursor::new(json), ZSTD_LEVEL).map_err(ArchiveError::Compression)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| ArchiveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(ArchiveError::Exists(path.to_path_buf()))
        }
        Err(source) => {
            return Err(ArchiveError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if let Err(source) = file.write_all(&compressed).and_then(|()| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Decompress and decode an archive file.
pub fn read_archive(path: &Path) -> Result<ArchivePayload, ArchiveError> {
    let compressed = fs::read(path).map_err(|source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let json = zstd::decode_all(Cursor::new(compressed)).map_err(ArchiveError::Compression)?;
    let payload: ArchivePayload = serde_json::from_slice(&json)?;
    if !payload.is_consistent() {
        return Err(ArchiveError::Inconsistent);
    }
    Ok(payload)
}

/// What the shutdown archival step did.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveOutcome {
    /// History was empty; nothing written.
    Skipped,
    /// Writing the archive file failed; nothing uploaded.
    WriteFailed { error: String },
    Uploaded {
        path: PathBuf,
        link: String,
        /// Ledger result, or `None` when before the cutoff or no ledger is set.
        summary: Option<LedgerInsert>,
    },
    UploadFailed {
        path: PathBuf,
        error: String,
        fallback: Option<LedgerInsert>,
    },
}

pub struct ArchiveExporter {
    dir: PathBuf,
    naming: ArchiveNaming,
    sink: Arc<dyn UploadSink>,
    clock: Arc<dyn Clock>,
    summary_cutoff_hour: u32,
    ledger: Option<DailyLedger>,
    fallback: Option<DailyLedger>,
}

impl ArchiveExporter {
    pub fn new(
        dir: impl Into<PathBuf>,
        naming: ArchiveNaming,
        sink: Arc<dyn UploadSink>,
        clock: Arc<dyn Clock>,
        summary_cutoff_hour: u32,
    ) -> Self {
        Self {
            dir: dir.into(),
            naming,
            sink,
            clock,
            summary_cutoff_hour,
            ledger: None,
            fallback: None,
        }
    }

    /// Ledger that receives `{ date, file_name, link, summary }` after upload.
    pub fn with_summary_ledger(mut self, ledger: DailyLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Ledger that receives the summary when the upload fails.
    pub fn with_fallback_ledger(mut self, ledger: DailyLedger) -> Self {
        self.fallback = Some(ledger);
        self
    }

    /// Consume the history and archive it. Never fails; see [`ArchiveOutcome`].
    pub fn export(&self, history: RunHistory) -> ArchiveOutcome {
        let cycles = history.len();
        let Some(payload) = history.into_payload() else {
            info!("run history empty; nothing to archive");
            return ArchiveOutcome::Skipped;
        };

        let now = self.clock.now();
        let (file_name, path) = match self.write_new(&now, &payload) {
            Ok(written) => written,
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "failed to write archive");
                return ArchiveOutcome::WriteFailed {
                    error: e.to_string(),
                };
            }
        };
        info!(path = %path.display(), cycles, "archive written");

        match self.sink.upload(&path) {
            Ok(link) => {
                info!(sink = self.sink.name(), link = %link, "archive uploaded");
                let summary = self.record_summary(&now, &file_name, &link, &payload);
                ArchiveOutcome::Uploaded {
                    path,
                    link,
                    summary,
                }
            }
            Err(e) => {
                warn!(sink = self.sink.name(), error = %e, "archive upload failed");
                let fallback = self.record_fallback(&now, &file_name, &payload);
                ArchiveOutcome::UploadFailed {
                    path,
                    error: e.to_string(),
                    fallback,
                }
            }
        }
    }

    /// Write under the first free run name for `now`.
    fn write_new(
        &self,
        now: &DateTime<FixedOffset>,
        payload: &ArchivePayload,
    ) -> Result<(String, PathBuf), ArchiveError> {
        let base = archive_file_name(now, self.naming);
        for run in 1..=MAX_RUN_SUFFIX {
            let file_name = run_file_name(&base, run);
            let path = self.dir.join(&file_name);
            match write_archive(&path, payload) {
                Ok(()) => return Ok((file_name, path)),
                Err(ArchiveError::Exists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ArchiveError::NamesExhausted(base, self.dir.clone()))
    }

    fn record_summary(
        &self,
        now: &DateTime<FixedOffset>,
        file_name: &str,
        link: &str,
        payload: &ArchivePayload,
    ) -> Option<LedgerInsert> {
        let ledger = self.ledger.as_ref()?;
        if now.hour() < self.summary_cutoff_hour {
            info!(
                hour = now.hour(),
                cutoff = self.summary_cutoff_hour,
                "before summary cutoff; daily summary not recorded"
            );
            return None;
        }
        let fields = json!({
            "file_name": file_name,
            "link": link,
            "summary": payload.metadata,
        });
        match ledger.record_once(now, fields) {
            Ok(insert) => Some(insert),
            Err(e) => {
                warn!(collection = ledger.collection(), error = %e, "failed to record daily summary");
                None
            }
        }
    }

    fn record_fallback(
        &self,
        now: &DateTime<FixedOffset>,
        file_name: &str,
        payload: &ArchivePayload,
    ) -> Option<LedgerInsert> {
        let ledger = self.fallback.as_ref()?;
        let fields = json!({
            "file_name": file_name,
            "summary": payload.metadata,
        });
        match ledger.record_once(now, fields) {
            Ok(insert) => Some(insert),
            Err(e) => {
                warn!(collection = ledger.collection(), error = %e, "failed to record fallback summary");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, Filter, MemoryStore};
    use crate::test_helpers::{manual_clock, RecordingSink};
    use crate::upload::LocalDirSink;
    use snapfeed_core::{BatchId, CycleResult, Record};

    fn history(n: usize, clock: &dyn Clock) -> RunHistory {
        let mut h = RunHistory::new();
        for i in 0..n {
            let mut c = CycleResult::empty(clock.now(), 3);
            c.records.push(Record::new(json!({ "cycle": i })));
            c.fetched_count = 2;
            c.failed_batches.insert(BatchId(3));
            h.append(c);
        }
        h
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        clock: Arc<snapfeed_core::ManualClock>,
    }

    fn fixture(sink: RecordingSink, hour: u32) -> Fixture {
        Fixture {
            dir: tempfile::tempdir().unwrap(),
            store: Arc::new(MemoryStore::new()),
            sink: Arc::new(sink),
            clock: Arc::new(manual_clock(2025, 4, 21, hour, 30)),
        }
    }

    fn exporter(f: &Fixture, naming: ArchiveNaming) -> ArchiveExporter {
        ArchiveExporter::new(f.dir.path(), naming, f.sink.clone(), f.clock.clone(), 15)
            .with_summary_ledger(DailyLedger::new(f.store.clone(), "file_links"))
            .with_fallback_ledger(DailyLedger::new(f.store.clone(), "daily_data"))
    }

    #[test]
    fn file_names_follow_local_date_and_hour() {
        let at = manual_clock(2025, 4, 21, 9, 5).now();
        assert_eq!(archive_file_name(&at, ArchiveNaming::Daily), "21-04-2025.json.zst");
        assert_eq!(archive_file_name(&at, ArchiveNaming::Hourly), "21-04-2025_09.json.zst");
        assert_eq!(run_file_name("21-04-2025.json.zst", 1), "21-04-2025.json.zst");
        assert_eq!(run_file_name("21-04-2025_09.json.zst", 3), "21-04-2025_09_r3.json.zst");
    }

    #[test]
    fn write_archive_refuses_to_replace_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock(2025, 4, 21, 16, 0);
        let path = dir.path().join("21-04-2025.json.zst");
        write_archive(&path, &history(2, &clock).into_payload().unwrap()).unwrap();

        let err = write_archive(&path, &history(1, &clock).into_payload().unwrap()).unwrap_err();
        assert!(matches!(err, ArchiveError::Exists(_)));
        assert_eq!(read_archive(&path).unwrap().entries.len(), 2);
    }

    #[test]
    fn same_day_runs_keep_separate_archives_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(manual_clock(2025, 4, 21, 11, 0));
        let sink = Arc::new(LocalDirSink::new(dir.path().join("uploads")));
        let exp = ArchiveExporter::new(
            dir.path().join("archives"),
            ArchiveNaming::Daily,
            sink,
            clock.clone(),
            15,
        );
        let run = |label: &str| {
            let mut h = RunHistory::new();
            let mut c = CycleResult::empty(clock.now(), 1);
            c.records.push(Record::new(json!({ "run": label })));
            c.fetched_count = 1;
            h.append(c);
            h
        };

        let ArchiveOutcome::Uploaded { path: path1, link: link1, .. } = exp.export(run("morning"))
        else {
            panic!("first export did not upload");
        };
        clock.set(manual_clock(2025, 4, 21, 14, 0).now());
        let ArchiveOutcome::Uploaded { path: path2, link: link2, .. } =
            exp.export(run("afternoon"))
        else {
            panic!("second export did not upload");
        };

        assert!(path1.ends_with("21-04-2025.json.zst"));
        assert!(path2.ends_with("21-04-2025_r2.json.zst"));
        assert_ne!(link1, link2);

        for (link, label) in [(&link1, "morning"), (&link2, "afternoon")] {
            let uploaded = Path::new(link.strip_prefix("file://").unwrap());
            let payload = read_archive(uploaded).unwrap();
            assert_eq!(payload.metadata.records, vec![Record::new(json!({ "run": label }))]);
        }
    }

    #[test]
    fn empty_history_is_a_no_op() {
        let f = fixture(RecordingSink::ok(), 16);
        let outcome = exporter(&f, ArchiveNaming::Daily).export(RunHistory::new());
        assert_eq!(outcome, ArchiveOutcome::Skipped);
        assert!(f.sink.uploads().is_empty());
        assert_eq!(fs::read_dir(f.dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn archive_round_trips_and_metadata_is_last_entry() {
        let f = fixture(RecordingSink::ok(), 16);
        let original = history(3, f.clock.as_ref());
        let expected = original.clone();

        let outcome = exporter(&f, ArchiveNaming::Daily).export(original);

        let ArchiveOutcome::Uploaded { path, .. } = outcome else {
            panic!("expected upload, got {outcome:?}");
        };
        let payload = read_archive(&path).unwrap();
        assert_eq!(payload.entries, expected.entries());
        assert_eq!(Some(&payload.metadata), expected.last());
    }

    #[test]
    fn upload_after_cutoff_records_daily_summary_once() {
        let f = fixture(RecordingSink::ok(), 16);
        let exp = exporter(&f, ArchiveNaming::Hourly);

        let first = exp.export(history(2, f.clock.as_ref()));
        let second = exp.export(history(1, f.clock.as_ref()));

        assert!(matches!(
            first,
            ArchiveOutcome::Uploaded { summary: Some(LedgerInsert::Inserted(_)), .. }
        ));
        assert!(matches!(
            second,
            ArchiveOutcome::Uploaded { summary: Some(LedgerInsert::AlreadyPresent), .. }
        ));
        let docs = f.store.documents("file_links");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].body["date"], "21-04-2025");
        assert_eq!(docs[0].body["file_name"], "21-04-2025_16.json.zst");
        assert_eq!(docs[0].body["link"], "https://files.test/21-04-2025_16.json.zst");
        assert_eq!(docs[0].body["summary"]["fetchedCount"], 2);

        let ArchiveOutcome::Uploaded { path, .. } = second else { unreachable!() };
        assert!(path.ends_with("21-04-2025_16_r2.json.zst"));
        assert_eq!(f.sink.uploads().len(), 2);
    }

    #[test]
    fn upload_before_cutoff_skips_daily_summary() {
        let f = fixture(RecordingSink::ok(), 11);
        let outcome = exporter(&f, ArchiveNaming::Daily).export(history(1, f.clock.as_ref()));
        assert!(matches!(outcome, ArchiveOutcome::Uploaded { summary: None, .. }));
        assert_eq!(f.store.count("file_links", &Filter::All).unwrap(), 0);
    }

    #[test]
    fn upload_failure_is_swallowed_and_falls_back() {
        let f = fixture(RecordingSink::failing(), 16);
        let outcome = exporter(&f, ArchiveNaming::Daily).export(history(2, f.clock.as_ref()));

        let ArchiveOutcome::UploadFailed { path, fallback, .. } = outcome else {
            panic!("expected upload failure, got {outcome:?}");
        };
        assert!(path.exists(), "archive file stays on disk");
        assert!(matches!(fallback, Some(LedgerInsert::Inserted(_))));
        assert_eq!(f.store.count("file_links", &Filter::All).unwrap(), 0);
        assert_eq!(f.store.count("daily_data", &Filter::All).unwrap(), 1);
    }

    #[test]
    fn ledger_failure_does_not_fail_export() {
        let f = fixture(RecordingSink::ok(), 16);
        f.store.set_fail_inserts(true);
        let outcome = exporter(&f, ArchiveNaming::Daily).export(history(1, f.clock.as_ref()));
        assert!(matches!(outcome, ArchiveOutcome::Uploaded { summary: None, .. }));
    }

    #[test]
    fn tampered_metadata_is_rejected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock(2025, 4, 21, 16, 0);
        let mut payload = history(2, &clock).into_payload().unwrap();
        payload.metadata.fetched_count = 99;
        let path = dir.path().join("bad.json.zst");
        write_archive(&path, &payload).unwrap();
        assert!(matches!(read_archive(&path), Err(ArchiveError::Inconsistent)));
    }
}
