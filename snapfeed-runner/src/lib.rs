//! Snapfeed Runner — cycle coordination, scheduling, persistence and archival.
//!
//! This crate builds on `snapfeed-core` to provide:
//! - Concurrency coordinator (bounded primary pass + one retry pass)
//! - Scheduling gate (trading window + one-shot override)
//! - Document store seam with in-memory and SQLite backends
//! - Latest-snapshot persistence and the per-date ledger
//! - Run history and the zstd archive exporter with upload sinks
//! - TOML/environment configuration and the control loop

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod gate;
pub mod history;
pub mod persistence;
pub mod pipeline;
pub mod store;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
pub mod upload;

pub use archive::{
    archive_file_name, read_archive, run_file_name, write_archive, ArchiveError, ArchiveExporter,
    ArchiveNaming, ArchiveOutcome,
};
pub use config::{ConfigError, EnvSettings, PipelineConfig, UploadConfig};
pub use coordinator::{Coordinator, CycleAccumulator, Pass};
pub use gate::{GateDecision, GateState, SchedulingGate, TradingWindow, WindowError};
pub use history::{ArchivePayload, RunHistory};
pub use persistence::{
    DailyLedger, LedgerInsert, PersistenceError, Snapshot, SnapshotDocument, SnapshotWriter,
};
pub use pipeline::{Pipeline, RunSummary};
pub use store::{open_store, DocumentStore, Filter, MemoryStore, SqliteStore, StoreError};
pub use upload::{Credentials, HttpUploadSink, LocalDirSink, UploadError, UploadSink};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn stores_are_send_sync() {
        assert_send::<MemoryStore>();
        assert_sync::<MemoryStore>();
        assert_send::<SqliteStore>();
        assert_sync::<SqliteStore>();
    }

    #[test]
    fn coordinator_is_send_sync() {
        assert_send::<Coordinator>();
        assert_sync::<Coordinator>();
    }

    #[test]
    fn persistence_types_are_send_sync() {
        assert_send::<SnapshotWriter>();
        assert_sync::<SnapshotWriter>();
        assert_send::<DailyLedger>();
        assert_sync::<DailyLedger>();
    }

    #[test]
    fn archive_types_are_send_sync() {
        assert_send::<ArchiveExporter>();
        assert_sync::<ArchiveExporter>();
        assert_send::<ArchivePayload>();
        assert_sync::<ArchivePayload>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<PipelineConfig>();
        assert_sync::<PipelineConfig>();
        assert_send::<EnvSettings>();
        assert_sync::<EnvSettings>();
    }

    #[test]
    fn pipeline_is_send() {
        assert_send::<Pipeline>();
    }
}
