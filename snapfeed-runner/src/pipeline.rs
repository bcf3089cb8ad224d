//! Control loop: gate → cycle → persist → history, then archive on exit.
//!
//! Cycles run strictly one after another on the calling thread, which owns
//! the [`RunHistory`]. Archival is attached to the loop as a drop guard, so
//! it runs once on every exit path after the loop starts: a gate halt, a
//! cancellation, or a panic unwinding out of a cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use snapfeed_core::{BatchId, BatchSource, Clock, HttpBatchSource};

use crate::archive::{ArchiveExporter, ArchiveOutcome};
use crate::config::{ConfigError, EnvSettings, PipelineConfig, UploadConfig};
use crate::coordinator::Coordinator;
use crate::gate::{GateDecision, SchedulingGate};
use crate::history::RunHistory;
use crate::persistence::{DailyLedger, SnapshotWriter};
use crate::store::open_store;
use crate::upload::{Credentials, HttpUploadSink, LocalDirSink, UploadSink};

/// What one run of the control loop did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub cycles: usize,
    pub persisted: usize,
    pub persistence_failures: usize,
    pub history_len: usize,
    pub archive: ArchiveOutcome,
}

/// Hands the run history to the exporter exactly once, on drop if not before.
struct ArchiveOnExit<'a> {
    exporter: &'a ArchiveExporter,
    history: Option<RunHistory>,
}

impl<'a> ArchiveOnExit<'a> {
    fn new(exporter: &'a ArchiveExporter) -> Self {
        Self {
            exporter,
            history: Some(RunHistory::new()),
        }
    }

    fn append(&mut self, cycle: snapfeed_core::CycleResult) {
        if let Some(history) = self.history.as_mut() {
            history.append(cycle);
        }
    }

    fn len(&self) -> usize {
        self.history.as_ref().map_or(0, RunHistory::len)
    }

    fn finish(mut self) -> ArchiveOutcome {
        match self.history.take() {
            Some(history) => self.exporter.export(history),
            None => ArchiveOutcome::Skipped,
        }
    }
}

impl Drop for ArchiveOnExit<'_> {
    fn drop(&mut self) {
        if let Some(history) = self.history.take() {
            warn!(cycles = history.len(), "control loop exited abnormally; archiving history");
            self.exporter.export(history);
        }
    }
}

pub struct Pipeline {
    gate: SchedulingGate,
    coordinator: Coordinator,
    writer: SnapshotWriter,
    exporter: ArchiveExporter,
    clock: Arc<dyn Clock>,
    batch_ids: Vec<BatchId>,
    cycle_interval: Duration,
    cancel: Option<Arc<AtomicBool>>,
}

impl Pipeline {
    pub fn new(
        gate: SchedulingGate,
        coordinator: Coordinator,
        writer: SnapshotWriter,
        exporter: ArchiveExporter,
        clock: Arc<dyn Clock>,
        batch_ids: Vec<BatchId>,
        cycle_interval: Duration,
    ) -> Self {
        Self {
            gate,
            coordinator,
            writer,
            exporter,
            clock,
            batch_ids,
            cycle_interval,
            cancel: None,
        }
    }

    /// Stop after the current cycle once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Wire a production pipeline: HTTP source, store from the environment,
    /// system clock in the configured offset, upload sink per config.
    pub fn from_config(
        config: &PipelineConfig,
        env: &EnvSettings,
        run_once: bool,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let shard_map = Arc::new(config.shard_map()?);
        let clock: Arc<dyn Clock> = Arc::new(config.schedule.clock()?);

        let source: Arc<dyn BatchSource> = Arc::new(HttpBatchSource::new(
            Arc::clone(&shard_map),
            config.request_timeout(),
            config.source.list_field.clone(),
        )?);
        let coordinator = Coordinator::new(
            source,
            config.retry_policy(),
            Arc::clone(&clock),
            config.concurrency.primary_workers,
            config.concurrency.retry_workers,
        );

        let store = open_store(&env.store_url)?;
        let writer = SnapshotWriter::new(Arc::clone(&store), &config.store.snapshot_collection);

        let sink = build_sink(&config.archive.upload, env)?;
        let exporter = ArchiveExporter::new(
            &config.archive.dir,
            config.archive_naming(),
            sink,
            Arc::clone(&clock),
            config.archive.summary_cutoff_hour,
        )
        .with_summary_ledger(DailyLedger::new(
            Arc::clone(&store),
            &config.store.daily_collection,
        ))
        .with_fallback_ledger(DailyLedger::new(store, &config.store.fallback_collection));

        let gate = SchedulingGate::new(config.schedule.window()?, run_once || env.run_once);

        Ok(Self::new(
            gate,
            coordinator,
            writer,
            exporter,
            clock,
            shard_map.batch_ids(),
            config.schedule.cycle_interval(),
        ))
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Run cycles until the gate halts or the cancel flag is set, then
    /// archive the history.
    pub fn run(&mut self) -> RunSummary {
        let mut history = ArchiveOnExit::new(&self.exporter);
        let mut cycles = 0;
        let mut persisted = 0;
        let mut persistence_failures = 0;

        loop {
            let now = self.clock.now();
            let last = match self.gate.evaluate(&now) {
                GateDecision::Run { last } => last,
                GateDecision::Halt => break,
            };

            cycles += 1;
            let cycle = self.coordinator.run_cycle(&self.batch_ids);
            if cycle.has_no_records() {
                warn!(
                    cycle = cycles,
                    failed = cycle.failed_batches.len(),
                    "cycle obtained no records; persisting empty aggregate"
                );
            }

            match self.writer.persist(&cycle) {
                Ok(_) => {
                    persisted += 1;
                    history.append(cycle);
                }
                Err(e) => {
                    persistence_failures += 1;
                    error!(cycle = cycles, error = %e, "snapshot persistence failed");
                    if !cycle.has_no_records() {
                        history.append(cycle);
                    }
                }
            }

            if last {
                info!(cycles, "one-shot cycle complete; halting");
                break;
            }
            if self.cancelled() {
                info!(cycles, "cancellation requested; halting");
                break;
            }
            self.clock.sleep(self.cycle_interval);
        }

        let history_len = history.len();
        info!(cycles, persisted, persistence_failures, history = history_len, "control loop finished");
        let archive = history.finish();

        RunSummary {
            cycles,
            persisted,
            persistence_failures,
            history_len,
            archive,
        }
    }
}

fn build_sink(upload: &UploadConfig, env: &EnvSettings) -> Result<Arc<dyn UploadSink>, ConfigError> {
    match upload {
        UploadConfig::Local { dir } => Ok(Arc::new(LocalDirSink::new(dir))),
        UploadConfig::Http { url, timeout_secs } => {
            let token = env
                .upload_token
                .as_deref()
                .ok_or(ConfigError::MissingEnv(crate::config::ENV_UPLOAD_TOKEN))?;
            let credentials = Credentials::parse(token)?;
            Ok(Arc::new(HttpUploadSink::new(
                url.clone(),
                credentials,
                Duration::from_secs(*timeout_secs),
            )?))
        }
    }
}
