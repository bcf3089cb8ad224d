//! Snapfeed CLI — run the ingestion loop and inspect its artifacts.
//!
//! Commands:
//! - `run` — gate-driven fetch/persist loop, archived on exit
//! - `check` — validate a pipeline file and print the shard map
//! - `fetch` — fetch a single batch with the configured retry policy
//! - `inspect` — decode an archive file and summarise its cycles

mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use snapfeed_core::{fetch_batch, BatchId, FetchOutcome, HttpBatchSource};
use snapfeed_runner::{read_archive, ArchiveOutcome, EnvSettings, Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(
    name = "snapfeed",
    version,
    about = "Snapfeed — scheduled sharded ingestion with latest-snapshot persistence"
)]
struct Cli {
    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run cycles while the trading window is open, then archive the run.
    Run {
        /// Path to the pipeline TOML file.
        #[arg(long)]
        config: PathBuf,

        /// Run one cycle even outside the trading window, then stop.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Validate a pipeline file and print the resolved shard map.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Fetch one batch and print its records as JSON.
    Fetch {
        #[arg(long)]
        config: PathBuf,

        /// Batch identifier in [1, total_batches].
        #[arg(long)]
        batch: u32,
    },
    /// Decode an archive file and print a per-cycle summary.
    Inspect {
        /// Path to a `.json.zst` archive.
        archive: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run { config, once } => run_pipeline(&config, once),
        Commands::Check { config } => run_check(&config),
        Commands::Fetch { config, batch } => run_fetch(&config, batch),
        Commands::Inspect { archive } => run_inspect(&archive),
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::from_file(path)
        .with_context(|| format!("invalid pipeline config {}", path.display()))
}

fn run_pipeline(config_path: &Path, once: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let env = EnvSettings::from_env().context("invalid environment")?;
    let mut pipeline =
        Pipeline::from_config(&config, &env, once).context("failed to start pipeline")?;

    let summary = pipeline.run();

    println!(
        "cycles: {}  persisted: {}  persistence failures: {}",
        summary.cycles, summary.persisted, summary.persistence_failures
    );
    match &summary.archive {
        ArchiveOutcome::Skipped => println!("archive: none (no cycles recorded)"),
        ArchiveOutcome::WriteFailed { error } => println!("archive: write failed: {error}"),
        ArchiveOutcome::Uploaded { path, link, .. } => {
            println!("archive: {} -> {link}", path.display())
        }
        ArchiveOutcome::UploadFailed { path, error, .. } => {
            println!("archive: {} (upload failed: {error})", path.display())
        }
    }
    Ok(())
}

fn run_check(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let map = config.shard_map()?;

    println!("Total batches: {}", map.total_batches());
    println!("{:<14} {:>6} {:>6}  BASE URL", "RANGE", "START", "END");
    println!("{}", "-".repeat(60));
    for shard in map.shards() {
        println!(
            "{:<14} {:>6} {:>6}  {}",
            format!("{} batches", shard.len()),
            shard.start,
            shard.end,
            shard.base_url
        );
    }

    let s = &config.schedule;
    println!();
    println!(
        "Window: {}..={} {:02}:00-{:02}:00 (UTC{:+}m), every {}s",
        s.first_weekday,
        s.last_weekday,
        s.start_hour,
        s.end_hour,
        s.utc_offset_minutes,
        s.cycle_interval_secs
    );
    println!(
        "Workers: {} primary, {} retry; {} attempts per pass",
        config.concurrency.primary_workers,
        config.concurrency.retry_workers,
        config.retry_policy().attempts()
    );
    Ok(())
}

fn run_fetch(config_path: &Path, batch: u32) -> Result<()> {
    let config = load_config(config_path)?;
    let map = Arc::new(config.shard_map()?);
    let clock = config.schedule.clock()?;
    let source = HttpBatchSource::new(
        Arc::clone(&map),
        config.request_timeout(),
        config.source.list_field.clone(),
    )?;

    let batch = BatchId(batch);
    let endpoint = map.resolve_endpoint(batch)?;
    eprintln!("Fetching batch {batch} from {endpoint}");

    match fetch_batch(&source, batch, &config.retry_policy(), &clock) {
        FetchOutcome::Success { records, .. } => {
            eprintln!("{} records", records.len());
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        FetchOutcome::Failure { last_error, .. } => {
            bail!("batch {batch} failed: {last_error}")
        }
    }
}

fn run_inspect(path: &Path) -> Result<()> {
    let payload =
        read_archive(path).with_context(|| format!("failed to read archive {}", path.display()))?;

    println!("Archive: {}", path.display());
    println!("Cycles:  {}", payload.entries.len());
    println!();
    println!(
        "{:<4} {:<26} {:>8} {:>8} {:>8}  FAILED",
        "#", "CAPTURED", "FETCHED", "EXPECTED", "RECORDS"
    );
    println!("{}", "-".repeat(72));
    for (i, cycle) in payload.entries.iter().enumerate() {
        let failed: Vec<String> = cycle.failed_batches.iter().map(|b| b.to_string()).collect();
        println!(
            "{:<4} {:<26} {:>8} {:>8} {:>8}  {}",
            i + 1,
            cycle.captured_at.format("%Y-%m-%d %H:%M:%S %:z"),
            cycle.fetched_count,
            cycle.total_expected,
            cycle.record_count(),
            if failed.is_empty() { "-".to_string() } else { failed.join(",") }
        );
    }

    let m = &payload.metadata;
    println!();
    println!(
        "Latest: {} ({} of {} batches, {} records)",
        m.captured_at.to_rfc3339(),
        m.fetched_count,
        m.total_expected,
        m.record_count()
    );
    Ok(())
}
