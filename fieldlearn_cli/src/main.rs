use fieldlearn_core::config::{FileFormat, LearnerConfig, RunConfig};
use fieldlearn_core::coordinator::{CorpusCoordinator, RunSummary, StopTrigger};

use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Learn field value constraints from a corpus of valid files", long_about = None)]
struct Cli {
    /// File type to learn (avi, bmp, gif, jpg, png, midi, pcap, wav, mp3, mp4, zip)
    file_type: String,
    /// Process at most this many files
    #[clap(long)]
    max_files: Option<usize>,
    /// Seed directory, instead of <data-root>/<type>/passed
    #[clap(long, value_parser)]
    source_dir: Option<PathBuf>,
    /// Continue the newest run of this file type
    #[clap(long)]
    resume: bool,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Worker threads; 1 processes files sequentially
    #[clap(short, long)]
    workers: Option<usize>,
    /// Stop after this many seconds; the checkpoint and results are still written
    #[clap(long)]
    time_limit: Option<u64>,
    /// Stop once this file exists
    #[clap(long, value_parser)]
    stop_file: Option<PathBuf>,
}

fn load_config(config_file: Option<PathBuf>) -> Result<LearnerConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            tracing::info!("Loading configuration from {config_path:?}");
            LearnerConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("fieldlearn.toml");
            if default_config_path.exists() {
                tracing::info!("Loading default configuration {default_config_path:?}");
                LearnerConfig::load_from_file(&default_config_path)
            } else {
                tracing::info!("No config file found, using built-in defaults");
                Ok(LearnerConfig::default())
            }
        }
    }
}

fn print_summary(summary: &RunSummary, elapsed_secs: f64) {
    let counters = &summary.counters;
    let stats = &summary.stats;
    println!("\n--- Learning {} ---", if summary.cancelled { "Cancelled" } else { "Finished" });
    println!("Run: {} ({:?})", summary.run_id, summary.run_dir);
    if summary.resumed {
        println!("Resumed from checkpoint");
    }
    if let Some(reason) = &summary.interrupted {
        println!("Interrupted: {reason}");
    }
    println!("Elapsed: {elapsed_secs:.2}s");
    println!(
        "Files: {} succeeded, {} failed, {} timed out, {} skipped",
        counters.succeeded, counters.failed, counters.timed_out, counters.skipped
    );
    println!("Valid abstractions: {}", stats.valid_abstractions);
    println!("  with new fields: {}", stats.valid_abstractions_special);
    println!("Valid random overwrites: {}", stats.valid_overwrites);
    println!(
        "Learned {} values across {} fields",
        summary.learned_values, summary.learned_fields
    );
    println!(
        "Blacklisted: {} by size, {} by count",
        summary.blacklisted_by_size, summary.blacklisted_by_count
    );
    println!("Checksummed element types: {}", summary.checksum_types);
    for path in &summary.result_files {
        println!("Results: {path:?}");
    }
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format: FileFormat = cli.file_type.parse()?;

    let mut config = load_config(cli.config_file)?;
    if let Some(workers) = cli.workers {
        config.parallel.workers = Some(workers);
    }
    tracing::debug!("Effective configuration: {config:#?}");

    let run = RunConfig {
        format,
        max_files: cli.max_files,
        source_dir: cli.source_dir,
        resume: cli.resume,
    };

    let start_time = Instant::now();
    let coordinator = CorpusCoordinator::with_external_tools(config, run);
    let trigger = StopTrigger {
        time_limit: cli.time_limit.map(Duration::from_secs),
        stop_file: cli.stop_file,
    };
    if !trigger.is_empty() {
        tracing::info!("Watching for stop conditions: {trigger:?}");
        coordinator.spawn_stop_watcher(trigger)?;
    }
    let summary = coordinator.run()?;
    print_summary(&summary, start_time.elapsed().as_secs_f64());
    if let Some(reason) = summary.interrupted {
        anyhow::bail!("Run {} stopped early: {reason}", summary.run_id);
    }
    Ok(())
}
