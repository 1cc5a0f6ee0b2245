// SPDX-License-Identifier: MIT
// jobcoord: keyed job coordinator for datastore writes
//
// - Runs a synthetic workload of simulated writes through a coordinator.
// - Prints the coordinator counters as JSON once every job is resolved.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;

use jobcoord::config::{CoordinatorConfig, ShutdownPolicy};
use jobcoord::job_engine::JobCoordinator;
use jobcoord::load::{self, LoadProfile};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// JSON file with the coordinator config. Flags below override it.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of worker slots
    #[arg(long)]
    workers: Option<usize>,

    /// Count a write as failed if it has not completed within this time
    #[arg(long = "completion-timeout-ms", value_name = "MS")]
    completion_timeout_ms: Option<u64>,

    /// Delay before a failed attempt is re-run
    #[arg(long = "retry-backoff-ms", value_name = "MS")]
    retry_backoff_ms: Option<u64>,

    /// What happens to queued jobs on shutdown
    #[arg(long, value_enum)]
    shutdown_policy: Option<ShutdownPolicy>,

    /// Number of distinct entity keys
    #[arg(long, default_value_t = 10)]
    keys: usize,

    /// Number of jobs to enqueue
    #[arg(long, default_value_t = 100)]
    jobs: usize,

    /// Simulated writes per job
    #[arg(long = "writes-per-job", default_value_t = 2)]
    writes_per_job: usize,

    #[arg(long = "max-retries", default_value_t = 2)]
    max_retries: u32,

    /// Chance in percent that an attempt contains a failing write
    #[arg(
        long = "failure-percent",
        default_value_t = 10,
        value_parser = clap::value_parser!(u8).range(0..=100)
    )]
    failure_percent: u8,

    /// Attach a compensator that reverts jobs whose retries are used up
    #[arg(long = "with-compensator")]
    with_compensator: bool,

    #[arg(long = "write-latency-ms", value_name = "MS", default_value_t = 1)]
    write_latency_ms: u64,
}

fn validate_args(args: &Args) -> Result<(), String> {
    if args.keys == 0 {
        return Err("--keys must be at least 1".into());
    }
    if args.workers == Some(0) {
        return Err("--workers must be at least 1".into());
    }
    Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_json_file(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(ms) = args.completion_timeout_ms {
        config.completion_timeout_ms = Some(ms);
    }
    if let Some(ms) = args.retry_backoff_ms {
        config.retry_backoff_ms = ms;
    }
    if let Some(policy) = args.shutdown_policy {
        config.shutdown_policy = policy;
    }
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    let config = build_config(&args)?;
    info!("Starting jobcoord with {:?}", config);
    let coordinator = JobCoordinator::new(config)?;

    let profile = LoadProfile {
        keys: args.keys,
        jobs: args.jobs,
        writes_per_job: args.writes_per_job,
        max_retries: args.max_retries,
        failure_percent: args.failure_percent,
        with_compensator: args.with_compensator,
        write_latency: Duration::from_millis(args.write_latency_ms),
    };
    let report = load::run(&coordinator, &profile);
    coordinator.wait_until_finished();

    println!("{}", serde_json::to_string_pretty(&report)?);
    info!("Stopping jobcoord");

    if !report.is_consistent() {
        eprintln!("Error: per-key ordering was violated or jobs were left unresolved");
        std::process::exit(1);
    }
    Ok(())
}
