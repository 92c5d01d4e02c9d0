//! Benchmark control CLI
//!
//! One subcommand per pipeline entry point. The testbed description lives
//! in a JSON settings file; everything about the load profile is flags.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dagbench_config::{BenchParameters, Parameters, TestbedSettings};
use dagbench_control::{BenchmarkRunner, RunOptions, SshChannel};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dagbench", about = "Distributed benchmark orchestrator", version)]
struct Cli {
    /// Testbed settings file
    #[arg(long, global = true, default_value = "settings.json")]
    settings: PathBuf,

    /// Local working directory for keys, logs and results
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct BenchArgs {
    /// Number of nodes to run
    #[arg(long, default_value_t = 4)]
    nodes: usize,

    /// Workers per node
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Aggregate input rate in tx/s
    #[arg(long, default_value_t = 50_000)]
    rate: u64,

    /// Transaction size in bytes
    #[arg(long, default_value_t = 512)]
    tx_size: usize,

    /// Run duration in seconds
    #[arg(long, default_value_t = 300)]
    duration: u64,

    /// Crash faults to simulate (those nodes are never booted)
    #[arg(long, default_value_t = 0)]
    faults: usize,

    /// Startup margin excluded from throughput, in seconds
    #[arg(long, default_value_t = 20)]
    warmup: u64,

    /// Shutdown margin excluded from throughput, in seconds
    #[arg(long, default_value_t = 20)]
    cooldown: u64,
}

impl BenchArgs {
    fn to_parameters(&self) -> BenchParameters {
        BenchParameters {
            nodes: self.nodes,
            workers: self.workers,
            rate: self.rate,
            tx_size: self.tx_size,
            duration_secs: self.duration,
            faults: self.faults,
            warmup_secs: self.warmup,
            cooldown_secs: self.cooldown,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run one full benchmark: distribute, launch, measure, collect, report
    Run {
        #[command(flatten)]
        bench: BenchArgs,

        /// Install this SSH key on every node before the run
        #[arg(long)]
        provision_credential: Option<PathBuf>,

        /// Regenerate key files even if they already exist
        #[arg(long)]
        overwrite_keys: bool,

        /// Re-download logs that already exist locally
        #[arg(long)]
        force_collect: bool,

        /// Do not persist the result record
        #[arg(long)]
        skip_persist: bool,

        /// Cap on simultaneous remote operations
        #[arg(long, default_value_t = 8)]
        parallelism: usize,
    },

    /// Download logs from the fleet without running anything
    Collect {
        #[command(flatten)]
        bench: BenchArgs,

        /// Re-download logs that already exist locally
        #[arg(long)]
        force: bool,
    },

    /// Re-process already-collected logs into a result
    Report {
        #[command(flatten)]
        bench: BenchArgs,

        /// Do not persist the result record
        #[arg(long)]
        skip_persist: bool,
    },

    /// Show which detached sessions are alive on each host
    Status,

    /// Kill all detached sessions on every host
    Cleanup {
        /// Also delete remote logs and node databases
        #[arg(long)]
        delete_logs: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = TestbedSettings::load(&cli.settings)
        .with_context(|| format!("loading settings from {}", cli.settings.display()))?;
    let channel = Arc::new(SshChannel::default());
    let runner = BenchmarkRunner::new(settings, channel, cli.workdir.clone());

    match cli.command {
        Command::Run {
            bench,
            provision_credential,
            overwrite_keys,
            force_collect,
            skip_persist,
            parallelism,
        } => {
            let opts = RunOptions {
                bench: bench.to_parameters(),
                tuning: Parameters::default(),
                force_collect,
                skip_persist,
                provision_credential,
                overwrite_keys,
                parallelism,
            };
            let result = runner.run(&opts).await?;
            println!("{}", result.summary());
        }
        Command::Collect { bench, force } => {
            let report = runner.collect_only(&bench.to_parameters(), force).await?;
            for (node, outcome) in &report.nodes {
                match outcome {
                    Ok(c) => println!(
                        "node {node}: {} transferred, {} skipped",
                        c.transferred, c.skipped
                    ),
                    Err(e) => println!("node {node}: {e}"),
                }
            }
        }
        Command::Report { bench, skip_persist } => {
            let result = runner.report_only(&bench.to_parameters(), skip_persist)?;
            println!("{}", result.summary());
        }
        Command::Status => {
            for (host, status) in runner.status().await {
                println!("{host}: {status}");
            }
        }
        Command::Cleanup { delete_logs } => {
            for (host, outcome) in runner.cleanup(delete_logs).await {
                match outcome {
                    Ok(()) => println!("{host}: cleaned"),
                    Err(e) => println!("{host}: {e}"),
                }
            }
        }
    }
    Ok(())
}
