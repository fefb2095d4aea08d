//! bmksuite CLI: runs the benchmark suite and works with its reports.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use bmksuite_core::{Benchmark, RunMode};

/// bmksuite: CPU benchmark orchestrator
#[derive(Parser, Debug)]
#[command(name = "bmksuite", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the selected benchmarks and write the report
    Run(RunArgs),
    /// Collect host metadata and print it as JSON
    Metadata {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the result summary of an existing report
    Show {
        /// Report file
        report: PathBuf,
    },
    /// Send an existing report to the configured message queue
    Publish {
        /// Report file
        report: PathBuf,
        /// Configuration file holding the `activemq` section
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Benchmarks to run, replacing the configured list (repeat or comma separate)
    #[arg(short, long = "benchmarks", value_delimiter = ',')]
    benchmarks: Vec<Benchmark>,

    /// Run directory
    #[arg(short, long)]
    rundir: Option<PathBuf>,

    /// Container run mode: docker or singularity
    #[arg(short, long)]
    mode: Option<RunMode>,

    /// Number of concurrent copies per benchmark
    #[arg(long)]
    mp_num: Option<usize>,

    /// Extra report tags as a JSON object
    #[arg(short, long)]
    tags: Option<String>,

    /// Publish the report when the run completes
    #[arg(long)]
    publish: bool,

    /// Archive results and logs when the run completes
    #[arg(long)]
    export: bool,
}

fn init_tracing(verbose: u8, quiet: bool) -> Option<WorkerGuard> {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("ch", "hep-benchmarks", "bmksuite")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    if std::fs::create_dir_all(&log_dir).is_err() {
        tracing_subscriber::registry().with(stderr_layer).init();
        return None;
    }
    let file_appender = tracing_appender::rolling::daily(&log_dir, "bmksuite.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.quiet);

    match commands::handle_command(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "bmksuite failed");
            ExitCode::from(commands::exit_code(&e))
        }
    }
}
