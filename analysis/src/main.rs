use clap::{Parser, Subcommand};
use cpbench_analysis::collect::{self, CollectError};
use cpbench_analysis::compare::{self, CompareError};
use cpbench_analysis::report::{self, ReportError};
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cpbench-analysis", version, about = "Collect and compare benchmark results")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Combine per-task statistics documents into one CSV table
    CollectStatistics {
        /// Result directories to walk
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
        /// Output CSV file
        #[arg(short, long)]
        out_file: PathBuf,
    },
    /// Combine objective values from solution documents into one CSV table
    CollectObjectives {
        /// Result directories to walk
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
        /// Output CSV file
        #[arg(short, long)]
        out_file: PathBuf,
    },
    /// Classify performance and status differences between two configurations
    Compare {
        /// Aggregated statistics CSV
        statistics: PathBuf,
        /// Baseline configuration name
        from_conf: String,
        /// Comparison configuration name
        to_conf: String,
        /// Relative runtime change worth reporting
        #[arg(long, default_value_t = 0.1)]
        time_delta: f64,
        /// Relative objective change worth reporting
        #[arg(long, default_value_t = 0.1)]
        obj_delta: f64,
        /// Emit the structured JSON form instead of the narrative report
        #[arg(long)]
        json: bool,
    },
    /// Aggregate solve statuses into a per-configuration count table
    ReportStatus {
        /// Aggregated statistics CSV
        statistics: PathBuf,
        /// Create a row for every model
        #[arg(long)]
        per_model: bool,
        /// Create a row for every problem
        #[arg(long)]
        per_problem: bool,
        /// Show the average runtime next to each count
        #[arg(long)]
        avg_time: bool,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Compare(#[from] CompareError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("failed to create {path}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                error!("caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn create(path: &PathBuf) -> Result<File, CliError> {
    File::create(path).map_err(|source| CliError::Create {
        path: path.clone(),
        source,
    })
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::CollectStatistics { dirs, out_file } => {
            let records = collect::collect_statistics(&dirs)?;
            collect::write_statistics_csv(&records, create(&out_file)?)?;
            eprintln!("Processed {} documents.", records.len());
        }
        Commands::CollectObjectives { dirs, out_file } => {
            let records = collect::collect_objectives(&dirs)?;
            collect::write_objectives_csv(&records, create(&out_file)?)?;
            eprintln!("Processed {} solutions.", records.len());
        }
        Commands::Compare {
            statistics,
            from_conf,
            to_conf,
            time_delta,
            obj_delta,
            json,
        } => {
            let changes = compare::compare_configurations(
                &statistics,
                &from_conf,
                &to_conf,
                time_delta,
                obj_delta,
            )?;
            if json {
                println!("{}", changes.serialise());
            } else {
                println!("{changes}");
            }
        }
        Commands::ReportStatus {
            statistics,
            per_model,
            per_problem,
            avg_time,
        } => {
            print!(
                "{}",
                report::report_status(&statistics, per_model, per_problem, avg_time)?
            );
        }
    }
    Ok(())
}
