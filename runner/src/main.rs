use clap::{Parser, Subcommand};
use cpbench_core::codec::{self, CodecError};
use cpbench_core::index::{IndexError, JobTask};
use cpbench_core::manifest::{self, ManifestError};
use cpbench_runner::executors::{
    local::LocalExecutor, slurm::SlurmExecutor, BatchPlan, ExecutorError, Executors, ENV_CONFIGS,
    ENV_TASK_ID, ENV_TIMEOUT_MS,
};
use cpbench_runner::instances::{self, InstanceError};
use cpbench_runner::solver::CliDriver;
use cpbench_runner::task::{self, ExecutionContext, TaskError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use std::{env, fs};
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cpbench-runner", version, about = "Schedule and run constraint solving benchmarks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a benchmarks tree and print the instance manifest as CSV
    CollectInstances {
        /// Root of the benchmarks tree
        benchmarks: PathBuf,
    },
    /// Submit a benchmark batch to SLURM, or run it in-process with --local
    Schedule {
        /// Instance manifest CSV
        manifest: PathBuf,
        /// Configuration set file (JSON)
        #[arg(short, long)]
        configurations: PathBuf,
        /// Per-task solve timeout in seconds
        #[arg(short, long)]
        timeout: u64,
        /// Directory for the per-task output documents
        #[arg(short, long, default_value = "results")]
        output_dir: PathBuf,
        /// Run every task in this process instead of submitting to SLURM
        #[arg(long)]
        local: bool,
        /// Thread count for --local; 0 means one thread per core
        #[arg(long, requires = "local")]
        jobs: Option<usize>,
        #[arg(long, default_value = "cpbench")]
        job_name: String,
        #[arg(long, default_value_t = 1)]
        cpus_per_task: u32,
        /// Memory per task in MiB
        #[arg(long, default_value_t = 4096)]
        memory: u32,
        /// Nodes eligible to run tasks, comma separated
        #[arg(long, value_delimiter = ',')]
        nodelist: Vec<String>,
        #[arg(long)]
        nice: Option<i64>,
        /// Block until the whole array has finished
        #[arg(long)]
        wait: bool,
        /// Keep scheduler output files and forward a debug log filter
        #[arg(long)]
        debug: bool,
    },
    /// Array-task entry point, spawned by the batch scheduler
    #[command(hide = true)]
    RunTask {
        manifest: PathBuf,
        output_dir: PathBuf,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("failed to read configuration file {path}")]
    ReadConfigurations {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("environment variable {0} is missing or invalid")]
    Env(&'static str),
    #[error("array task ids are 1-based")]
    TaskIdZero,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Instances(#[from] InstanceError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("failed to write instance manifest")]
    WriteManifest(#[from] csv::Error),
    #[error("failed to flush instance manifest")]
    FlushManifest(#[source] std::io::Error),
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

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::CollectInstances { benchmarks } => collect_instances(&benchmarks),
        Commands::Schedule {
            manifest,
            configurations,
            timeout,
            output_dir,
            local,
            jobs,
            job_name,
            cpus_per_task,
            memory,
            nodelist,
            nice,
            wait,
            debug,
        } => {
            let text =
                fs::read_to_string(&configurations).map_err(|source| {
                    CliError::ReadConfigurations {
                        path: configurations,
                        source,
                    }
                })?;
            let plan = BatchPlan::new(
                manifest,
                codec::decode(&text)?,
                Duration::from_secs(timeout),
                output_dir,
            )?;

            let executor = if local {
                Executors::Local(LocalExecutor { jobs })
            } else {
                Executors::Slurm(SlurmExecutor {
                    job_name,
                    cpus_per_task,
                    memory,
                    nodelist,
                    nice,
                    wait,
                    debug,
                })
            };
            executor.execute(&plan)?;
            Ok(())
        }
        Commands::RunTask {
            manifest,
            output_dir,
        } => run_array_task(&manifest, &output_dir),
    }
}

fn collect_instances(benchmarks: &Path) -> Result<(), CliError> {
    let instances = instances::collect_instances(benchmarks)?;
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    for record in &instances {
        writer.serialize(record)?;
    }
    writer.flush().map_err(CliError::FlushManifest)?;
    eprintln!("Nr. Instances = {}", instances.len());
    Ok(())
}

/// Process boundary of one array task: all environment decoding happens
/// here, before a typed task is handed to the runner. A failure before the
/// task is even resolved still leaves an error file behind, because inside
/// an array there is nobody else to report to.
fn run_array_task(manifest: &Path, output_dir: &Path) -> Result<(), CliError> {
    match resolve_array_task(manifest) {
        Ok((task, timeout)) => {
            let driver = CliDriver::from_configuration(&task.configuration);
            let manifest_dir = manifest.parent().unwrap_or_else(|| Path::new("."));
            task::run_task(
                ExecutionContext::ClusterArray,
                &driver,
                &task,
                manifest_dir,
                timeout,
                output_dir,
            )?;
            Ok(())
        }
        Err(err) => {
            let id = env::var(ENV_TASK_ID).unwrap_or_else(|_| "unknown".to_string());
            error!(task_id = %id, "failed to resolve array task: {err}");
            task::write_error_file(&output_dir.join(format!("task_{id}_err.txt")), &err);
            Ok(())
        }
    }
}

fn resolve_array_task(manifest: &Path) -> Result<(JobTask, Duration), CliError> {
    let task_id: usize = env::var(ENV_TASK_ID)
        .ok()
        .and_then(|value| value.parse().ok())
        .ok_or(CliError::Env(ENV_TASK_ID))?;
    if task_id == 0 {
        return Err(CliError::TaskIdZero);
    }
    let encoded = env::var(ENV_CONFIGS).map_err(|_| CliError::Env(ENV_CONFIGS))?;
    let timeout_ms: u64 = env::var(ENV_TIMEOUT_MS)
        .ok()
        .and_then(|value| value.parse().ok())
        .ok_or(CliError::Env(ENV_TIMEOUT_MS))?;

    let configurations = codec::decode(&encoded)?;
    let instances = manifest::read_manifest(manifest)?;
    let task = JobTask::resolve(task_id - 1, &instances, &configurations)?;
    Ok((task, Duration::from_millis(timeout_ms)))
}
