//! Executor that submits the batch as one SLURM job array.
//!
//! The configuration set travels to the array tasks through the child
//! environment; each task recomputes its own unit of work from
//! `SLURM_ARRAY_TASK_ID`. On success the current process is replaced by the
//! `sbatch` invocation and never returns.

use super::{BatchPlan, ExecutorError, ENV_CONFIGS, ENV_TIMEOUT_MS};
use cpbench_core::codec;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SlurmExecutor {
    pub job_name: String,
    pub cpus_per_task: u32,
    /// Memory per task in MiB.
    pub memory: u32,
    /// Nodes eligible to run array tasks.
    pub nodelist: Vec<String>,
    pub nice: Option<i64>,
    /// Block the submission until the whole array has finished.
    pub wait: bool,
    /// Keep per-task scheduler output and forward a debug log filter.
    pub debug: bool,
}

impl SlurmExecutor {
    pub fn execute(self, plan: &BatchPlan) -> Result<(), ExecutorError> {
        let encoded = codec::encode(&plan.configurations)?;
        let this_exe = std::env::current_exe().map_err(ExecutorError::Submit)?;
        let manifest = absolute(&plan.manifest)?;
        let out_dir = absolute(&plan.out_dir)?;

        let slurm_output = if self.debug {
            format!("{}/cpbench-%A_%a.out", out_dir.display())
        } else {
            "/dev/null".to_string()
        };

        let mut command = Command::new("sbatch");
        command
            .arg(format!("--output={slurm_output}"))
            .arg(format!("--job-name={}", self.job_name))
            .arg(format!("--cpus-per-task={}", self.cpus_per_task))
            .arg(format!("--mem={}", self.memory))
            .arg(format!("--array=1-{}", plan.total_tasks()))
            // hard kill deadline, strictly above the solve timeout so tasks
            // can flush their statistics first
            .arg(format!("--time={}", slurm_time(plan.hard_timeout())));
        if !self.nodelist.is_empty() {
            command.arg(format!("--nodelist={}", self.nodelist.join(",")));
        }
        if let Some(nice) = self.nice {
            command.arg(format!("--nice={nice}"));
        }
        if self.wait {
            command.arg("--wait");
        }
        command
            .arg(format!(
                "--wrap=exec {} run-task {} {}",
                shell_quote(&this_exe.to_string_lossy()),
                shell_quote(&manifest.to_string_lossy()),
                shell_quote(&out_dir.to_string_lossy()),
            ))
            .env(ENV_CONFIGS, encoded)
            .env(ENV_TIMEOUT_MS, plan.timeout.as_millis().to_string());
        if self.debug {
            command.env("RUST_LOG", "debug");
        }

        info!(
            tasks = plan.total_tasks(),
            timeout = ?plan.timeout,
            "submitting job array"
        );
        // only reachable when the replacement itself failed
        Err(ExecutorError::Submit(command.exec()))
    }
}

fn absolute(path: &Path) -> Result<std::path::PathBuf, ExecutorError> {
    path.canonicalize().map_err(ExecutorError::Submit)
}

/// Render a duration in the `H:MM:SS` form the batch scheduler accepts.
fn slurm_time(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, total % 3600 / 60, total % 60)
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}
