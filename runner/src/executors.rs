pub mod local;
pub mod slurm;

use crate::task::TaskError;
use cpbench_core::codec::CodecError;
use cpbench_core::config::Configuration;
use cpbench_core::index::IndexError;
use cpbench_core::manifest::{self, InstanceRecord, ManifestError};
use itertools::Itertools;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variables crossing the scheduler/task process boundary.
pub const ENV_CONFIGS: &str = "CPBENCH_CONFIGS";
pub const ENV_TIMEOUT_MS: &str = "CPBENCH_TIMEOUT_MS";
/// Set by the batch scheduler for each array task, 1-based.
pub const ENV_TASK_ID: &str = "SLURM_ARRAY_TASK_ID";

/// Margin between the per-task solve timeout and the cluster-level kill
/// deadline, leaving room to flush statistics before a force-kill.
pub const HARD_TIMEOUT_MARGIN: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("manifest {0} contains no instances")]
    NoInstances(PathBuf),
    #[error("no configurations were given")]
    NoConfigurations,
    #[error("configuration name `{0}` is not unique within the batch")]
    DuplicateConfiguration(String),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("failed to create output directory {path}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start local thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to submit batch job")]
    Submit(#[source] std::io::Error),
}

/// A fully validated batch: the whole configuration grid plus derived sizes.
/// Zero instances or zero configurations never get this far.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub manifest: PathBuf,
    pub instances: Vec<InstanceRecord>,
    pub configurations: Vec<Configuration>,
    pub timeout: Duration,
    pub out_dir: PathBuf,
}

impl BatchPlan {
    pub fn new(
        manifest: PathBuf,
        configurations: Vec<Configuration>,
        timeout: Duration,
        out_dir: PathBuf,
    ) -> Result<Self, ExecutorError> {
        let instances = manifest::read_manifest(&manifest)?;
        if instances.is_empty() {
            return Err(ExecutorError::NoInstances(manifest));
        }
        if configurations.is_empty() {
            return Err(ExecutorError::NoConfigurations);
        }
        if let Some(name) = configurations
            .iter()
            .map(|configuration| configuration.name.as_str())
            .duplicates()
            .next()
        {
            return Err(ExecutorError::DuplicateConfiguration(name.to_string()));
        }
        fs::create_dir_all(&out_dir).map_err(|source| ExecutorError::OutputDir {
            path: out_dir.clone(),
            source,
        })?;

        Ok(Self {
            manifest,
            instances,
            configurations,
            timeout,
            out_dir,
        })
    }

    /// Size of the job array; nonzero by construction.
    pub fn total_tasks(&self) -> usize {
        self.instances.len() * self.configurations.len()
    }

    pub fn manifest_dir(&self) -> &Path {
        self.manifest.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Cluster-level kill deadline, strictly above the solve timeout.
    pub fn hard_timeout(&self) -> Duration {
        self.timeout + HARD_TIMEOUT_MARGIN
    }
}

/// All executor variants, initialized by the caller and dispatched without
/// dynamic dispatch.
#[derive(Debug)]
pub enum Executors {
    Slurm(slurm::SlurmExecutor),
    Local(local::LocalExecutor),
}

impl Executors {
    pub fn execute(self, plan: &BatchPlan) -> Result<(), ExecutorError> {
        match self {
            Self::Slurm(executor) => executor.execute(plan),
            Self::Local(executor) => executor.execute(plan),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpbench_core::config::SolverRef;
    use std::io::Write;

    fn manifest_with(rows: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "problem,model,data_file").unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn configurations(names: &[&str]) -> Vec<Configuration> {
        names
            .iter()
            .map(|name| Configuration::new(*name, SolverRef::lookup("gecode")))
            .collect()
    }

    #[test]
    fn plan_computes_the_full_grid() {
        let manifest = manifest_with(&["a,a/m.mzn,", "b,b/m.mzn,b/d.dzn", "c,c/m.mzn,"]);
        let out = tempfile::tempdir().unwrap();
        let plan = BatchPlan::new(
            manifest.path().to_path_buf(),
            configurations(&["base", "free"]),
            Duration::from_secs(900),
            out.path().join("results"),
        )
        .unwrap();

        assert_eq!(plan.total_tasks(), 6);
        assert_eq!(plan.hard_timeout(), Duration::from_secs(960));
        assert!(plan.hard_timeout() > plan.timeout);
        assert!(out.path().join("results").is_dir());
    }

    #[test]
    fn empty_grids_are_configuration_errors() {
        let empty = manifest_with(&[]);
        let out = tempfile::tempdir().unwrap();
        assert!(matches!(
            BatchPlan::new(
                empty.path().to_path_buf(),
                configurations(&["base"]),
                Duration::from_secs(1),
                out.path().to_path_buf(),
            ),
            Err(ExecutorError::NoInstances(_))
        ));

        let manifest = manifest_with(&["a,a/m.mzn,"]);
        assert!(matches!(
            BatchPlan::new(
                manifest.path().to_path_buf(),
                Vec::new(),
                Duration::from_secs(1),
                out.path().to_path_buf(),
            ),
            Err(ExecutorError::NoConfigurations)
        ));
    }

    #[test]
    fn duplicate_configuration_names_are_rejected() {
        let manifest = manifest_with(&["a,a/m.mzn,"]);
        let out = tempfile::tempdir().unwrap();
        assert!(matches!(
            BatchPlan::new(
                manifest.path().to_path_buf(),
                configurations(&["base", "free", "base"]),
                Duration::from_secs(1),
                out.path().to_path_buf(),
            ),
            Err(ExecutorError::DuplicateConfiguration(name)) if name == "base"
        ));
    }
}
