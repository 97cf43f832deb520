//! Executor that runs the whole batch inside this process, for development
//! and testing without a real cluster. The typed configuration set is handed
//! straight to the task runner; no environment round-trip takes place.

use super::{BatchPlan, ExecutorError};
use crate::solver::CliDriver;
use crate::task::{self, ExecutionContext};
use cpbench_core::index::JobTask;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Iterates the task grid in-process. Sequential unless a job count is
/// given; `Some(0)` means one thread per core.
#[derive(Debug, Default)]
pub struct LocalExecutor {
    pub jobs: Option<usize>,
}

impl LocalExecutor {
    pub fn execute(self, plan: &BatchPlan) -> Result<(), ExecutorError> {
        let total = plan.total_tasks();
        let processed = AtomicU64::new(0);

        let run_one = |index: usize| -> Result<(), ExecutorError> {
            let task = JobTask::resolve(index, &plan.instances, &plan.configurations)?;
            debug!(
                task = %task.file_stem(),
                timeout = ?plan.timeout,
                "running task in-process"
            );

            let driver = CliDriver::from_configuration(&task.configuration);
            task::run_task(
                ExecutionContext::Standalone,
                &driver,
                &task,
                plan.manifest_dir(),
                plan.timeout,
                &plan.out_dir,
            )?;

            info!(
                "done with {}/{total}",
                processed.fetch_add(1, Ordering::SeqCst) + 1
            );
            Ok(())
        };

        match self.jobs {
            None => (0..total).try_for_each(run_one)?,
            Some(jobs) => {
                let threads = if jobs == 0 { num_cpus::get() } else { jobs };
                debug!("starting thread pool with {threads} threads");
                let pool = ThreadPoolBuilder::new().num_threads(threads).build()?;
                pool.install(|| (0..total).into_par_iter().try_for_each(run_one))?;
            }
        }

        info!("finished local batch of {total} tasks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpbench_core::config::{Configuration, SolverRef};
    use cpbench_core::record::Record;
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    /// Stand-in for the engine driver: answers the model interface query and
    /// replays a fixed result stream for every solve call.
    fn fake_driver(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("fake-minizinc");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            concat!(
                "#!/bin/sh\n",
                "for arg in \"$@\"; do\n",
                "  if [ \"$arg\" = \"--model-interface-only\" ]; then\n",
                "    echo '{{\"method\": \"min\"}}'\n",
                "    exit 0\n",
                "  fi\n",
                "done\n",
                "echo '{{\"type\": \"statistics\", \"statistics\": {{\"nodes\": 5}}}}'\n",
                "echo '{{\"type\": \"solution\", \"output\": {{\"json\": {{\"x\": 1, \"_objective\": 3}}}}, \"time\": 250}}'\n",
                "echo '{{\"type\": \"status\", \"status\": \"OPTIMAL_SOLUTION\", \"time\": 300}}'\n",
            )
        )
        .unwrap();
        drop(file);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn runs_the_whole_grid_through_the_driver() {
        let dir = tempfile::tempdir().unwrap();
        let driver = fake_driver(dir.path());

        fs::write(dir.path().join("model.mzn"), "solve minimize x;\n").unwrap();
        let manifest = dir.path().join("instances.csv");
        fs::write(&manifest, "problem,model,data_file\ntoy,model.mzn,\n").unwrap();

        let mut base = Configuration::new("base", SolverRef::lookup("fake"));
        base.minizinc = Some(driver.clone());
        let mut free = Configuration::new("free", SolverRef::lookup("fake"));
        free.minizinc = Some(driver);
        free.free_search = true;

        let plan = BatchPlan::new(
            manifest,
            vec![base, free],
            Duration::from_secs(5),
            dir.path().join("results"),
        )
        .unwrap();

        LocalExecutor::default().execute(&plan).unwrap();

        for name in ["1_base", "1_free"] {
            let text =
                fs::read_to_string(dir.path().join(format!("results/{name}_stats.yml"))).unwrap();
            let stats: Record = serde_yaml::from_str(&text).unwrap();
            assert_eq!(stats["status"], serde_yaml::Value::from("OPTIMAL_SOLUTION"));
            assert_eq!(stats["method"], serde_yaml::Value::from("minimize"));
            assert_eq!(stats["objective"], serde_yaml::Value::from(3));
            assert_eq!(stats["nodes"], serde_yaml::Value::from(5));
            assert!(!dir.path().join(format!("results/{name}_err.txt")).exists());
        }
    }
}
