//! Per-task execution engine.
//!
//! One array task owns exactly one `(instance, configuration)` pair and
//! writes exactly two files, a solution document and a statistics document,
//! plus an error file on unexpected failure. Solutions are flushed as they
//! arrive so an external kill never loses results already found; the final
//! statistics record is written once, atomically.

use crate::solver::{SolveEvent, SolveInputs, SolverBackend, SolverError};
use cpbench_core::config::Configuration;
use cpbench_core::index::JobTask;
use cpbench_core::manifest::InstanceRecord;
use cpbench_core::record::{self, Record};
use cpbench_core::status::{Method, SolveStatus};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempPath;
use thiserror::Error;
use tracing::{error, info, warn};

/// Where a task runs, which decides its failure policy: inside a batch array
/// unexpected failures are isolated to this task's error file so siblings
/// keep running; standalone they propagate to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    ClusterArray,
    Standalone,
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("failed to write {path}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize record")]
    Encode(#[from] serde_yaml::Error),
    #[error("failed to stage extra instance data")]
    Stage(#[source] std::io::Error),
}

/// Split between failures of the solving engine, which are recorded in the
/// statistics record, and failures of the task itself, which are not
/// recoverable in-task.
enum SolveFailure {
    Solver(SolverError),
    Task(TaskError),
}

impl From<SolverError> for SolveFailure {
    fn from(err: SolverError) -> Self {
        Self::Solver(err)
    }
}

impl From<TaskError> for SolveFailure {
    fn from(err: TaskError) -> Self {
        Self::Task(err)
    }
}

/// Run one task to completion, whatever the outcome.
pub fn run_task<S: SolverBackend>(
    ctx: ExecutionContext,
    solver: &S,
    task: &JobTask,
    manifest_dir: &Path,
    timeout: Duration,
    out_dir: &Path,
) -> Result<(), TaskError> {
    let stem = task.file_stem();
    info!(task = %stem, "running task");

    match execute(solver, task, manifest_dir, timeout, out_dir, &stem) {
        Ok(status) => {
            info!(task = %stem, status = %status, "task finished");
            Ok(())
        }
        Err(err) => match ctx {
            ExecutionContext::Standalone => Err(err),
            ExecutionContext::ClusterArray => {
                error!(task = %stem, error = %err, "task failed, isolating from siblings");
                write_error_file(&out_dir.join(record::err_file_name(&stem)), &err);
                Ok(())
            }
        },
    }
}

/// Write a human-readable failure trace next to the task's other output
/// files. Best effort: a failure to report a failure only gets logged.
pub fn write_error_file(path: &Path, err: &dyn std::error::Error) {
    let mut text = format!("ERROR: {err}\n");
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(&format!("caused by: {cause}\n"));
        source = cause.source();
    }
    if let Err(io_err) = fs::write(path, text) {
        error!(path = %path.display(), error = %io_err, "failed to write error file");
    }
}

fn execute<S: SolverBackend>(
    solver: &S,
    task: &JobTask,
    manifest_dir: &Path,
    timeout: Duration,
    out_dir: &Path,
    stem: &str,
) -> Result<String, TaskError> {
    let sol_path = out_dir.join(record::sol_file_name(stem));
    let stats_path = out_dir.join(record::stats_file_name(stem));
    let mut statistics = record::base_record(task);

    let start = Instant::now();
    match solve(solver, task, manifest_dir, timeout, &sol_path, &mut statistics) {
        Ok(()) => {
            statistics.insert(
                "time".to_string(),
                serde_yaml::Value::from(start.elapsed().as_secs_f64()),
            );
        }
        Err(SolveFailure::Solver(err)) => {
            warn!(task = %stem, error = %err, "solver failed on this instance");
            statistics.insert(
                "status".to_string(),
                SolveStatus::Error.to_string().into(),
            );
            statistics.insert("error".to_string(), err.to_string().into());
        }
        Err(SolveFailure::Task(err)) => return Err(err),
    }

    let status = statistics
        .get("status")
        .and_then(|value| value.as_str())
        .unwrap_or(SolveStatus::Unknown.as_str())
        .to_string();
    write_statistics(&stats_path, &statistics)?;
    Ok(status)
}

fn solve<S: SolverBackend>(
    solver: &S,
    task: &JobTask,
    manifest_dir: &Path,
    timeout: Duration,
    sol_path: &Path,
    statistics: &mut Record,
) -> Result<(), SolveFailure> {
    let model = InstanceRecord::resolve(&task.instance.model, manifest_dir);
    let mut data_files: Vec<PathBuf> = task
        .instance
        .data_files()
        .map(|path| InstanceRecord::resolve(&path, manifest_dir))
        .collect();

    // configuration overrides become one generated data file, staged for the
    // lifetime of the solve
    let _extra_guard = match stage_extra_data(&task.configuration)? {
        Some(staged) => {
            data_files.push(staged.to_path_buf());
            Some(staged)
        }
        None => None,
    };

    let inputs = SolveInputs {
        configuration: &task.configuration,
        model,
        data_files,
    };

    let method = solver.method(&inputs)?;
    // the per-solution records carry the task identity only; the method is a
    // statistics-level fact
    let base = statistics.clone();
    statistics.insert("method".to_string(), method.to_string().into());

    let mut sol_file = File::create(sol_path).map_err(|source| TaskError::Output {
        path: sol_path.to_path_buf(),
        source,
    })?;
    let events = solver.solutions(&inputs, timeout)?;
    drain_events(events, &base, method, &mut sol_file, sol_path, statistics)
}

/// Consume the event stream: every event is appended to the solution
/// document immediately and merged into the running statistics record.
fn drain_events<I>(
    events: I,
    base: &Record,
    method: Method,
    sol_file: &mut File,
    sol_path: &Path,
    statistics: &mut Record,
) -> Result<(), SolveFailure>
where
    I: IntoIterator<Item = Result<SolveEvent, SolverError>>,
{
    for event in events {
        let SolveEvent {
            status,
            time,
            solution,
            statistics: event_statistics,
        } = event?;

        let mut solution_record = base.clone();
        solution_record.insert("status".to_string(), status.to_string().into());
        if let Some(time) = time {
            solution_record.insert("time".to_string(), serde_yaml::Value::from(time));
        }
        if let Some(solution) = &solution {
            solution_record.insert(
                "solution".to_string(),
                serde_yaml::to_value(solution).map_err(TaskError::Encode)?,
            );
        }
        append_record(sol_file, sol_path, &solution_record)?;

        statistics.extend(event_statistics);
        statistics.insert("status".to_string(), status.to_string().into());
        if method != Method::Satisfy {
            if let Some(objective) = solution.as_ref().and_then(|s| s.get("objective")) {
                statistics.insert("objective".to_string(), objective.clone());
            }
        }
    }
    Ok(())
}

fn append_record(file: &mut File, path: &Path, record: &Record) -> Result<(), TaskError> {
    // one single-element sequence per emission; concatenated they parse back
    // as one document in emission order
    let text = serde_yaml::to_string(std::slice::from_ref(record))?;
    file.write_all(text.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|source| TaskError::Output {
            path: path.to_path_buf(),
            source,
        })
}

fn stage_extra_data(configuration: &Configuration) -> Result<Option<TempPath>, TaskError> {
    if configuration.extra_data.is_empty() {
        return Ok(None);
    }
    let mut file = tempfile::Builder::new()
        .prefix("cpbench-data-")
        .suffix(".dzn")
        .tempfile()
        .map_err(TaskError::Stage)?;
    for (name, value) in &configuration.extra_data {
        writeln!(file, "{name} = {};", value.to_dzn()).map_err(TaskError::Stage)?;
    }
    file.flush().map_err(TaskError::Stage)?;
    Ok(Some(file.into_temp_path()))
}

/// Single atomic write: the collector either sees no statistics file at all
/// (task failed or still pending) or a complete one, never a torn one.
fn write_statistics(path: &Path, statistics: &Record) -> Result<(), TaskError> {
    let text = serde_yaml::to_string(statistics)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, text).map_err(|source| TaskError::Output {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| TaskError::Output {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpbench_core::config::SolverRef;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    struct Scripted {
        method: Method,
        events: RefCell<Vec<Result<SolveEvent, SolverError>>>,
    }

    impl Scripted {
        fn new(method: Method, events: Vec<Result<SolveEvent, SolverError>>) -> Self {
            Self {
                method,
                events: RefCell::new(events),
            }
        }
    }

    impl SolverBackend for Scripted {
        type Stream = std::vec::IntoIter<Result<SolveEvent, SolverError>>;

        fn method(&self, _inputs: &SolveInputs) -> Result<Method, SolverError> {
            Ok(self.method)
        }

        fn solutions(
            &self,
            _inputs: &SolveInputs,
            _timeout: Duration,
        ) -> Result<Self::Stream, SolverError> {
            Ok(std::mem::take(&mut *self.events.borrow_mut()).into_iter())
        }
    }

    fn task() -> JobTask {
        JobTask {
            row: 1,
            instance: InstanceRecord {
                problem: "knapsack".to_string(),
                model: PathBuf::from("knapsack/model.mzn"),
                data_file: String::new(),
            },
            configuration: Configuration::new("base", SolverRef::lookup("gecode")),
        }
    }

    fn event(
        status: SolveStatus,
        objective: Option<i64>,
        stats: &[(&str, i64)],
    ) -> Result<SolveEvent, SolverError> {
        Ok(SolveEvent {
            status,
            time: Some(0.5),
            solution: objective.map(|obj| {
                Record::from([(
                    "objective".to_string(),
                    serde_yaml::Value::from(obj),
                )])
            }),
            statistics: stats
                .iter()
                .map(|(k, v)| (k.to_string(), serde_yaml::Value::from(*v)))
                .collect::<BTreeMap<_, _>>(),
        })
    }

    fn read_stats(dir: &Path) -> Record {
        let text = fs::read_to_string(dir.join("1_base_stats.yml")).unwrap();
        serde_yaml::from_str(&text).unwrap()
    }

    #[test]
    fn streams_solutions_and_accumulates_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let solver = Scripted::new(
            Method::Minimize,
            vec![
                event(SolveStatus::Satisfied, Some(10), &[("nodes", 40)]),
                event(SolveStatus::Satisfied, Some(8), &[("nodes", 95)]),
                event(SolveStatus::OptimalSolution, None, &[("nodes", 120)]),
            ],
        );

        run_task(
            ExecutionContext::Standalone,
            &solver,
            &task(),
            dir.path(),
            Duration::from_secs(10),
            dir.path(),
        )
        .unwrap();

        let text = fs::read_to_string(dir.path().join("1_base_sol.yml")).unwrap();
        let solutions: Vec<Record> = serde_yaml::from_str(&text).unwrap();
        assert_eq!(solutions.len(), 3);
        assert_eq!(
            solutions[0]["status"],
            serde_yaml::Value::from("SATISFIED")
        );
        assert_eq!(
            solutions[2]["status"],
            serde_yaml::Value::from("OPTIMAL_SOLUTION")
        );
        assert_eq!(
            solutions[1]["solution"]["objective"],
            serde_yaml::Value::from(8)
        );
        // solution records never carry statistics-level facts
        assert!(!solutions[0].contains_key("method"));

        let stats = read_stats(dir.path());
        assert_eq!(stats["status"], serde_yaml::Value::from("OPTIMAL_SOLUTION"));
        assert_eq!(stats["method"], serde_yaml::Value::from("minimize"));
        assert_eq!(stats["objective"], serde_yaml::Value::from(8));
        assert_eq!(stats["nodes"], serde_yaml::Value::from(120));
        assert!(stats["time"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn solver_failures_are_recorded_not_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let solver = Scripted::new(
            Method::Satisfy,
            vec![
                event(SolveStatus::Satisfied, None, &[]),
                Err(SolverError::Engine("fzn crashed".to_string())),
            ],
        );

        run_task(
            ExecutionContext::Standalone,
            &solver,
            &task(),
            dir.path(),
            Duration::from_secs(10),
            dir.path(),
        )
        .unwrap();

        let text = fs::read_to_string(dir.path().join("1_base_sol.yml")).unwrap();
        let solutions: Vec<Record> = serde_yaml::from_str(&text).unwrap();
        assert_eq!(solutions.len(), 1);

        let stats = read_stats(dir.path());
        assert_eq!(stats["status"], serde_yaml::Value::from("ERROR"));
        assert!(stats["error"]
            .as_str()
            .unwrap()
            .contains("fzn crashed"));
        assert!(dir.path().join("1_base_stats.yml").exists());
        assert!(!dir.path().join("1_base_err.txt").exists());
    }

    #[test]
    fn unexpected_failures_are_isolated_in_array_context() {
        let dir = tempfile::tempdir().unwrap();
        // blocking the solution document forces an infrastructure failure
        fs::create_dir(dir.path().join("1_base_sol.yml")).unwrap();
        let solver = Scripted::new(Method::Satisfy, vec![event(SolveStatus::Satisfied, None, &[])]);

        run_task(
            ExecutionContext::ClusterArray,
            &solver,
            &task(),
            dir.path(),
            Duration::from_secs(10),
            dir.path(),
        )
        .unwrap();

        let trace = fs::read_to_string(dir.path().join("1_base_err.txt")).unwrap();
        assert!(trace.starts_with("ERROR: "));
        // a failed task leaves no statistics file: missing means failed or
        // pending, distinct from a present record with an ERROR status
        assert!(!dir.path().join("1_base_stats.yml").exists());
    }

    #[test]
    fn unexpected_failures_propagate_when_standalone() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("1_base_sol.yml")).unwrap();
        let solver = Scripted::new(Method::Satisfy, vec![event(SolveStatus::Satisfied, None, &[])]);

        let err = run_task(
            ExecutionContext::Standalone,
            &solver,
            &task(),
            dir.path(),
            Duration::from_secs(10),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::Output { .. }));
        assert!(!dir.path().join("1_base_err.txt").exists());
    }

    #[test]
    fn extra_data_overrides_are_staged_as_dzn() {
        use cpbench_core::config::DataValue;

        let mut configuration = Configuration::new("tuned", SolverRef::lookup("gecode"));
        configuration
            .extra_data
            .insert("n".to_string(), DataValue::Int(4));
        configuration.extra_data.insert(
            "hint".to_string(),
            DataValue::Expr("first_fail".to_string()),
        );

        let staged = stage_extra_data(&configuration).unwrap().unwrap();
        let text = fs::read_to_string(&staged).unwrap();
        assert_eq!(text, "hint = first_fail;\nn = 4;\n");
    }
}
