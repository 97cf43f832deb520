//! Boundary to the solving engine.
//!
//! The engine is an external collaborator: given a solver reference, a model,
//! optional data and search parameters it produces a stream of results, each
//! carrying a status, an optional solution payload and a statistics map.
//! `CliDriver` talks to the engine's command-line driver over a line-delimited
//! JSON stream; `SolverBackend` is the seam the task runner consumes, so the
//! engine can be scripted in tests.

use cpbench_core::config::{Configuration, DataValue, SolverRef};
use cpbench_core::record::Record;
use cpbench_core::status::{Method, SolveStatus, StatusError};
use serde::Deserialize;
use std::io::{BufRead, BufReader, Lines, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;
use tempfile::TempPath;
use thiserror::Error;
use tracing::debug;
use wait_timeout::ChildExt;

/// Slack on top of the solve timeout before a child is reaped forcefully.
const WAIT_GRACE: Duration = Duration::from_secs(5);
/// Deadline for the model interface query, which does no search.
const INTERFACE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("failed to launch solver driver `{exe}`")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("solver driver produced malformed output")]
    Protocol(#[from] serde_json::Error),
    #[error("failed to convert solver statistics")]
    Statistics(#[from] serde_yaml::Error),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("solver error: {0}")]
    Engine(String),
    #[error("failed to read solver output")]
    Io(#[from] std::io::Error),
    #[error("solver exceeded its hard deadline and was killed")]
    Deadline,
    #[error("failed to stage solver definition")]
    Stage(#[source] std::io::Error),
}

/// One incremental result from the engine.
#[derive(Debug, Clone)]
pub struct SolveEvent {
    pub status: SolveStatus,
    /// Seconds since the solve started, when the engine reported one.
    pub time: Option<f64>,
    /// Solution payload with internal keys stripped; `None` for pure status
    /// events.
    pub solution: Option<Record>,
    pub statistics: Record,
}

/// Everything the engine needs for one solve call.
#[derive(Debug)]
pub struct SolveInputs<'a> {
    pub configuration: &'a Configuration,
    pub model: PathBuf,
    pub data_files: Vec<PathBuf>,
}

/// Seam between the task runner and the solving engine.
pub trait SolverBackend {
    type Stream: Iterator<Item = Result<SolveEvent, SolverError>>;

    /// Classify the instantiated problem without searching.
    fn method(&self, inputs: &SolveInputs) -> Result<Method, SolverError>;

    /// Start a solve and stream its incremental results.
    fn solutions(&self, inputs: &SolveInputs, timeout: Duration) -> Result<Self::Stream, SolverError>;
}

/// Driver that shells out to the engine's command-line frontend.
#[derive(Debug, Clone)]
pub struct CliDriver {
    exe: PathBuf,
}

impl CliDriver {
    pub const DEFAULT_EXE: &'static str = "minizinc";

    /// Build a driver for a configuration, honoring its executable override.
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            exe: configuration
                .minizinc
                .clone()
                .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_EXE)),
        }
    }

    fn spawn(&self, command: &mut Command) -> Result<Child, SolverError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(exe = %self.exe.display(), "launching solver driver");
        command.spawn().map_err(|source| SolverError::Spawn {
            exe: self.exe.clone(),
            source,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ModelInterface {
    method: String,
}

impl SolverBackend for CliDriver {
    type Stream = Solutions;

    fn method(&self, inputs: &SolveInputs) -> Result<Method, SolverError> {
        let (solver, _solver_def) = solver_arg(&inputs.configuration.solver)?;
        let mut command = Command::new(&self.exe);
        command
            .arg("--model-interface-only")
            .arg("--solver")
            .arg(&solver)
            .arg(&inputs.model)
            .args(&inputs.data_files);

        let mut child = self.spawn(&mut command)?;
        match child.wait_timeout(INTERFACE_TIMEOUT)? {
            Some(status) => {
                let mut stdout = String::new();
                if let Some(mut pipe) = child.stdout.take() {
                    pipe.read_to_string(&mut stdout)?;
                }
                if !status.success() {
                    return Err(SolverError::Engine(format!(
                        "model interface query failed: {}",
                        read_stderr(&mut child)
                    )));
                }
                let interface: ModelInterface = serde_json::from_str(stdout.trim())?;
                Ok(interface.method.parse()?)
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(SolverError::Deadline)
            }
        }
    }

    fn solutions(&self, inputs: &SolveInputs, timeout: Duration) -> Result<Solutions, SolverError> {
        let (solver, solver_def) = solver_arg(&inputs.configuration.solver)?;
        let mut command = Command::new(&self.exe);
        command
            .args(search_args(inputs.configuration, timeout))
            .arg("--solver")
            .arg(&solver)
            .arg(&inputs.model)
            .args(&inputs.data_files);

        let mut child = self.spawn(&mut command)?;
        let stdout = child.stdout.take().expect("stdout was piped");
        Ok(Solutions {
            child,
            lines: BufReader::new(stdout).lines(),
            assembler: EventAssembler::default(),
            grace: timeout + WAIT_GRACE,
            finished: false,
            _solver_def: solver_def,
        })
    }
}

/// Turn a solver reference into a `--solver` argument. Inline definitions
/// are staged to a definition file whose lifetime is tied to the returned
/// guard.
fn solver_arg(solver: &SolverRef) -> Result<(String, Option<TempPath>), SolverError> {
    match solver {
        SolverRef::Lookup(id) => Ok((id.clone(), None)),
        SolverRef::Definition(def) => {
            let mut file = tempfile::Builder::new()
                .prefix("cpbench-solver-")
                .suffix(".msc")
                .tempfile()
                .map_err(SolverError::Stage)?;
            let blob = serde_json::to_string(def)?;
            file.write_all(blob.as_bytes()).map_err(SolverError::Stage)?;
            let path = file.into_temp_path();
            Ok((path.to_string_lossy().into_owned(), Some(path)))
        }
    }
}

/// Search arguments for one solve call. The configuration's free-form flags
/// go through verbatim.
fn search_args(configuration: &Configuration, timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "--json-stream".to_string(),
        "--intermediate-solutions".to_string(),
        "--output-time".to_string(),
        "--statistics".to_string(),
        "--time-limit".to_string(),
        timeout.as_millis().to_string(),
    ];
    if let Some(processes) = configuration.processes {
        args.push("--parallel".to_string());
        args.push(processes.to_string());
    }
    if let Some(seed) = configuration.random_seed {
        args.push("--random-seed".to_string());
        args.push(seed.to_string());
    }
    if configuration.free_search {
        args.push("--free-search".to_string());
    }
    if let Some(level) = configuration.optimisation_level {
        args.push(format!("-O{level}"));
    }
    for (flag, value) in &configuration.other_flags {
        let flag = if flag.starts_with('-') {
            flag.clone()
        } else {
            format!("--{flag}")
        };
        match value {
            DataValue::Bool(true) => args.push(flag),
            DataValue::Bool(false) => {}
            other => {
                args.push(flag);
                args.push(other.to_flag_arg());
            }
        }
    }
    args
}

fn read_stderr(child: &mut Child) -> String {
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr);
    }
    stderr.trim().to_string()
}

/// One message on the driver's line-delimited JSON stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DriverMessage {
    Solution {
        #[serde(default)]
        output: SolutionOutput,
        /// Milliseconds since the solve started.
        #[serde(default)]
        time: Option<f64>,
    },
    Statistics {
        statistics: serde_json::Map<String, serde_json::Value>,
    },
    Status {
        status: String,
        #[serde(default)]
        time: Option<f64>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct SolutionOutput {
    #[serde(default)]
    json: serde_json::Map<String, serde_json::Value>,
}

/// Folds driver messages into solve events. Statistics messages accumulate
/// and ride along on the next solution or status event.
#[derive(Debug, Default)]
struct EventAssembler {
    pending: Record,
}

impl EventAssembler {
    fn push(&mut self, message: DriverMessage) -> Result<Option<SolveEvent>, SolverError> {
        match message {
            DriverMessage::Statistics { statistics } => {
                for (key, value) in statistics {
                    self.pending.insert(key, serde_yaml::to_value(value)?);
                }
                Ok(None)
            }
            DriverMessage::Solution { output, time } => Ok(Some(SolveEvent {
                status: SolveStatus::Satisfied,
                time: time.map(millis_to_secs),
                solution: Some(clean_solution(output.json)?),
                statistics: std::mem::take(&mut self.pending),
            })),
            DriverMessage::Status { status, time } => Ok(Some(SolveEvent {
                status: status.parse()?,
                time: time.map(millis_to_secs),
                solution: None,
                statistics: std::mem::take(&mut self.pending),
            })),
            DriverMessage::Error { message } => Err(SolverError::Engine(message)),
            DriverMessage::Other => Ok(None),
        }
    }
}

/// Strip internal `_`-prefixed payload keys, surfacing the engine's
/// `_objective` as `objective` first.
fn clean_solution(
    fields: serde_json::Map<String, serde_json::Value>,
) -> Result<Record, SolverError> {
    let mut solution = Record::new();
    for (key, value) in fields {
        let key = if key == "_objective" {
            "objective".to_string()
        } else if key.starts_with('_') {
            continue;
        } else {
            key
        };
        solution.insert(key, serde_yaml::to_value(value)?);
    }
    Ok(solution)
}

fn millis_to_secs(millis: f64) -> f64 {
    millis / 1000.0
}

/// Streamed results of one solve call. The iterator owns the child process;
/// dropping it mid-stream kills the child.
#[derive(Debug)]
pub struct Solutions {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    assembler: EventAssembler,
    grace: Duration,
    finished: bool,
    _solver_def: Option<TempPath>,
}

impl Solutions {
    fn abandon(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Reap the child after its stream ended. The engine is expected to stop
    /// on its own at the solve timeout; the grace deadline is the backstop.
    fn reap(&mut self) -> Result<(), SolverError> {
        match self.child.wait_timeout(self.grace)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(SolverError::Engine(format!(
                "solver exited with {status}: {}",
                read_stderr(&mut self.child)
            ))),
            None => {
                self.abandon();
                Err(SolverError::Deadline)
            }
        }
    }
}

impl Iterator for Solutions {
    type Item = Result<SolveEvent, SolverError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.lines.next() {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message = match serde_json::from_str::<DriverMessage>(&line) {
                        Ok(message) => message,
                        Err(err) => {
                            self.finished = true;
                            self.abandon();
                            return Some(Err(err.into()));
                        }
                    };
                    match self.assembler.push(message) {
                        Ok(Some(event)) => return Some(Ok(event)),
                        Ok(None) => continue,
                        Err(err) => {
                            self.finished = true;
                            self.abandon();
                            return Some(Err(err));
                        }
                    }
                }
                Some(Err(err)) => {
                    self.finished = true;
                    self.abandon();
                    return Some(Err(err.into()));
                }
                None => {
                    self.finished = true;
                    return match self.reap() {
                        Ok(()) => None,
                        Err(err) => Some(Err(err)),
                    };
                }
            }
        }
    }
}

impl Drop for Solutions {
    fn drop(&mut self) {
        if !self.finished {
            self.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpbench_core::config::{Configuration, SolverRef};

    fn push(assembler: &mut EventAssembler, line: &str) -> Result<Option<SolveEvent>, SolverError> {
        assembler.push(serde_json::from_str(line).unwrap())
    }

    #[test]
    fn statistics_ride_along_on_the_next_event() {
        let mut assembler = EventAssembler::default();
        assert!(push(&mut assembler, r#"{"type":"statistics","statistics":{"nodes":120}}"#)
            .unwrap()
            .is_none());

        let event = push(
            &mut assembler,
            r#"{"type":"solution","output":{"json":{"x":3,"_objective":7,"_checker":""}},"time":1500}"#,
        )
        .unwrap()
        .expect("solution yields an event");

        assert_eq!(event.status, SolveStatus::Satisfied);
        assert_eq!(event.time, Some(1.5));
        assert_eq!(
            event.statistics.get("nodes"),
            Some(&serde_yaml::Value::from(120))
        );
        let solution = event.solution.unwrap();
        assert_eq!(solution.get("objective"), Some(&serde_yaml::Value::from(7)));
        assert_eq!(solution.get("x"), Some(&serde_yaml::Value::from(3)));
        assert!(!solution.contains_key("_checker"));
    }

    #[test]
    fn status_messages_fold_into_the_vocabulary() {
        let mut assembler = EventAssembler::default();
        let event = push(&mut assembler, r#"{"type":"status","status":"ALL_SOLUTIONS"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event.status, SolveStatus::Satisfied);
        assert!(event.solution.is_none());
    }

    #[test]
    fn error_messages_become_engine_errors() {
        let mut assembler = EventAssembler::default();
        let err = push(&mut assembler, r#"{"type":"error","message":"flattening failed"}"#)
            .unwrap_err();
        assert!(matches!(err, SolverError::Engine(message) if message == "flattening failed"));
    }

    #[test]
    fn unknown_message_types_are_skipped() {
        let mut assembler = EventAssembler::default();
        assert!(push(&mut assembler, r#"{"type":"comment","comment":"%"}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn free_form_flags_pass_through_verbatim() {
        let mut configuration = Configuration::new("flags", SolverRef::lookup("gecode"));
        configuration.processes = Some(4);
        configuration.free_search = true;
        configuration
            .other_flags
            .insert("restart".to_string(), DataValue::Str("luby".to_string()));
        configuration
            .other_flags
            .insert("verbose-solving".to_string(), DataValue::Bool(true));

        let args = search_args(&configuration, Duration::from_secs(60));
        assert!(args.contains(&"--free-search".to_string()));
        assert!(args.contains(&"--verbose-solving".to_string()));
        let restart = args.iter().position(|a| a == "--restart").unwrap();
        assert_eq!(args[restart + 1], "luby");
        let limit = args.iter().position(|a| a == "--time-limit").unwrap();
        assert_eq!(args[limit + 1], "60000");
    }

    #[test]
    fn inline_solver_definitions_are_staged_to_a_file() {
        use cpbench_core::config::SolverDef;
        use std::collections::BTreeMap;

        let solver = SolverRef::Definition(SolverDef {
            id: "org.example.mysolver".to_string(),
            version: "0.0.1".to_string(),
            executable: Some("/opt/mysolver/bin/fzn".to_string()),
            mzn_lib: None,
            extra: BTreeMap::new(),
        });
        let (arg, guard) = solver_arg(&solver).unwrap();
        assert!(arg.ends_with(".msc"));
        let staged = std::fs::read_to_string(&arg).unwrap();
        assert!(staged.contains("org.example.mysolver"));
        drop(guard);
        assert!(!std::path::Path::new(&arg).exists());
    }
}
