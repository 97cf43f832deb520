//! Collection of per-task result documents into unified tables.
//!
//! Statistics are schema-less: beyond the fixed baseline keys every task may
//! report its own set of solver statistics, so the table schema is the union
//! of all keys seen. Baseline columns come first in a fixed order, the extra
//! columns after them sorted by name (the sorting is an implementation
//! detail for run-to-run stability, not a promised order), and a trailing
//! `run` column names the originating result directory. A record lacking a
//! key renders as an empty cell. Malformed documents are an error, never a
//! silent skip.

use cpbench_core::record::{Record, STANDARD_KEYS};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use itertools::Itertools;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("invalid document pattern")]
    Pattern(#[from] globset::Error),
    #[error("failed to resolve result directory {path}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed result document {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write table")]
    Table(#[from] csv::Error),
    #[error("failed to flush table")]
    Flush(#[source] std::io::Error),
}

/// Read every statistics document under the given directories, one record
/// per task that got as far as writing its final statistics. Tasks that
/// failed or are still pending have no document and therefore no row.
pub fn collect_statistics(dirs: &[PathBuf]) -> Result<Vec<Record>, CollectError> {
    let mut records = Vec::new();
    for dir in dirs {
        let (run, files) = find_documents(dir, "*_stats.yml")?;
        for file in files {
            let text = read(&file)?;
            let mut record: Record =
                serde_yaml::from_str(&text).map_err(|source| CollectError::Parse {
                    path: file.clone(),
                    source,
                })?;
            record.insert("run".to_string(), run.clone().into());
            records.push(record);
        }
    }
    sort_rows(&mut records);
    Ok(records)
}

/// Read every solution document under the given directories and emit one
/// record per incremental result that carries a solution payload. Status is
/// dropped: a row's presence already means the solver found something.
pub fn collect_objectives(dirs: &[PathBuf]) -> Result<Vec<Record>, CollectError> {
    let mut records = Vec::new();
    for dir in dirs {
        let (run, files) = find_documents(dir, "*_sol.yml")?;
        for file in files {
            let text = read(&file)?;
            let solutions: Vec<Record> =
                serde_yaml::from_str(&text).map_err(|source| CollectError::Parse {
                    path: file.clone(),
                    source,
                })?;
            for solution in solutions {
                let Some(payload) = solution.get("solution") else {
                    continue;
                };
                let mut record = Record::new();
                for key in OBJECTIVE_BASE_KEYS {
                    if let Some(value) = solution.get(key) {
                        record.insert(key.to_string(), value.clone());
                    }
                }
                if let Some(objective) = payload.get("objective") {
                    record.insert("objective".to_string(), objective.clone());
                }
                record.insert("run".to_string(), run.clone().into());
                records.push(record);
            }
        }
    }
    sort_rows(&mut records);
    Ok(records)
}

/// Write the statistics table: baseline columns, then the union of extra
/// keys, then `run`.
pub fn write_statistics_csv<W: std::io::Write>(
    records: &[Record],
    out: W,
) -> Result<(), CollectError> {
    let extras: BTreeSet<&str> = records
        .iter()
        .flat_map(|record| record.keys())
        .map(String::as_str)
        .filter(|key| *key != "run" && !STANDARD_KEYS.contains(key))
        .collect();
    let columns: Vec<&str> = STANDARD_KEYS
        .iter()
        .copied()
        .chain(extras)
        .chain(["run"])
        .collect();
    write_table(records, &columns, out)
}

const OBJECTIVE_BASE_KEYS: [&str; 5] = ["configuration", "problem", "model", "data_file", "time"];

/// Write the objectives table. The column set is fixed: solution-scoped rows
/// carry no solver statistics.
pub fn write_objectives_csv<W: std::io::Write>(
    records: &[Record],
    out: W,
) -> Result<(), CollectError> {
    let columns: Vec<&str> = OBJECTIVE_BASE_KEYS
        .iter()
        .copied()
        .chain(["objective", "run"])
        .collect();
    write_table(records, &columns, out)
}

fn read(path: &Path) -> Result<String, CollectError> {
    std::fs::read_to_string(path).map_err(|source| CollectError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn write_table<W: std::io::Write>(
    records: &[Record],
    columns: &[&str],
    out: W,
) -> Result<(), CollectError> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(columns)?;
    for record in records {
        writer.write_record(columns.iter().map(|column| cell(record.get(*column))))?;
    }
    writer.flush().map_err(CollectError::Flush)
}

/// Render one table cell; a missing value is an empty cell, never an error.
fn cell(value: Option<&serde_yaml::Value>) -> String {
    match value {
        None | Some(serde_yaml::Value::Null) => String::new(),
        Some(serde_yaml::Value::Bool(flag)) => flag.to_string(),
        Some(serde_yaml::Value::Number(number)) => number.to_string(),
        Some(serde_yaml::Value::String(text)) => text.clone(),
        Some(other) => serde_yaml::to_string(other)
            .map(|text| text.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Locate all documents matching `pattern` under `dir`, sorted, along with
/// the run label (the directory's resolved name).
fn find_documents(dir: &Path, pattern: &str) -> Result<(String, Vec<PathBuf>), CollectError> {
    let resolved = dir
        .canonicalize()
        .map_err(|source| CollectError::Resolve {
            path: dir.to_path_buf(),
            source,
        })?;
    let run = resolved
        .file_name()
        .unwrap_or(resolved.as_os_str())
        .to_string_lossy()
        .into_owned();

    let glob: GlobSet = GlobSetBuilder::new()
        .add(Glob::new(pattern)?)
        .build()?;
    let files = WalkBuilder::new(&resolved)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("failed to walk result directory: {err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
        .map(|entry| entry.into_path())
        .filter(|path| glob.is_match(path))
        .sorted()
        .collect();
    debug!(run = %run, pattern, "collected result documents");
    Ok((run, files))
}

/// Stable sort on the baseline identity so repeated collection of the same
/// directories yields byte-identical tables.
fn sort_rows(records: &mut [Record]) {
    records.sort_by(|a, b| {
        let key = |record: &Record| {
            ["configuration", "problem", "model", "data_file", "run"]
                .map(|column| cell(record.get(column)))
        };
        key(a).cmp(&key(b))
    });
}
