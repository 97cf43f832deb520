//! Instance discovery over a benchmarks tree.
//!
//! The expected layout follows the MiniZinc benchmarks convention: each
//! problem lives in its own folder holding one or more `*.mzn` models, and
//! every model pairs with every `*.dzn`/`*.json` data file found under that
//! folder. A model without data files is an instance on its own.

use cpbench_core::manifest::InstanceRecord;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("invalid file pattern")]
    Pattern(#[from] globset::Error),
}

pub fn collect_instances(benchmarks: &Path) -> Result<Vec<InstanceRecord>, InstanceError> {
    let models = find_files(benchmarks, &glob_set(&["*.mzn"])?);
    let data_glob = glob_set(&["*.dzn", "*.json"])?;

    let mut instances = Vec::new();
    for model in models {
        let problem_dir = model.parent().unwrap_or(benchmarks);
        let problem = problem_dir
            .file_name()
            .unwrap_or(benchmarks.as_os_str())
            .to_string_lossy()
            .into_owned();

        let data_files = find_files(problem_dir, &data_glob);
        if data_files.is_empty() {
            instances.push(InstanceRecord {
                problem,
                model,
                data_file: String::new(),
            });
        } else {
            for data in data_files {
                instances.push(InstanceRecord {
                    problem: problem.clone(),
                    model: model.clone(),
                    data_file: data.to_string_lossy().into_owned(),
                });
            }
        }
    }
    Ok(instances)
}

fn glob_set(patterns: &[&str]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

/// All matching files under `root`, sorted so the manifest comes out in a
/// stable order regardless of directory iteration order.
fn find_files(root: &Path, glob: &GlobSet) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkBuilder::new(root)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("failed to walk benchmarks directory: {err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
        .map(|entry| entry.into_path())
        .filter(|path| glob.is_match(path))
        .collect();
    files.sort();
    files
}
