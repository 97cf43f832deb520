//! The instance manifest: a CSV table with a header row and one row per
//! solvable instance. Read once per process, immutable thereafter.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read instance manifest {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// One row of the instance manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Problem group label.
    pub problem: String,
    /// Path to the model file, possibly relative to the manifest.
    pub model: PathBuf,
    /// Zero or more data file paths, `:`-joined; empty means no external data.
    #[serde(default)]
    pub data_file: String,
}

impl InstanceRecord {
    pub fn data_files(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.data_file
            .split(':')
            .filter(|part| !part.is_empty())
            .map(PathBuf::from)
    }

    /// Join a manifest-relative path onto the manifest's directory.
    pub fn resolve(path: &Path, manifest_dir: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            manifest_dir.join(path)
        }
    }
}

/// Read all rows of a manifest (the header row is not an instance).
pub fn read_manifest(path: &Path) -> Result<Vec<InstanceRecord>, ManifestError> {
    let read_err = |source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::Reader::from_path(path).map_err(read_err)?;
    reader
        .deserialize()
        .map(|row| row.map_err(read_err))
        .collect()
}
