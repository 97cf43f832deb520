//! Deterministic mapping from a flat array-task index to one unit of work.
//!
//! Every array task recomputes its own `(instance, configuration)` pair from
//! nothing but its integer index and the shared inputs, so no task state is
//! ever persisted or exchanged.

use crate::config::Configuration;
use crate::manifest::InstanceRecord;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IndexError {
    #[error(
        "task index {index} out of range for {instances} instances and {configs} configurations"
    )]
    OutOfRange {
        index: usize,
        instances: usize,
        configs: usize,
    },
    #[error("a batch needs at least one configuration")]
    NoConfigurations,
    #[error("a batch needs at least one instance")]
    NoInstances,
}

/// Resolve a 0-based task index into a 1-based manifest row and a 0-based
/// configuration index. Configurations vary fastest, instances slowest.
pub fn resolve(
    task_index: usize,
    num_instances: usize,
    num_configs: usize,
) -> Result<(usize, usize), IndexError> {
    if num_configs == 0 {
        return Err(IndexError::NoConfigurations);
    }
    if num_instances == 0 {
        return Err(IndexError::NoInstances);
    }
    if task_index >= num_instances * num_configs {
        return Err(IndexError::OutOfRange {
            index: task_index,
            instances: num_instances,
            configs: num_configs,
        });
    }

    Ok((task_index / num_configs + 1, task_index % num_configs))
}

/// The resolved unit of work for one array task.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTask {
    /// 1-based manifest row, used for display and output file names.
    pub row: usize,
    pub instance: InstanceRecord,
    pub configuration: Configuration,
}

impl JobTask {
    pub fn resolve(
        task_index: usize,
        instances: &[InstanceRecord],
        configurations: &[Configuration],
    ) -> Result<Self, IndexError> {
        let (row, config_index) = resolve(task_index, instances.len(), configurations.len())?;
        Ok(Self {
            row,
            instance: instances[row - 1].clone(),
            configuration: configurations[config_index].clone(),
        })
    }

    /// Stem shared by all of this task's output files. Unique per
    /// `(row, configuration)` pair, which is what makes lock-free output
    /// partitioning across sibling tasks possible.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.row, self.configuration.name)
    }
}
