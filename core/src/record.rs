//! Schema-less solution and statistics records.
//!
//! The superset of statistic keys across tasks is open-ended: each record is
//! a plain string-keyed map, and the collection step unions keys instead of
//! assuming a fixed schema. Only the baseline keys below are guaranteed.

use crate::index::JobTask;
use crate::status::SolveStatus;
use std::collections::BTreeMap;

/// Baseline keys present in every record, in their fixed table order.
pub const STANDARD_KEYS: [&str; 6] = [
    "configuration",
    "problem",
    "model",
    "data_file",
    "status",
    "time",
];

pub const SOL_SUFFIX: &str = "_sol.yml";
pub const STATS_SUFFIX: &str = "_stats.yml";
pub const ERR_SUFFIX: &str = "_err.txt";

pub type Record = BTreeMap<String, serde_yaml::Value>;

/// Seed record carrying the task identity and an `UNKNOWN` status; both the
/// incremental solution records and the final statistics record start here.
pub fn base_record(task: &JobTask) -> Record {
    let mut record = Record::new();
    record.insert(
        "configuration".to_string(),
        task.configuration.name.clone().into(),
    );
    record.insert("problem".to_string(), task.instance.problem.clone().into());
    record.insert(
        "model".to_string(),
        task.instance.model.to_string_lossy().into_owned().into(),
    );
    record.insert(
        "data_file".to_string(),
        task.instance.data_file.clone().into(),
    );
    record.insert(
        "status".to_string(),
        SolveStatus::Unknown.to_string().into(),
    );
    record
}

pub fn sol_file_name(stem: &str) -> String {
    format!("{stem}{SOL_SUFFIX}")
}

pub fn stats_file_name(stem: &str) -> String {
    format!("{stem}{STATS_SUFFIX}")
}

pub fn err_file_name(stem: &str) -> String {
    format!("{stem}{ERR_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, SolverRef};
    use crate::manifest::InstanceRecord;
    use std::path::PathBuf;

    #[test]
    fn base_record_carries_identity_and_unknown_status() {
        let task = JobTask {
            row: 7,
            instance: InstanceRecord {
                problem: "queens".to_string(),
                model: PathBuf::from("queens/queens.mzn"),
                data_file: "queens/n8.dzn".to_string(),
            },
            configuration: Configuration::new("base", SolverRef::lookup("gecode")),
        };

        let record = base_record(&task);
        assert_eq!(record["configuration"], serde_yaml::Value::from("base"));
        assert_eq!(record["status"], serde_yaml::Value::from("UNKNOWN"));
        assert_eq!(record["model"], serde_yaml::Value::from("queens/queens.mzn"));

        assert_eq!(sol_file_name(&task.file_stem()), "7_base_sol.yml");
        assert_eq!(stats_file_name(&task.file_stem()), "7_base_stats.yml");
        assert_eq!(err_file_name(&task.file_stem()), "7_base_err.txt");
    }
}
