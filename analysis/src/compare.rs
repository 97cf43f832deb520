//! Differencing of two configurations over an aggregated statistics table.
//!
//! Rows are partitioned by configuration name and keyed on
//! `(model, data_file)`; every instance of the baseline configuration is
//! classified against its counterpart: missing, status change (positive,
//! conflicting or neutral per the fixed tables below), timing change,
//! objective conflict between two disagreeing optimality proofs, or
//! objective change tagged with the optimization direction.

use cpbench_core::status::{Method, SolveStatus, StatusError};
use once_cell::sync::Lazy;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Objective difference below which two optimality proofs agree.
const SAME_DELTA: f64 = 1e-6;
/// Denominator floor when the baseline value is exactly zero.
const ZERO_FLOOR: f64 = 0.1;

/// Status transitions considered an improvement.
static POSITIVE_STATUS_CHANGES: Lazy<BTreeSet<(SolveStatus, SolveStatus)>> = Lazy::new(|| {
    use SolveStatus::*;
    BTreeSet::from([
        (Error, Satisfied),
        (Error, Unsatisfiable),
        (Error, OptimalSolution),
        (Error, Unknown),
        (Unknown, Satisfied),
        (Unknown, Unsatisfiable),
        (Unknown, OptimalSolution),
        (Satisfied, OptimalSolution),
    ])
});

/// Status transitions that contradict each other; at least one side proved
/// something false.
static CONFLICT_STATUS_CHANGES: Lazy<BTreeSet<(SolveStatus, SolveStatus)>> = Lazy::new(|| {
    use SolveStatus::*;
    BTreeSet::from([
        (Unsatisfiable, Satisfied),
        (Satisfied, Unsatisfiable),
        (Unsatisfiable, OptimalSolution),
        (OptimalSolution, Unsatisfiable),
    ])
});

#[derive(Error, Debug)]
pub enum CompareError {
    #[error("failed to read statistics table {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("statistics table is missing the `{0}` column")]
    MissingColumn(&'static str),
    #[error("row {row}: {source}")]
    BadStatus {
        row: usize,
        #[source]
        source: StatusError,
    },
    #[error("row {row}: `{value}` is not a number in column `{column}`")]
    BadNumber {
        row: usize,
        column: &'static str,
        value: String,
    },
}

/// `(model, data_file)`, the instance identity shared by both configurations.
pub type InstanceKey = (String, String);

#[derive(Debug, Clone, PartialEq)]
pub struct TimeChange {
    pub model: String,
    pub data_file: String,
    pub before: f64,
    pub after: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveChange {
    pub model: String,
    pub data_file: String,
    pub before: f64,
    pub after: f64,
    pub maximise: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveConflict {
    pub model: String,
    pub data_file: String,
    pub before: f64,
    pub after: f64,
}

/// All classified deltas of one comparison. Built fresh per comparison and
/// rendered either as a grouped narrative (`Display`) or as a structured
/// JSON object (`serialise`).
#[derive(Debug, Default)]
pub struct PerformanceChanges {
    pub time_delta: f64,
    pub obj_delta: f64,
    pub status_changes: BTreeMap<(SolveStatus, SolveStatus), Vec<InstanceKey>>,
    pub time_changes: Vec<TimeChange>,
    pub obj_changes: Vec<ObjectiveChange>,
    pub obj_conflicts: Vec<ObjectiveConflict>,
    pub missing_instances: Vec<InstanceKey>,
}

/// Relative change with the baseline floored away from zero, preserving the
/// sign and rough magnitude instead of dividing by zero.
fn relative_change(before: f64, after: f64) -> f64 {
    let divisor = if before == 0.0 { ZERO_FLOOR } else { before };
    (after - before) / divisor
}

impl PerformanceChanges {
    fn new(time_delta: f64, obj_delta: f64) -> Self {
        Self {
            time_delta,
            obj_delta,
            ..Self::default()
        }
    }

    /// Signed improvement magnitude of an objective change, positive when
    /// the change moves the objective in the optimization direction.
    fn objective_gain(change: &ObjectiveChange) -> f64 {
        let direction = if change.maximise { 1.0 } else { -1.0 };
        direction * relative_change(change.before, change.after)
    }

    pub fn serialise(&self) -> serde_json::Value {
        json!({
            "status_changes": self
                .status_changes
                .iter()
                .flat_map(|((before, after), instances)| {
                    instances.iter().map(move |(model, data)| {
                        json!({
                            "model": model,
                            "data": data,
                            "status_before": before,
                            "status_after": after,
                        })
                    })
                })
                .collect::<Vec<_>>(),
            "time_delta": self.time_delta,
            "time_changes": self
                .time_changes
                .iter()
                .map(|change| {
                    json!({
                        "model": change.model,
                        "data": change.data_file,
                        "time_before": change.before,
                        "time_after": change.after,
                    })
                })
                .collect::<Vec<_>>(),
            "obj_delta": self.obj_delta,
            "obj_changes": self
                .obj_changes
                .iter()
                .map(|change| {
                    json!({
                        "model": change.model,
                        "data": change.data_file,
                        "obj_before": change.before,
                        "obj_after": change.after,
                        "maximise": change.maximise,
                    })
                })
                .collect::<Vec<_>>(),
            "obj_conflicts": self
                .obj_conflicts
                .iter()
                .map(|conflict| {
                    json!({
                        "model": conflict.model,
                        "data": conflict.data_file,
                        "obj_before": conflict.before,
                        "obj_after": conflict.after,
                    })
                })
                .collect::<Vec<_>>(),
            "missing_instances": self
                .missing_instances
                .iter()
                .map(|(model, data)| json!({ "model": model, "data": data }))
                .collect::<Vec<_>>(),
        })
    }
}

impl fmt::Display for PerformanceChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut conflicting = String::new();
        let mut positive = String::new();
        let mut neutral = String::new();
        let mut n_conflicting = 0;
        let mut n_positive = 0;
        let n_status_changes: usize = self.status_changes.values().map(Vec::len).sum();

        for (change, instances) in &self.status_changes {
            let mut section = format!("{} -> {}:\n", change.0, change.1);
            for (model, data) in instances {
                section.push_str(&format!("  - {model} {data}\n"));
            }
            if CONFLICT_STATUS_CHANGES.contains(change) {
                n_conflicting += instances.len();
                conflicting.push_str(&section);
            } else if POSITIVE_STATUS_CHANGES.contains(change) {
                n_positive += instances.len();
                positive.push_str(&section);
            } else {
                neutral.push_str(&section);
            }
        }

        writeln!(f, "Summary:")?;
        writeln!(f, "========")?;
        if !self.missing_instances.is_empty() {
            writeln!(f, "- Missing instances: {}", self.missing_instances.len())?;
        }
        if !self.obj_conflicts.is_empty() {
            writeln!(f, "- Objective conflicts: {}", self.obj_conflicts.len())?;
        }
        let conflict_note = if n_conflicting > 0 {
            format!("conflicts: {n_conflicting}, ")
        } else {
            String::new()
        };
        writeln!(
            f,
            "- Status Changes: {n_status_changes} ({conflict_note}positive: {n_positive})"
        )?;
        writeln!(
            f,
            "- Runtime Changes: {} (positive: {})",
            self.time_changes.len(),
            self.time_changes
                .iter()
                .filter(|change| relative_change(change.before, change.after) < 0.0)
                .count()
        )?;
        writeln!(
            f,
            "- Objective Changes: {} (positive: {})",
            self.obj_changes.len(),
            self.obj_changes
                .iter()
                .filter(|change| Self::objective_gain(change) > 0.0)
                .count()
        )?;

        if !self.missing_instances.is_empty() {
            writeln!(f, "\nMissing Instances:")?;
            writeln!(f, "==================")?;
            for (model, data) in &self.missing_instances {
                writeln!(f, "- {model} {data}")?;
            }
        }

        if !self.obj_conflicts.is_empty() {
            writeln!(f, "\nObjective Conflicts (\u{b1}{SAME_DELTA}):")?;
            writeln!(f, "=============================")?;
            for conflict in &self.obj_conflicts {
                writeln!(
                    f,
                    "- ({} != {}) {} {}",
                    conflict.before, conflict.after, conflict.model, conflict.data_file
                )?;
            }
        }

        if n_status_changes > 0 {
            writeln!(f, "\nStatus Changes:")?;
            writeln!(f, "===============")?;
            if !conflicting.is_empty() {
                writeln!(f, "Conflicting Status Changes:")?;
                writeln!(f, "---------------------------")?;
                f.write_str(&conflicting)?;
            }
            if !neutral.is_empty() {
                writeln!(f, "Negative Status Changes:")?;
                writeln!(f, "------------------------")?;
                f.write_str(&neutral)?;
            }
            if !positive.is_empty() {
                writeln!(f, "Positive Status Changes:")?;
                writeln!(f, "------------------------")?;
                f.write_str(&positive)?;
            }
        }

        // itemized listings go worst-first, with a divider before the first
        // improvement
        if !self.time_changes.is_empty() {
            writeln!(f, "\nTiming Changes (>\u{b1}{:.1}%):", self.time_delta * 100.0)?;
            writeln!(f, "=========================")?;
            let mut changes: Vec<&TimeChange> = self.time_changes.iter().collect();
            changes.sort_by(|a, b| {
                relative_change(b.before, b.after).total_cmp(&relative_change(a.before, a.after))
            });
            let mut divided = relative_change(changes[0].before, changes[0].after) < 0.0;
            for change in changes {
                let relative = relative_change(change.before, change.after);
                if !divided && relative < 0.0 {
                    writeln!(f, "-------------------------")?;
                    divided = true;
                }
                writeln!(
                    f,
                    "- ({:.1}%: {:.1}s -> {:.1}s) {} {}",
                    relative * 100.0,
                    change.before,
                    change.after,
                    change.model,
                    change.data_file
                )?;
            }
        }

        if !self.obj_changes.is_empty() {
            writeln!(
                f,
                "\nObjective Changes (>\u{b1}{:.1}%):",
                self.obj_delta * 100.0
            )?;
            writeln!(f, "============================")?;
            let mut changes: Vec<&ObjectiveChange> = self.obj_changes.iter().collect();
            changes.sort_by(|a, b| Self::objective_gain(a).total_cmp(&Self::objective_gain(b)));
            let mut divided = Self::objective_gain(changes[0]) > 0.0;
            for change in changes {
                if !divided && Self::objective_gain(change) > 0.0 {
                    writeln!(f, "----------------------------")?;
                    divided = true;
                }
                writeln!(
                    f,
                    "- ({:.1}%: {} {:.2} -> {:.2}) {} {}",
                    relative_change(change.before, change.after) * 100.0,
                    if change.maximise { "MAX" } else { "MIN" },
                    change.before,
                    change.after,
                    change.model,
                    change.data_file
                )?;
            }
        }

        Ok(())
    }
}

/// One configuration's result on one instance, as read from the table.
#[derive(Debug, Clone)]
struct ConfiguredResult {
    status: SolveStatus,
    time: f64,
    objective: f64,
    method: Option<Method>,
}

struct Columns {
    configuration: usize,
    model: usize,
    data_file: usize,
    status: usize,
    time: usize,
    objective: Option<usize>,
    method: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, CompareError> {
        let find = |name: &'static str| {
            headers
                .iter()
                .position(|header| header == name)
                .ok_or(CompareError::MissingColumn(name))
        };
        let optional = |name: &str| headers.iter().position(|header| header == name);
        Ok(Self {
            configuration: find("configuration")?,
            model: find("model")?,
            data_file: find("data_file")?,
            status: find("status")?,
            time: find("time")?,
            objective: optional("objective"),
            method: optional("method"),
        })
    }
}

fn parse_number(
    record: &csv::StringRecord,
    index: Option<usize>,
    row: usize,
    column: &'static str,
) -> Result<f64, CompareError> {
    match index.and_then(|index| record.get(index)) {
        None | Some("") => Ok(f64::NAN),
        Some(value) => value.parse().map_err(|_| CompareError::BadNumber {
            row,
            column,
            value: value.to_string(),
        }),
    }
}

/// Compare two named configurations over an aggregated statistics table.
pub fn compare_configurations(
    statistics: &Path,
    from_conf: &str,
    to_conf: &str,
    time_delta: f64,
    obj_delta: f64,
) -> Result<PerformanceChanges, CompareError> {
    let read_err = |source| CompareError::Read {
        path: statistics.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(statistics).map_err(read_err)?;
    let columns = Columns::from_headers(reader.headers().map_err(read_err)?)?;

    let mut from_results: BTreeMap<InstanceKey, ConfiguredResult> = BTreeMap::new();
    let mut to_results: BTreeMap<InstanceKey, ConfiguredResult> = BTreeMap::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(read_err)?;
        let field = |index: usize| record.get(index).unwrap_or("");

        let configuration = field(columns.configuration);
        let side = if configuration == from_conf {
            &mut from_results
        } else if configuration == to_conf {
            &mut to_results
        } else {
            continue;
        };

        let status: SolveStatus = field(columns.status)
            .parse()
            .map_err(|source| CompareError::BadStatus { row, source })?;
        let method = match columns.method.and_then(|index| record.get(index)) {
            None | Some("") => None,
            Some(value) => Some(
                value
                    .parse()
                    .map_err(|source| CompareError::BadStatus { row, source })?,
            ),
        };
        let key = (field(columns.model).to_string(), field(columns.data_file).to_string());
        side.insert(
            key,
            ConfiguredResult {
                status,
                time: parse_number(&record, Some(columns.time), row, "time")?,
                objective: parse_number(&record, columns.objective, row, "objective")?,
                method,
            },
        );
    }

    let mut changes = PerformanceChanges::new(time_delta, obj_delta);
    for (key, from) in from_results {
        let Some(to) = to_results.get(&key) else {
            changes.missing_instances.push(key);
            continue;
        };
        let (model, data_file) = key;

        if from.status != to.status {
            changes
                .status_changes
                .entry((from.status, to.status))
                .or_default()
                .push((model, data_file));
        } else if from.status == SolveStatus::OptimalSolution
            || (from.status == SolveStatus::Satisfied && from.method == Some(Method::Satisfy))
        {
            // two optimality proofs must agree on the objective before their
            // runtimes are worth comparing
            if from.status == SolveStatus::OptimalSolution
                && (from.objective - to.objective).abs() > SAME_DELTA
            {
                changes.obj_conflicts.push(ObjectiveConflict {
                    model,
                    data_file,
                    before: from.objective,
                    after: to.objective,
                });
            } else if relative_change(from.time, to.time).abs() > time_delta {
                changes.time_changes.push(TimeChange {
                    model,
                    data_file,
                    before: from.time,
                    after: to.time,
                });
            }
        } else if from.status == SolveStatus::Satisfied
            && matches!(from.method, Some(Method::Minimize | Method::Maximize))
            && relative_change(from.objective, to.objective).abs() > obj_delta
        {
            changes.obj_changes.push(ObjectiveChange {
                model,
                data_file,
                before: from.objective,
                after: to.objective,
                maximise: from.method == Some(Method::Maximize),
            });
        }
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "configuration,problem,model,data_file,status,time,objective,method,run";

    fn table(rows: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "{HEADER}").unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn classifies_the_full_scenario() {
        let table = table(&[
            // X: contradictory proofs
            "base,p,x.mzn,x.dzn,UNSATISFIABLE,2.0,,satisfy,r",
            "new,p,x.mzn,x.dzn,SATISFIED,2.0,,satisfy,r",
            // Y: same optimum, 60% slower
            "base,p,y.mzn,y.dzn,OPTIMAL_SOLUTION,5.0,10.0,minimize,r",
            "new,p,y.mzn,y.dzn,OPTIMAL_SOLUTION,8.0,10.0,minimize,r",
            // Z: no counterpart in `new`
            "base,p,z.mzn,z.dzn,SATISFIED,1.0,3.0,minimize,r",
        ]);

        let changes =
            compare_configurations(table.path(), "base", "new", 0.1, 0.1).unwrap();

        let key = (SolveStatus::Unsatisfiable, SolveStatus::Satisfied);
        assert_eq!(
            changes.status_changes[&key],
            vec![("x.mzn".to_string(), "x.dzn".to_string())]
        );
        assert!(CONFLICT_STATUS_CHANGES.contains(&key));

        assert_eq!(changes.time_changes.len(), 1);
        let timing = &changes.time_changes[0];
        assert_eq!((timing.before, timing.after), (5.0, 8.0));
        assert!((relative_change(timing.before, timing.after) - 0.6).abs() < 1e-9);

        assert_eq!(
            changes.missing_instances,
            vec![("z.mzn".to_string(), "z.dzn".to_string())]
        );
    }

    #[test]
    fn disagreeing_optimality_proofs_conflict_instead_of_timing() {
        let table = table(&[
            "base,p,m.mzn,d.dzn,OPTIMAL_SOLUTION,5.0,10.0,minimize,r",
            "new,p,m.mzn,d.dzn,OPTIMAL_SOLUTION,9.0,12.0,minimize,r",
        ]);

        let changes =
            compare_configurations(table.path(), "base", "new", 0.1, 0.1).unwrap();
        assert!(changes.time_changes.is_empty());
        assert_eq!(changes.obj_conflicts.len(), 1);
        assert_eq!(changes.obj_conflicts[0].after, 12.0);
    }

    #[test]
    fn satisfied_optimization_runs_compare_objectives_with_direction() {
        let table = table(&[
            "base,p,a.mzn,,SATISFIED,5.0,100.0,maximize,r",
            "new,p,a.mzn,,SATISFIED,5.0,150.0,maximize,r",
            "base,p,b.mzn,,SATISFIED,5.0,100.0,minimize,r",
            "new,p,b.mzn,,SATISFIED,5.0,101.0,minimize,r",
        ]);

        let changes =
            compare_configurations(table.path(), "base", "new", 0.1, 0.1).unwrap();
        // b's 1% move stays under the threshold
        assert_eq!(changes.obj_changes.len(), 1);
        let change = &changes.obj_changes[0];
        assert!(change.maximise);
        assert!(PerformanceChanges::objective_gain(change) > 0.0);
    }

    #[test]
    fn zero_baseline_times_use_the_denominator_floor() {
        assert_eq!(relative_change(0.0, 0.05), 0.5);
        assert_eq!(relative_change(2.0, 1.0), -0.5);

        let table = table(&[
            "base,p,m.mzn,,OPTIMAL_SOLUTION,0.0,10.0,minimize,r",
            "new,p,m.mzn,,OPTIMAL_SOLUTION,0.05,10.0,minimize,r",
        ]);
        let changes =
            compare_configurations(table.path(), "base", "new", 0.1, 0.1).unwrap();
        assert_eq!(changes.time_changes.len(), 1);
    }

    #[test]
    fn missing_required_columns_fail_loudly() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "configuration,problem,model,data_file,time").unwrap();
        writeln!(file, "base,p,m.mzn,,1.0").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            compare_configurations(file.path(), "base", "new", 0.1, 0.1),
            Err(CompareError::MissingColumn("status"))
        ));
    }

    #[test]
    fn narrative_report_groups_and_sorts() {
        let table = table(&[
            "base,p,x.mzn,x.dzn,UNSATISFIABLE,2.0,,satisfy,r",
            "new,p,x.mzn,x.dzn,SATISFIED,2.0,,satisfy,r",
            "base,p,y.mzn,,OPTIMAL_SOLUTION,5.0,10.0,minimize,r",
            "new,p,y.mzn,,OPTIMAL_SOLUTION,8.0,10.0,minimize,r",
            "base,p,w.mzn,,OPTIMAL_SOLUTION,10.0,7.0,minimize,r",
            "new,p,w.mzn,,OPTIMAL_SOLUTION,5.0,7.0,minimize,r",
        ]);

        let changes =
            compare_configurations(table.path(), "base", "new", 0.1, 0.1).unwrap();
        let report = changes.to_string();

        assert!(report.contains("- Status Changes: 1 (conflicts: 1, positive: 0)"));
        assert!(report.contains("- Runtime Changes: 2 (positive: 1)"));
        assert!(report.contains("UNSATISFIABLE -> SATISFIED:"));
        // worst first, divider, then the improvement
        let worse = report.find("(60.0%: 5.0s -> 8.0s)").unwrap();
        let divider = report.find("\n-------------------------\n").unwrap();
        let better = report.find("(-50.0%: 10.0s -> 5.0s)").unwrap();
        assert!(worse < divider && divider < better);
    }

    #[test]
    fn serialised_form_carries_every_classification() {
        let table = table(&[
            "base,p,x.mzn,x.dzn,UNSATISFIABLE,2.0,,satisfy,r",
            "new,p,x.mzn,x.dzn,SATISFIED,2.0,,satisfy,r",
            "base,p,z.mzn,z.dzn,SATISFIED,1.0,3.0,minimize,r",
        ]);

        let changes =
            compare_configurations(table.path(), "base", "new", 0.1, 0.1).unwrap();
        let value = changes.serialise();

        assert_eq!(value["time_delta"], serde_json::json!(0.1));
        assert_eq!(
            value["status_changes"][0]["status_before"],
            serde_json::json!("UNSATISFIABLE")
        );
        assert_eq!(
            value["missing_instances"][0]["model"],
            serde_json::json!("z.mzn")
        );
        assert_eq!(value["time_changes"], serde_json::json!([]));
    }
}
