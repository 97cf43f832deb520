//! Per-configuration status summary over an aggregated statistics table.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to read statistics table {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("statistics table is missing the `{0}` column")]
    MissingColumn(&'static str),
    #[error("row {row}: `{value}` is not a number in column `time`")]
    BadTime { row: usize, value: String },
}

/// Count solve statuses per configuration, optionally splitting rows out
/// per model and per problem, and optionally annotating each count with the
/// average runtime. Returns a width-padded text table.
pub fn report_status(
    statistics: &Path,
    per_model: bool,
    per_problem: bool,
    avg_time: bool,
) -> Result<String, ReportError> {
    let read_err = |source| ReportError::Read {
        path: statistics.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(statistics).map_err(read_err)?;

    let headers = reader.headers().map_err(read_err)?.clone();
    let find = |name: &'static str| {
        headers
            .iter()
            .position(|header| header == name)
            .ok_or(ReportError::MissingColumn(name))
    };
    let configuration_at = find("configuration")?;
    let model_at = if per_model { Some(find("model")?) } else { None };
    let problem_at = if per_problem { Some(find("problem")?) } else { None };
    let status_at = find("status")?;
    let time_at = if avg_time { Some(find("time")?) } else { None };

    let mut seen_statuses = BTreeSet::new();
    let mut table: BTreeMap<Vec<String>, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(read_err)?;
        let field = |index: usize| record.get(index).unwrap_or("").to_string();

        let mut key = vec![field(configuration_at)];
        if let Some(index) = model_at {
            key.push(field(index));
        }
        if let Some(index) = problem_at {
            key.push(field(index));
        }

        let status = field(status_at);
        seen_statuses.insert(status.clone());
        let time = match time_at {
            None => 0.0,
            Some(index) => match record.get(index).unwrap_or("") {
                "" => 0.0,
                value => value.parse().map_err(|_| ReportError::BadTime {
                    row,
                    value: value.to_string(),
                })?,
            },
        };
        table.entry(key).or_default().entry(status).or_default().push(time);
    }

    // reverse lexicographic order, so solved statuses lead and ERROR trails
    let statuses: Vec<&String> = seen_statuses.iter().rev().collect();

    let mut header: Vec<String> = vec!["configuration".to_string()];
    if per_model {
        header.push("model".to_string());
    }
    if per_problem {
        header.push("problem".to_string());
    }
    header.extend(statuses.iter().map(|status| status.to_string()));

    let mut rows = vec![header];
    for (key, counts) in &table {
        let mut row = key.clone();
        for status in &statuses {
            row.push(match counts.get(*status) {
                None => "0".to_string(),
                Some(times) if avg_time => format!(
                    "{} ({:.2}s)",
                    times.len(),
                    times.iter().sum::<f64>() / times.len() as f64
                ),
                Some(times) => times.len().to_string(),
            });
        }
        rows.push(row);
    }

    Ok(render(&rows))
}

fn render(rows: &[Vec<String>]) -> String {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let widths: Vec<usize> = (0..columns)
        .map(|column| {
            rows.iter()
                .filter_map(|row| row.get(column))
                .map(String::len)
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    for (index, row) in rows.iter().enumerate() {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
        if index == 0 {
            let underline = widths
                .iter()
                .map(|width| "-".repeat(*width))
                .collect::<Vec<_>>()
                .join("  ");
            out.push_str(&underline);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table(rows: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "configuration,problem,model,data_file,status,time,run").unwrap();
        for row in rows {
            writeln!(file, "{row}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn counts_statuses_per_configuration() {
        let table = table(&[
            "base,p,a.mzn,,SATISFIED,1.0,r",
            "base,p,b.mzn,,SATISFIED,3.0,r",
            "base,p,c.mzn,,ERROR,0.5,r",
            "free,p,a.mzn,,UNSATISFIABLE,2.0,r",
        ]);

        let report = report_status(table.path(), false, false, false).unwrap();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], "configuration  UNSATISFIABLE  SATISFIED  ERROR");
        assert_eq!(lines[2], "base           0              2          1");
        assert_eq!(lines[3], "free           1              0          0");
    }

    #[test]
    fn average_runtime_annotates_the_counts() {
        let table = table(&[
            "base,p,a.mzn,,SATISFIED,1.0,r",
            "base,p,b.mzn,,SATISFIED,3.0,r",
        ]);

        let report = report_status(table.path(), false, false, true).unwrap();
        assert!(report.contains("2 (2.00s)"));
    }

    #[test]
    fn per_model_rows_split_the_counts() {
        let table = table(&[
            "base,p,a.mzn,,SATISFIED,1.0,r",
            "base,p,b.mzn,,ERROR,1.0,r",
        ]);

        let report = report_status(table.path(), true, false, false).unwrap();
        let lines: Vec<&str> = report.lines().collect();
        assert!(lines[0].starts_with("configuration  model"));
        assert!(report.contains("a.mzn"));
        assert!(report.contains("b.mzn"));
    }

    #[test]
    fn missing_columns_fail_loudly() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "configuration,problem").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            report_status(file.path(), false, false, false),
            Err(ReportError::MissingColumn("status"))
        ));
    }
}
