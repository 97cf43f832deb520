use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("`{0}` is not a known solve status")]
    UnknownStatus(String),
    #[error("`{0}` is not a known solve method")]
    UnknownMethod(String),
}

/// Terminal or intermediate outcome of a solve call.
///
/// The wire form is the upper snake case name (`OPTIMAL_SOLUTION`, ...), the
/// same vocabulary the per-task documents and aggregated tables carry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolveStatus {
    Unknown,
    Satisfied,
    OptimalSolution,
    Unsatisfiable,
    Unbounded,
    Error,
}

impl SolveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Satisfied => "SATISFIED",
            Self::OptimalSolution => "OPTIMAL_SOLUTION",
            Self::Unsatisfiable => "UNSATISFIABLE",
            Self::Unbounded => "UNBOUNDED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SolveStatus {
    type Err = StatusError;

    /// Parse a wire status. Engine statuses outside the six-value vocabulary
    /// fold here: `ALL_SOLUTIONS` counts as satisfied, `UNSAT_OR_UNBOUNDED`
    /// as unbounded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(Self::Unknown),
            "SATISFIED" | "ALL_SOLUTIONS" => Ok(Self::Satisfied),
            "OPTIMAL_SOLUTION" => Ok(Self::OptimalSolution),
            "UNSATISFIABLE" => Ok(Self::Unsatisfiable),
            "UNBOUNDED" | "UNSAT_OR_UNBOUNDED" => Ok(Self::Unbounded),
            "ERROR" => Ok(Self::Error),
            other => Err(StatusError::UnknownStatus(other.to_string())),
        }
    }
}

/// Whether a problem is a pure satisfaction problem or an optimization in
/// either direction. The objective is only meaningful outside `Satisfy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Satisfy,
    Minimize,
    Maximize,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Satisfy => "satisfy",
            Self::Minimize => "minimize",
            Self::Maximize => "maximize",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // long and short forms; the model interface reports "sat"/"min"/"max"
            "satisfy" | "sat" => Ok(Self::Satisfy),
            "minimize" | "min" => Ok(Self::Minimize),
            "maximize" | "max" => Ok(Self::Maximize),
            other => Err(StatusError::UnknownMethod(other.to_string())),
        }
    }
}
