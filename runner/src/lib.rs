//! Execution side of the cpbench benchmark harness: the solving-engine
//! boundary, the per-task execution engine and the batch executors.

pub mod executors;
pub mod instances;
pub mod solver;
pub mod task;
