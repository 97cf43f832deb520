//! Offline side of the cpbench benchmark harness: collecting per-task result
//! documents into aggregated CSV tables, differencing two configurations and
//! summarizing statuses. Everything here is read-only over finished runs and
//! fails loudly on malformed input rather than producing an incomplete
//! report.

pub mod collect;
pub mod compare;
pub mod report;
