//! The Shrike worker execution engine.
//!
//! A pool of persistent worker threads pulls work from a shared workload
//! state machine, executes benchmark-supplied transactions with per-DBMS
//! retry/savepoint/abort discipline, and records phase-gated latency
//! samples and outcome histograms. The driver owns the phase schedule and
//! aggregates results when the run ends.

pub mod catalog;
pub mod dialect;
pub mod driver;
pub mod latency;
pub mod memdb;
pub mod module;
pub mod phase;
pub mod signal;
pub mod state;
pub mod worker;

#[cfg(test)]
mod tests;

pub use catalog::TransactionCatalog;
pub use dialect::{classify, ErrorAction};
pub use driver::{BenchmarkResults, Driver, DriverOptions, LatencySummary, ThroughputPoint};
pub use latency::{LatencyRecord, Sample};
pub use module::{
    BenchmarkModule, CancelToken, Connection, ExecuteContext, Procedure, Savepoint, StatementSlot,
};
pub use phase::{Phase, Rate};
pub use state::{Fetched, SubmittedProcedure, WorkloadState};
pub use worker::{Worker, WorkerHandle, WorkerOutput, WorkerStats};
