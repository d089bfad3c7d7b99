//! Error taxonomy for the harness.
//!
//! Three layers, mirroring who raises what:
//! - [`DbError`] — what an abstract database driver reports (vendor error
//!   code + SQLSTATE + message). Classified by the dialect table into a
//!   retry / retry-different / fatal decision.
//! - [`ProcedureError`] — what a benchmark procedure may raise: a
//!   deliberate user abort, a database error, or an environmental failure.
//! - [`WorkerError`] / [`HarnessError`] — worker-fatal and run-fatal
//!   conditions that propagate out of the engine.

use thiserror::Error;

use crate::types::{DatabaseType, GlobalState, TransactionType};

/// Convenience alias for `Result<T, HarnessError>`.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// A database-driver-level error carrying the vendor error code and the
/// five-character SQLSTATE, when the driver supplied one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("database error (code={code}, sqlstate={}): {message}", .sql_state.as_deref().unwrap_or("<none>"))]
pub struct DbError {
    pub code: i32,
    pub sql_state: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn new(code: i32, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: Some(sql_state.into()),
            message: message.into(),
        }
    }

    /// An error the driver reported without a SQLSTATE.
    pub fn stateless(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: None,
            message: message.into(),
        }
    }

    pub fn sql_state(&self) -> Option<&str> {
        self.sql_state.as_deref()
    }
}

/// What a benchmark procedure's `execute` may raise.
#[derive(Error, Debug)]
pub enum ProcedureError {
    /// Deliberate abort by benchmark logic (e.g. the mandated 1% NewOrder
    /// rollback). Counted, never treated as a failure.
    #[error("transaction aborted by benchmark: {0}")]
    UserAbort(String),

    #[error(transparent)]
    Db(#[from] DbError),

    /// Environmental or programming failure inside the procedure.
    /// Propagated unwrapped; kills the worker.
    #[error("unexpected failure in procedure: {0}")]
    Fatal(String),
}

/// Worker-fatal conditions. Any of these terminates the worker's run loop
/// and surfaces through the driver as a failed run.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker<{worker:03}> could not acquire a connection for '{txn}' on {db_type}: {source}")]
    Connection {
        worker: usize,
        db_type: DatabaseType,
        txn: String,
        #[source]
        source: DbError,
    },

    #[error("fatal database error while executing '{txn}': {source}")]
    Db {
        txn: String,
        #[source]
        source: DbError,
    },

    #[error("fatal error while executing '{txn}': {message}")]
    Fatal { txn: String, message: String },

    /// The workload mix produced a type id with no registered procedure.
    /// Always a bug in the phase weights, never a runtime condition.
    #[error("no transaction type registered for id {0}")]
    UnknownTransactionType(i32),

    #[error("worker initialization failed: {0}")]
    Init(String),

    #[error("serial work fetched from a throughput phase")]
    DisabledPhase,

    #[error("serial phase exhausted in unexpected state {0}")]
    SerialOutOfPhase(GlobalState),
}

/// Errors raised while building the transaction catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("duplicate procedure registered for transaction type {0}")]
    DuplicateProcedure(TransactionType),

    #[error("transaction type {0} declared in the workload but no procedure registered")]
    MissingProcedure(TransactionType),
}

/// Configuration validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("workload declares no transaction types")]
    NoTransactions,

    #[error("workload declares no phases")]
    NoPhases,

    #[error("transaction ids must be contiguous from 1; found id {found} at position {position}")]
    NonContiguousIds { found: i32, position: usize },

    #[error("duplicate transaction name '{0}'")]
    DuplicateName(String),

    #[error("phase {phase}: {weights} weights for {transactions} transaction types")]
    WeightArity {
        phase: usize,
        weights: usize,
        transactions: usize,
    },

    #[error("phase {phase}: all weights are zero")]
    ZeroWeights { phase: usize },

    #[error("phase {phase}: rate must be > 0 when set")]
    ZeroRate { phase: usize },

    #[error("terminals must be >= 1")]
    NoTerminals,

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level error for the driver and the CLI.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("worker thread panicked")]
    WorkerPanic,
}
