//! Core vocabulary shared by the harness, the benchmark modules, and the
//! CLI: DBMS identities, isolation modes, run states, and transaction
//! classification.

use serde::{Deserialize, Serialize};

/// The DBMS family a benchmark run targets. Drives error classification
/// and savepoint discipline in the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Mysql,
    Mariadb,
    Postgres,
    Cockroachdb,
    Sqlserver,
    Oracle,
    Db2,
    Sqlite,
    /// In-process reference backend, used by the bundled demo module.
    Mem,
}

impl DatabaseType {
    /// Whether the worker should manage explicit transactions (isolation
    /// mode, commit/rollback) on connections to this DBMS.
    pub fn uses_transactions(self) -> bool {
        // Every supported backend today is relational; the hook exists so
        // that append-only / NoSQL targets can opt out.
        true
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DatabaseType::Mysql => "mysql",
            DatabaseType::Mariadb => "mariadb",
            DatabaseType::Postgres => "postgres",
            DatabaseType::Cockroachdb => "cockroachdb",
            DatabaseType::Sqlserver => "sqlserver",
            DatabaseType::Oracle => "oracle",
            DatabaseType::Db2 => "db2",
            DatabaseType::Sqlite => "sqlite",
            DatabaseType::Mem => "mem",
        };
        write!(f, "{s}")
    }
}

/// Transaction isolation mode applied to every connection before work
/// begins, expressed in standard SQL terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IsolationMode::ReadUncommitted => "READ UNCOMMITTED",
            IsolationMode::ReadCommitted => "READ COMMITTED",
            IsolationMode::RepeatableRead => "REPEATABLE READ",
            IsolationMode::Serializable => "SERIALIZABLE",
        };
        write!(f, "{s}")
    }
}

/// Global run state shared by the driver and every worker.
///
/// Transitions are monotonic within a phase; `Done` is observed by each
/// worker exactly once (and acknowledged), after which the last
/// acknowledgement moves the run to `Exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalState {
    /// Load is applied but results are discarded.
    Warmup,
    /// Serial latency runs: the current query executes cold, unrecorded.
    ColdQuery,
    /// The measurement window: results are recorded.
    Measure,
    /// A serial phase ran out of queries; waiting for the next phase.
    LatencyComplete,
    /// All workers have acknowledged the end of the run.
    Exit,
    /// The driver has ended the run; workers acknowledge and stop.
    Done,
}

impl std::fmt::Display for GlobalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GlobalState::Warmup => "WARMUP",
            GlobalState::ColdQuery => "COLD_QUERY",
            GlobalState::Measure => "MEASURE",
            GlobalState::LatencyComplete => "LATENCY_COMPLETE",
            GlobalState::Exit => "EXIT",
            GlobalState::Done => "DONE",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a single transaction attempt, as reported by the benchmark
/// procedure or derived from error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Success,
    /// Deliberate rollback by benchmark logic. Not an error.
    UserAborted,
    /// Transient failure; the same transaction should be re-attempted.
    Retry,
    /// The attempt was discarded (cancellation, empty result); the worker
    /// moves on to a different transaction.
    RetryDifferent,
    Error,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::UserAborted => "USER_ABORTED",
            TransactionStatus::Retry => "RETRY",
            TransactionStatus::RetryDifferent => "RETRY_DIFFERENT",
            TransactionStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// A named transaction class within a benchmark (e.g. `NewOrder`).
///
/// Id `0` is reserved for the [`TransactionType::invalid`] sentinel; every
/// registered type has id ≥ 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionType {
    id: i32,
    name: String,
}

impl TransactionType {
    pub const INVALID_ID: i32 = 0;

    pub fn new(id: i32, name: impl Into<String>) -> Self {
        debug_assert!(id >= 1, "real transaction types have id >= 1");
        Self {
            id,
            name: name.into(),
        }
    }

    /// The sentinel type returned when no transaction was resolved.
    pub fn invalid() -> Self {
        Self {
            id: Self::INVALID_ID,
            name: "INVALID".into(),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_invalid(&self) -> bool {
        self.id == Self::INVALID_ID
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:02}", self.name, self.id)
    }
}
