//! Contracts between the engine and a benchmark module.
//!
//! A benchmark module supplies connections, the procedure registry, and
//! the workload configuration; the engine supplies the run loop, retry
//! and savepoint discipline, and all accounting. Schema creation, bulk
//! loading, and catalog introspection live behind the module boundary and
//! are of no concern to the engine.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;

use shrike_common::config::WorkloadConfiguration;
use shrike_common::error::{DbError, ProcedureError};
use shrike_common::types::{IsolationMode, TransactionStatus, TransactionType};

/// A nested-transaction marker handed back by [`Connection::set_savepoint`].
/// Opaque to the engine; connections correlate it with their own state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    id: u64,
    name: Option<String>,
}

impl Savepoint {
    pub fn unnamed(id: u64) -> Self {
        Self { id, name: None }
    }

    pub fn named(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Abstract relational connection with the standard transaction surface.
///
/// Release-on-exit is ownership-based: the engine moves a connection into
/// each unit of work and drops it on every exit path, so implementations
/// clean up in `Drop`.
pub trait Connection {
    fn auto_commit(&self) -> Result<bool, DbError>;
    fn set_auto_commit(&mut self, on: bool) -> Result<(), DbError>;
    fn set_isolation(&mut self, level: IsolationMode) -> Result<(), DbError>;

    /// Create a savepoint; `name` is `Some` only for dialects that demand
    /// a specific savepoint name.
    fn set_savepoint(&mut self, name: Option<&str>) -> Result<Savepoint, DbError>;
    fn release_savepoint(&mut self, sp: Savepoint) -> Result<(), DbError>;

    /// Roll back the whole transaction.
    fn rollback(&mut self) -> Result<(), DbError>;
    /// Roll back to `sp`, keeping the outer transaction alive.
    fn rollback_to(&mut self, sp: &Savepoint) -> Result<(), DbError>;

    fn commit(&mut self) -> Result<(), DbError>;
}

/// Handle to an in-flight statement that can be cancelled from another
/// thread, typically by asking the database driver to interrupt it.
pub trait CancelToken: Send + Sync {
    fn cancel(&self) -> Result<(), DbError>;
}

/// Thread-safe slot holding the worker's currently-executing statement.
///
/// Procedures register their statement before a blocking database call and
/// clear it after; the driver sweeps `cancel` over all slots when it
/// advances the run state. Cancellation surfaces in the procedure as a
/// dialect "cancelled" error (SQLSTATE 57014) and is classified as
/// retry-different.
#[derive(Clone, Default)]
pub struct StatementSlot {
    current: Arc<Mutex<Option<Arc<dyn CancelToken>>>>,
}

impl StatementSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: Arc<dyn CancelToken>) {
        *self.current.lock() = Some(token);
    }

    pub fn clear(&self) {
        *self.current.lock() = None;
    }

    /// Cancel the registered statement, if any. Failures are logged, not
    /// propagated: by the time the cancel lands the statement may already
    /// have finished.
    pub fn cancel(&self) {
        let token = self.current.lock().clone();
        if let Some(token) = token {
            if let Err(e) = token.cancel() {
                tracing::error!("failed to cancel statement: {e}");
            }
        }
    }
}

/// Per-invocation context handed to a procedure: the worker identity, a
/// seeded RNG, and the statement-cancellation slot.
pub struct ExecuteContext<'a> {
    pub worker_id: usize,
    pub rng: &'a mut StdRng,
    pub statement: &'a StatementSlot,
}

/// One benchmark transaction. Implementations run exactly one logical
/// transaction per call and report its outcome; they never commit or roll
/// back themselves — the engine owns transaction boundaries.
pub trait Procedure<C: Connection>: Any + Send + Sync {
    fn execute(
        &self,
        ctx: &mut ExecuteContext<'_>,
        conn: &mut C,
    ) -> Result<TransactionStatus, ProcedureError>;
}

/// A pluggable benchmark implementation.
pub trait BenchmarkModule: Send + Sync + 'static {
    type Conn: Connection + 'static;

    /// A fresh, ready-to-use connection. Acquired per unit of work; the
    /// engine never pools (a module may pool internally).
    fn connection(&self) -> Result<Self::Conn, DbError>;

    /// Snapshot of the procedure registry: exactly one procedure per
    /// transaction type.
    fn procedures(&self) -> HashMap<TransactionType, Arc<dyn Procedure<Self::Conn>>>;

    fn configuration(&self) -> &WorkloadConfiguration;

    /// Called on the worker thread before it parks at the start barrier.
    /// An error here is fatal to the run.
    fn on_worker_start(&self, _worker_id: usize) -> Result<(), ProcedureError> {
        Ok(())
    }

    /// Called on the worker thread after its loop exits, on both clean and
    /// fatal paths.
    fn on_worker_stop(&self, _worker_id: usize) {}
}
