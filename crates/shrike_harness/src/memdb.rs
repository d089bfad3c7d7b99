//! In-process reference benchmark module.
//!
//! A single-table key/balance store with buffered-write transaction
//! semantics, plus two procedures (`ReadRecord`, `UpdateRecord`). Used by
//! the CLI as the runnable demo backend and by the integration tests as a
//! real module implementation. It honors the full connection contract —
//! savepoints included — so any dialect's discipline can be exercised
//! against it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use shrike_common::config::WorkloadConfiguration;
use shrike_common::error::{DbError, ProcedureError};
use shrike_common::types::{IsolationMode, TransactionStatus, TransactionType};

use crate::module::{BenchmarkModule, Connection, ExecuteContext, Procedure, Savepoint};

type Table = Arc<Mutex<HashMap<i64, i64>>>;

/// Connection over the shared in-memory table. Writes are buffered until
/// commit; savepoints mark positions in the write buffer.
pub struct MemConnection {
    table: Table,
    pending: Vec<(i64, i64)>,
    auto_commit: bool,
    next_savepoint: u64,
    savepoints: Vec<(u64, usize)>,
}

impl MemConnection {
    fn new(table: Table) -> Self {
        Self {
            table,
            pending: Vec::new(),
            auto_commit: true,
            next_savepoint: 1,
            savepoints: Vec::new(),
        }
    }

    /// Read a key, seeing this connection's uncommitted writes first.
    pub fn get(&self, key: i64) -> Option<i64> {
        if let Some((_, val)) = self.pending.iter().rev().find(|(k, _)| *k == key) {
            return Some(*val);
        }
        self.table.lock().get(&key).copied()
    }

    /// Write a key. Applied immediately under autocommit, buffered inside
    /// an explicit transaction.
    pub fn put(&mut self, key: i64, val: i64) {
        if self.auto_commit {
            self.table.lock().insert(key, val);
        } else {
            self.pending.push((key, val));
        }
    }

    /// Committed row count.
    pub fn row_count(&self) -> usize {
        self.table.lock().len()
    }
}

impl Connection for MemConnection {
    fn auto_commit(&self) -> Result<bool, DbError> {
        Ok(self.auto_commit)
    }

    fn set_auto_commit(&mut self, on: bool) -> Result<(), DbError> {
        self.auto_commit = on;
        Ok(())
    }

    fn set_isolation(&mut self, _level: IsolationMode) -> Result<(), DbError> {
        // Single-versioned store: every isolation level behaves the same.
        Ok(())
    }

    fn set_savepoint(&mut self, name: Option<&str>) -> Result<Savepoint, DbError> {
        let id = self.next_savepoint;
        self.next_savepoint += 1;
        self.savepoints.push((id, self.pending.len()));
        Ok(match name {
            Some(name) => Savepoint::named(id, name),
            None => Savepoint::unnamed(id),
        })
    }

    fn release_savepoint(&mut self, sp: Savepoint) -> Result<(), DbError> {
        match self.savepoints.iter().rposition(|(id, _)| *id == sp.id()) {
            Some(pos) => {
                self.savepoints.truncate(pos);
                Ok(())
            }
            None => Err(DbError::new(
                0,
                "3B001",
                format!("no such savepoint: {}", sp.id()),
            )),
        }
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.pending.clear();
        self.savepoints.clear();
        Ok(())
    }

    fn rollback_to(&mut self, sp: &Savepoint) -> Result<(), DbError> {
        match self.savepoints.iter().rposition(|(id, _)| *id == sp.id()) {
            Some(pos) => {
                let mark = self.savepoints[pos].1;
                self.pending.truncate(mark);
                // The savepoint survives a rollback to it.
                self.savepoints.truncate(pos + 1);
                Ok(())
            }
            None => Err(DbError::new(
                0,
                "3B001",
                format!("no such savepoint: {}", sp.id()),
            )),
        }
    }

    fn commit(&mut self) -> Result<(), DbError> {
        let mut table = self.table.lock();
        for (key, val) in self.pending.drain(..) {
            table.insert(key, val);
        }
        self.savepoints.clear();
        Ok(())
    }
}

/// Point read of a random committed row.
pub struct ReadRecord;

impl Procedure<MemConnection> for ReadRecord {
    fn execute(
        &self,
        ctx: &mut ExecuteContext<'_>,
        conn: &mut MemConnection,
    ) -> Result<TransactionStatus, ProcedureError> {
        let rows = conn.row_count();
        if rows == 0 {
            // Mirrors a cursor coming back empty on a real backend.
            return Err(DbError::new(0, "02000", "no rows in table").into());
        }
        let key = ctx.rng.gen_range(0..rows as i64);
        let _ = conn.get(key);
        Ok(TransactionStatus::Success)
    }
}

/// Read-modify-write of a random row, with an optional benchmark-mandated
/// abort rate.
pub struct UpdateRecord {
    abort_pct: u8,
}

impl UpdateRecord {
    pub fn new(abort_pct: u8) -> Self {
        Self { abort_pct }
    }
}

impl Procedure<MemConnection> for UpdateRecord {
    fn execute(
        &self,
        ctx: &mut ExecuteContext<'_>,
        conn: &mut MemConnection,
    ) -> Result<TransactionStatus, ProcedureError> {
        let rows = conn.row_count();
        if rows == 0 {
            return Err(DbError::new(0, "02000", "no rows in table").into());
        }
        let key = ctx.rng.gen_range(0..rows as i64);
        let balance = conn.get(key).unwrap_or(0);
        let delta = ctx.rng.gen_range(-50..=50);
        conn.put(key, balance + delta);
        if self.abort_pct > 0 && ctx.rng.gen_range(0..100) < self.abort_pct {
            return Err(ProcedureError::UserAbort(format!(
                "insufficient funds for account {key}"
            )));
        }
        Ok(TransactionStatus::Success)
    }
}

/// The module: shared table plus the workload configuration.
pub struct MemBenchmark {
    config: WorkloadConfiguration,
    table: Table,
    abort_pct: u8,
}

impl MemBenchmark {
    pub fn new(config: WorkloadConfiguration) -> Self {
        Self::with_abort_pct(config, 1)
    }

    pub fn with_abort_pct(config: WorkloadConfiguration, abort_pct: u8) -> Self {
        Self {
            config,
            table: Arc::new(Mutex::new(HashMap::new())),
            abort_pct,
        }
    }

    /// Drop and recreate the (single) table.
    pub fn create(&self) {
        self.table.lock().clear();
    }

    /// Bulk-load `rows` accounts with a starting balance.
    pub fn load(&self, rows: u64) {
        let mut table = self.table.lock();
        table.reserve(rows as usize);
        for key in 0..rows as i64 {
            table.insert(key, 100);
        }
    }

    pub fn row_count(&self) -> usize {
        self.table.lock().len()
    }
}

impl BenchmarkModule for MemBenchmark {
    type Conn = MemConnection;

    fn connection(&self) -> Result<MemConnection, DbError> {
        Ok(MemConnection::new(self.table.clone()))
    }

    fn procedures(&self) -> HashMap<TransactionType, Arc<dyn Procedure<MemConnection>>> {
        let mut map: HashMap<TransactionType, Arc<dyn Procedure<MemConnection>>> = HashMap::new();
        for txn in self.config.transaction_types() {
            let procedure: Option<Arc<dyn Procedure<MemConnection>>> = match txn.name() {
                "ReadRecord" => Some(Arc::new(ReadRecord)),
                "UpdateRecord" => Some(Arc::new(UpdateRecord::new(self.abort_pct))),
                _ => None,
            };
            if let Some(procedure) = procedure {
                map.insert(txn, procedure);
            }
        }
        map
    }

    fn configuration(&self) -> &WorkloadConfiguration {
        &self.config
    }

    fn on_worker_start(&self, worker_id: usize) -> Result<(), ProcedureError> {
        debug!(worker = worker_id, "mem worker ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::module::StatementSlot;

    fn config() -> WorkloadConfiguration {
        WorkloadConfiguration::from_toml(
            r#"
db_type = "mem"
seed = 7

[[transaction]]
id = 1
name = "ReadRecord"

[[transaction]]
id = 2
name = "UpdateRecord"

[[phase]]
time_secs = 1
weights = [1, 1]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_autocommit_write_is_visible_immediately() {
        let bench = MemBenchmark::new(config());
        let mut conn = bench.connection().unwrap();
        conn.put(1, 10);
        assert_eq!(bench.row_count(), 1);
    }

    #[test]
    fn test_buffered_write_applies_on_commit() {
        let bench = MemBenchmark::new(config());
        let mut conn = bench.connection().unwrap();
        conn.set_auto_commit(false).unwrap();
        conn.put(1, 10);
        assert_eq!(bench.row_count(), 0);
        assert_eq!(conn.get(1), Some(10)); // own writes visible
        conn.commit().unwrap();
        assert_eq!(bench.row_count(), 1);
    }

    #[test]
    fn test_rollback_discards_buffered_writes() {
        let bench = MemBenchmark::new(config());
        let mut conn = bench.connection().unwrap();
        conn.set_auto_commit(false).unwrap();
        conn.put(1, 10);
        conn.rollback().unwrap();
        conn.commit().unwrap();
        assert_eq!(bench.row_count(), 0);
    }

    #[test]
    fn test_rollback_to_savepoint_keeps_earlier_writes() {
        let bench = MemBenchmark::new(config());
        let mut conn = bench.connection().unwrap();
        conn.set_auto_commit(false).unwrap();
        conn.put(1, 10);
        let sp = conn.set_savepoint(None).unwrap();
        conn.put(2, 20);
        conn.rollback_to(&sp).unwrap();
        conn.commit().unwrap();
        assert_eq!(conn.get(1), Some(10));
        assert_eq!(conn.get(2), None);
    }

    #[test]
    fn test_savepoint_survives_rollback_to_it() {
        let bench = MemBenchmark::new(config());
        let mut conn = bench.connection().unwrap();
        conn.set_auto_commit(false).unwrap();
        let sp = conn.set_savepoint(None).unwrap();
        conn.rollback_to(&sp).unwrap();
        conn.release_savepoint(sp).unwrap();
    }

    #[test]
    fn test_release_unknown_savepoint_errors() {
        let bench = MemBenchmark::new(config());
        let mut conn = bench.connection().unwrap();
        let err = conn.release_savepoint(Savepoint::unnamed(99)).unwrap_err();
        assert_eq!(err.sql_state(), Some("3B001"));
    }

    #[test]
    fn test_read_record_on_empty_table_reports_no_rows() {
        let bench = MemBenchmark::new(config());
        let mut conn = bench.connection().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let slot = StatementSlot::new();
        let mut ctx = ExecuteContext {
            worker_id: 0,
            rng: &mut rng,
            statement: &slot,
        };
        let err = ReadRecord.execute(&mut ctx, &mut conn).unwrap_err();
        match err {
            ProcedureError::Db(db) => assert_eq!(db.sql_state(), Some("02000")),
            other => panic!("expected Db error, got {other}"),
        }
    }

    #[test]
    fn test_update_record_against_loaded_table() {
        let bench = MemBenchmark::with_abort_pct(config(), 0);
        bench.load(100);
        let mut conn = bench.connection().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let slot = StatementSlot::new();
        let mut ctx = ExecuteContext {
            worker_id: 0,
            rng: &mut rng,
            statement: &slot,
        };
        let status = UpdateRecord::new(0).execute(&mut ctx, &mut conn).unwrap();
        assert_eq!(status, TransactionStatus::Success);
    }

    #[test]
    fn test_procedures_cover_declared_transactions() {
        let bench = MemBenchmark::new(config());
        let procs = bench.procedures();
        assert_eq!(procs.len(), 2);
    }
}
