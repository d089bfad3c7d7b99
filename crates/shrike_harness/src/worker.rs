//! The per-terminal worker: fetch work, execute the transaction with
//! retry/savepoint/cancel discipline, record the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use shrike_common::error::{DbError, ProcedureError, WorkerError};
use shrike_common::histogram::Histogram;
use shrike_common::types::{DatabaseType, GlobalState, TransactionStatus, TransactionType};
use shrike_common::util::abbreviate;

use crate::catalog::TransactionCatalog;
use crate::dialect::{classify, ErrorAction};
use crate::latency::LatencyRecord;
use crate::module::{BenchmarkModule, Connection, ExecuteContext, Savepoint, StatementSlot};
use crate::phase::Phase;
use crate::state::{Fetched, SubmittedProcedure, WorkloadState};

/// Attempts per transaction before the worker gives up and moves on.
pub const MAX_RETRY_COUNT: u32 = 3;

/// Abort messages are truncated to this many characters before bucketing.
const ABORT_MESSAGE_MAX_CHARS: usize = 20;

/// CockroachDB only honors rollback-and-retry through a savepoint with
/// this exact name.
const COCKROACH_SAVEPOINT: &str = "cockroach_restart";

/// Per-worker outcome tallies, read by the driver after the run.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub success: Histogram<TransactionType>,
    pub abort: Histogram<TransactionType>,
    pub retry: Histogram<TransactionType>,
    pub errors: Histogram<TransactionType>,
    pub abort_messages: HashMap<TransactionType, Histogram<String>>,
}

/// Everything a worker hands back when its loop exits cleanly.
#[derive(Debug)]
pub struct WorkerOutput {
    pub id: usize,
    pub latencies: LatencyRecord,
    pub stats: WorkerStats,
}

/// The driver's per-worker handle: live throughput sampling and statement
/// cancellation, both usable while the worker runs.
pub struct WorkerHandle {
    id: usize,
    interval_requests: Arc<AtomicU64>,
    statement: StatementSlot,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Atomically read and reset the interval request counter. Summing the
    /// returned values over a run yields the total measured samples.
    pub fn get_and_reset_interval_requests(&self) -> u64 {
        self.interval_requests.swap(0, Ordering::AcqRel)
    }

    /// Cancel the worker's in-flight statement, if any.
    pub fn cancel_statement(&self) {
        self.statement.cancel();
    }
}

impl std::fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker<{:03}>", self.id)
    }
}

/// One persistent client terminal.
pub struct Worker<B: BenchmarkModule> {
    id: usize,
    module: Arc<B>,
    state: Arc<WorkloadState>,
    catalog: Arc<TransactionCatalog<B::Conn>>,
    latencies: LatencyRecord,
    stats: WorkerStats,
    interval_requests: Arc<AtomicU64>,
    statement: StatementSlot,
    rng: StdRng,
    seen_done: bool,
}

impl<B: BenchmarkModule> Worker<B> {
    pub fn new(
        id: usize,
        module: Arc<B>,
        state: Arc<WorkloadState>,
        catalog: Arc<TransactionCatalog<B::Conn>>,
    ) -> Self {
        let rng = match module.configuration().seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
            None => StdRng::from_entropy(),
        };
        Self {
            id,
            module,
            state,
            catalog,
            latencies: LatencyRecord::new(),
            stats: WorkerStats::default(),
            interval_requests: Arc::new(AtomicU64::new(0)),
            statement: StatementSlot::new(),
            rng,
            seen_done: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Handle for the driver, valid for the worker's whole lifetime.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.id,
            interval_requests: self.interval_requests.clone(),
            statement: self.statement.clone(),
        }
    }

    /// Run the worker to completion. Blocks at the start barrier, loops
    /// until the driver ends the run, and returns the collected results.
    pub fn run(mut self) -> Result<WorkerOutput, WorkerError> {
        if let Err(e) = self.module.on_worker_start(self.id) {
            self.state.worker_failed();
            self.module.on_worker_stop(self.id);
            return Err(WorkerError::Init(e.to_string()));
        }

        self.state.block_for_start();
        let result = self.work_loop();
        self.module.on_worker_stop(self.id);

        match result {
            Ok(()) => Ok(WorkerOutput {
                id: self.id,
                latencies: self.latencies,
                stats: self.stats,
            }),
            Err(e) => {
                error!(worker = self.id, error = %e, "worker terminated fatally");
                self.state.worker_failed();
                Err(e)
            }
        }
    }

    fn work_loop(&mut self) -> Result<(), WorkerError> {
        loop {
            // Check for the end of the run before anything else.
            let state = self.state.global_state();
            if state == GlobalState::Done && !self.seen_done {
                self.seen_done = true;
                self.state.signal_done();
                debug!(worker = self.id, "observed DONE; leaving work loop");
                return Ok(());
            }

            // Sleep while there is nothing to do.
            self.state.stay_awake();
            if self.state.current_phase().is_none() {
                continue;
            }

            let fetched = self.state.fetch_work(&mut self.rng);

            // Re-snapshot: the run may have moved while we waited.
            let pre_state = self.state.global_state();
            let Some(phase) = self.state.current_phase() else {
                continue;
            };
            if matches!(
                pre_state,
                GlobalState::Done | GlobalState::Exit | GlobalState::LatencyComplete
            ) {
                continue;
            }

            let work = match fetched {
                Fetched::Stalled => continue,
                Fetched::EndOfSerial => {
                    self.handle_end_of_serial(pre_state, &phase)?;
                    continue;
                }
                Fetched::Work(work) => work,
            };

            let start_ns = work.start_ns;
            let executed = self.do_work(pre_state == GlobalState::Measure, &work)?;
            let end_ns = self.state.now_ns();

            let post_state = self.state.global_state();
            match post_state {
                GlobalState::Measure => {
                    // Record only when the whole execution sat inside one
                    // measurement window: MEASURE on both sides and an
                    // unchanged phase. Anything else straddles a warm-up
                    // or the end of the window.
                    if pre_state == GlobalState::Measure
                        && self.state.current_phase_id() == Some(phase.id())
                    {
                        if let Some(txn) = &executed {
                            self.latencies
                                .append(txn.id(), start_ns, end_ns, self.id, phase.id());
                            self.interval_requests.fetch_add(1, Ordering::AcqRel);
                            if phase.is_latency_run() {
                                self.state.start_cold_query();
                            }
                        }
                    }
                }
                GlobalState::ColdQuery => {
                    // The cold run of this query is done; the next
                    // execution of it is hot and measured.
                    if pre_state == GlobalState::ColdQuery {
                        self.state.start_hot_query();
                    }
                }
                _ => {}
            }

            self.state.finished_work();
        }
    }

    /// A serial phase ran out of queries. Warm-up wraps; during
    /// measurement the first worker to notice declares the latency run
    /// complete.
    fn handle_end_of_serial(
        &mut self,
        pre_state: GlobalState,
        phase: &Arc<Phase>,
    ) -> Result<(), WorkerError> {
        if phase.is_throughput_run() {
            error!(worker = self.id, "drew serial work from a throughput phase");
            return Err(WorkerError::DisabledPhase);
        }
        if self.state.current_phase_id() == Some(phase.id()) {
            match pre_state {
                GlobalState::Warmup => phase.reset_serial(),
                GlobalState::ColdQuery | GlobalState::Measure => {
                    self.state.signal_latency_complete();
                    info!(
                        worker = self.id,
                        "serial execution of all transactions complete"
                    );
                }
                other => return Err(WorkerError::SerialOutOfPhase(other)),
            }
        }
        Ok(())
    }

    /// Execute one unit of work: acquire a connection, run the procedure
    /// inside an explicit transaction with per-dialect savepoint
    /// discipline, retrying transient failures up to [`MAX_RETRY_COUNT`]
    /// times. Returns the executed transaction type when the final status
    /// was success, `None` otherwise.
    pub(crate) fn do_work(
        &mut self,
        measure: bool,
        work: &SubmittedProcedure,
    ) -> Result<Option<TransactionType>, WorkerError> {
        let config = self.module.configuration();
        let db_type = config.db_type;
        let isolation = config.isolation;
        let record_abort_messages = config.record_abort_messages;

        let next = self
            .catalog
            .transaction(work.type_id)
            .cloned()
            .ok_or(WorkerError::UnknownTransactionType(work.type_id))?;
        let procedure = self
            .catalog
            .procedure(work.type_id)
            .cloned()
            .ok_or(WorkerError::UnknownTransactionType(work.type_id))?;

        let fatal_db = |source: DbError| WorkerError::Db {
            txn: next.name().to_string(),
            source,
        };

        let mut conn = self
            .module
            .connection()
            .map_err(|source| WorkerError::Connection {
                worker: self.id,
                db_type,
                txn: next.name().to_string(),
                source,
            })?;

        if !conn.auto_commit().map_err(fatal_db)? {
            warn!(
                worker = self.id,
                "autocommit already disabled at beginning of work"
            );
        }
        conn.set_auto_commit(false).map_err(fatal_db)?;

        if db_type.uses_transactions() {
            conn.set_isolation(isolation).map_err(fatal_db)?;
        }

        let mut status = TransactionStatus::Retry;
        let mut retry_count: u32 = 0;

        while retry_count < MAX_RETRY_COUNT
            && status == TransactionStatus::Retry
            && self.state.global_state() != GlobalState::Done
        {
            // Postgres and CockroachDB can only resume after an aborted
            // statement through a savepoint; CockroachDB insists on its
            // well-known name.
            let savepoint = match db_type {
                DatabaseType::Postgres => {
                    debug!(worker = self.id, "setting savepoint");
                    Some(conn.set_savepoint(None).map_err(fatal_db)?)
                }
                DatabaseType::Cockroachdb => {
                    debug!(worker = self.id, "setting savepoint {COCKROACH_SAVEPOINT}");
                    Some(
                        conn.set_savepoint(Some(COCKROACH_SAVEPOINT))
                            .map_err(fatal_db)?,
                    )
                }
                _ => None,
            };

            debug!(worker = self.id, txn = %next, measure, attempt = retry_count + 1, "attempting");

            let attempt = self.run_attempt(&procedure, &mut conn, savepoint);
            // Drop any cancel token left over from this attempt.
            self.statement.clear();

            match attempt {
                Ok(st) => {
                    debug!(worker = self.id, txn = %next, status = %st, "committed");
                    status = st;
                }
                Err((ProcedureError::UserAbort(message), savepoint)) => {
                    if record_abort_messages {
                        self.stats
                            .abort_messages
                            .entry(next.clone())
                            .or_default()
                            .add(abbreviate(&message, ABORT_MESSAGE_MAX_CHARS));
                    }
                    Self::rollback_attempt(&mut conn, savepoint.as_ref()).map_err(fatal_db)?;
                    status = TransactionStatus::UserAborted;
                }
                Err((ProcedureError::Db(db), savepoint)) => {
                    warn!(
                        worker = self.id,
                        txn = %next,
                        code = db.code,
                        sqlstate = db.sql_state().unwrap_or("<none>"),
                        message = %db.message,
                        "database error during transaction"
                    );
                    self.stats.errors.add(next.clone());

                    if db_type.uses_transactions() {
                        Self::rollback_attempt(&mut conn, savepoint.as_ref())
                            .map_err(fatal_db)?;
                    }

                    match classify(db_type, db.code, db.sql_state()) {
                        ErrorAction::Retry => status = TransactionStatus::Retry,
                        ErrorAction::RetryDifferent => {
                            status = TransactionStatus::RetryDifferent;
                        }
                        ErrorAction::Fatal => {
                            error!(
                                worker = self.id,
                                db = %db_type,
                                code = db.code,
                                sqlstate = db.sql_state().unwrap_or("<none>"),
                                txn = %next,
                                "fatal database error"
                            );
                            return Err(fatal_db(db));
                        }
                        ErrorAction::UnknownRetry => {
                            warn!(
                                worker = self.id,
                                txn = %next,
                                "unrecognized database error; retrying conservatively"
                            );
                            status = TransactionStatus::Retry;
                        }
                    }
                }
                Err((ProcedureError::Fatal(message), _)) => {
                    error!(worker = self.id, txn = %next, message, "fatal error in procedure");
                    return Err(WorkerError::Fatal {
                        txn: next.name().to_string(),
                        message,
                    });
                }
            }

            // Per-attempt outcome accounting.
            debug!(worker = self.id, txn = %next, result = %status, "attempt finished");
            match status {
                TransactionStatus::Success => {
                    self.stats.success.add(next.clone());
                }
                TransactionStatus::UserAborted => {
                    self.stats.abort.add(next.clone());
                }
                TransactionStatus::RetryDifferent => {
                    // Abandon this transaction and move on; the connection
                    // drops here, autocommit state and all.
                    self.stats.retry.add(next.clone());
                    return Ok(None);
                }
                TransactionStatus::Retry => {
                    self.stats.retry.add(next.clone());
                    retry_count += 1;
                    if retry_count >= MAX_RETRY_COUNT {
                        warn!(
                            worker = self.id,
                            txn = %next,
                            retries = retry_count,
                            "retry count exceeded; moving on"
                        );
                    } else {
                        warn!(
                            worker = self.id,
                            txn = %next,
                            attempt = retry_count,
                            "retrying transaction"
                        );
                    }
                }
                TransactionStatus::Error => {}
            }
        }

        if conn.auto_commit().map_err(fatal_db)? {
            warn!(
                worker = self.id,
                "autocommit unexpectedly enabled at end of work"
            );
        }
        conn.set_auto_commit(true).map_err(fatal_db)?;

        Ok(if status == TransactionStatus::Success {
            Some(next)
        } else {
            None
        })
    }

    /// One attempt: execute, release the savepoint, commit. On error the
    /// savepoint is handed back when it is still live so the caller can
    /// roll back to it; a consumed savepoint means full rollback.
    fn run_attempt(
        &mut self,
        procedure: &Arc<dyn crate::module::Procedure<B::Conn>>,
        conn: &mut B::Conn,
        mut savepoint: Option<Savepoint>,
    ) -> Result<TransactionStatus, (ProcedureError, Option<Savepoint>)> {
        let mut ctx = ExecuteContext {
            worker_id: self.id,
            rng: &mut self.rng,
            statement: &self.statement,
        };

        let status = match procedure.execute(&mut ctx, conn) {
            Ok(status) => status,
            Err(e) => return Err((e, savepoint)),
        };

        if let Some(sp) = savepoint.take() {
            debug!(worker = self.id, "releasing savepoint");
            if let Err(e) = conn.release_savepoint(sp) {
                return Err((e.into(), None));
            }
        }
        if let Err(e) = conn.commit() {
            return Err((e.into(), None));
        }
        Ok(status)
    }

    fn rollback_attempt(conn: &mut B::Conn, savepoint: Option<&Savepoint>) -> Result<(), DbError> {
        match savepoint {
            Some(sp) => conn.rollback_to(sp),
            None => conn.rollback(),
        }
    }
}
