//! Engine-level scenario tests: a scripted benchmark module drives the
//! worker through the retry, savepoint, abort, and cancellation paths,
//! and the driver is exercised end to end against the in-memory module.

mod support {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use shrike_common::config::WorkloadConfiguration;
    use shrike_common::error::{DbError, ProcedureError, WorkerError};
    use shrike_common::types::{GlobalState, IsolationMode, TransactionStatus, TransactionType};

    use crate::catalog::TransactionCatalog;
    use crate::module::{
        BenchmarkModule, Connection, ExecuteContext, Procedure, Savepoint,
    };
    use crate::phase::Phase;
    use crate::state::WorkloadState;
    use crate::worker::{Worker, WorkerOutput};

    /// Everything a connection was asked to do, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Op {
        SetAutoCommit(bool),
        SetIsolation,
        SetSavepoint(Option<String>),
        ReleaseSavepoint,
        Rollback,
        RollbackTo,
        Commit,
    }

    /// Connection that records every call and always succeeds.
    pub struct RecordingConnection {
        log: Arc<Mutex<Vec<Op>>>,
        auto_commit: bool,
        next_savepoint: u64,
    }

    impl Connection for RecordingConnection {
        fn auto_commit(&self) -> Result<bool, DbError> {
            Ok(self.auto_commit)
        }

        fn set_auto_commit(&mut self, on: bool) -> Result<(), DbError> {
            self.auto_commit = on;
            self.log.lock().push(Op::SetAutoCommit(on));
            Ok(())
        }

        fn set_isolation(&mut self, _level: IsolationMode) -> Result<(), DbError> {
            self.log.lock().push(Op::SetIsolation);
            Ok(())
        }

        fn set_savepoint(&mut self, name: Option<&str>) -> Result<Savepoint, DbError> {
            let id = self.next_savepoint;
            self.next_savepoint += 1;
            self.log
                .lock()
                .push(Op::SetSavepoint(name.map(str::to_string)));
            Ok(match name {
                Some(name) => Savepoint::named(id, name),
                None => Savepoint::unnamed(id),
            })
        }

        fn release_savepoint(&mut self, _sp: Savepoint) -> Result<(), DbError> {
            self.log.lock().push(Op::ReleaseSavepoint);
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), DbError> {
            self.log.lock().push(Op::Rollback);
            Ok(())
        }

        fn rollback_to(&mut self, _sp: &Savepoint) -> Result<(), DbError> {
            self.log.lock().push(Op::RollbackTo);
            Ok(())
        }

        fn commit(&mut self) -> Result<(), DbError> {
            self.log.lock().push(Op::Commit);
            Ok(())
        }
    }

    /// One planned outcome of a procedure invocation.
    pub type Step = Box<dyn FnOnce() -> Result<TransactionStatus, ProcedureError> + Send>;

    pub struct ScriptedProcedure {
        steps: Mutex<VecDeque<Step>>,
    }

    impl Procedure<RecordingConnection> for ScriptedProcedure {
        fn execute(
            &self,
            _ctx: &mut ExecuteContext<'_>,
            _conn: &mut RecordingConnection,
        ) -> Result<TransactionStatus, ProcedureError> {
            match self.steps.lock().pop_front() {
                Some(step) => step(),
                None => Ok(TransactionStatus::Success),
            }
        }
    }

    /// Module wrapping the scripted procedure and recording connections.
    pub struct ScriptedModule {
        config: WorkloadConfiguration,
        procedure: Arc<ScriptedProcedure>,
        pub log: Arc<Mutex<Vec<Op>>>,
    }

    impl ScriptedModule {
        pub fn new(config: WorkloadConfiguration, steps: Vec<Step>) -> Self {
            Self {
                config,
                procedure: Arc::new(ScriptedProcedure {
                    steps: Mutex::new(steps.into()),
                }),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn ops(&self) -> Vec<Op> {
            self.log.lock().clone()
        }
    }

    impl BenchmarkModule for ScriptedModule {
        type Conn = RecordingConnection;

        fn connection(&self) -> Result<RecordingConnection, DbError> {
            Ok(RecordingConnection {
                log: self.log.clone(),
                auto_commit: true,
                next_savepoint: 1,
            })
        }

        fn procedures(
            &self,
        ) -> HashMap<TransactionType, Arc<dyn Procedure<RecordingConnection>>> {
            let mut map: HashMap<TransactionType, Arc<dyn Procedure<RecordingConnection>>> =
                HashMap::new();
            map.insert(TransactionType::new(1, "Scripted"), self.procedure.clone());
            map
        }

        fn configuration(&self) -> &WorkloadConfiguration {
            &self.config
        }
    }

    /// Single transaction, single serial phase: the worker executes the
    /// scripted transaction exactly once, signals latency-complete, and
    /// parks until cool-down.
    pub fn scripted_config(db: &str) -> WorkloadConfiguration {
        WorkloadConfiguration::from_toml(&format!(
            r#"
db_type = "{db}"
terminals = 1
record_abort_messages = true
seed = 1

[[transaction]]
id = 1
name = "Scripted"

[[phase]]
time_secs = 60
serial = true
weights = [1]
"#
        ))
        .unwrap()
    }

    /// Drive a single worker through the scripted run and hand back its
    /// result. Panics if the scenario does not settle within 5 seconds.
    pub fn run_scenario(
        state: Arc<WorkloadState>,
        module: Arc<ScriptedModule>,
    ) -> Result<WorkerOutput, WorkerError> {
        let catalog = Arc::new(
            TransactionCatalog::build(
                &module.configuration().transaction_types(),
                module.procedures(),
            )
            .unwrap(),
        );
        let phase = Arc::new(Phase::from_config(1, &module.configuration().phases[0]));
        let worker = Worker::new(0, module, state.clone(), catalog);
        let join = thread::spawn(move || worker.run());

        state.begin_phase(phase, false);
        state.signal_start();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match state.global_state() {
                GlobalState::LatencyComplete | GlobalState::Done | GlobalState::Exit => break,
                _ => {}
            }
            if state.failed_workers() > 0 {
                break;
            }
            assert!(Instant::now() < deadline, "scenario did not settle");
            thread::sleep(Duration::from_millis(2));
        }
        state.start_cool_down();
        join.join().expect("worker thread panicked")
    }

    pub fn db_err(code: i32, sql_state: &str) -> Step {
        let sql_state = sql_state.to_string();
        Box::new(move || Err(DbError::new(code, sql_state, "scripted failure").into()))
    }

    pub fn success() -> Step {
        Box::new(|| Ok(TransactionStatus::Success))
    }
}

mod worker_scenarios {
    use std::sync::Arc;

    use shrike_common::error::{ProcedureError, WorkerError};
    use shrike_common::types::TransactionType;

    use crate::state::WorkloadState;

    use super::support::*;

    fn txn() -> TransactionType {
        TransactionType::new(1, "Scripted")
    }

    // Postgres, MEASURE, success on the first attempt: one savepoint
    // created and released, one commit, one success, one sample.
    #[test]
    fn test_happy_path_postgres() {
        let state = Arc::new(WorkloadState::new(1));
        let module = Arc::new(ScriptedModule::new(scripted_config("postgres"), vec![success()]));

        let output = run_scenario(state, module.clone()).unwrap();

        assert_eq!(
            module.ops(),
            vec![
                Op::SetAutoCommit(false),
                Op::SetIsolation,
                Op::SetSavepoint(None),
                Op::ReleaseSavepoint,
                Op::Commit,
                Op::SetAutoCommit(true),
            ]
        );
        assert_eq!(output.stats.success.get(&txn()), 1);
        assert_eq!(output.stats.abort.total(), 0);
        assert_eq!(output.stats.retry.total(), 0);
        assert_eq!(output.stats.errors.total(), 0);
        assert_eq!(output.latencies.len(), 1);
        let sample = output.latencies.iter().next().unwrap();
        assert!(sample.end_ns >= sample.start_ns);
        assert_eq!(sample.type_id, 1);
        assert_eq!(sample.phase_id, 1);
        assert_eq!(sample.worker_id, 0);
    }

    // CockroachDB uses its well-known savepoint name.
    #[test]
    fn test_cockroach_savepoint_name() {
        let state = Arc::new(WorkloadState::new(1));
        let module = Arc::new(ScriptedModule::new(
            scripted_config("cockroachdb"),
            vec![success()],
        ));

        let output = run_scenario(state, module.clone()).unwrap();

        assert!(module
            .ops()
            .contains(&Op::SetSavepoint(Some("cockroach_restart".into()))));
        assert_eq!(output.stats.success.get(&txn()), 1);
    }

    // MySQL deadlock twice, then success: two rollbacks and one commit,
    // two retries, two errors, one success, one sample.
    #[test]
    fn test_mysql_deadlock_retry() {
        let state = Arc::new(WorkloadState::new(1));
        let module = Arc::new(ScriptedModule::new(
            scripted_config("mysql"),
            vec![db_err(1213, "40001"), db_err(1213, "40001"), success()],
        ));

        let output = run_scenario(state, module.clone()).unwrap();

        assert_eq!(
            module.ops(),
            vec![
                Op::SetAutoCommit(false),
                Op::SetIsolation,
                Op::Rollback,
                Op::Rollback,
                Op::Commit,
                Op::SetAutoCommit(true),
            ]
        );
        assert_eq!(output.stats.retry.get(&txn()), 2);
        assert_eq!(output.stats.errors.get(&txn()), 2);
        assert_eq!(output.stats.success.get(&txn()), 1);
        assert_eq!(output.latencies.len(), 1);
    }

    // Oracle serialization failure on every attempt: three rollbacks,
    // retry budget exhausted, no sample, worker proceeds normally.
    #[test]
    fn test_oracle_retry_exhaustion() {
        let state = Arc::new(WorkloadState::new(1));
        let module = Arc::new(ScriptedModule::new(
            scripted_config("oracle"),
            vec![
                db_err(8177, "72000"),
                db_err(8177, "72000"),
                db_err(8177, "72000"),
            ],
        ));

        let output = run_scenario(state, module.clone()).unwrap();

        let rollbacks = module
            .ops()
            .iter()
            .filter(|op| **op == Op::Rollback)
            .count();
        assert_eq!(rollbacks, 3);
        assert!(!module.ops().contains(&Op::Commit));
        assert_eq!(output.stats.errors.get(&txn()), 3);
        assert_eq!(output.stats.retry.get(&txn()), 3);
        assert_eq!(output.stats.success.total(), 0);
        assert!(output.latencies.is_empty());
    }

    // Benchmark-intentional abort with message recording: rolled back to
    // the savepoint, bucketed under the truncated message, never retried.
    #[test]
    fn test_user_abort_with_message_recording() {
        let state = Arc::new(WorkloadState::new(1));
        let module = Arc::new(ScriptedModule::new(
            scripted_config("postgres"),
            vec![Box::new(|| {
                Err(ProcedureError::UserAbort("item_not_found_in_stock".into()))
            })],
        ));

        let output = run_scenario(state, module.clone()).unwrap();

        assert_eq!(
            module.ops(),
            vec![
                Op::SetAutoCommit(false),
                Op::SetIsolation,
                Op::SetSavepoint(None),
                Op::RollbackTo,
                Op::SetAutoCommit(true),
            ]
        );
        assert_eq!(output.stats.abort.get(&txn()), 1);
        assert_eq!(output.stats.retry.total(), 0);
        let messages = output.stats.abort_messages.get(&txn()).unwrap();
        assert_eq!(messages.get(&"item_not_found_in_st…".to_string()), 1);
        assert!(output.latencies.is_empty());
    }

    // The run state advances mid-execution: the outcome still counts but
    // the sample is discarded.
    #[test]
    fn test_phase_transition_mid_execution_drops_sample() {
        let state = Arc::new(WorkloadState::new(1));
        let mid_state = state.clone();
        let module = Arc::new(ScriptedModule::new(
            scripted_config("postgres"),
            vec![Box::new(move || {
                mid_state.start_cool_down();
                Ok(shrike_common::types::TransactionStatus::Success)
            })],
        ));

        let output = run_scenario(state, module.clone()).unwrap();

        assert_eq!(output.stats.success.get(&txn()), 1);
        assert!(output.latencies.is_empty());
        assert!(module.ops().contains(&Op::Commit));
    }

    // Statement cancelled by the driver (SQLSTATE 57014): the attempt is
    // discarded, counted as a retry, no sample.
    #[test]
    fn test_cancelled_statement_retries_different() {
        let state = Arc::new(WorkloadState::new(1));
        let module = Arc::new(ScriptedModule::new(
            scripted_config("postgres"),
            vec![db_err(0, "57014")],
        ));

        let output = run_scenario(state, module.clone()).unwrap();

        assert_eq!(
            module.ops(),
            vec![
                Op::SetAutoCommit(false),
                Op::SetIsolation,
                Op::SetSavepoint(None),
                Op::RollbackTo,
            ]
        );
        assert_eq!(output.stats.retry.get(&txn()), 1);
        assert_eq!(output.stats.errors.get(&txn()), 1);
        assert_eq!(output.stats.success.total(), 0);
        assert!(output.latencies.is_empty());
    }

    // Postgres out-of-memory is fatal: the worker dies and reports it.
    #[test]
    fn test_postgres_oom_is_fatal() {
        let state = Arc::new(WorkloadState::new(1));
        let module = Arc::new(ScriptedModule::new(
            scripted_config("postgres"),
            vec![db_err(0, "53200")],
        ));

        let err = run_scenario(state.clone(), module).unwrap_err();
        assert!(matches!(err, WorkerError::Db { .. }));
        assert_eq!(state.failed_workers(), 1);
    }

    // A non-database failure inside the procedure kills the worker.
    #[test]
    fn test_environmental_failure_is_fatal() {
        let state = Arc::new(WorkloadState::new(1));
        let module = Arc::new(ScriptedModule::new(
            scripted_config("postgres"),
            vec![Box::new(|| {
                Err(ProcedureError::Fatal("index out of bounds".into()))
            })],
        ));

        let err = run_scenario(state.clone(), module).unwrap_err();
        assert!(matches!(err, WorkerError::Fatal { .. }));
        assert_eq!(state.failed_workers(), 1);
    }

    // An unrecognized error pairing is logged and conservatively retried.
    #[test]
    fn test_unknown_error_retries() {
        let state = Arc::new(WorkloadState::new(1));
        let module = Arc::new(ScriptedModule::new(
            scripted_config("postgres"),
            vec![db_err(9999, "99999"), success()],
        ));

        let output = run_scenario(state, module).unwrap();
        assert_eq!(output.stats.retry.get(&txn()), 1);
        assert_eq!(output.stats.errors.get(&txn()), 1);
        assert_eq!(output.stats.success.get(&txn()), 1);
        assert_eq!(output.latencies.len(), 1);
    }

    // A driver that drops the SQLSTATE entirely is treated the same way.
    #[test]
    fn test_missing_sqlstate_retries() {
        let state = Arc::new(WorkloadState::new(1));
        let module = Arc::new(ScriptedModule::new(
            scripted_config("mysql"),
            vec![
                Box::new(|| {
                    Err(shrike_common::error::DbError::stateless(-1, "connection reset").into())
                }),
                success(),
            ],
        ));

        let output = run_scenario(state, module).unwrap();
        assert_eq!(output.stats.retry.get(&txn()), 1);
        assert_eq!(output.stats.success.get(&txn()), 1);
    }
}

mod pool_integration {
    use std::sync::Arc;
    use std::time::Duration;

    use shrike_common::config::WorkloadConfiguration;
    use shrike_common::error::HarnessError;
    use shrike_common::types::TransactionType;

    use crate::driver::{Driver, DriverOptions};
    use crate::memdb::MemBenchmark;

    use super::support::{db_err, scripted_config, ScriptedModule};

    fn mem_config(extra: &str) -> WorkloadConfiguration {
        WorkloadConfiguration::from_toml(&format!(
            r#"
db_type = "mem"
terminals = 2
record_abort_messages = true
seed = 99

[[transaction]]
id = 1
name = "ReadRecord"

[[transaction]]
id = 2
name = "UpdateRecord"

{extra}
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_throughput_run_end_to_end() {
        let config = mem_config(
            r#"
[[phase]]
time_secs = 1
rate = 2000
weights = [1, 1]
"#,
        );
        let module = Arc::new(MemBenchmark::with_abort_pct(config, 0));
        module.create();
        module.load(256);

        let driver = Driver::with_options(
            module,
            DriverOptions {
                monitor_interval: Some(Duration::from_millis(100)),
            },
        );
        let results = driver.run().unwrap();

        assert!(results.measured_requests() > 0);
        assert_eq!(results.errors.total(), 0);
        assert_eq!(results.abort.total(), 0);
        // Samples are the success outcomes whose measurement window held.
        assert!(results.measured_requests() <= results.success.total());
        assert!(results.completed_work >= results.measured_requests());
        // Interval samples never overcount the recorded samples.
        let monitored: u64 = results.throughput.iter().map(|p| p.requests).sum();
        assert!(monitored <= results.measured_requests());
        for sample in &results.samples {
            assert!(sample.end_ns >= sample.start_ns);
            assert_eq!(sample.phase_id, 1);
        }
    }

    #[test]
    fn test_rate_limited_run_bounds_submissions() {
        let mut config = mem_config(
            r#"
[[phase]]
time_secs = 1
rate = 40
weights = [1, 0]
"#,
        );
        config.terminals = 1;
        let module = Arc::new(MemBenchmark::with_abort_pct(config, 0));
        module.load(64);

        let driver = Driver::with_options(module, DriverOptions { monitor_interval: None });
        let results = driver.run().unwrap();

        assert!(results.measured_requests() >= 1);
        // At 40 tx/s over one second the driver cannot have submitted more
        // than ~40 units, plus scheduling slack.
        assert!(
            results.measured_requests() <= 50,
            "measured {} requests",
            results.measured_requests()
        );
    }

    #[test]
    fn test_serial_latency_run_measures_each_query_once() {
        let mut config = mem_config(
            r#"
[[phase]]
time_secs = 30
serial = true
weights = [1, 1]
"#,
        );
        config.terminals = 1;
        let module = Arc::new(MemBenchmark::with_abort_pct(config, 0));
        module.load(64);

        let driver = Driver::with_options(module, DriverOptions { monitor_interval: None });
        let results = driver.run().unwrap();

        // One hot sample per enabled query.
        assert_eq!(results.measured_requests(), 2);
        let ids: Vec<i32> = results.samples.iter().map(|s| s.type_id).collect();
        assert_eq!(ids, vec![1, 2]);
        // The second query also ran cold, unrecorded.
        assert_eq!(results.success.total(), 3);
        // Finished long before the 30s cap.
        assert!(results.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn test_abort_messages_truncated_and_counted() {
        let mut config = mem_config(
            r#"
[[phase]]
time_secs = 30
serial = true
weights = [0, 1]
"#,
        );
        config.terminals = 1;
        let module = Arc::new(MemBenchmark::with_abort_pct(config, 100));
        module.load(64);

        let driver = Driver::with_options(module, DriverOptions { monitor_interval: None });
        let results = driver.run().unwrap();

        assert_eq!(results.abort.total(), 1);
        assert!(results.measured_requests() == 0);
        let update = TransactionType::new(2, "UpdateRecord");
        let messages = results.abort_messages.get(&update).unwrap();
        assert_eq!(messages.total(), 1);
        for (msg, _) in messages.iter() {
            assert_eq!(msg, "insufficient funds f…");
        }
    }

    #[test]
    fn test_fatal_worker_fails_the_run() {
        let mut config = scripted_config("postgres");
        config.phases[0].serial = false;
        config.phases[0].time_secs = 30;
        let module = Arc::new(ScriptedModule::new(
            config,
            vec![db_err(0, "53200")],
        ));

        let driver = Driver::with_options(module, DriverOptions { monitor_interval: None });
        let err = driver.run().unwrap_err();
        assert!(matches!(err, HarnessError::Worker(_)));
    }

    #[test]
    fn test_warmup_then_measure_records_only_measured_window() {
        let mut config = mem_config(
            r#"
[[phase]]
time_secs = 1
warmup_secs = 1
rate = 200
weights = [1, 1]
"#,
        );
        config.terminals = 1;
        let module = Arc::new(MemBenchmark::with_abort_pct(config, 0));
        module.load(64);

        let driver = Driver::with_options(module, DriverOptions { monitor_interval: None });
        let results = driver.run().unwrap();

        // Work ran for ~2s but only the measured second produced samples.
        assert!(results.measured_requests() > 0);
        assert!(results.success.total() > results.measured_requests());
        assert!(results.elapsed >= Duration::from_secs(2));
    }
}
