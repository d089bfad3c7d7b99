//! The worker-pool driver: spawns the terminals, walks the phase
//! schedule, samples live throughput, and aggregates results.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use shrike_common::error::{HarnessError, HarnessResult};
use shrike_common::histogram::Histogram;
use shrike_common::types::{GlobalState, TransactionType};

use crate::catalog::TransactionCatalog;
use crate::latency::Sample;
use crate::module::BenchmarkModule;
use crate::phase::{Phase, Rate};
use crate::signal::StopSignal;
use crate::state::WorkloadState;
use crate::worker::{Worker, WorkerHandle, WorkerOutput};

/// Latency percentiles in microseconds over a set of samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub max_us: u64,
}

fn summarize(mut latencies_us: Vec<u64>) -> LatencySummary {
    if latencies_us.is_empty() {
        return LatencySummary::default();
    }
    latencies_us.sort_unstable();
    let n = latencies_us.len();
    LatencySummary {
        count: n as u64,
        p50_us: latencies_us[n * 50 / 100],
        p95_us: latencies_us[std::cmp::min(n * 95 / 100, n - 1)],
        p99_us: latencies_us[std::cmp::min(n * 99 / 100, n - 1)],
        p999_us: latencies_us[std::cmp::min(n * 999 / 1000, n - 1)],
        max_us: latencies_us[n - 1],
    }
}

/// One interval sample from the throughput monitor: how many measured
/// requests completed across all workers since the previous sample.
#[derive(Debug, Clone, Copy)]
pub struct ThroughputPoint {
    pub elapsed: Duration,
    pub requests: u64,
}

/// Aggregated outcome of a run.
#[derive(Debug)]
pub struct BenchmarkResults {
    pub elapsed: Duration,
    /// All phase-gated latency samples, merged across workers in
    /// submission order.
    pub samples: Vec<Sample>,
    pub success: Histogram<TransactionType>,
    pub abort: Histogram<TransactionType>,
    pub retry: Histogram<TransactionType>,
    pub errors: Histogram<TransactionType>,
    pub abort_messages: HashMap<TransactionType, Histogram<String>>,
    pub throughput: Vec<ThroughputPoint>,
    /// Work units completed, measured or not.
    pub completed_work: u64,
}

impl BenchmarkResults {
    pub fn measured_requests(&self) -> u64 {
        self.samples.len() as u64
    }

    /// Measured requests per second over the whole run.
    pub fn requests_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.samples.len() as f64 / secs
        } else {
            0.0
        }
    }

    /// Percentiles over every recorded sample.
    pub fn latency_summary(&self) -> LatencySummary {
        summarize(
            self.samples
                .iter()
                .map(|s| (s.latency_ns() / 1_000) as u64)
                .collect(),
        )
    }

    /// Percentiles for one transaction type.
    pub fn latency_summary_for(&self, type_id: i32) -> LatencySummary {
        summarize(
            self.samples
                .iter()
                .filter(|s| s.type_id == type_id)
                .map(|s| (s.latency_ns() / 1_000) as u64)
                .collect(),
        )
    }

    /// JSON rendering for machine-readable export.
    pub fn to_json(&self) -> serde_json::Value {
        let per_txn = |h: &Histogram<TransactionType>| {
            let mut map = serde_json::Map::new();
            for (txn, n) in h.iter() {
                map.insert(txn.name().to_string(), n.into());
            }
            serde_json::Value::Object(map)
        };
        let lat = self.latency_summary();
        let abort_messages: serde_json::Map<String, serde_json::Value> = self
            .abort_messages
            .iter()
            .map(|(txn, h)| {
                let buckets: serde_json::Map<String, serde_json::Value> =
                    h.iter().map(|(msg, n)| (msg.clone(), n.into())).collect();
                (
                    txn.name().to_string(),
                    serde_json::Value::Object(buckets),
                )
            })
            .collect();
        serde_json::json!({
            "elapsed_ms": self.elapsed.as_millis() as u64,
            "measured_requests": self.measured_requests(),
            "completed_work": self.completed_work,
            "requests_per_sec": self.requests_per_sec(),
            "success": per_txn(&self.success),
            "abort": per_txn(&self.abort),
            "retry": per_txn(&self.retry),
            "errors": per_txn(&self.errors),
            "abort_messages": abort_messages,
            "latency_us": {
                "count": lat.count,
                "p50": lat.p50_us,
                "p95": lat.p95_us,
                "p99": lat.p99_us,
                "p999": lat.p999_us,
                "max": lat.max_us,
            },
        })
    }
}

/// Driver knobs that are not part of the workload itself.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Cadence of the live throughput monitor; `None` disables it.
    pub monitor_interval: Option<Duration>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            monitor_interval: Some(Duration::from_secs(1)),
        }
    }
}

/// Orchestrates one benchmark run end to end.
pub struct Driver<B: BenchmarkModule> {
    module: Arc<B>,
    options: DriverOptions,
}

impl<B: BenchmarkModule> Driver<B> {
    pub fn new(module: Arc<B>) -> Self {
        Self::with_options(module, DriverOptions::default())
    }

    pub fn with_options(module: Arc<B>, options: DriverOptions) -> Self {
        Self { module, options }
    }

    /// Run the configured phase schedule to completion and aggregate
    /// per-worker results. Returns an error if any worker died fatally.
    pub fn run(&self) -> HarnessResult<BenchmarkResults> {
        let config = self.module.configuration();
        config.validate()?;
        let terminals = config.terminals;

        let phases: Vec<Arc<Phase>> = config
            .phases
            .iter()
            .enumerate()
            .map(|(idx, pc)| Arc::new(Phase::from_config(idx + 1, pc)))
            .collect();

        let state = Arc::new(WorkloadState::new(terminals));
        let catalog = Arc::new(TransactionCatalog::build(
            &config.transaction_types(),
            self.module.procedures(),
        )?);

        let mut handles = Vec::with_capacity(terminals);
        let mut joins = Vec::with_capacity(terminals);
        for id in 0..terminals {
            let worker = Worker::new(id, self.module.clone(), state.clone(), catalog.clone());
            handles.push(worker.handle());
            let join = thread::Builder::new()
                .name(format!("worker-{id:03}"))
                .spawn(move || worker.run())
                .expect("spawn worker thread");
            joins.push(join);
        }
        let handles = Arc::new(handles);

        let monitor_stop = StopSignal::new();
        let monitor = self.options.monitor_interval.map(|interval| {
            let stop = monitor_stop.clone();
            let handles = handles.clone();
            thread::Builder::new()
                .name("throughput-monitor".into())
                .spawn(move || monitor_loop(interval, stop, handles.as_slice()))
                .expect("spawn monitor thread")
        });

        info!(terminals, phases = phases.len(), "starting benchmark");
        let started = Instant::now();
        state.signal_start();

        for phase in &phases {
            if state.failed_workers() > 0 {
                break;
            }
            info!(
                phase = phase.id(),
                serial = phase.is_latency_run(),
                "starting phase"
            );

            let warm = phase.warmup() > Duration::ZERO;
            state.begin_phase(phase.clone(), warm);
            if warm {
                if self.drive_window(&state, phase, phase.warmup()) {
                    break;
                }
                state.start_measure();
            }

            let aborted = if phase.is_latency_run() {
                self.await_latency_complete(&state, phase.duration())
            } else {
                self.drive_window(&state, phase, phase.duration())
            };
            if aborted {
                break;
            }

            // Advancing state: interrupt whatever the workers are running.
            for handle in handles.iter() {
                handle.cancel_statement();
            }
            state.between_phases();
        }

        state.start_cool_down();
        for handle in handles.iter() {
            handle.cancel_statement();
        }

        monitor_stop.stop();
        let throughput = match monitor {
            Some(join) => join.join().map_err(|_| HarnessError::WorkerPanic)?,
            None => Vec::new(),
        };

        let mut outputs: Vec<WorkerOutput> = Vec::with_capacity(terminals);
        let mut first_error: Option<HarnessError> = None;
        for join in joins {
            match join.join() {
                Ok(Ok(output)) => outputs.push(output),
                Ok(Err(e)) => {
                    error!(error = %e, "worker failed");
                    first_error.get_or_insert(HarnessError::Worker(e));
                }
                Err(_) => {
                    error!("worker thread panicked");
                    first_error.get_or_insert(HarnessError::WorkerPanic);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let elapsed = started.elapsed();
        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            completed = state.completed(),
            "benchmark finished"
        );
        Ok(aggregate(outputs, elapsed, throughput, state.completed()))
    }

    /// Hold the current window open for `window`, feeding the submission
    /// queue when the phase is rate-limited. Returns `true` when the run
    /// should abort because a worker died.
    fn drive_window(&self, state: &Arc<WorkloadState>, phase: &Arc<Phase>, window: Duration) -> bool {
        let started = Instant::now();
        let end = started + window;
        let mut submitted: u64 = 0;
        loop {
            if state.failed_workers() > 0 {
                warn!("worker failure detected; ending run early");
                return true;
            }
            let now = Instant::now();
            if now >= end {
                return false;
            }
            if let Rate::PerSecond(rate) = phase.rate() {
                let due = (now.duration_since(started).as_secs_f64() * rate as f64) as u64;
                if due > submitted {
                    state.submit_work((due - submitted) as usize);
                    submitted = due;
                }
            }
            let tick = std::cmp::min(Duration::from_millis(5), end - now);
            thread::sleep(tick);
        }
    }

    /// Wait for the workers to finish a serial latency run, bounded by
    /// the phase duration. Returns `true` when the run should abort.
    fn await_latency_complete(&self, state: &Arc<WorkloadState>, cap: Duration) -> bool {
        let end = Instant::now() + cap;
        loop {
            if state.failed_workers() > 0 {
                warn!("worker failure detected; ending run early");
                return true;
            }
            if state.global_state() == GlobalState::LatencyComplete {
                return false;
            }
            if Instant::now() >= end {
                warn!("serial phase hit its time cap before completing");
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

fn monitor_loop(
    interval: Duration,
    stop: StopSignal,
    handles: &[WorkerHandle],
) -> Vec<ThroughputPoint> {
    let started = Instant::now();
    let mut points = Vec::new();
    loop {
        if stop.wait_timeout(interval) {
            return points;
        }
        let requests: u64 = handles
            .iter()
            .map(|h| h.get_and_reset_interval_requests())
            .sum();
        let elapsed = started.elapsed();
        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            requests,
            tps = requests as f64 / interval.as_secs_f64(),
            "interval throughput"
        );
        points.push(ThroughputPoint { elapsed, requests });
    }
}

fn aggregate(
    outputs: Vec<WorkerOutput>,
    elapsed: Duration,
    throughput: Vec<ThroughputPoint>,
    completed_work: u64,
) -> BenchmarkResults {
    let mut success = Histogram::new();
    let mut abort = Histogram::new();
    let mut retry = Histogram::new();
    let mut errors = Histogram::new();
    let mut abort_messages: HashMap<TransactionType, Histogram<String>> = HashMap::new();
    let mut samples = Vec::new();

    for output in outputs {
        success.merge(&output.stats.success);
        abort.merge(&output.stats.abort);
        retry.merge(&output.stats.retry);
        errors.merge(&output.stats.errors);
        for (txn, h) in &output.stats.abort_messages {
            abort_messages.entry(txn.clone()).or_default().merge(h);
        }
        samples.extend(output.latencies.iter().copied());
    }
    samples.sort_by_key(|s| s.start_ns);

    BenchmarkResults {
        elapsed,
        samples,
        success,
        abort,
        retry,
        errors,
        abort_messages,
        throughput,
        completed_work,
    }
}
