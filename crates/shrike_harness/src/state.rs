//! The shared workload state machine: global phase controller and work
//! dispatcher for every worker in the pool.
//!
//! One instance is shared by the driver and all workers. The driver
//! advances phases and signals start/cool-down; workers fetch work,
//! acknowledge completion, and trigger the serial-phase transitions
//! (cold/hot query, latency-complete). All mutation happens under one
//! mutex, which gives the dispatch guarantees the worker loop relies on:
//! phase transitions become visible to a worker at most one fetch late,
//! `Done` is persistent once observed (it only ever advances to `Exit`),
//! and concurrent `fetch_work` calls hand out disjoint work units.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;

use shrike_common::types::GlobalState;

use crate::phase::{Phase, Rate};

/// One scheduled unit of work. `start_ns` is stamped when the work was
/// *submitted*, not fetched, so recorded latency includes queue delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedProcedure {
    pub type_id: i32,
    pub start_ns: i64,
}

/// What `fetch_work` handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    Work(SubmittedProcedure),
    /// A serial phase ran out of queries. The worker decides whether to
    /// wrap (warm-up) or declare the latency run complete.
    EndOfSerial,
    /// Nothing to dispatch: the run is winding down or no phase is
    /// active. The worker loops and re-checks.
    Stalled,
}

struct Inner {
    global: GlobalState,
    started: bool,
    phase: Option<Arc<Phase>>,
    /// Submission timestamps for rate-limited work, oldest first.
    queue: VecDeque<i64>,
    workers_remaining: usize,
    failed_workers: usize,
    completed: u64,
}

/// Shared phase controller and work dispatcher.
pub struct WorkloadState {
    inner: Mutex<Inner>,
    cond: Condvar,
    test_start: Instant,
}

impl WorkloadState {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                global: GlobalState::Warmup,
                started: false,
                phase: None,
                queue: VecDeque::new(),
                workers_remaining: workers,
                failed_workers: 0,
                completed: 0,
            }),
            cond: Condvar::new(),
            test_start: Instant::now(),
        }
    }

    /// Monotonic nanoseconds since the shared test-start base.
    pub fn now_ns(&self) -> i64 {
        self.test_start.elapsed().as_nanos() as i64
    }

    // ── Worker-side operations ──────────────────────────────────────────

    /// Park until the driver signals the run has begun. No worker
    /// proceeds past this before `signal_start`.
    pub fn block_for_start(&self) {
        let mut inner = self.inner.lock();
        while !inner.started {
            self.cond.wait(&mut inner);
        }
    }

    /// Sleep until there is plausibly work to do or the run state moved.
    /// Returns with no guarantee that work is available; callers re-check.
    pub fn stay_awake(&self) {
        let mut inner = self.inner.lock();
        while !Self::runnable(&inner) {
            self.cond.wait(&mut inner);
        }
    }

    fn runnable(inner: &Inner) -> bool {
        match inner.global {
            // Workers must wake to observe the end of the run.
            GlobalState::Done | GlobalState::Exit => true,
            // Parked until the driver advances past the finished serial run.
            GlobalState::LatencyComplete => false,
            _ => match &inner.phase {
                None => false,
                Some(phase) => {
                    if phase.is_latency_run() {
                        true
                    } else {
                        match phase.rate() {
                            Rate::Unlimited => true,
                            Rate::PerSecond(_) => !inner.queue.is_empty(),
                        }
                    }
                }
            },
        }
    }

    /// Take the next unit of work, blocking while a rate-limited queue is
    /// empty. Safe under concurrent callers; each work unit is handed out
    /// exactly once.
    pub fn fetch_work(&self, rng: &mut StdRng) -> Fetched {
        let mut inner = self.inner.lock();
        loop {
            match inner.global {
                GlobalState::Done | GlobalState::Exit | GlobalState::LatencyComplete => {
                    return Fetched::Stalled;
                }
                _ => {}
            }
            let Some(phase) = inner.phase.clone() else {
                return Fetched::Stalled;
            };

            if phase.is_latency_run() {
                // A cold fetch replays the query the previous hot fetch
                // dispensed, so the cursor only advances on hot fetches.
                let cold = inner.global == GlobalState::ColdQuery;
                return match phase.next_serial(cold) {
                    Some(type_id) => Fetched::Work(SubmittedProcedure {
                        type_id,
                        start_ns: self.now_ns(),
                    }),
                    None => Fetched::EndOfSerial,
                };
            }

            match phase.rate() {
                Rate::Unlimited => {
                    return Fetched::Work(SubmittedProcedure {
                        type_id: phase.choose_transaction(rng),
                        start_ns: self.now_ns(),
                    });
                }
                Rate::PerSecond(_) => {
                    if let Some(start_ns) = inner.queue.pop_front() {
                        return Fetched::Work(SubmittedProcedure {
                            type_id: phase.choose_transaction(rng),
                            start_ns,
                        });
                    }
                    self.cond.wait(&mut inner);
                }
            }
        }
    }

    /// Acknowledge one completed work unit.
    pub fn finished_work(&self) {
        self.inner.lock().completed += 1;
    }

    /// Snapshot of the run state.
    pub fn global_state(&self) -> GlobalState {
        self.inner.lock().global
    }

    /// Snapshot of the active phase, `None` between phases.
    pub fn current_phase(&self) -> Option<Arc<Phase>> {
        self.inner.lock().phase.clone()
    }

    pub fn current_phase_id(&self) -> Option<usize> {
        self.inner.lock().phase.as_ref().map(|p| p.id())
    }

    /// Acknowledge `Done`. The last acknowledgement moves the run to
    /// `Exit`.
    pub fn signal_done(&self) {
        let mut inner = self.inner.lock();
        inner.workers_remaining = inner.workers_remaining.saturating_sub(1);
        if inner.workers_remaining == 0 {
            inner.global = GlobalState::Exit;
        }
        self.cond.notify_all();
    }

    /// Report a worker-fatal exit. Counts toward the acknowledgement
    /// total so the run can still reach `Exit`.
    pub fn worker_failed(&self) {
        let mut inner = self.inner.lock();
        inner.failed_workers += 1;
        inner.workers_remaining = inner.workers_remaining.saturating_sub(1);
        if inner.workers_remaining == 0 {
            inner.global = GlobalState::Exit;
        }
        self.cond.notify_all();
    }

    /// A serial phase finished its query list during measurement.
    /// Ignored unless measurement is actually in progress, so a late
    /// signal cannot clobber `Done`.
    pub fn signal_latency_complete(&self) {
        let mut inner = self.inner.lock();
        if matches!(
            inner.global,
            GlobalState::Measure | GlobalState::ColdQuery
        ) {
            inner.global = GlobalState::LatencyComplete;
        }
        self.cond.notify_all();
    }

    /// After a recorded hot query in a latency run: execute the next
    /// query cold.
    pub fn start_cold_query(&self) {
        let mut inner = self.inner.lock();
        if inner.global == GlobalState::Measure {
            inner.global = GlobalState::ColdQuery;
        }
        self.cond.notify_all();
    }

    /// After a cold execution: re-run the same query hot, measured.
    pub fn start_hot_query(&self) {
        let mut inner = self.inner.lock();
        if inner.global == GlobalState::ColdQuery {
            inner.global = GlobalState::Measure;
        }
        self.cond.notify_all();
    }

    // ── Driver-side operations ──────────────────────────────────────────

    /// Release every worker parked at the start barrier.
    pub fn signal_start(&self) {
        let mut inner = self.inner.lock();
        inner.started = true;
        self.cond.notify_all();
    }

    /// Install `phase` as the active phase. Entering a phase in warm-up
    /// discards results until `start_measure`.
    pub fn begin_phase(&self, phase: Arc<Phase>, warm: bool) {
        let mut inner = self.inner.lock();
        phase.reset_serial();
        inner.phase = Some(phase);
        inner.queue.clear();
        inner.global = if warm {
            GlobalState::Warmup
        } else {
            GlobalState::Measure
        };
        self.cond.notify_all();
    }

    /// Open the measurement window for the active phase. Serial phases
    /// restart their query list so the measured pass covers it exactly
    /// once.
    pub fn start_measure(&self) {
        let mut inner = self.inner.lock();
        if let Some(phase) = &inner.phase {
            if phase.is_latency_run() {
                phase.reset_serial();
            }
        }
        inner.global = GlobalState::Measure;
        self.cond.notify_all();
    }

    /// Deactivate the current phase; workers idle until the next one.
    pub fn between_phases(&self) {
        let mut inner = self.inner.lock();
        inner.phase = None;
        inner.queue.clear();
        self.cond.notify_all();
    }

    /// End the run. Workers observe `Done` once, acknowledge, and exit.
    pub fn start_cool_down(&self) {
        let mut inner = self.inner.lock();
        inner.global = GlobalState::Done;
        self.cond.notify_all();
    }

    /// Submit `count` rate-limited work units stamped with the current
    /// time. No-op outside an active rate-limited throughput phase.
    pub fn submit_work(&self, count: usize) {
        let mut inner = self.inner.lock();
        match inner.global {
            GlobalState::Done | GlobalState::Exit => return,
            _ => {}
        }
        let rate_limited = inner
            .phase
            .as_ref()
            .is_some_and(|p| p.is_throughput_run() && matches!(p.rate(), Rate::PerSecond(_)));
        if !rate_limited {
            return;
        }
        let now = self.now_ns();
        for _ in 0..count {
            inner.queue.push_back(now);
        }
        self.cond.notify_all();
    }

    /// Completed work units across all workers.
    pub fn completed(&self) -> u64 {
        self.inner.lock().completed
    }

    /// Work units submitted but not yet fetched (rate-limited phases).
    pub fn backlog(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn failed_workers(&self) -> usize {
        self.inner.lock().failed_workers
    }

    /// Workers that have not yet acknowledged the end of the run.
    pub fn workers_remaining(&self) -> usize {
        self.inner.lock().workers_remaining
    }
}
