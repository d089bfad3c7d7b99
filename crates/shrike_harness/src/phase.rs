//! Runtime representation of one phase of the schedule.

use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;

use shrike_common::config::PhaseConfig;

/// Target submission rate for a throughput phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rate {
    /// Workers pull work as fast as they can.
    Unlimited,
    /// The driver submits this many transactions per second.
    PerSecond(u64),
}

/// Continuous load vs. serial one-shot latency measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Throughput,
    Latency,
}

/// A contiguous interval of the run with a fixed mix, rate, and
/// semantics. Shared read-only across workers; the serial cursor is the
/// only mutable part.
pub struct Phase {
    id: usize,
    kind: PhaseKind,
    rate: Rate,
    weights: Vec<u64>,
    weight_total: u64,
    /// Enabled transaction ids in declaration order, walked once per
    /// serial run.
    serial_order: Vec<i32>,
    serial_cursor: Mutex<usize>,
    duration: Duration,
    warmup: Duration,
}

impl Phase {
    /// `id` is 1-based and unique across the schedule.
    pub fn from_config(id: usize, cfg: &PhaseConfig) -> Self {
        let serial_order = cfg
            .weights
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0)
            .map(|(pos, _)| pos as i32 + 1)
            .collect();
        Self {
            id,
            kind: if cfg.serial {
                PhaseKind::Latency
            } else {
                PhaseKind::Throughput
            },
            rate: match cfg.rate {
                Some(r) => Rate::PerSecond(r),
                None => Rate::Unlimited,
            },
            weight_total: cfg.weights.iter().sum(),
            weights: cfg.weights.clone(),
            serial_order,
            serial_cursor: Mutex::new(0),
            duration: Duration::from_secs(cfg.time_secs),
            warmup: Duration::from_secs(cfg.warmup_secs),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn warmup(&self) -> Duration {
        self.warmup
    }

    pub fn is_latency_run(&self) -> bool {
        self.kind == PhaseKind::Latency
    }

    pub fn is_throughput_run(&self) -> bool {
        self.kind == PhaseKind::Throughput
    }

    /// Weighted draw over the mix. Transaction ids are positional: weight
    /// `k` belongs to type id `k + 1`.
    pub fn choose_transaction(&self, rng: &mut StdRng) -> i32 {
        debug_assert!(self.weight_total > 0);
        let mut roll = rng.gen_range(0..self.weight_total);
        for (pos, w) in self.weights.iter().enumerate() {
            if roll < *w {
                return pos as i32 + 1;
            }
            roll -= w;
        }
        // Unreachable while weight_total equals the sum of weights.
        self.weights.len() as i32
    }

    /// Next transaction id in the serial order, or `None` when the list
    /// is exhausted. A cold fetch peeks without advancing so the same
    /// query can run cold and then hot.
    pub fn next_serial(&self, cold: bool) -> Option<i32> {
        let mut cursor = self.serial_cursor.lock();
        let id = self.serial_order.get(*cursor).copied()?;
        if !cold {
            *cursor += 1;
        }
        Some(id)
    }

    /// Rewind the serial cursor; warm-up wraps around the list.
    pub fn reset_serial(&self) {
        *self.serial_cursor.lock() = 0;
    }
}
