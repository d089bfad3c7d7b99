//! Workload configuration, loaded from TOML by the CLI.
//!
//! ```toml
//! db_type = "postgres"
//! isolation = "serializable"
//! terminals = 8
//! record_abort_messages = true
//!
//! [[transaction]]
//! id = 1
//! name = "ReadRecord"
//!
//! [[transaction]]
//! id = 2
//! name = "UpdateRecord"
//!
//! [[phase]]
//! time_secs = 60
//! warmup_secs = 10
//! rate = 1000          # target txn/s; omit for unlimited
//! weights = [80, 20]
//!
//! [[phase]]
//! time_secs = 30
//! serial = true        # latency run: each enabled query once, in order
//! weights = [1, 1]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{DatabaseType, IsolationMode, TransactionType};

/// Everything the harness needs to know about a run: target DBMS,
/// isolation, terminal count, the transaction registry, and the phase
/// schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfiguration {
    pub db_type: DatabaseType,

    #[serde(default = "default_isolation")]
    pub isolation: IsolationMode,

    /// Number of concurrent worker threads (terminals).
    #[serde(default = "default_terminals")]
    pub terminals: usize,

    /// When set, user-abort messages are bucketed (truncated) per
    /// transaction type.
    #[serde(default)]
    pub record_abort_messages: bool,

    /// RNG seed for the transaction-mix draw. Omit for a per-run random
    /// seed; set for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(rename = "transaction")]
    pub transactions: Vec<TransactionDef>,

    #[serde(rename = "phase")]
    pub phases: Vec<PhaseConfig>,
}

fn default_isolation() -> IsolationMode {
    IsolationMode::Serializable
}

fn default_terminals() -> usize {
    1
}

/// One declared transaction type. Ids must be contiguous from 1 so that
/// phase weight vectors can be positional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDef {
    pub id: i32,
    pub name: String,
}

/// One phase of the schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Measured duration in seconds. For serial phases this is an upper
    /// bound; the phase ends early when the query list is exhausted.
    pub time_secs: u64,

    /// Unmeasured warm-up applied before the measurement window.
    #[serde(default)]
    pub warmup_secs: u64,

    /// Target submission rate in transactions per second. Absent means
    /// unlimited: workers pull work as fast as they can.
    #[serde(default)]
    pub rate: Option<u64>,

    /// Mix weights, positional over the declared transactions.
    pub weights: Vec<u64>,

    /// Serial latency run: execute each enabled transaction once, in
    /// declaration order, measuring cold and hot latencies.
    #[serde(default)]
    pub serial: bool,
}

impl WorkloadConfiguration {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The declared transaction types, in id order.
    pub fn transaction_types(&self) -> Vec<TransactionType> {
        self.transactions
            .iter()
            .map(|t| TransactionType::new(t.id, t.name.clone()))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.terminals == 0 {
            return Err(ConfigError::NoTerminals);
        }
        if self.transactions.is_empty() {
            return Err(ConfigError::NoTransactions);
        }
        if self.phases.is_empty() {
            return Err(ConfigError::NoPhases);
        }

        let mut seen_names = std::collections::HashSet::new();
        for (pos, t) in self.transactions.iter().enumerate() {
            if t.id != pos as i32 + 1 {
                return Err(ConfigError::NonContiguousIds {
                    found: t.id,
                    position: pos,
                });
            }
            if !seen_names.insert(t.name.as_str()) {
                return Err(ConfigError::DuplicateName(t.name.clone()));
            }
        }

        for (idx, phase) in self.phases.iter().enumerate() {
            if phase.weights.len() != self.transactions.len() {
                return Err(ConfigError::WeightArity {
                    phase: idx + 1,
                    weights: phase.weights.len(),
                    transactions: self.transactions.len(),
                });
            }
            if phase.weights.iter().all(|w| *w == 0) {
                return Err(ConfigError::ZeroWeights { phase: idx + 1 });
            }
            if phase.rate == Some(0) {
                return Err(ConfigError::ZeroRate { phase: idx + 1 });
            }
        }
        Ok(())
    }
}
