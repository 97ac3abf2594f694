//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::graph::GraphOpts;
use crate::Result;

/// Configuration of a [`Scheduler`](super::Scheduler).
///
/// Every field is optional in the serialized form; missing fields take the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Keep processed transactions and node revisions in memory.
    pub record_transaction_history: bool,
    /// In minutes.
    pub transaction_history_age_limit: u32,
    /// In minutes; records from this period after start are never trimmed.
    pub permanently_recorded_init_period: u32,
    /// Simulate every NB transaction and SB notification before executing it.
    pub enable_txn_simulation: bool,
    /// Log a summary of every processed transaction.
    pub print_txn_summary: bool,
    pub txn_queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            record_transaction_history: true,
            transaction_history_age_limit: 24 * 60,
            permanently_recorded_init_period: 60,
            enable_txn_simulation: false,
            print_txn_summary: true,
            txn_queue_capacity: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn history_age_limit(&self) -> Duration {
        Duration::from_secs(u64::from(self.transaction_history_age_limit) * 60)
    }

    pub fn permanent_init_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.permanently_recorded_init_period) * 60)
    }

    pub fn graph_opts(&self) -> GraphOpts {
        GraphOpts {
            record_old_revs: self.record_transaction_history,
            record_age_limit: self.history_age_limit(),
            permanent_init_period: self.permanent_init_period(),
            ..GraphOpts::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_for_missing_fields() {
        let cfg = SchedulerConfig::from_json(r#"{"enable-txn-simulation": true, "txn-queue-capacity": 8}"#)
            .unwrap();
        assert_eq!(cfg, SchedulerConfig {
            enable_txn_simulation: true,
            txn_queue_capacity: 8,
            ..SchedulerConfig::default()
        });
        assert_eq!(cfg.graph_opts().record_age_limit, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn rejects_malformed() {
        let err = SchedulerConfig::from_json(r#"{"print-txn-summary": "yes"}"#).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
