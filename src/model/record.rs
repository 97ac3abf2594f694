//! Transaction log entries and value status reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::display_value;
use super::{DescriptorError, KeyWithError, TxnOperation, ValueOrigin, ValueRef, ValueState};

/// Kind of transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnType {
    SbNotification,
    NbTransaction,
    RetryFailedOps,
}

impl fmt::Display for TxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnType::SbNotification => write!(f, "SB Notification"),
            TxnType::NbTransaction => write!(f, "NB Transaction"),
            TxnType::RetryFailedOps => write!(f, "Retry Transaction"),
        }
    }
}

/// Resync mode of a NB transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResyncType {
    #[default]
    NotResync,
    /// The transaction carries the complete desired state.
    FullResync,
    /// Re-apply the current desired state against a refreshed SB view.
    DownstreamResync,
}

impl fmt::Display for ResyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResyncType::NotResync => write!(f, "Not Resync"),
            ResyncType::FullResync => write!(f, "Full Resync"),
            ResyncType::DownstreamResync => write!(f, "SB Sync"),
        }
    }
}

/// Input value of a recorded transaction.
#[derive(Debug, Clone)]
pub struct RecordedKvPair {
    pub key: String,
    pub value: Option<ValueRef>,
    pub origin: ValueOrigin,
}

/// One planned or executed operation.
#[derive(Debug, Clone, Default)]
pub struct RecordedTxnOp {
    pub operation: TxnOperation,
    pub key: String,

    pub prev_value: Option<ValueRef>,
    pub new_value: Option<ValueRef>,
    pub prev_origin: ValueOrigin,
    pub new_origin: ValueOrigin,
    pub prev_state: ValueState,
    pub new_state: ValueState,
    pub prev_err: Option<DescriptorError>,
    pub new_err: Option<DescriptorError>,

    /// Nothing was called on the descriptor.
    pub noop: bool,
    pub is_derived: bool,
    /// Derived value without a descriptor.
    pub is_property: bool,
    pub is_revert: bool,
    pub is_retry: bool,
    pub is_recreate: bool,
}

impl RecordedTxnOp {
    /// Short markers describing the state transition, e.g. `WAS-PENDING`.
    pub fn flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.is_derived && !self.is_property {
            flags.push("DERIVED");
        }
        if self.is_property {
            flags.push("PROPERTY");
        }
        if self.noop {
            flags.push("NOOP");
        }
        if self.is_revert && !self.is_property {
            flags.push("REVERT");
        }
        if self.is_retry && !self.is_property {
            flags.push("RETRY");
        }
        if self.is_recreate {
            flags.push("RECREATE");
        }
        if self.new_state == ValueState::Obtained {
            flags.push("OBTAINED");
        }
        if self.new_state == ValueState::Unimplemented {
            flags.push("UNIMPLEMENTED");
        }
        if self.prev_state == ValueState::Removed && self.operation == TxnOperation::Delete {
            flags.push("ALREADY-REMOVED");
        }
        if self.prev_state == ValueState::Missing {
            flags.push(if self.new_state == ValueState::Removed {
                "ALREADY-MISSING"
            } else {
                "WAS-MISSING"
            });
        }
        if self.prev_state == ValueState::Discovered {
            flags.push("DISCOVERED");
        }
        match (self.prev_state, self.new_state) {
            (ValueState::Pending, ValueState::Pending) => flags.push("STILL-PENDING"),
            (ValueState::Pending, _) => flags.push("WAS-PENDING"),
            (_, ValueState::Pending) => flags.push("IS-PENDING"),
            _ => {}
        }
        match (self.prev_state, self.new_state) {
            (ValueState::Failed, ValueState::Failed) => flags.push("STILL-FAILING"),
            (ValueState::Failed, ValueState::Configured) => flags.push("FIXED"),
            (_, ValueState::Failed) => flags.push("FAILED"),
            _ => {}
        }
        match (self.prev_state, self.new_state) {
            (ValueState::Retrying, ValueState::Retrying) => flags.push("STILL-RETRYING"),
            (ValueState::Retrying, ValueState::Configured) => flags.push("FIXED"),
            (_, ValueState::Retrying) => flags.push("RETRYING"),
            _ => {}
        }
        if self.new_state == ValueState::Invalid {
            flags.push("INVALID");
        }
        flags
    }
}

impl fmt::Display for RecordedTxnOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.flags();
        if flags.is_empty() {
            writeln!(f, "{} [{}]", self.operation, self.key)?;
        } else {
            writeln!(f, "{} [{}] {}", self.operation, self.key, flags.join(" "))?;
        }
        if self.operation == TxnOperation::Delete && self.prev_value.is_some() {
            writeln!(f, "    prev-value: {}", display_value(self.prev_value.as_ref()))?;
        } else if self.operation != TxnOperation::Delete {
            if self.operation == TxnOperation::Modify {
                writeln!(f, "    prev-value: {}", display_value(self.prev_value.as_ref()))?;
            }
            writeln!(f, "    new-value: {}", display_value(self.new_value.as_ref()))?;
        }
        if let Some(err) = &self.prev_err {
            writeln!(f, "    prev-error: {err}")?;
        }
        if let Some(err) = &self.new_err {
            writeln!(f, "    error: {err}")?;
        }
        Ok(())
    }
}

/// Record of a processed (or pre-recorded) transaction.
#[derive(Debug, Clone)]
pub struct RecordedTxn {
    /// Only arguments, plan and pre-processing errors are filled in.
    pub pre_record: bool,
    pub with_simulation: bool,

    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,

    pub seq_num: u64,
    pub txn_type: TxnType,
    pub resync_type: ResyncType,
    pub description: String,
    pub retry_for_txn: u64,
    pub retry_attempt: u32,

    pub values: Vec<RecordedKvPair>,
    pub pre_process_errors: Vec<KeyWithError>,
    pub planned: Vec<RecordedTxnOp>,
    pub executed: Vec<RecordedTxnOp>,
}

impl RecordedTxn {
    pub fn new(seq_num: u64, txn_type: TxnType) -> Self {
        Self {
            pre_record: true,
            with_simulation: false,
            start: None,
            stop: None,
            seq_num,
            txn_type,
            resync_type: ResyncType::NotResync,
            description: String::new(),
            retry_for_txn: 0,
            retry_attempt: 0,
            values: Vec::new(),
            pre_process_errors: Vec::new(),
            planned: Vec::new(),
            executed: Vec::new(),
        }
    }

    /// Render the record; `result_only` prints just the executed operations.
    pub fn render(&self, result_only: bool) -> String {
        use std::fmt::Write;

        let mut s = String::new();
        if !result_only {
            s.push_str("* transaction arguments:\n");
            let _ = writeln!(s, "    - seq-num: {}", self.seq_num);
            match self.txn_type {
                TxnType::NbTransaction if self.resync_type != ResyncType::NotResync => {
                    let _ = writeln!(s, "    - type: {}, {}", self.txn_type, self.resync_type);
                }
                TxnType::RetryFailedOps => {
                    let _ = writeln!(
                        s,
                        "    - type: {} (for txn {}, attempt #{})",
                        self.txn_type, self.retry_for_txn, self.retry_attempt
                    );
                }
                _ => {
                    let _ = writeln!(s, "    - type: {}", self.txn_type);
                }
            }
            if !self.description.is_empty() {
                let _ = writeln!(s, "    - description: {}", self.description);
            }
            if self.resync_type != ResyncType::DownstreamResync {
                if self.values.is_empty() {
                    s.push_str("    - values: NONE\n");
                } else {
                    s.push_str("    - values:\n");
                }
                for kv in &self.values {
                    if self.resync_type != ResyncType::NotResync && kv.origin == ValueOrigin::FromSb {
                        continue;
                    }
                    let _ = writeln!(s, "        - key: {}", kv.key);
                    let _ = writeln!(s, "          val: {}", display_value(kv.value.as_ref()));
                }
            }
            if !self.pre_process_errors.is_empty() {
                s.push_str("* pre-processing errors:\n");
                for err in &self.pre_process_errors {
                    let _ = writeln!(s, "    - {err}");
                }
            }
            if self.with_simulation {
                s.push_str("* planned operations:\n");
                write_ops(&mut s, &self.planned);
            }
        }
        if !self.pre_record {
            match (self.start, self.stop) {
                (Some(start), Some(stop)) if !self.executed.is_empty() => {
                    let _ = writeln!(
                        s,
                        "* executed operations ({} -> {}, dur: {}ms):",
                        start.format("%H:%M:%S%.3f"),
                        stop.format("%H:%M:%S%.3f"),
                        (stop - start).num_milliseconds()
                    );
                }
                _ => s.push_str("* executed operations:\n"),
            }
            write_ops(&mut s, &self.executed);
        }
        s
    }
}

fn write_ops(s: &mut String, ops: &[RecordedTxnOp]) {
    if ops.is_empty() {
        s.push_str("    <NONE>\n");
        return;
    }
    for (i, op) in ops.iter().enumerate() {
        for (j, line) in op.to_string().lines().enumerate() {
            if j == 0 {
                s.push_str(&format!("    {}. {}\n", i + 1, line));
            } else {
                s.push_str(&format!("    {line}\n"));
            }
        }
    }
}

impl fmt::Display for RecordedTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(false))
    }
}

// ============================================================================
// Value status
// ============================================================================

/// Status of a single value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValueStatus {
    pub key: String,
    pub state: ValueState,
    pub error: String,
    pub last_operation: TxnOperation,
    /// Invalid fields for `Invalid`, unsatisfied dependency labels for `Pending`.
    pub details: Vec<String>,
}

/// Status of a base value together with its derived values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BaseValueStatus {
    pub value: ValueStatus,
    pub derived_values: Vec<ValueStatus>,
}
