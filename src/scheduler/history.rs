//! Transaction history: pre-recording, recording, trimming and lookup.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::graph::record::{Retention, to_delta};
use crate::model::{RecordedKvPair, RecordedTxn, RecordedTxnOp, ResyncType, TxnType};
use super::txn::Transaction;
use super::Inner;

/// Processed transactions, ordered by start time.
pub(super) struct History {
    txns: Vec<RecordedTxn>,
    last_trim: DateTime<Utc>,
}

impl History {
    pub(super) fn new(now: DateTime<Utc>) -> Self {
        Self { txns: Vec::new(), last_trim: now }
    }

    /// Transactions that started within `[since, until]`; open ends are
    /// unbounded.
    pub(super) fn window(&self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Vec<RecordedTxn> {
        if let (Some(since), Some(until)) = (since, until) {
            if until < since {
                return Vec::new();
            }
        }
        let started = |t: &RecordedTxn| t.start.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let first = since.map_or(0, |since| self.txns.partition_point(|t| started(t) < since));
        let end = until.map_or(self.txns.len(), |until| self.txns.partition_point(|t| started(t) <= until));
        self.txns.get(first..end).map(<[RecordedTxn]>::to_vec).unwrap_or_default()
    }

    pub(super) fn get(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.txns.iter().find(|t| t.seq_num == seq_num).cloned()
    }

    fn push(&mut self, txn: RecordedTxn) {
        self.txns.push(txn);
    }

    /// Drop records older than the age limit, except those that started
    /// within the permanent init period.
    fn trim(&mut self, now: DateTime<Utc>, ret: Retention) {
        // i = first record after the init period, j = first one to keep
        let i = self
            .txns
            .iter()
            .position(|t| t.start.is_some_and(|start| start - ret.start_time > ret.permanent_init_period))
            .unwrap_or(self.txns.len());
        let j = self.txns[i..]
            .iter()
            .position(|t| t.stop.is_none_or(|stop| now - stop <= ret.age_limit))
            .map_or(self.txns.len(), |p| i + p);
        if j > i {
            self.txns.drain(i..j);
        }
        self.last_trim = now;
    }
}

impl Inner {
    /// Record arguments and plan before execution.
    pub(super) fn pre_record_transaction(
        &self,
        txn: &Transaction,
        planned: Vec<RecordedTxnOp>,
        skipped_simulation: bool,
    ) -> RecordedTxn {
        let mut record = RecordedTxn::new(txn.seq_num, txn.txn_type);
        record.with_simulation = !skipped_simulation;
        record.planned = planned;
        if let Some(nb) = &txn.nb {
            record.resync_type = nb.resync;
            record.description = nb.description.clone();
        }
        if let Some(retry) = &txn.retry {
            record.retry_for_txn = retry.meta.txn_seq_num;
            record.retry_attempt = retry.meta.attempt;
        }

        let downstream = txn.nb.as_ref().is_some_and(|nb| nb.resync == ResyncType::DownstreamResync);
        if !downstream {
            record.values = txn
                .values
                .iter()
                .map(|kv| RecordedKvPair { key: kv.key.clone(), value: kv.value.clone(), origin: kv.origin })
                .collect();
            record.values.sort_by(|a, b| a.key.cmp(&b.key));
        }

        if self.config.print_txn_summary {
            let info = match (&txn.nb, &txn.retry) {
                (Some(nb), _) if nb.resync != ResyncType::NotResync => nb.resync.to_string(),
                (_, Some(retry)) if txn.txn_type == TxnType::RetryFailedOps => format!(
                    "retrying TX #{} (attempt {})",
                    retry.meta.txn_seq_num, retry.meta.attempt
                ),
                _ => String::new(),
            };
            info!(
                txn_seq = txn.seq_num,
                txn_type = %txn.txn_type,
                "transaction #{} {info}\n{}",
                txn.seq_num,
                record.render(false)
            );
        }
        record
    }

    /// Finalize the record with the executed operations and keep it.
    pub(super) fn record_transaction(
        &self,
        mut record: RecordedTxn,
        executed: Vec<RecordedTxnOp>,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) {
        record.pre_record = false;
        record.start = Some(start);
        record.stop = Some(stop);
        record.executed = executed;

        if self.config.print_txn_summary {
            info!(
                txn_seq = record.seq_num,
                took_ms = (stop - start).num_milliseconds(),
                "transaction #{} done\n{}",
                record.seq_num,
                record.render(true)
            );
        }

        if !self.config.record_transaction_history {
            return;
        }
        let mut history = self.history.lock();
        history.push(record);
        if stop - history.last_trim >= to_delta(self.graph.opts().trimming_period) {
            history.trim(stop, Retention {
                start_time: self.graph.start_time(),
                permanent_init_period: to_delta(self.config.permanent_init_period()),
                age_limit: to_delta(self.config.history_age_limit()),
            });
        }
    }
}
