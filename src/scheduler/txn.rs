//! Transaction processing: pre-process, simulate, execute, record and
//! post-process, one transaction at a time.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hashbrown::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::graph::KeySet;
use crate::model::{
    BaseValueStatus, KeyWithError, Metadata, RecordedTxnOp, ResyncType, RetryOpt, TxnType, ValueOrigin, ValueRef,
    ValueState,
};
use super::exec::execute_transaction;
use super::node_utils::{base_key, last_update, nb_base_selectors, origin, sb_base_selectors, state, value_status};
use super::refresh::{ResyncData, refresh_graph};
use super::{Inner, Subscriber, TxnOutcome, wait_closed};

// ============================================================================
// Transaction
// ============================================================================

/// One value of a queued transaction.
#[derive(Clone)]
pub(super) struct KvForTxn {
    pub key: String,
    /// `None` removes the value.
    pub value: Option<ValueRef>,
    /// Only for SB notifications.
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
    pub is_revert: bool,
}

impl KvForTxn {
    pub fn new(key: impl Into<String>, value: Option<ValueRef>, origin: ValueOrigin) -> Self {
        Self { key: key.into(), value, metadata: None, origin, is_revert: false }
    }

    pub fn reverting(mut self, is_revert: bool) -> Self {
        self.is_revert = is_revert;
        self
    }
}

/// NB-specific part of a transaction.
pub(super) struct NbTxn {
    pub resync: ResyncType,
    pub verbose_refresh: bool,
    pub retry: Option<RetryOpt>,
    pub revert_on_failure: bool,
    pub with_simulation: bool,
    pub description: String,
    /// Present for blocking commits.
    pub result_tx: Option<oneshot::Sender<TxnOutcome>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) struct RetryMeta {
    /// Transaction whose failures are being retried.
    pub txn_seq_num: u64,
    pub delay: Duration,
    pub attempt: u32,
}

pub(super) struct RetryTxn {
    pub meta: RetryMeta,
    /// key -> sequence number of its last update when the retry was scheduled
    pub keys: HashMap<String, u64>,
}

pub(super) struct Transaction {
    /// Assigned at enqueue.
    pub seq_num: u64,
    pub txn_type: TxnType,
    pub values: Vec<KvForTxn>,
    pub nb: Option<NbTxn>,
    pub retry: Option<RetryTxn>,
}

impl Transaction {
    pub fn new(txn_type: TxnType, values: Vec<KvForTxn>) -> Self {
        Self { seq_num: 0, txn_type, values, nb: None, retry: None }
    }
}

/// Deletes first, then the rest; each group ordered by key.
fn order_values(values: &mut [KvForTxn]) {
    values.sort_by(|a, b| (a.value.is_some(), &a.key).cmp(&(b.value.is_some(), &b.key)));
}

// ============================================================================
// Processing
// ============================================================================

impl Inner {
    pub(super) fn process_transaction(self: &Arc<Self>, mut txn: Transaction) {
        let _serialized = self.txn_lock.lock();
        let start = Utc::now();

        let (mut skip_exec, skip_simulation, record) = self.pre_process(&mut txn);
        if !skip_exec {
            order_values(&mut txn.values);
        }

        let mut planned = Vec::new();
        if !skip_simulation {
            let mut w = self.graph.write(false, record);
            planned = execute_transaction(self, &txn, &mut w, true);
            if planned.is_empty() {
                // nothing to execute
                w.save();
                skip_exec = true;
            }
            w.release();
        }
        let txn_record = self.pre_record_transaction(&txn, planned, skip_simulation);

        let mut executed = Vec::new();
        if !skip_exec {
            let mut w = self.graph.write(true, record);
            executed = execute_transaction(self, &txn, &mut w, false);
            w.release();
        }

        self.record_transaction(txn_record, executed.clone(), start, Utc::now());
        self.post_process(txn, executed);
    }

    /// Returns `(skip_exec, skip_simulation, record)`.
    fn pre_process(&self, txn: &mut Transaction) -> (bool, bool, bool) {
        match txn.txn_type {
            TxnType::SbNotification => {
                let skip = self.filter_notification(txn);
                (skip, !self.config.enable_txn_simulation, true)
            }
            TxnType::NbTransaction => {
                let skip = self.pre_process_nb(txn);
                let (with_simulation, resync) = txn
                    .nb
                    .as_ref()
                    .map_or((false, ResyncType::NotResync), |nb| (nb.with_simulation, nb.resync));
                (skip, skip || !with_simulation, resync != ResyncType::DownstreamResync)
            }
            TxnType::RetryFailedOps => {
                let skip = self.pre_process_retry(txn);
                (skip, skip, true)
            }
        }
    }

    fn filter_notification(&self, txn: &Transaction) -> bool {
        let Some(kv) = txn.values.first() else {
            return true;
        };
        if self.registry.get_for_key(&kv.key).is_none() {
            debug!(txn_seq = txn.seq_num, key = %kv.key, "ignoring unimplemented notification");
            return true;
        }
        let graph = self.graph.read();
        if origin(graph.get_node(&kv.key)) == ValueOrigin::FromNb {
            debug!(txn_seq = txn.seq_num, key = %kv.key, "ignoring notification for a NB-managed value");
            return true;
        }
        false
    }

    /// Expand a resync into the full list of changes.
    fn pre_process_nb(&self, txn: &mut Transaction) -> bool {
        let Some(nb) = &txn.nb else {
            return false;
        };
        if nb.resync == ResyncType::NotResync {
            return false;
        }
        let (resync, verbose) = (nb.resync, nb.verbose_refresh);

        let mut w = self.graph.write(true, false);
        let count = self.resync_count.fetch_add(1, Ordering::SeqCst) + 1;

        if resync == ResyncType::DownstreamResync {
            let current: Vec<KvForTxn> = w
                .get_nodes(None, &nb_base_selectors())
                .into_iter()
                .filter_map(|node| {
                    let lu = last_update(Some(node))?;
                    Some(KvForTxn::new(node.key(), lu.value.clone(), ValueOrigin::FromNb).reverting(lu.revert))
                })
                .collect();
            txn.values.extend(current);
        }

        let nb_keys: KeySet = txn.values.iter().map(|kv| kv.key.clone()).collect();
        refresh_graph(self, &mut w, None, Some(ResyncData { first: count == 1, values: &txn.values }), verbose);

        // NB values not requested anymore are removed
        let removed: Vec<KvForTxn> = w
            .get_nodes(None, &nb_base_selectors())
            .into_iter()
            .filter(|node| !nb_keys.contains(node.key()))
            .map(|node| KvForTxn::new(node.key(), None, ValueOrigin::FromNb))
            .collect();
        // SB values are re-applied to keep their record intact
        let obtained: Vec<KvForTxn> = w
            .get_nodes(None, &sb_base_selectors())
            .into_iter()
            .filter(|node| !nb_keys.contains(node.key()))
            .map(|node| KvForTxn::new(node.key(), node.value().cloned(), ValueOrigin::FromSb))
            .collect();
        txn.values.extend(removed);
        txn.values.extend(obtained);
        txn.values.is_empty()
    }

    /// Keep the keys not updated since the failure.
    fn pre_process_retry(&self, txn: &mut Transaction) -> bool {
        let Some(retry) = &txn.retry else {
            return true;
        };
        let graph = self.graph.read();
        let values: Vec<KvForTxn> = retry
            .keys
            .iter()
            .filter_map(|(key, &rev)| {
                let lu = last_update(graph.get_node(key))?;
                (lu.txn_seq_num <= rev)
                    .then(|| KvForTxn::new(key.clone(), lu.value.clone(), ValueOrigin::FromNb).reverting(lu.revert))
            })
            .collect();
        graph.release();
        txn.values = values;
        txn.values.is_empty()
    }

    fn post_process(self: &Arc<Self>, mut txn: Transaction, executed: Vec<RecordedTxnOp>) {
        let mut to_refresh = KeySet::new();
        let mut to_retry = KeySet::new();
        {
            let graph = self.graph.read();
            for op in &executed {
                let Some(node) = graph.get_node(&op.key) else { continue };
                match state(Some(node)) {
                    ValueState::Failed => {
                        to_refresh.insert(base_key(node).to_string());
                    }
                    ValueState::Retrying => {
                        to_refresh.insert(base_key(node).to_string());
                        to_retry.insert(base_key(node).to_string());
                    }
                    _ => {}
                }
            }
        }

        if !to_refresh.is_empty() {
            let mut w = self.graph.write(true, false);
            refresh_graph(self, &mut w, Some(&to_refresh), None, true);

            let mut retries: HashMap<RetryMeta, HashMap<String, u64>> = HashMap::new();
            for key in &to_retry {
                let Some(lu) = last_update(w.get_node(key)) else { continue };
                let Some(opt) = lu.retry else { continue };
                let prev = txn.retry.as_ref().filter(|r| r.keys.contains_key(key)).map(|r| r.meta);
                let delay = match prev {
                    Some(prev) if opt.exp_backoff => prev.delay * 2,
                    _ => opt.period,
                };
                let meta = RetryMeta {
                    txn_seq_num: prev.map_or(txn.seq_num, |p| p.txn_seq_num),
                    delay,
                    attempt: prev.map_or(1, |p| p.attempt + 1),
                };
                retries.entry(meta).or_default().insert(key.clone(), lu.txn_seq_num);
            }
            w.release();
            for (meta, keys) in retries {
                self.enqueue_retry(RetryTxn { meta, keys });
            }
        }

        let updated = std::mem::take(&mut *self.updated_states.lock());
        let mut removed = Vec::new();
        let statuses: Vec<BaseValueStatus> = {
            let graph = self.graph.read();
            updated
                .into_iter()
                .map(|key| {
                    let status = value_status(&graph, graph.get_node(&key), &key);
                    if status.value.state == ValueState::Removed {
                        removed.push(key);
                    }
                    status
                })
                .collect()
        };

        let errors: Vec<KeyWithError> = executed
            .iter()
            .filter_map(|op| {
                let error = op.new_err.clone()?;
                Some(KeyWithError { key: op.key.clone(), operation: op.operation, error })
            })
            .collect();

        match txn.nb.as_mut().and_then(|nb| nb.result_tx.take()) {
            Some(result_tx) => {
                let outcome = TxnOutcome { seq_num: txn.seq_num, errors: errors.clone() };
                if result_tx.send(outcome).is_err() {
                    warn!(txn_seq = txn.seq_num, "failed to deliver transaction result to the caller");
                }
            }
            None if errors.is_empty() => info!(txn_seq = txn.seq_num, "transaction successful"),
            None => {
                let summary: Vec<String> = errors.iter().map(ToString::to_string).collect();
                error!(txn_seq = txn.seq_num, errors = ?summary, "transaction failed");
            }
        }

        notify(&self.watchers, &statuses, |s| s.value.key.as_str(), txn.seq_num);
        notify(&self.error_subs, &errors, |e| e.key.as_str(), txn.seq_num);

        if !removed.is_empty() {
            let mut w = self.graph.write(true, true);
            for key in &removed {
                w.delete_node(key);
            }
        }
    }

    /// Queue a retry once its delay elapses, unless the scheduler is closed
    /// before that.
    fn enqueue_retry(self: &Arc<Self>, retry: RetryTxn) {
        debug!(
            txn_seq = retry.meta.txn_seq_num,
            attempt = retry.meta.attempt,
            delay_ms = u64::try_from(retry.meta.delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling retry of failed operations"
        );
        let inner = Arc::downgrade(self);
        let mut closed = self.closed.subscribe();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = wait_closed(&mut closed) => return,
                _ = tokio::time::sleep(retry.meta.delay) => {}
            }
            let Some(inner) = inner.upgrade() else { return };
            let mut txn = Transaction::new(TxnType::RetryFailedOps, Vec::new());
            txn.retry = Some(retry);
            if let Err(err) = inner.enqueue(txn, true).await {
                warn!(%err, "failed to enqueue retry of failed operations");
            }
        });
    }
}

/// Deliver items to subscribers whose selector matches; drops closed ones.
fn notify<T: Clone>(
    subscribers: &parking_lot::Mutex<Vec<Subscriber<T>>>,
    items: &[T],
    key_of: impl Fn(&T) -> &str,
    txn_seq: u64,
) {
    if items.is_empty() {
        return;
    }
    let mut subscribers = subscribers.lock();
    subscribers.retain(|s| !s.tx.is_closed());
    for subscriber in subscribers.iter() {
        for item in items {
            if subscriber.selector.as_ref().is_some_and(|selects| !selects(key_of(item))) {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = subscriber.tx.try_send(item.clone()) {
                warn!(txn_seq, key = %key_of(item), "subscriber channel full, dropping update");
            }
        }
    }
}
