//! # Scheduler
//!
//! The transaction engine. NB transactions, SB notifications and retries
//! of failed operations share one bounded queue drained by a single
//! consumer task; each transaction is planned and executed against the
//! graph while no other transaction runs.
//!
//! | Piece | Module | Description |
//! |-------|--------|-------------|
//! | `SchedulerConfig` | `config` | JSON-loadable settings |
//! | `TxnContext` / `CancelToken` | `options` | per-commit options |
//! | processing | `txn` | pre-process, simulate, execute, record, post-process |
//! | execution | `exec` | graph walk calling descriptors |
//! | refresh | `refresh` | folding `retrieve` results into the graph |
//! | history | `history` | recorded transactions |

mod config;
mod exec;
mod history;
mod node_utils;
mod options;
mod refresh;
mod txn;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error};

use crate::descriptor::{KvDescriptor, MetadataMap, Registry};
use crate::graph::{Flag, FlagSelector, Graph, KeySet, RecordedNode};
use crate::model::{
    BaseValueStatus, KeySelector, KeyValuePair, KeyWithError, KvWithMetadata, Metadata, RecordedTxn,
    ResyncType, TxnType, ValueOrigin, ValueRef, ValueState,
};
use crate::{Error, Result};

use history::History;
use node_utils::{descriptor_selectors, is_available, last_operation, last_update, to_kv_with_metadata, value_status};
use txn::{KvForTxn, NbTxn, Transaction};

pub use config::SchedulerConfig;
pub use options::{CancelToken, TxnContext};

// ============================================================================
// Public types
// ============================================================================

/// Result of a committed NB transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnOutcome {
    pub seq_num: u64,
    /// Failed operations, empty for non-blocking commits (those go to
    /// error subscribers).
    pub errors: Vec<KeyWithError>,
}

/// Point of view for value dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// What NB requested.
    Nb,
    /// What SB actually holds, read through `retrieve`.
    Sb,
    /// The scheduler's cached view of SB.
    Cached,
}

// ============================================================================
// KvScheduler Trait
// ============================================================================

/// The scheduler API.
#[async_trait]
pub trait KvScheduler: Send + Sync {
    /// Fails with [`Error::DescriptorExists`] on a duplicate name.
    fn register_descriptor(&self, descriptor: Arc<dyn KvDescriptor>) -> Result<()>;

    fn registered_nb_key_prefixes(&self) -> Vec<String>;

    fn start_nb_transaction(&self) -> Txn;

    /// Report a value change made outside of the scheduler. Never blocks:
    /// a full queue fails with [`Error::QueueFull`].
    async fn push_sb_notification(
        &self,
        key: &str,
        value: Option<ValueRef>,
        metadata: Option<Metadata>,
    ) -> Result<u64>;

    /// Resolves once everything queued before the call was processed.
    async fn transaction_barrier(&self) -> Result<()>;

    /// Value of an available (applied or obtained) key.
    fn get_value(&self, key: &str) -> Option<ValueRef>;

    fn get_values(&self, selector: Option<KeySelector>) -> Vec<KeyValuePair>;

    /// Values waiting for their dependencies.
    fn get_pending_values(&self, selector: Option<KeySelector>) -> Vec<KeyValuePair>;

    fn get_failed_values(&self, selector: Option<KeySelector>) -> Vec<KeyWithError>;

    fn get_metadata_map(&self, descriptor: &str) -> Option<Arc<dyn MetadataMap>>;

    fn get_value_status(&self, key: &str) -> BaseValueStatus;

    /// Status updates of base values after each transaction. Updates for a
    /// full channel are dropped.
    fn watch_value_status(&self, sender: mpsc::Sender<BaseValueStatus>, selector: Option<KeySelector>);

    /// Per-key errors of every processed transaction.
    fn subscribe_for_errors(&self, sender: mpsc::Sender<KeyWithError>, selector: Option<KeySelector>);

    fn dump_values_by_descriptor(&self, descriptor: &str, view: View) -> Result<Vec<KvWithMetadata>>;

    fn dump_values_by_key_prefix(&self, key_prefix: &str, view: View) -> Result<Vec<KvWithMetadata>>;

    /// Transactions started within `[since, until]`.
    fn get_transaction_history(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<RecordedTxn>;

    fn get_recorded_transaction(&self, seq_num: u64) -> Option<RecordedTxn>;

    fn get_node_timeline(&self, key: &str) -> Vec<RecordedNode>;

    fn get_graph_snapshot(&self, time: DateTime<Utc>) -> Vec<RecordedNode>;

    fn dump_graph(&self) -> String;

    /// Stop processing. Queued transactions are dropped; blocked callers
    /// get [`Error::ClosedScheduler`].
    fn close(&self);
}

// ============================================================================
// Internals
// ============================================================================

enum Work {
    Txn(Transaction),
    Barrier(oneshot::Sender<()>),
}

struct Subscriber<T> {
    tx: mpsc::Sender<T>,
    selector: Option<KeySelector>,
}

struct Inner {
    config: SchedulerConfig,
    graph: Graph,
    registry: Registry,
    queue: mpsc::Sender<Work>,
    /// Next sequence number.
    seq: Mutex<u64>,
    closed: watch::Sender<bool>,
    /// Held while a transaction is processed.
    txn_lock: Mutex<()>,
    /// Base keys whose status changed in the current transaction.
    updated_states: Mutex<KeySet>,
    watchers: Mutex<Vec<Subscriber<BaseValueStatus>>>,
    error_subs: Mutex<Vec<Subscriber<KeyWithError>>>,
    history: Mutex<History>,
    resync_count: AtomicU64,
    runtime: Handle,
}

impl Inner {
    async fn enqueue(&self, mut txn: Transaction, blocking: bool) -> Result<u64> {
        let closed = *self.closed.borrow();
        if closed {
            return Err(Error::ClosedScheduler);
        }
        let permit = if blocking {
            self.queue.reserve().await.map_err(|_| Error::ClosedScheduler)?
        } else {
            self.queue.try_reserve().map_err(|err| match err {
                mpsc::error::TrySendError::Full(()) => Error::QueueFull,
                mpsc::error::TrySendError::Closed(()) => Error::ClosedScheduler,
            })?
        };
        let mut seq = self.seq.lock();
        txn.seq_num = *seq;
        *seq += 1;
        let seq_num = txn.seq_num;
        permit.send(Work::Txn(txn));
        Ok(seq_num)
    }
}

async fn consume(inner: Weak<Inner>, mut rx: mpsc::Receiver<Work>, mut closed: watch::Receiver<bool>) {
    loop {
        let work = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            work = rx.recv() => match work {
                Some(work) => work,
                None => break,
            },
        };
        match work {
            Work::Barrier(done) => {
                let _ = done.send(());
            }
            Work::Txn(txn) => {
                let Some(inner) = inner.upgrade() else { break };
                if let Err(err) = tokio::task::spawn_blocking(move || inner.process_transaction(txn)).await {
                    error!(%err, "transaction processing panicked");
                }
            }
        }
    }
    debug!("transaction consumer stopped");
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // a dropped sender counts as closed
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn wait_cancel(token: Option<&CancelToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn key_filter(selector: &Option<KeySelector>) -> Option<&dyn Fn(&str) -> bool> {
    selector.as_ref().map(|s| &**s as &dyn Fn(&str) -> bool)
}

// ============================================================================
// Scheduler
// ============================================================================

/// Handle to a running scheduler; clones share the same instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Start a scheduler with its consumer task on the current tokio
    /// runtime.
    ///
    /// # Panics
    ///
    /// Outside of a tokio runtime.
    pub fn new(config: SchedulerConfig) -> Self {
        let runtime = Handle::current();
        let (queue, rx) = mpsc::channel(config.txn_queue_capacity.max(1));
        let (closed, closed_rx) = watch::channel(false);
        let graph = Graph::new(config.graph_opts());
        let history = History::new(graph.start_time());
        let inner = Arc::new(Inner {
            graph,
            registry: Registry::new(),
            queue,
            seq: Mutex::new(0),
            closed,
            txn_lock: Mutex::new(()),
            updated_states: Mutex::new(KeySet::new()),
            watchers: Mutex::new(Vec::new()),
            error_subs: Mutex::new(Vec::new()),
            history: Mutex::new(history),
            resync_count: AtomicU64::new(0),
            runtime: runtime.clone(),
            config,
        });
        runtime.spawn(consume(Arc::downgrade(&inner), rx, closed_rx));
        Self { inner }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

/// NB transaction under construction.
pub struct Txn {
    inner: Arc<Inner>,
    values: BTreeMap<String, Option<ValueRef>>,
}

impl Txn {
    /// Request a value; `None` removes it. A later call for the same key
    /// replaces the earlier one.
    pub fn set_value(mut self, key: impl Into<String>, value: Option<ValueRef>) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Queue the transaction. A blocking commit waits until it was executed;
    /// see [`TxnContext`] for the options.
    pub async fn commit(self, ctx: TxnContext) -> Result<TxnOutcome> {
        if ctx.resync == ResyncType::DownstreamResync && !self.values.is_empty() {
            return Err(Error::CombinedDownstreamResyncWithChange);
        }
        if ctx.revert && ctx.resync != ResyncType::NotResync {
            return Err(Error::RevertNotSupportedWithResync);
        }

        let blocking = ctx.is_blocking();
        let (result_tx, result_rx) = if blocking {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let values = self
            .values
            .into_iter()
            .map(|(key, value)| KvForTxn::new(key, value, ValueOrigin::FromNb))
            .collect();
        let mut txn = Transaction::new(TxnType::NbTransaction, values);
        txn.nb = Some(NbTxn {
            resync: ctx.resync,
            verbose_refresh: ctx.verbose_refresh,
            retry: ctx.retry,
            revert_on_failure: ctx.revert,
            with_simulation: ctx.simulation || self.inner.config.enable_txn_simulation,
            description: ctx.description.clone(),
            result_tx,
        });

        let seq_num = self.inner.enqueue(txn, blocking).await?;
        let Some(result_rx) = result_rx else {
            return Ok(TxnOutcome { seq_num, errors: Vec::new() });
        };

        let mut closed = self.inner.closed.subscribe();
        tokio::select! {
            biased;
            result = result_rx => result.map_err(|_| Error::ClosedScheduler),
            _ = wait_cancel(ctx.cancel.as_ref()) => Err(Error::TxnWaitCanceled),
            _ = wait_closed(&mut closed) => Err(Error::ClosedScheduler),
        }
    }
}

#[async_trait]
impl KvScheduler for Scheduler {
    fn register_descriptor(&self, descriptor: Arc<dyn KvDescriptor>) -> Result<()> {
        self.inner.registry.register(descriptor.clone())?;
        if descriptor.capabilities().with_metadata {
            let mut w = self.inner.graph.write(true, false);
            w.register_metadata_map(descriptor.name(), descriptor.metadata_map_factory());
        }
        debug!(descriptor = descriptor.name(), "descriptor registered");
        Ok(())
    }

    fn registered_nb_key_prefixes(&self) -> Vec<String> {
        self.inner.registry.nb_key_prefixes()
    }

    fn start_nb_transaction(&self) -> Txn {
        Txn { inner: self.inner.clone(), values: BTreeMap::new() }
    }

    async fn push_sb_notification(
        &self,
        key: &str,
        value: Option<ValueRef>,
        metadata: Option<Metadata>,
    ) -> Result<u64> {
        let mut kv = KvForTxn::new(key, value, ValueOrigin::FromSb);
        kv.metadata = metadata;
        self.inner.enqueue(Transaction::new(TxnType::SbNotification, vec![kv]), false).await
    }

    async fn transaction_barrier(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let permit = self.inner.queue.reserve().await.map_err(|_| Error::ClosedScheduler)?;
        permit.send(Work::Barrier(done_tx));
        done_rx.await.map_err(|_| Error::ClosedScheduler)
    }

    fn get_value(&self, key: &str) -> Option<ValueRef> {
        let graph = self.inner.graph.read();
        graph.get_node(key).filter(|n| is_available(n)).and_then(|n| n.value().cloned())
    }

    fn get_values(&self, selector: Option<KeySelector>) -> Vec<KeyValuePair> {
        let graph = self.inner.graph.read();
        graph
            .get_nodes(key_filter(&selector), &[FlagSelector::without([Flag::Unavailable])])
            .into_iter()
            .map(|n| KeyValuePair { key: n.key().to_string(), value: n.value().cloned() })
            .collect()
    }

    fn get_pending_values(&self, selector: Option<KeySelector>) -> Vec<KeyValuePair> {
        let graph = self.inner.graph.read();
        graph
            .get_nodes(key_filter(&selector), &[FlagSelector::with([Flag::ValueState(ValueState::Pending)])])
            .into_iter()
            .map(|n| KeyValuePair { key: n.key().to_string(), value: n.value().cloned() })
            .collect()
    }

    fn get_failed_values(&self, selector: Option<KeySelector>) -> Vec<KeyWithError> {
        let graph = self.inner.graph.read();
        graph
            .get_nodes(key_filter(&selector), &[])
            .into_iter()
            .filter_map(|n| {
                let (err, _) = n.flags().error()?;
                Some(KeyWithError {
                    key: n.key().to_string(),
                    operation: last_operation(Some(n)),
                    error: err.clone(),
                })
            })
            .collect()
    }

    fn get_metadata_map(&self, descriptor: &str) -> Option<Arc<dyn MetadataMap>> {
        self.inner.graph.read().get_metadata_map(descriptor)
    }

    fn get_value_status(&self, key: &str) -> BaseValueStatus {
        let graph = self.inner.graph.read();
        value_status(&graph, graph.get_node(key), key)
    }

    fn watch_value_status(&self, sender: mpsc::Sender<BaseValueStatus>, selector: Option<KeySelector>) {
        self.inner.watchers.lock().push(Subscriber { tx: sender, selector });
    }

    fn subscribe_for_errors(&self, sender: mpsc::Sender<KeyWithError>, selector: Option<KeySelector>) {
        self.inner.error_subs.lock().push(Subscriber { tx: sender, selector });
    }

    fn dump_values_by_descriptor(&self, descriptor: &str, view: View) -> Result<Vec<KvWithMetadata>> {
        let Some(d) = self.inner.registry.get(descriptor) else {
            return Err(Error::UnknownDescriptor(descriptor.to_string()));
        };
        // SB view: no transaction may run while SB is read
        let _paused = (view == View::Sb).then(|| self.inner.txn_lock.lock());

        let graph = self.inner.graph.read();
        if view == View::Nb {
            return Ok(graph
                .get_nodes(None, &[
                    FlagSelector::with([Flag::Descriptor(descriptor.to_string())]),
                    FlagSelector::without([
                        Flag::Derived(String::new()),
                        Flag::ValueState(ValueState::Obtained),
                    ]),
                ])
                .into_iter()
                .filter_map(|n| {
                    // skip discovered values and requested removals
                    let value = last_update(Some(n))?.value.clone()?;
                    Some(KvWithMetadata {
                        key: n.key().to_string(),
                        value: Some(value),
                        metadata: n.metadata().cloned(),
                        origin: ValueOrigin::FromNb,
                    })
                })
                .collect());
        }

        let cached: Vec<KvWithMetadata> = graph
            .get_nodes(None, &descriptor_selectors(descriptor, true))
            .into_iter()
            .map(to_kv_with_metadata)
            .collect();
        graph.release();
        if view == View::Cached {
            return Ok(cached);
        }
        if !d.capabilities().supports_retrieve {
            return Err(Error::UnsupportedOperation { descriptor: descriptor.to_string(), operation: "retrieve" });
        }
        d.retrieve(&cached)
            .map_err(|source| Error::Descriptor { descriptor: descriptor.to_string(), source })
    }

    fn dump_values_by_key_prefix(&self, key_prefix: &str, view: View) -> Result<Vec<KvWithMetadata>> {
        let descriptor = self
            .inner
            .registry
            .all()
            .into_iter()
            .find(|d| d.nb_key_prefix() == Some(key_prefix))
            .ok_or_else(|| Error::UnknownKeyPrefix(key_prefix.to_string()))?;
        self.dump_values_by_descriptor(descriptor.name(), view)
    }

    fn get_transaction_history(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<RecordedTxn> {
        self.inner.history.lock().window(since, until)
    }

    fn get_recorded_transaction(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.inner.history.lock().get(seq_num)
    }

    fn get_node_timeline(&self, key: &str) -> Vec<RecordedNode> {
        self.inner.graph.read().get_node_timeline(key).to_vec()
    }

    fn get_graph_snapshot(&self, time: DateTime<Utc>) -> Vec<RecordedNode> {
        self.inner.graph.read().get_snapshot(time).into_iter().cloned().collect()
    }

    fn dump_graph(&self) -> String {
        self.inner.graph.read().dump()
    }

    fn close(&self) {
        self.inner.closed.send_replace(true);
        debug!("scheduler closed");
    }
}
