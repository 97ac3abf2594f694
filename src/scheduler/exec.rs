//! Execution: walks the graph from each transaction value through its
//! dependents and derived values, calling descriptors along the way.
//!
//! Descriptor handlers run while the graph write lock is held and must not
//! call back into the scheduler; debug builds panic if they do.

use hashbrown::HashSet;
use tracing::{trace, warn};

use crate::descriptor::KvDescriptor;
use crate::graph::{Flag, FlagKind, GraphState, GraphWriter, KeySet, LastUpdate};
use crate::model::{
    DescriptorError, KeyValuePair, RecordedTxnOp, TxnOperation, TxnType, ValueOrigin, ValueRef,
    ValueState, values_equal,
};
use crate::DEPENDENCY_RELATION;
use super::node_utils::{
    base_key, construct_targets, derived_keys, equal_details, error_string, is_available,
    is_derived, is_ready, last_operation, last_update, origin, state, value_details,
};
use super::refresh::refresh_graph;
use super::txn::{KvForTxn, Transaction};
use super::Inner;

type Outcome = Result<(), DescriptorError>;

/// Arguments of one step of the walk.
#[derive(Clone)]
struct ApplyArgs {
    kv: KvForTxn,
    /// Key of the base value the walk entered from.
    base_key: String,
    is_dep_update: bool,
    is_derived: bool,
    is_retry: bool,
    /// Keys being re-created (delete + create) by the current update.
    recreating: Option<KeySet>,
}

impl ApplyArgs {
    fn new(kv: KvForTxn, is_retry: bool) -> Self {
        Self {
            base_key: kv.key.clone(),
            kv,
            is_dep_update: false,
            is_derived: false,
            is_retry,
            recreating: None,
        }
    }
}

/// Why a delete did not go through.
enum DeleteFailure {
    /// A derived value or a dependent failed; the value itself is kept.
    Inherited(DescriptorError),
    Descriptor { err: DescriptorError, retriable: bool },
}

struct Walk<'w, 'g> {
    inner: &'w Inner,
    txn: &'w Transaction,
    w: &'w mut GraphWriter<'g>,
    dry_run: bool,
    /// Keys of the transaction itself; only their failures fail the transaction.
    applied: KeySet,
    /// Keys on the current recursion branch, for cycle detection.
    branch: HashSet<String>,
}

/// Execute a pre-processed transaction against `w`.
///
/// With `dry_run` no descriptor is called; the walk only plans. With
/// revert-on-failure, the first failure stops the walk and every value
/// applied so far is restored, most recent first.
pub(super) fn execute_transaction(
    inner: &Inner,
    txn: &Transaction,
    w: &mut GraphWriter<'_>,
    dry_run: bool,
) -> Vec<RecordedTxnOp> {
    let is_retry = txn.txn_type == TxnType::RetryFailedOps;
    let revert_on_failure = txn.nb.as_ref().is_some_and(|nb| nb.revert_on_failure);
    let mut walk = Walk {
        inner,
        txn,
        w,
        dry_run,
        applied: KeySet::new(),
        branch: HashSet::new(),
    };

    let mut executed = Vec::new();
    let mut prev_values: Vec<(String, Option<ValueRef>)> = Vec::with_capacity(txn.values.len());
    let mut revert = false;
    for kv in &txn.values {
        walk.applied.insert(kv.key.clone());
        let prev = walk.w.get_node(&kv.key).and_then(|n| n.value().cloned());
        prev_values.push((kv.key.clone(), prev));

        let failed = walk.apply_value(&ApplyArgs::new(kv.clone(), is_retry), &mut executed).is_err();
        if failed && revert_on_failure {
            if !dry_run {
                let failed_key = KeySet::from([kv.key.clone()]);
                refresh_graph(inner, walk.w, Some(&failed_key), None, true);
            }
            revert = true;
            break;
        }
    }

    if revert {
        walk.w.checkpoint();
        for (key, value) in prev_values.into_iter().rev() {
            let kv = KvForTxn::new(key, value, ValueOrigin::FromNb).reverting(true);
            // failures of the revert itself are only recorded
            let _ = walk.apply_value(&ApplyArgs::new(kv, false), &mut executed);
        }
    }

    compress_txn_ops(executed)
}

impl Walk<'_, '_> {
    fn graph(&self) -> &GraphState {
        &**self.w
    }

    fn apply_value(&mut self, args: &ApplyArgs, ops: &mut Vec<RecordedTxnOp>) -> Outcome {
        if !self.branch.insert(args.kv.key.clone()) {
            // dependency cycle
            return Ok(());
        }
        let result = self.apply_value_on_branch(args, ops);
        self.branch.remove(&args.kv.key);
        result
    }

    fn apply_value_on_branch(&mut self, args: &ApplyArgs, ops: &mut Vec<RecordedTxnOp>) -> Outcome {
        let key = args.kv.key.as_str();
        self.w.set_node(key);

        let (prev_state, prev_op, prev_err, prev_details, prev_update) = {
            let graph = self.graph();
            let node = graph.get_node(key);
            (
                state(node),
                last_operation(node),
                error_string(node),
                node.map(|n| value_details(graph, n)).unwrap_or_default(),
                last_update(node).cloned(),
            )
        };

        let mut op = self.pre_record_op(args);
        op.operation = if args.is_dep_update {
            let operation = self.dep_update_operation(key);
            if operation == TxnOperation::Undefined {
                // already deleted within this round of dependency updates
                if self.graph().get_node(key).is_some_and(|n| n.value().is_none()) {
                    self.w.delete_node(key);
                }
                return Ok(());
            }
            operation
        } else if args.kv.value.is_none() {
            TxnOperation::Delete
        } else if self.graph().get_node(key).map_or(true, |n| n.value().is_none() || !is_available(n)) {
            TxnOperation::Add
        } else {
            TxnOperation::Modify
        };
        trace!(txn_seq = self.txn.seq_num, key, op = %op.operation, "apply value");

        let retry = if let Some(nb) = &self.txn.nb {
            nb.retry
        } else if let Some(prev) = &prev_update {
            prev.retry
        } else if args.is_derived {
            last_update(self.graph().get_node(&args.base_key)).and_then(|lu| lu.retry)
        } else {
            None
        };
        // the same request for a settled value keeps its last update
        let repeated = !args.is_dep_update
            && matches!(prev_state, ValueState::Configured | ValueState::Unimplemented)
            && prev_update.as_ref().is_some_and(|lu| {
                lu.revert == args.kv.is_revert
                    && lu.retry == retry
                    && values_equal(lu.value.as_ref(), args.kv.value.as_ref())
            });
        if !repeated {
            self.w.set_node(key).set_flag(Flag::LastUpdate(LastUpdate {
                txn_seq_num: self.txn.seq_num,
                txn_op: op.operation,
                value: args.kv.value.clone(),
                revert: args.kv.is_revert,
                retry,
            }));
        }

        // broken earlier in this transaction: left to the post-processing refresh
        let broken = matches!(prev_state, ValueState::Failed | ValueState::Retrying)
            && !args.kv.is_revert
            && prev_update.as_ref().is_some_and(|lu| lu.txn_seq_num == self.txn.seq_num);
        if broken {
            return match self.graph().get_node(key).and_then(|n| n.flags().error()) {
                Some((err, _)) => Err(err.clone()),
                None => Ok(()),
            };
        }

        let result = match op.operation {
            TxnOperation::Delete => {
                let pending = args.is_dep_update;
                self.apply_delete(args, op, ops, pending, false)
            }
            TxnOperation::Add => self.apply_create(args, op, ops),
            TxnOperation::Modify => self.apply_update(args, op, ops),
            _ => Ok(()),
        };

        if !self.dry_run {
            let graph = self.graph();
            let node = graph.get_node(key);
            let details = node.map(|n| value_details(graph, n)).unwrap_or_default();
            let changed = prev_update.is_none()
                || prev_state != state(node)
                || prev_op != last_operation(node)
                || prev_err != error_string(node)
                || !equal_details(&prev_details, &details);
            if changed {
                self.inner.updated_states.lock().insert(args.base_key.clone());
            }
        }
        result
    }

    // ========================================================================
    // Delete
    // ========================================================================

    fn apply_delete(
        &mut self,
        args: &ApplyArgs,
        mut op: RecordedTxnOp,
        ops: &mut Vec<RecordedTxnOp>,
        pending: bool,
        recreate: bool,
    ) -> Outcome {
        let key = args.kv.key.as_str();
        let Some(node) = self.graph().get_node(key) else {
            return Ok(());
        };
        if node.value().is_none() {
            // nothing to remove, not even recorded
            self.w.delete_node(key);
            return Ok(());
        }
        let prev_state = state(Some(node));

        let result = if is_available(node) {
            self.delete_available(args, pending, ops)
        } else {
            // was pending, only the state changes
            op.noop = true;
            Ok(())
        };

        match result {
            Ok(()) => {
                self.w.set_node(key).del_flags(&[FlagKind::Error]);
                if pending {
                    op.new_state = ValueState::Pending;
                    self.set_state(key, ValueState::Pending);
                } else {
                    op.new_state = ValueState::Removed;
                    if args.is_derived && !recreate {
                        self.w.delete_node(key);
                    } else {
                        self.set_state(key, ValueState::Removed);
                    }
                }
                ops.push(op);
                Ok(())
            }
            Err(DeleteFailure::Inherited(err)) => {
                self.w.set_node(key).del_flags(&[FlagKind::Unavailable]);
                self.set_state(key, prev_state);
                Err(err)
            }
            Err(DeleteFailure::Descriptor { err, retriable }) => {
                op.new_err = Some(err.clone());
                op.new_state = self.mark_failed(args, err.clone(), retriable);
                ops.push(op);
                self.own_error(key, err)
            }
        }
    }

    fn delete_available(
        &mut self,
        args: &ApplyArgs,
        pending: bool,
        ops: &mut Vec<RecordedTxnOp>,
    ) -> Result<(), DeleteFailure> {
        let key = args.kv.key.as_str();
        // not a satisfied dependency anymore while being removed
        self.w.set_node(key).set_flag(Flag::Unavailable);
        if !pending {
            self.set_state(key, ValueState::Removed);
        }

        if !args.is_derived {
            let derived = self
                .graph()
                .get_node(key)
                .map(derived_keys)
                .unwrap_or_default()
                .into_iter()
                .map(|k| KvForTxn::new(k, None, args.kv.origin).reverting(args.kv.is_revert))
                .collect();
            self.apply_derived(derived, args, false, ops).map_err(DeleteFailure::Inherited)?;
        }
        self.run_dep_updates(key, args, false, ops).map_err(DeleteFailure::Inherited)?;

        let Some(descriptor) = self.inner.registry.get_for_key(key) else {
            return Ok(());
        };
        if self.dry_run {
            return Ok(());
        }
        if args.kv.origin != ValueOrigin::FromSb {
            let (value, metadata) = match self.graph().get_node(key) {
                Some(n) => (n.value().cloned(), n.metadata().cloned()),
                None => (None, None),
            };
            if let Some(value) = value {
                if let Err(err) = descriptor.delete(key, value.as_ref(), metadata.as_ref()) {
                    let retriable = retriable(descriptor.as_ref(), &err);
                    return Err(DeleteFailure::Descriptor { err, retriable });
                }
            }
        }
        if !args.is_derived && descriptor.capabilities().with_metadata {
            self.w.set_node(key).set_metadata(None);
        }
        Ok(())
    }

    // ========================================================================
    // Create
    // ========================================================================

    fn apply_create(&mut self, args: &ApplyArgs, mut op: RecordedTxnOp, ops: &mut Vec<RecordedTxnOp>) -> Outcome {
        let key = args.kv.key.as_str();
        let descriptor = self.inner.registry.get_for_key(key);
        {
            let mut node = self.w.set_node(key);
            node.set_value(args.kv.value.clone());
            if let Some(d) = &descriptor {
                node.set_flag(Flag::Descriptor(d.name().to_string()))
                    .set_label(&d.key_label(key));
            }
        }

        let unimplemented = args.kv.origin == ValueOrigin::FromNb && !args.is_derived && descriptor.is_none();
        if unimplemented {
            self.w.set_node(key).set_flag(Flag::Unavailable).del_flags(&[FlagKind::Error]);
            op.noop = true;
            op.new_state = ValueState::Unimplemented;
            self.set_state(key, ValueState::Unimplemented);
            ops.push(op);
            return Ok(());
        }

        if args.is_derived {
            self.w.set_node(key).set_flag(Flag::Derived(args.base_key.clone()));
        }

        if !self.dry_run && args.kv.origin == ValueOrigin::FromNb {
            if let (Some(d), Some(value)) = (&descriptor, &args.kv.value) {
                if let Err(err) = d.validate(key, value.as_ref()) {
                    return self.mark_invalid(args, op, ops, err);
                }
            }
        }

        let derives = self.apply_new_relations(args, descriptor.as_deref(), None, true, ops)?;

        // obtained values already exist in SB whatever their dependencies
        let ready = args.kv.origin == ValueOrigin::FromSb || is_ready(self.graph(), key);
        if !ready {
            self.w.set_node(key).set_flag(Flag::Unavailable).del_flags(&[FlagKind::Error]);
            op.new_state = ValueState::Pending;
            op.noop = true;
            self.set_state(key, ValueState::Pending);
            ops.push(op);
            return Ok(());
        }

        if let (false, Some(d)) = (self.dry_run, &descriptor) {
            let created = if args.kv.origin != ValueOrigin::FromSb {
                match &args.kv.value {
                    Some(value) => d.create(key, value.as_ref()),
                    None => Ok(None),
                }
            } else {
                // already present in SB
                Ok(args.kv.metadata.clone())
            };
            match created {
                Err(err) => {
                    self.w.set_node(key).set_flag(Flag::Unavailable);
                    let retriable = retriable(d.as_ref(), &err);
                    op.new_err = Some(err.clone());
                    op.new_state = self.mark_failed(args, err.clone(), retriable);
                    ops.push(op);
                    return self.own_error(key, err);
                }
                Ok(metadata) => {
                    if !args.is_derived && d.capabilities().with_metadata {
                        self.w.set_node(key).set_metadata_map(d.name()).set_metadata(metadata);
                    }
                }
            }
        }

        self.w.set_node(key).del_flags(&[FlagKind::Error, FlagKind::Unavailable]);
        op.new_state = applied_state(args.kv.origin);
        self.set_state(key, op.new_state);
        ops.push(op);

        self.run_dep_updates(key, args, true, ops)?;
        if !args.is_derived {
            self.apply_derived(derived_to_txn(derives, &args.kv), args, true, ops)?;
        }
        Ok(())
    }

    // ========================================================================
    // Update
    // ========================================================================

    fn apply_update(&mut self, args: &ApplyArgs, mut op: RecordedTxnOp, ops: &mut Vec<RecordedTxnOp>) -> Outcome {
        let key = args.kv.key.as_str();
        let descriptor = self.inner.registry.get_for_key(key);

        if !self.dry_run && args.kv.origin == ValueOrigin::FromNb {
            if let (Some(d), Some(value)) = (&descriptor, &args.kv.value) {
                if let Err(err) = d.validate(key, value.as_ref()) {
                    self.w.set_node(key).set_value(args.kv.value.clone());
                    return self.mark_invalid(args, op, ops, err);
                }
            }
        }

        let (old, metadata) = match self.graph().get_node(key) {
            Some(n) => (n.value().cloned(), n.metadata().cloned()),
            None => (None, None),
        };
        let (Some(old), Some(new)) = (old, args.kv.value.clone()) else {
            return Ok(());
        };

        let equivalent = match &descriptor {
            Some(d) => d.equivalent_values(key, old.as_ref(), new.as_ref()),
            None => old.equals(new.as_ref()),
        };
        let recreate = !equivalent
            && args.kv.origin != ValueOrigin::FromSb
            && descriptor.as_ref().is_some_and(|d| {
                !d.capabilities().supports_update
                    || d.update_with_recreate(key, old.as_ref(), new.as_ref(), metadata.as_ref())
            });

        if recreate {
            let mut recreating = self.graph().get_node(key).map(derived_keys).unwrap_or_default();
            recreating.insert(key.to_string());
            let rec_args = ApplyArgs { recreating: Some(recreating), ..args.clone() };

            let mut del_op = self.pre_record_op(&rec_args);
            del_op.operation = TxnOperation::Delete;
            del_op.new_value = None;
            self.apply_delete(&rec_args, del_op, ops, false, true)?;

            let mut create_op = self.pre_record_op(&rec_args);
            create_op.operation = TxnOperation::Add;
            create_op.prev_value = None;
            return self.apply_create(&rec_args, create_op, ops);
        }

        self.w.set_node(key).set_value(Some(new.clone()));
        let derives = match self.apply_new_relations(args, descriptor.as_deref(), Some(&old), !equivalent, ops) {
            Ok(derives) => derives,
            Err(err) => {
                self.w.set_node(key).set_value(Some(old));
                return Err(err);
            }
        };

        // new dependencies not satisfied: delete the old value, keep the new one pending
        if !equivalent && args.kv.origin != ValueOrigin::FromSb && !is_ready(self.graph(), key) {
            self.w.set_node(key).set_value(Some(old));
            let result = self.apply_delete(args, op, ops, true, false);
            self.w.set_node(key).set_value(Some(new));
            return result;
        }

        if let (false, false, Some(d)) = (self.dry_run, equivalent, &descriptor) {
            let updated = if args.kv.origin != ValueOrigin::FromSb {
                d.update(key, old.as_ref(), new.as_ref(), metadata.as_ref())
            } else {
                // already modified in SB
                Ok(args.kv.metadata.clone())
            };
            match updated {
                Err(err) => {
                    let retriable = retriable(d.as_ref(), &err);
                    op.new_err = Some(err.clone());
                    op.new_state = self.mark_failed(args, err.clone(), retriable);
                    ops.push(op);
                    return self.own_error(key, err);
                }
                Ok(metadata) => {
                    if !args.is_derived && d.capabilities().with_metadata {
                        self.w.set_node(key).set_metadata(metadata);
                    }
                }
            }
        }

        self.w.set_node(key).del_flags(&[FlagKind::Error, FlagKind::Unavailable]);
        op.new_state = applied_state(args.kv.origin);
        self.set_state(key, op.new_state);
        if equivalent {
            op.operation = TxnOperation::Update;
            self.set_last_operation(key, TxnOperation::Update);
        }

        if !equivalent || op.prev_state != op.new_state {
            let confirms_in_sync =
                equivalent && op.prev_state == ValueState::Discovered && op.new_state == ValueState::Configured;
            if !confirms_in_sync {
                op.noop = equivalent;
                ops.push(op);
            }
        }

        if !args.is_derived {
            self.apply_derived(derived_to_txn(derives, &args.kv), args, true, ops)?;
        }
        Ok(())
    }

    fn mark_invalid(
        &mut self,
        args: &ApplyArgs,
        mut op: RecordedTxnOp,
        ops: &mut Vec<RecordedTxnOp>,
        err: DescriptorError,
    ) -> Outcome {
        let key = args.kv.key.as_str();
        self.w.set_node(key).set_flag(Flag::Unavailable);
        op.new_err = Some(err.clone());
        op.new_state = ValueState::Invalid;
        op.noop = true;
        self.set_state(key, ValueState::Invalid);
        self.w.set_node(key).set_flag(Flag::Error { err: err.clone(), retriable: false });
        ops.push(op);
        self.own_error(key, err)
    }

    // ========================================================================
    // Relations, derived values, dependents
    // ========================================================================

    /// Refresh the relation targets of the value and remove derived values
    /// it no longer derives. Returns the current derived values.
    fn apply_new_relations(
        &mut self,
        args: &ApplyArgs,
        descriptor: Option<&dyn KvDescriptor>,
        prev_value: Option<&ValueRef>,
        update_deps: bool,
        ops: &mut Vec<RecordedTxnOp>,
    ) -> Result<Vec<KeyValuePair>, DescriptorError> {
        if args.is_derived && !update_deps {
            return Ok(Vec::new());
        }
        let key = args.kv.key.as_str();
        let value = self.graph().get_node(key).and_then(|n| n.value().cloned());

        let prev_derived: KeySet = match (args.is_derived, prev_value, descriptor) {
            (false, Some(prev), Some(d)) => d.derived_values(key, prev.as_ref()).into_iter().map(|kv| kv.key).collect(),
            _ => KeySet::new(),
        };
        let derived = match (args.is_derived, &value, descriptor) {
            (false, Some(v), Some(d)) => d.derived_values(key, v.as_ref()),
            _ => Vec::new(),
        };
        let new_derived: KeySet = derived.iter().map(|kv| kv.key.clone()).collect();
        let update_derived = prev_derived != new_derived;

        if update_deps || update_derived {
            let deps = match (&value, descriptor) {
                (Some(v), Some(d)) => d.dependencies(key, v.as_ref()),
                _ => Vec::new(),
            };
            self.w.set_node(key).set_targets(construct_targets(deps, new_derived.iter().cloned()));
        }

        if update_derived {
            let obsolete: Vec<KvForTxn> = prev_derived
                .difference(&new_derived)
                .map(|k| KvForTxn::new(k.clone(), None, args.kv.origin).reverting(args.kv.is_revert))
                .collect();
            if !obsolete.is_empty() {
                self.apply_derived(obsolete, args, false, ops)?;
            }
        }
        Ok(derived)
    }

    /// (Re-)apply derived values, in key order. Returns the last failure.
    fn apply_derived(
        &mut self,
        mut derived: Vec<KvForTxn>,
        args: &ApplyArgs,
        check: bool,
        ops: &mut Vec<RecordedTxnOp>,
    ) -> Outcome {
        derived.sort_by(|a, b| a.key.cmp(&b.key));
        let mut failure = None;
        for kv in derived {
            if check && !self.valid_derived_kv(&kv, &args.base_key) {
                continue;
            }
            let der_args = ApplyArgs { kv, is_derived: true, is_dep_update: false, ..args.clone() };
            if let Err(err) = self.apply_value(&der_args, ops) {
                failure = Some(err);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn valid_derived_kv(&self, kv: &KvForTxn, base: &str) -> bool {
        if kv.value.is_none() {
            warn!(txn_seq = self.txn.seq_num, key = %kv.key, "derived nil value");
            return false;
        }
        if self.graph().get_node(&kv.key).is_some_and(|n| !is_derived(n)) {
            let err = DescriptorError::DerivedCollision { base: base.to_string() };
            warn!(txn_seq = self.txn.seq_num, key = %kv.key, %err, "skipping derived value");
            return false;
        }
        true
    }

    /// Re-evaluate the NB values depending on `key`: the unavailable ones
    /// after it was created, the available ones after it was removed.
    fn run_dep_updates(
        &mut self,
        key: &str,
        args: &ApplyArgs,
        for_unavailable: bool,
        ops: &mut Vec<RecordedTxnOp>,
    ) -> Outcome {
        let dependents: Vec<(KvForTxn, String, bool)> = {
            let graph = self.graph();
            let Some(node) = graph.get_node(key) else {
                return Ok(());
            };
            let mut keys: Vec<&str> = node
                .sources_of(DEPENDENCY_RELATION)
                .iter()
                .flat_map(|s| s.matching_keys.iter().map(String::as_str))
                .collect();
            keys.sort_unstable();
            keys.dedup();
            keys.into_iter()
                .filter_map(|k| graph.get_node(k))
                .filter(|dep| !is_available(dep) == for_unavailable)
                .filter_map(|dep| {
                    // obtained values follow SB notifications, never their dependencies
                    let dep_origin = origin(Some(dep));
                    if dep_origin != ValueOrigin::FromNb {
                        return None;
                    }
                    // DISCOVERED values have no last update
                    let value = match last_update(Some(dep)) {
                        Some(lu) => lu.value.clone(),
                        None => dep.value().cloned(),
                    };
                    let kv = KvForTxn::new(dep.key(), value, dep_origin).reverting(args.kv.is_revert);
                    Some((kv, base_key(dep).to_string(), is_derived(dep)))
                })
                .collect()
        };

        let mut failure = None;
        for (kv, base_key, is_derived) in dependents {
            let dep_args = ApplyArgs { kv, base_key, is_derived, is_dep_update: true, ..args.clone() };
            if let Err(err) = self.apply_value(&dep_args, ops) {
                failure = Some(err);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn dep_update_operation(&self, key: &str) -> TxnOperation {
        let Some(node) = self.graph().get_node(key) else {
            return TxnOperation::Undefined;
        };
        let ready = is_ready(self.graph(), key);
        match (is_available(node), ready) {
            (false, true) => TxnOperation::Add,
            (true, false) => TxnOperation::Delete,
            _ => TxnOperation::Undefined,
        }
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    /// Operation record with everything known before executing it.
    fn pre_record_op(&self, args: &ApplyArgs) -> RecordedTxnOp {
        let key = args.kv.key.as_str();
        let node = self.graph().get_node(key);
        let prev_state = state(node);
        let prev_origin = match origin(node) {
            ValueOrigin::Unknown => args.kv.origin,
            known => known,
        };
        RecordedTxnOp {
            key: key.to_string(),
            prev_value: if prev_state == ValueState::Removed {
                None
            } else {
                node.and_then(|n| n.value().cloned())
            },
            new_value: args.kv.value.clone(),
            prev_origin,
            new_origin: args.kv.origin,
            prev_state,
            prev_err: node.and_then(|n| n.flags().error()).map(|(err, _)| err.clone()),
            is_derived: args.is_derived,
            is_property: args.is_derived && self.inner.registry.get_for_key(key).is_none(),
            is_revert: args.kv.is_revert,
            is_retry: args.is_retry,
            is_recreate: args.recreating.as_ref().is_some_and(|keys| keys.contains(key)),
            ..RecordedTxnOp::default()
        }
    }

    fn set_state(&mut self, key: &str, new_state: ValueState) {
        if state(self.graph().get_node(key)) != new_state {
            self.w.set_node(key).set_flag(Flag::ValueState(new_state));
        }
    }

    /// Only touches a last update written by this transaction.
    fn set_last_operation(&mut self, key: &str, operation: TxnOperation) {
        let seq_num = self.txn.seq_num;
        if let Some(mut lu) = last_update(self.graph().get_node(key)).filter(|lu| lu.txn_seq_num == seq_num).cloned() {
            lu.txn_op = operation;
            self.w.set_node(key).set_flag(Flag::LastUpdate(lu));
        }
    }

    /// Mark the value `Retrying` if a retry is allowed, `Failed` otherwise.
    fn mark_failed(&mut self, args: &ApplyArgs, err: DescriptorError, retriable: bool) -> ValueState {
        let key = args.kv.key.as_str();
        let mut new_state = ValueState::Failed;
        let to_be_reverted =
            self.txn.nb.as_ref().is_some_and(|nb| nb.revert_on_failure) && !args.kv.is_revert;
        if retriable && !to_be_reverted {
            let node = self.graph().get_node(key);
            let base = node.map_or(key, base_key);
            let attempt = match &self.txn.retry {
                Some(retry) if retry.keys.contains_key(base) => retry.meta.attempt + 1,
                _ => 1,
            };
            let allowed = last_update(node)
                .and_then(|lu| lu.retry)
                .is_some_and(|opt| opt.max_count == 0 || attempt <= opt.max_count);
            if allowed {
                new_state = ValueState::Retrying;
            }
        }
        self.set_state(key, new_state);
        self.w.set_node(key).set_flag(Flag::Error { err, retriable });
        new_state
    }

    /// Failures of values outside the transaction do not fail it.
    fn own_error(&self, key: &str, err: DescriptorError) -> Outcome {
        let base = self.graph().get_node(key).map_or(key, base_key);
        if self.applied.contains(base) { Err(err) } else { Ok(()) }
    }
}

fn applied_state(origin: ValueOrigin) -> ValueState {
    if origin == ValueOrigin::FromSb {
        ValueState::Obtained
    } else {
        ValueState::Configured
    }
}

fn retriable(descriptor: &dyn KvDescriptor, err: &DescriptorError) -> bool {
    !err.is_permanent() && descriptor.is_retriable_failure(err)
}

fn derived_to_txn(derived: Vec<KeyValuePair>, base: &KvForTxn) -> Vec<KvForTxn> {
    derived
        .into_iter()
        .map(|kv| KvForTxn::new(kv.key, kv.value, base.origin).reverting(base.is_revert))
        .collect()
}

/// Drop uninteresting intermediate operations: a Create that ended pending
/// and is followed by another Create of the same key, and a Delete of a
/// pending value preceded by another Delete of the same key.
pub(super) fn compress_txn_ops(mut executed: Vec<RecordedTxnOp>) -> Vec<RecordedTxnOp> {
    let mut keep = vec![true; executed.len()];
    for i in 0..executed.len() {
        if executed[i].operation != TxnOperation::Add || executed[i].new_state != ValueState::Pending {
            continue;
        }
        let Some(j) = (i + 1..executed.len()).find(|&j| executed[j].key == executed[i].key) else {
            continue;
        };
        if executed[j].operation == TxnOperation::Add {
            let prev_value = executed[i].prev_value.clone();
            let prev_err = executed[i].prev_err.clone();
            let prev_state = executed[i].prev_state;
            let later = &mut executed[j];
            later.prev_value = prev_value;
            later.prev_err = prev_err;
            later.prev_state = prev_state;
            keep[i] = false;
        }
    }
    let mut compressed: Vec<RecordedTxnOp> = executed
        .into_iter()
        .zip(keep)
        .filter_map(|(op, keep)| keep.then_some(op))
        .collect();

    let mut i = compressed.len();
    while i > 0 {
        i -= 1;
        if compressed[i].operation != TxnOperation::Delete || compressed[i].prev_state != ValueState::Pending {
            continue;
        }
        let Some(j) = (0..i).rev().find(|&j| compressed[j].key == compressed[i].key) else {
            continue;
        };
        if compressed[j].operation == TxnOperation::Delete {
            let op = compressed.remove(i);
            let earlier = &mut compressed[j];
            earlier.new_value = op.new_value;
            earlier.new_err = op.new_err;
            earlier.new_state = op.new_state;
        }
    }
    compressed
}
