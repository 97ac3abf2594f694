//! Refresh: re-reads the actual SB state through `retrieve` and folds it
//! into the graph.

use std::fmt::Write as _;

use hashbrown::HashSet;
use tracing::{debug, error, warn};

use crate::descriptor::KvDescriptor;
use crate::graph::{Flag, FlagKind, GraphWriter, KeySet};
use crate::model::value::display_value;
use crate::model::{KvWithMetadata, ValueOrigin, ValueState};
use super::node_utils::{
    base_key, construct_targets, derived_keys, descriptor_selectors, is_available, last_update, origin,
    state, to_kv_with_metadata,
};
use super::txn::KvForTxn;
use super::Inner;

/// Desired state carried by a resync transaction.
pub(super) struct ResyncData<'a> {
    /// The first resync after start: the graph holds nothing to correlate with.
    pub first: bool,
    pub values: &'a [KvForTxn],
}

/// Refresh the graph against the SB. With `keys`, only the listed keys are
/// refreshed (and only descriptors owning at least one of them are asked);
/// an empty set means everything.
pub(super) fn refresh_graph(
    inner: &Inner,
    w: &mut GraphWriter<'_>,
    keys: Option<&KeySet>,
    resync: Option<ResyncData<'_>>,
    verbose: bool,
) {
    let keys = keys.filter(|k| !k.is_empty());
    let mut refreshed: HashSet<String> = HashSet::new();

    for descriptor in inner.registry.all() {
        let name = descriptor.name();
        let descr_nodes: Vec<String> = w
            .get_nodes(None, &descriptor_selectors(name, false))
            .into_iter()
            .map(|n| n.key().to_string())
            .collect();

        if let Some(keys) = keys {
            if !keys.iter().any(|k| descriptor.key_selector(k)) {
                skip_refresh(w, &descr_nodes, None, &mut refreshed);
                continue;
            }
        }

        let correlate: Vec<KvWithMetadata> = match &resync {
            Some(resync) if resync.first => resync
                .values
                .iter()
                .filter(|kv| descriptor.key_selector(&kv.key))
                .map(|kv| KvWithMetadata {
                    key: kv.key.clone(),
                    value: kv.value.clone(),
                    metadata: None,
                    origin: kv.origin,
                })
                .collect(),
            _ => descr_nodes
                .iter()
                .filter_map(|k| w.get_node(k))
                .filter(|n| is_available(n))
                .map(to_kv_with_metadata)
                .collect(),
        };

        if !descriptor.capabilities().supports_retrieve {
            skip_refresh(w, &descr_nodes, None, &mut refreshed);
            continue;
        }
        let retrieved = match descriptor.retrieve(&correlate) {
            Ok(retrieved) => retrieved,
            Err(err) => {
                error!(descriptor = name, %err, "failed to retrieve values, skipping refresh");
                skip_refresh(w, &descr_nodes, None, &mut refreshed);
                continue;
            }
        };
        if verbose {
            let mut list = String::new();
            for (i, kv) in retrieved.iter().enumerate() {
                let _ = write!(list, "\n - {:>3} [{name}]: {:?} ({})\n   {}",
                    format!("{}.", i + 1), kv.key, kv.origin, display_value(kv.value.as_ref()));
            }
            debug!(descriptor = name, count = retrieved.len(), "retrieved values:{list}");
        }

        if keys.is_some() {
            skip_refresh(w, &descr_nodes, keys, &mut refreshed);
        }

        for mut kv in retrieved {
            if keys.is_some_and(|keys| !keys.contains(&kv.key)) {
                continue;
            }
            if !valid_retrieved_kv(&kv, descriptor.as_ref(), &refreshed) {
                continue;
            }
            if kv.origin == ValueOrigin::Unknown {
                if let Some(expected) = correlate.iter().find(|c| c.key == kv.key) {
                    kv.origin = expected.origin;
                }
            }
            if kv.origin == ValueOrigin::Unknown {
                if let Some(last) = w.get_node_timeline(&kv.key).last() {
                    kv.origin = last.flags.value_state().origin();
                }
            }
            if kv.origin == ValueOrigin::Unknown {
                kv.origin = ValueOrigin::FromSb;
            }
            refresh_value(inner, w, kv, descriptor.as_ref(), &mut refreshed);
        }

        // no longer in SB: metadata is stale
        for key in &descr_nodes {
            if refreshed.contains(key) {
                continue;
            }
            let stale = w
                .get_node(key)
                .is_some_and(|n| origin(Some(n)) == ValueOrigin::FromNb && n.metadata().is_some());
            if stale {
                w.set_node(key).set_metadata(None);
            }
        }
    }

    let unrefreshed: Vec<String> = w.get_keys().into_iter().filter(|k| !refreshed.contains(k)).collect();
    for key in unrefreshed {
        refresh_unavail_node(inner, w, &key, &mut refreshed);
    }
}

fn refresh_value(
    inner: &Inner,
    w: &mut GraphWriter<'_>,
    kv: KvWithMetadata,
    descriptor: &dyn KvDescriptor,
    refreshed: &mut HashSet<String>,
) {
    let key = kv.key.as_str();
    {
        let mut node = w.set_node(key);
        node.set_label(&descriptor.key_label(key)).set_value(kv.value.clone());
        if descriptor.capabilities().with_metadata {
            node.set_metadata_map(descriptor.name()).set_metadata(kv.metadata.clone());
        }
    }
    refresh_avail_node(inner, w, key, kv.origin, None, refreshed);

    let mut obsolete = w.get_node(key).map(derived_keys).unwrap_or_default();
    let derives = match &kv.value {
        Some(v) => descriptor.derived_values(key, v.as_ref()),
        None => Vec::new(),
    };
    for derived in &derives {
        obsolete.remove(&derived.key);
    }
    let deps = match &kv.value {
        Some(v) => descriptor.dependencies(key, v.as_ref()),
        None => Vec::new(),
    };
    let derived_keys = derives.iter().map(|d| d.key.clone()).chain(obsolete.iter().cloned());
    w.set_node(key).set_targets(construct_targets(deps, derived_keys));

    for derived in derives {
        let der_key = derived.key.as_str();
        let deps = match (&derived.value, inner.registry.get_for_key(der_key)) {
            (Some(v), Some(d)) => d.dependencies(der_key, v.as_ref()),
            _ => Vec::new(),
        };
        w.set_node(der_key)
            .set_value(derived.value.clone())
            .set_targets(construct_targets(deps, Vec::new()));
        refresh_avail_node(inner, w, der_key, kv.origin, Some(key), refreshed);
    }
    for der_key in obsolete {
        refresh_unavail_node(inner, w, &der_key, refreshed);
    }
}

/// The value exists in SB. `derived_from` is the base key of a derived value.
fn refresh_avail_node(
    inner: &Inner,
    w: &mut GraphWriter<'_>,
    key: &str,
    value_origin: ValueOrigin,
    derived_from: Option<&str>,
    refreshed: &mut HashSet<String>,
) {
    let descriptor = inner.registry.get_for_key(key);
    let Some(node) = w.get_node(key) else { return };

    if derived_from.is_some() {
        if node.value().is_none() {
            warn!(key, "derived nil value");
            w.delete_node(key);
            return;
        }
        if refreshed.contains(key) {
            warn!(key, "the same value was retrieved more than once");
        }
    }

    let base = derived_from.unwrap_or(key);
    if !is_available(node) {
        inner.updated_states.lock().insert(base.to_string());
    }
    let new_state = match state(Some(node)) {
        ValueState::Nonexistent if value_origin == ValueOrigin::FromSb => Some(ValueState::Obtained),
        ValueState::Nonexistent => Some(ValueState::Discovered),
        ValueState::Pending => Some(ValueState::Configured),
        _ => None,
    };
    refreshed.insert(key.to_string());

    let mut node = w.set_node(key);
    node.del_flags(&[FlagKind::Unavailable]);
    if let Some(new_state) = new_state {
        node.set_flag(Flag::ValueState(new_state));
    }
    match &descriptor {
        Some(d) => node.set_flag(Flag::Descriptor(d.name().to_string())),
        None => node.del_flags(&[FlagKind::Descriptor]),
    };
    match derived_from {
        Some(base) => node.set_flag(Flag::Derived(base.to_string())),
        None => node.del_flags(&[FlagKind::Derived]),
    };
}

/// The value was not found in SB.
fn refresh_unavail_node(inner: &Inner, w: &mut GraphWriter<'_>, key: &str, refreshed: &mut HashSet<String>) {
    refreshed.insert(key.to_string());
    let Some(node) = w.get_node(key) else { return };
    let available = is_available(node);
    if available {
        inner.updated_states.lock().insert(base_key(node).to_string());
    }
    let current = state(Some(node));
    if origin(Some(node)) == ValueOrigin::FromSb || current == ValueState::Discovered {
        w.delete_node(key);
        return;
    }
    let new_state = match current {
        ValueState::Configured if last_update(Some(node)).is_some_and(|lu| lu.value.is_none()) => {
            Some(ValueState::Removed)
        }
        ValueState::Configured => Some(ValueState::Missing),
        _ => None,
    };

    let mut node = w.set_node(key);
    if available {
        node.set_flag(Flag::Unavailable);
    }
    if let Some(new_state) = new_state {
        node.set_flag(Flag::ValueState(new_state));
    }
}

/// Mark `nodes` (and what they derive) refreshed without asking SB,
/// except the keys listed in `except`.
fn skip_refresh(
    w: &GraphWriter<'_>,
    nodes: &[String],
    except: Option<&KeySet>,
    refreshed: &mut HashSet<String>,
) {
    for key in nodes {
        if except.is_some_and(|e| e.contains(key)) {
            continue;
        }
        refreshed.insert(key.clone());
        if let Some(node) = w.get_node(key) {
            refreshed.extend(derived_keys(node));
        }
    }
}

fn valid_retrieved_kv(kv: &KvWithMetadata, descriptor: &dyn KvDescriptor, refreshed: &HashSet<String>) -> bool {
    let name = descriptor.name();
    if kv.key.is_empty() {
        warn!(descriptor = name, "descriptor retrieved value with empty key");
        return false;
    }
    if refreshed.contains(&kv.key) {
        warn!(descriptor = name, key = %kv.key, "the same value was retrieved more than once");
        return false;
    }
    if kv.value.is_none() {
        warn!(descriptor = name, key = %kv.key, "descriptor retrieved nil value");
        return false;
    }
    if !descriptor.key_selector(&kv.key) {
        warn!(descriptor = name, key = %kv.key, "descriptor retrieved value outside of its key space");
        return false;
    }
    true
}
