//! Node accessors shared by execution, refresh and the read API.

use hashbrown::HashMap;

use crate::graph::{
    Flag, FlagKind, FlagSelector, GraphState, KeySet, LastUpdate, Node, RelationTargetDef,
    TargetSelector,
};
use crate::model::{
    BaseValueStatus, Dependency, KvWithMetadata, TxnOperation, ValueOrigin, ValueState, ValueStatus,
};
use crate::{DEPENDENCY_RELATION, DERIVES_RELATION};

pub(crate) fn state(node: Option<&Node>) -> ValueState {
    node.map_or(ValueState::Nonexistent, |n| n.flags().value_state())
}

pub(crate) fn origin(node: Option<&Node>) -> ValueOrigin {
    state(node).origin()
}

pub(crate) fn is_available(node: &Node) -> bool {
    !node.flags().has(FlagKind::Unavailable)
}

pub(crate) fn is_derived(node: &Node) -> bool {
    node.flags().has(FlagKind::Derived)
}

pub(crate) fn base_key(node: &Node) -> &str {
    node.flags().derived_from().unwrap_or(node.key())
}

pub(crate) fn last_update(node: Option<&Node>) -> Option<&LastUpdate> {
    node.and_then(|n| n.flags().last_update())
}

/// Operation of the last update; SB values have none.
pub(crate) fn last_operation(node: Option<&Node>) -> TxnOperation {
    match node {
        Some(n) if state(node) != ValueState::Obtained => {
            n.flags().last_update().map_or(TxnOperation::Undefined, |lu| lu.txn_op)
        }
        _ => TxnOperation::Undefined,
    }
}

pub(crate) fn error_string(node: Option<&Node>) -> String {
    node.and_then(|n| n.flags().error())
        .map(|(err, _)| err.to_string())
        .unwrap_or_default()
}

/// Keys of the values derived from `node`.
pub(crate) fn derived_keys(node: &Node) -> KeySet {
    node.targets_of(DERIVES_RELATION)
        .iter()
        .flat_map(|t| t.matching_keys.iter().cloned())
        .collect()
}

pub(crate) fn to_kv_with_metadata(node: &Node) -> KvWithMetadata {
    KvWithMetadata {
        key: node.key().to_string(),
        value: node.value().cloned(),
        metadata: node.metadata().cloned(),
        origin: origin(Some(node)),
    }
}

// ============================================================================
// Value status
// ============================================================================

/// Invalid fields of an invalid value, unsatisfied dependency labels of a
/// pending one.
pub(crate) fn value_details(graph: &GraphState, node: &Node) -> Vec<String> {
    match state(Some(node)) {
        ValueState::Invalid => node
            .flags()
            .error()
            .map(|(err, _)| err.invalid_fields().to_vec())
            .unwrap_or_default(),
        ValueState::Pending => node
            .targets_of(DEPENDENCY_RELATION)
            .iter()
            .filter(|target| {
                !target
                    .matching_keys
                    .iter()
                    .any(|k| graph.get_node(k).is_some_and(is_available))
            })
            .map(|target| target.label.clone())
            .collect(),
        _ => Vec::new(),
    }
}

/// Order-insensitive comparison of two detail lists.
pub(crate) fn equal_details(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|d| b.contains(d))
}

pub(crate) fn value_status(graph: &GraphState, node: Option<&Node>, key: &str) -> BaseValueStatus {
    let mut status = BaseValueStatus {
        value: ValueStatus { key: key.to_string(), state: state(node), ..Default::default() },
        derived_values: Vec::new(),
    };
    let Some(n) = node else {
        return status;
    };
    if status.value.state == ValueState::Nonexistent {
        return status;
    }
    status.value.error = error_string(node);
    status.value.last_operation = last_operation(node);
    status.value.details = value_details(graph, n);

    if !is_derived(n) {
        for derived in derived_keys(n) {
            let derived_node = graph.get_node(&derived);
            status.derived_values.push(value_status(graph, derived_node, &derived).value);
        }
    }
    status
}

// ============================================================================
// Readiness
// ============================================================================

/// Whether every dependency of the node is satisfied. Nodes of a dependency
/// cycle are treated as one node: the cycle is ready if all of its
/// dependencies leading outside are.
pub(crate) fn is_ready(graph: &GraphState, key: &str) -> bool {
    let Some(node) = graph.get_node(key) else {
        return false;
    };
    if origin(Some(node)) == ValueOrigin::FromSb {
        return true;
    }
    let mut visited = HashMap::new();
    is_ready_rec(graph, node, 0, &mut visited, false).0
}

/// Returns readiness and the lowest depth on the current branch reachable
/// from the node by following dependencies.
fn is_ready_rec(
    graph: &GraphState,
    node: &Node,
    depth: usize,
    visited: &mut HashMap<String, usize>,
    check_scc: bool,
) -> (bool, usize) {
    if let Some(&target_depth) = visited.get(node.key()) {
        return (true, target_depth);
    }
    let mut cycle_depth = depth;
    visited.insert(node.key().to_string(), depth);

    let mut ready = true;
    'labels: for target in node.targets_of(DEPENDENCY_RELATION) {
        let mut satisfied = false;
        for key in &target.matching_keys {
            let Some(dep) = graph.get_node(key) else { continue };
            if state(Some(dep)) == ValueState::Removed {
                continue;
            }
            if is_available(dep) {
                satisfied = true;
                if !check_scc {
                    break;
                }
            }
            let (dep_ready, dep_cycle_depth) = is_ready_rec(graph, dep, depth + 1, visited, true);
            if dep_ready && dep_cycle_depth <= depth {
                satisfied = true;
                cycle_depth = cycle_depth.min(dep_cycle_depth);
            }
        }
        if !satisfied {
            ready = false;
            break 'labels;
        }
    }

    visited.remove(node.key());
    (ready, cycle_depth)
}

// ============================================================================
// Selectors and targets
// ============================================================================

/// Non-derived values requested by NB.
pub(crate) fn nb_base_selectors() -> Vec<FlagSelector> {
    vec![
        FlagSelector::without([Flag::Derived(String::new())]),
        FlagSelector::without([Flag::ValueState(ValueState::Obtained)]),
    ]
}

/// Non-derived values reported by SB.
pub(crate) fn sb_base_selectors() -> Vec<FlagSelector> {
    vec![
        FlagSelector::without([Flag::Derived(String::new())]),
        FlagSelector::with([Flag::ValueState(ValueState::Obtained)]),
    ]
}

/// Non-derived values of one descriptor.
pub(crate) fn descriptor_selectors(descriptor: &str, only_available: bool) -> Vec<FlagSelector> {
    let mut selectors = vec![
        FlagSelector::with([Flag::Descriptor(descriptor.to_string())]),
        FlagSelector::without([Flag::Derived(String::new())]),
    ];
    if only_available {
        selectors.push(FlagSelector::without([Flag::Unavailable]));
    }
    selectors
}

/// Relation targets of a value: one per dependency, one per derived key.
pub(crate) fn construct_targets(
    deps: Vec<Dependency>,
    derived: impl IntoIterator<Item = String>,
) -> Vec<RelationTargetDef> {
    let mut targets: Vec<RelationTargetDef> = deps
        .into_iter()
        .map(|dep| match dep.key {
            Some(key) => RelationTargetDef::to_key(DEPENDENCY_RELATION, &dep.label, &key),
            None => RelationTargetDef::to_selection(DEPENDENCY_RELATION, &dep.label, TargetSelector {
                key_prefixes: dep.any_of.key_prefixes,
                key_selector: dep.any_of.key_selector,
            }),
        })
        .collect();
    targets.extend(
        derived
            .into_iter()
            .map(|key| RelationTargetDef::to_key(DERIVES_RELATION, &key, &key)),
    );
    targets
}
