//! End-to-end tests for NB data changes.
//!
//! Each test commits transactions against a scheduler wired to the mock
//! southbound in `common` and checks both the scheduler's view and the
//! operations the mock SB received.

mod common;

use common::*;
use kvsched::{
    DescriptorError, KvScheduler, TxnContext, TxnOperation, ValueState, prefix_selector, value,
};
use pretty_assertions::assert_eq;

// ============================================================================
// 1. Values are created in dependency order
// ============================================================================

#[tokio::test]
async fn test_create_interface_and_route() {
    let (scheduler, sb) = setup();

    let outcome = scheduler
        .start_nb_transaction()
        .set_value(route_key("r1"), Some(route("10.1.0.0/24", "if1")))
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new())
        .await
        .unwrap();

    assert!(outcome.errors.is_empty());
    assert_eq!(sb.ops(), vec!["create /if/if1", "create /route/r1"]);
    assert!(scheduler.get_value("/route/r1").is_some());
    assert_eq!(scheduler.get_value_status("/route/r1").value.state, ValueState::Configured);
    assert_eq!(scheduler.get_value_status("/if/if1").value.last_operation, TxnOperation::Add);
}

// ============================================================================
// 2. A value with a missing dependency stays pending until it appears
// ============================================================================

#[tokio::test]
async fn test_pending_until_dependency_added() {
    let (scheduler, sb) = setup();

    let outcome = scheduler
        .start_nb_transaction()
        .set_value(route_key("r1"), Some(route("10.1.0.0/24", "if1")))
        .commit(TxnContext::new())
        .await
        .unwrap();
    assert!(outcome.errors.is_empty());
    assert!(sb.ops().is_empty());
    assert!(scheduler.get_value("/route/r1").is_none());

    let pending = scheduler.get_pending_values(None);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key, "/route/r1");
    assert_eq!(scheduler.get_value_status("/route/r1").value.state, ValueState::Pending);

    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new())
        .await
        .unwrap();

    assert_eq!(sb.ops(), vec!["create /if/if1", "create /route/r1"]);
    assert!(scheduler.get_pending_values(None).is_empty());
    assert_eq!(scheduler.get_value_status("/route/r1").value.state, ValueState::Configured);
}

// ============================================================================
// 3. Removing a dependency caches the dependent, re-adding restores it
// ============================================================================

#[tokio::test]
async fn test_dependent_cached_and_restored() {
    let (scheduler, sb) = setup();
    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .set_value(route_key("r1"), Some(route("10.1.0.0/24", "if1")))
        .commit(TxnContext::new())
        .await
        .unwrap();
    sb.take_ops();

    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), None)
        .commit(TxnContext::new())
        .await
        .unwrap();

    assert_eq!(sb.take_ops(), vec!["delete /route/r1", "delete /if/if1"]);
    assert_eq!(scheduler.get_value_status("/route/r1").value.state, ValueState::Pending);
    assert!(sb.keys().is_empty());

    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new())
        .await
        .unwrap();

    assert_eq!(sb.take_ops(), vec!["create /if/if1", "create /route/r1"]);
    assert_eq!(sb.keys(), vec!["/if/if1", "/route/r1"]);
}

// ============================================================================
// 4. Derived values follow their base value
// ============================================================================

#[tokio::test]
async fn test_derived_values_follow_base() {
    let (scheduler, sb) = setup();

    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &["10.0.0.1"])))
        .commit(TxnContext::new())
        .await
        .unwrap();
    assert_eq!(sb.take_ops(), vec!["create /if/if1", "create /if/if1/addr/10.0.0.1"]);

    let status = scheduler.get_value_status("/if/if1");
    assert_eq!(status.derived_values.len(), 1);
    assert_eq!(status.derived_values[0].key, addr_key("if1", "10.0.0.1"));
    assert_eq!(status.derived_values[0].state, ValueState::Configured);

    let keys: Vec<String> = scheduler
        .get_values(Some(prefix_selector("/if/if1")))
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    assert_eq!(keys, vec!["/if/if1", "/if/if1/addr/10.0.0.1"]);

    // the address changes: the obsolete one goes first
    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 9000, &["10.0.0.2"])))
        .commit(TxnContext::new())
        .await
        .unwrap();
    assert_eq!(
        sb.take_ops(),
        vec!["delete /if/if1/addr/10.0.0.1", "update /if/if1", "create /if/if1/addr/10.0.0.2"]
    );

    let removal = scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), None)
        .commit(TxnContext::new())
        .await
        .unwrap();
    assert_eq!(sb.take_ops(), vec!["delete /if/if1/addr/10.0.0.2", "delete /if/if1"]);
    assert!(scheduler.get_values(None).is_empty());

    // only the base value was requested, the derived one followed it
    let record = scheduler.get_recorded_transaction(removal.seq_num).unwrap();
    let requested: Vec<&str> = record.values.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(requested, vec!["/if/if1"]);
    let derived: Vec<(&str, bool)> = record.executed.iter().map(|op| (op.key.as_str(), op.is_derived)).collect();
    assert_eq!(derived, vec![("/if/if1/addr/10.0.0.2", true), ("/if/if1", false)]);

    // re-adding the base brings back the same derived value
    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 9000, &["10.0.0.2"])))
        .commit(TxnContext::new())
        .await
        .unwrap();
    assert_eq!(sb.take_ops(), vec!["create /if/if1", "create /if/if1/addr/10.0.0.2"]);
    let addr = sb.get(&addr_key("if1", "10.0.0.2")).unwrap();
    assert_eq!(
        addr.downcast_ref::<IfAddr>(),
        Some(&IfAddr { iface: "if1".to_string(), addr: "10.0.0.2".to_string() })
    );
    let status = scheduler.get_value_status("/if/if1");
    assert_eq!(status.derived_values.len(), 1);
    assert_eq!(status.derived_values[0].state, ValueState::Configured);
}

// ============================================================================
// 5. Re-applying the same values executes nothing
// ============================================================================

#[tokio::test]
async fn test_idempotent_commit() {
    let (scheduler, sb) = setup();
    let commit = || {
        scheduler
            .start_nb_transaction()
            .set_value(if_key("if1"), Some(iface("if1", 1500, &["10.0.0.1"])))
            .set_value(route_key("r1"), Some(route("10.1.0.0/24", "if1")))
            .commit(TxnContext::new().with_description("same config"))
    };

    let first = commit().await.unwrap();
    let ops_after_first = sb.ops().len();
    let revisions = |key: &str| scheduler.get_node_timeline(key).len();
    let before = (revisions("/if/if1"), revisions("/if/if1/addr/10.0.0.1"), revisions("/route/r1"));
    let second = commit().await.unwrap();

    assert_eq!(sb.ops().len(), ops_after_first);
    assert!(second.seq_num > first.seq_num);

    // the graph is left untouched, including the last-update bookkeeping
    let after = (revisions("/if/if1"), revisions("/if/if1/addr/10.0.0.1"), revisions("/route/r1"));
    assert_eq!(after, before);
    assert_eq!(scheduler.get_value_status("/if/if1").value.last_operation, TxnOperation::Add);

    let record = scheduler.get_recorded_transaction(second.seq_num).unwrap();
    assert_eq!(record.description, "same config");
    assert_eq!(record.values.len(), 2);
    assert!(record.executed.is_empty());

    let first_record = scheduler.get_recorded_transaction(first.seq_num).unwrap();
    let executed: Vec<(TxnOperation, &str)> = first_record
        .executed
        .iter()
        .map(|op| (op.operation, op.key.as_str()))
        .collect();
    assert_eq!(
        executed,
        vec![
            (TxnOperation::Add, "/if/if1"),
            (TxnOperation::Add, "/if/if1/addr/10.0.0.1"),
            (TxnOperation::Add, "/route/r1"),
        ]
    );
}

// ============================================================================
// 6. Values without update support are re-created
// ============================================================================

#[tokio::test]
async fn test_modify_route_recreates() {
    let (scheduler, sb) = setup();
    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .set_value(route_key("r1"), Some(route("10.1.0.0/24", "if1")))
        .commit(TxnContext::new())
        .await
        .unwrap();
    sb.take_ops();

    scheduler
        .start_nb_transaction()
        .set_value(route_key("r1"), Some(route("10.2.0.0/24", "if1")))
        .commit(TxnContext::new())
        .await
        .unwrap();

    assert_eq!(sb.take_ops(), vec!["delete /route/r1", "create /route/r1"]);
    let stored = sb.get("/route/r1").unwrap();
    assert_eq!(stored.downcast_ref::<Route>().map(|r| r.dst.as_str()), Some("10.2.0.0/24"));
}

// ============================================================================
// 7. Invalid values are rejected before reaching SB
// ============================================================================

#[tokio::test]
async fn test_invalid_value() {
    let (scheduler, sb) = setup();

    let outcome = scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 0, &[])))
        .commit(TxnContext::new())
        .await
        .unwrap();

    assert!(sb.ops().is_empty());
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].key, "/if/if1");
    assert_eq!(outcome.errors[0].operation, TxnOperation::Add);
    assert!(matches!(outcome.errors[0].error, DescriptorError::InvalidValue { .. }));
    assert_eq!(outcome.errors[0].error.invalid_fields(), ["mtu".to_string()]);

    let status = scheduler.get_value_status("/if/if1");
    assert_eq!(status.value.state, ValueState::Invalid);
    assert!(!status.value.error.is_empty());
    assert_eq!(scheduler.get_failed_values(None).len(), 1);

    // fixing the value applies it
    let outcome = scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new())
        .await
        .unwrap();
    assert!(outcome.errors.is_empty());
    assert_eq!(sb.ops(), vec!["create /if/if1"]);
    assert!(scheduler.get_failed_values(None).is_empty());
}

// ============================================================================
// 8. Keys no descriptor handles are kept as unimplemented
// ============================================================================

#[tokio::test]
async fn test_unimplemented_value() {
    let (scheduler, sb) = setup();

    let outcome = scheduler
        .start_nb_transaction()
        .set_value("/acl/a1", Some(value("deny all")))
        .commit(TxnContext::new())
        .await
        .unwrap();

    assert!(outcome.errors.is_empty());
    assert!(sb.ops().is_empty());
    assert_eq!(scheduler.get_value_status("/acl/a1").value.state, ValueState::Unimplemented);
    assert!(scheduler.get_value("/acl/a1").is_none());
}

// ============================================================================
// 9. Metadata returned by create is kept and indexed
// ============================================================================

#[tokio::test]
async fn test_metadata_map() {
    let (scheduler, _sb) = setup();
    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .set_value(if_key("if2"), Some(iface("if2", 1500, &[])))
        .commit(TxnContext::new())
        .await
        .unwrap();

    let map = scheduler.get_metadata_map("interface").unwrap();
    assert_eq!(map.list_labels(), vec!["if1", "if2"]);
    let meta = map.get("if2").unwrap();
    assert_eq!(meta.downcast_ref::<IfMeta>(), Some(&IfMeta { index: 2 }));
    assert_eq!(map.lookup_by_field("index", "1"), vec!["if1"]);
    assert!(scheduler.get_metadata_map("route").is_none());

    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), None)
        .commit(TxnContext::new())
        .await
        .unwrap();
    assert_eq!(map.list_labels(), vec!["if2"]);
}

// ============================================================================
// 10. A dependent sorting before its dependencies still waits for them
// ============================================================================

#[tokio::test]
async fn test_dependent_key_sorts_first() {
    let (scheduler, sb) = setup();

    let outcome = scheduler
        .start_nb_transaction()
        .set_value(bd_key("bd1"), Some(bridge_domain(&["if1", "if2"])))
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .set_value(if_key("if2"), Some(iface("if2", 1500, &[])))
        .commit(TxnContext::new())
        .await
        .unwrap();

    assert!(outcome.errors.is_empty());
    assert_eq!(sb.take_ops(), vec!["create /if/if1", "create /if/if2", "create /bd/bd1"]);
    assert_eq!(scheduler.get_value_status("/bd/bd1").value.state, ValueState::Configured);
    assert!(scheduler.get_pending_values(None).is_empty());

    // losing one member is enough to take the bridge domain down first
    scheduler
        .start_nb_transaction()
        .set_value(if_key("if2"), None)
        .commit(TxnContext::new())
        .await
        .unwrap();
    assert_eq!(sb.take_ops(), vec!["delete /bd/bd1", "delete /if/if2"]);
    assert_eq!(scheduler.get_value_status("/bd/bd1").value.state, ValueState::Pending);
    assert_eq!(sb.keys(), vec!["/if/if1"]);
}
