//! End-to-end tests for failure handling: retries, revert, and the queue
//! and lifecycle errors of the scheduler itself.

mod common;

use std::time::Duration;

use chrono::TimeDelta;
use common::*;
use kvsched::{
    CancelToken, Error, KvScheduler, SchedulerConfig, TxnContext, TxnOperation, TxnType, ValueState,
};
use pretty_assertions::assert_eq;

const WAIT: Duration = Duration::from_secs(3);

fn retries(scheduler: &kvsched::Scheduler) -> Vec<kvsched::RecordedTxn> {
    scheduler
        .get_transaction_history(None, None)
        .into_iter()
        .filter(|t| t.txn_type == TxnType::RetryFailedOps)
        .collect()
}

// ============================================================================
// 1. A retriable failure is retried after the period
// ============================================================================

#[tokio::test]
async fn test_retry_succeeds() {
    let (scheduler, sb) = setup();
    sb.fail_next("/if/if1", 1, true);

    let outcome = scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new().with_retry(Duration::from_millis(50), false, 3))
        .await
        .unwrap();

    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].key, "/if/if1");
    assert_eq!(outcome.errors[0].operation, TxnOperation::Add);
    assert_eq!(scheduler.get_value_status("/if/if1").value.state, ValueState::Retrying);

    let configured = eventually(WAIT, || {
        scheduler.get_value_status("/if/if1").value.state == ValueState::Configured
    })
    .await;
    assert!(configured);
    assert_eq!(sb.ops(), vec!["create /if/if1 FAILED", "create /if/if1"]);

    let retries = retries(&scheduler);
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].retry_for_txn, outcome.seq_num);
    assert_eq!(retries[0].retry_attempt, 1);
    assert!(retries[0].executed.iter().all(|op| op.is_retry));
    assert!(scheduler.get_failed_values(None).is_empty());
}

// ============================================================================
// 2. Exponential backoff doubles the delay between attempts
// ============================================================================

#[tokio::test]
async fn test_retry_exponential_backoff() {
    let (scheduler, sb) = setup();
    sb.fail_next("/if/if1", 2, true);

    let outcome = scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new().with_retry(Duration::from_millis(30), true, 5))
        .await
        .unwrap();
    assert_eq!(outcome.errors.len(), 1);

    let configured = eventually(WAIT, || sb.get("/if/if1").is_some()).await;
    assert!(configured);
    scheduler.transaction_barrier().await.unwrap();

    let original = scheduler.get_recorded_transaction(outcome.seq_num).unwrap();
    let retries = retries(&scheduler);
    let attempts: Vec<u32> = retries.iter().map(|t| t.retry_attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert!(retries.iter().all(|t| t.retry_for_txn == outcome.seq_num));

    let started = |t: &kvsched::RecordedTxn| t.start.unwrap();
    assert!(started(&retries[0]) - started(&original) >= TimeDelta::milliseconds(30));
    assert!(started(&retries[1]) - started(&retries[0]) >= TimeDelta::milliseconds(60));
}

// ============================================================================
// 3. Retries stop after the maximum count
// ============================================================================

#[tokio::test]
async fn test_retry_gives_up() {
    let (scheduler, sb) = setup();
    sb.fail_next("/if/if1", 10, true);

    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new().with_retry(Duration::from_millis(20), false, 1))
        .await
        .unwrap();

    let failed = eventually(WAIT, || {
        scheduler.get_value_status("/if/if1").value.state == ValueState::Failed
    })
    .await;
    assert!(failed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.transaction_barrier().await.unwrap();
    assert_eq!(sb.ops(), vec!["create /if/if1 FAILED", "create /if/if1 FAILED"]);
    assert_eq!(retries(&scheduler).len(), 1);

    let failed = scheduler.get_failed_values(None);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key, "/if/if1");
}

// ============================================================================
// 4. Permanent failures are never retried
// ============================================================================

#[tokio::test]
async fn test_permanent_failure_not_retried() {
    let (scheduler, sb) = setup();
    sb.fail_next("/if/if1", 1, false);

    let outcome = scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new().with_retry(Duration::from_millis(10), false, 0))
        .await
        .unwrap();

    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(scheduler.get_value_status("/if/if1").value.state, ValueState::Failed);

    tokio::time::sleep(Duration::from_millis(60)).await;
    scheduler.transaction_barrier().await.unwrap();
    assert!(retries(&scheduler).is_empty());
    assert_eq!(sb.ops(), vec!["create /if/if1 FAILED"]);
}

// ============================================================================
// 5. Revert undoes applied values, most recent first
// ============================================================================

#[tokio::test]
async fn test_revert_on_failure() {
    let (scheduler, sb) = setup();
    sb.fail_next("/if/if3", 1, true);

    let outcome = scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .set_value(if_key("if2"), Some(iface("if2", 1500, &[])))
        .set_value(if_key("if3"), Some(iface("if3", 1500, &[])))
        .commit(TxnContext::new().with_revert())
        .await
        .unwrap();

    assert!(outcome.errors.iter().any(|e| e.key == "/if/if3"));
    assert_eq!(
        sb.ops(),
        vec![
            "create /if/if1",
            "create /if/if2",
            "create /if/if3 FAILED",
            "delete /if/if2",
            "delete /if/if1",
        ]
    );
    assert!(sb.keys().is_empty());
    assert!(scheduler.get_value("/if/if1").is_none());

    let record = scheduler.get_recorded_transaction(outcome.seq_num).unwrap();
    assert!(record.executed.iter().any(|op| op.is_revert));
}

#[tokio::test]
async fn test_revert_restores_previous_value() {
    let (scheduler, sb) = setup();
    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new())
        .await
        .unwrap();
    sb.take_ops();
    sb.fail_next("/if/if2", 1, true);

    scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 9000, &[])))
        .set_value(if_key("if2"), Some(iface("if2", 1500, &[])))
        .commit(TxnContext::new().with_revert())
        .await
        .unwrap();

    assert_eq!(sb.ops(), vec!["update /if/if1", "create /if/if2 FAILED", "update /if/if1"]);
    let restored = sb.get("/if/if1").unwrap();
    assert_eq!(restored.downcast_ref::<Interface>().map(|i| i.mtu), Some(1500));
    let current = scheduler.get_value("/if/if1").unwrap();
    assert_eq!(current.downcast_ref::<Interface>().map(|i| i.mtu), Some(1500));
}

// ============================================================================
// 6. A full queue rejects non-blocking work
// ============================================================================

#[tokio::test]
async fn test_queue_full() {
    let (scheduler, _sb) = setup_with(SchedulerConfig { txn_queue_capacity: 1, ..quiet_config() });

    // the consumer cannot run before this task yields
    scheduler
        .push_sb_notification("/if/ext", Some(iface("ext", 1500, &[])), None)
        .await
        .unwrap();
    let err = scheduler
        .push_sb_notification("/if/ext2", Some(iface("ext2", 1500, &[])), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull));

    scheduler.transaction_barrier().await.unwrap();
    assert!(scheduler.get_value("/if/ext").is_some());
}

// ============================================================================
// 7. A closed scheduler accepts nothing
// ============================================================================

#[tokio::test]
async fn test_closed_scheduler() {
    let (scheduler, sb) = setup();
    scheduler.close();

    let err = scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClosedScheduler));

    let err = scheduler.push_sb_notification("/if/ext", None, None).await.unwrap_err();
    assert!(matches!(err, Error::ClosedScheduler));
    assert!(sb.ops().is_empty());
}

// ============================================================================
// 8. Cancelling stops the wait, not the transaction
// ============================================================================

#[tokio::test]
async fn test_cancel_wait() {
    let (scheduler, sb) = setup();
    let token = CancelToken::new();
    token.cancel();

    let err = scheduler
        .start_nb_transaction()
        .set_value(if_key("if1"), Some(iface("if1", 1500, &[])))
        .commit(TxnContext::new().with_cancel(token))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TxnWaitCanceled));

    scheduler.transaction_barrier().await.unwrap();
    assert_eq!(sb.ops(), vec!["create /if/if1"]);
}
