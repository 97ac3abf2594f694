//! Per-commit transaction options.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::model::{ResyncType, RetryOpt};

// ============================================================================
// CancelToken
// ============================================================================

/// Cancels the wait of a blocking commit.
///
/// Cancelling does not roll anything back: the transaction is already queued
/// and runs to completion, only the caller stops waiting for it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) was called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TxnContext
// ============================================================================

/// Options of one NB transaction, composed builder-style.
///
/// ```rust
/// use std::time::Duration;
/// use kvsched::TxnContext;
///
/// let ctx = TxnContext::new()
///     .with_retry(Duration::from_millis(500), true, 3)
///     .with_description("attach routes");
/// assert!(ctx.is_blocking());
/// ```
#[derive(Debug, Clone, Default)]
pub struct TxnContext {
    pub(crate) resync: ResyncType,
    pub(crate) verbose_refresh: bool,
    pub(crate) non_blocking: bool,
    pub(crate) retry: Option<RetryOpt>,
    pub(crate) revert: bool,
    pub(crate) description: String,
    pub(crate) simulation: bool,
    pub(crate) cancel: Option<CancelToken>,
}

impl TxnContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transaction carries the complete desired state; NB values missing
    /// from it are removed.
    pub fn full_resync(mut self) -> Self {
        self.resync = ResyncType::FullResync;
        self
    }

    /// Re-apply the current desired state against a refreshed SB view. Must
    /// not carry any values.
    pub fn downstream_resync(mut self) -> Self {
        self.resync = ResyncType::DownstreamResync;
        self
    }

    /// Log every retrieved value during the resync refresh.
    pub fn with_verbose_refresh(mut self) -> Self {
        self.verbose_refresh = true;
        self
    }

    /// Return right after enqueueing; errors go to error subscribers.
    pub fn without_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    /// Retry failed operations after `period`. `max_count` of 0 means no
    /// limit.
    pub fn with_retry(mut self, period: Duration, exp_backoff: bool, max_count: u32) -> Self {
        self.retry = Some(RetryOpt { period, exp_backoff, max_count });
        self
    }

    /// Undo already applied changes on the first failure.
    pub fn with_revert(mut self) -> Self {
        self.revert = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Plan the transaction on a private copy of the graph before executing
    /// it; the plan is recorded with the transaction.
    pub fn with_simulation(mut self) -> Self {
        self.simulation = true;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn resync_type(&self) -> ResyncType {
        self.resync
    }

    pub fn is_blocking(&self) -> bool {
        !self.non_blocking
    }

    pub fn retry(&self) -> Option<RetryOpt> {
        self.retry
    }

    pub fn is_revert(&self) -> bool {
        self.revert
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_composes() {
        let ctx = TxnContext::new()
            .full_resync()
            .without_blocking()
            .with_retry(Duration::from_secs(2), true, 5)
            .with_description("startup");

        assert_eq!(ctx.resync_type(), ResyncType::FullResync);
        assert!(!ctx.is_blocking());
        assert_eq!(ctx.retry(), Some(RetryOpt {
            period: Duration::from_secs(2),
            exp_backoff: true,
            max_count: 5,
        }));
        assert!(!ctx.is_revert());
        assert_eq!(ctx.description(), "startup");
    }

    #[tokio::test]
    async fn cancel_wakes_all_clones() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        assert!(!token.is_cancelled());
        token.cancel();
        task.await.unwrap();
        assert!(token.is_cancelled());

        // already cancelled: resolves immediately
        token.cancelled().await;
    }
}
