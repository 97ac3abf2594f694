//! # kvsched: Key-Value Reconciliation Scheduler
//!
//! Reconciles a desired set of key-value items with the actual state of an
//! external system. Items depend on each other; the scheduler applies them
//! in dependency order, caches items whose dependencies are missing, and
//! re-applies them once the dependencies appear.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `KvDescriptor` is the contract between the scheduler and
//!    each kind of item in the external system
//! 2. **Opaque values**: the scheduler only clones, compares and prints values
//! 3. **One writer**: transactions are queued and executed one at a time
//!    against an in-memory dependency graph with per-key history
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kvsched::{KvScheduler, Scheduler, SchedulerConfig, TxnContext, value};
//!
//! # async fn example() -> kvsched::Result<()> {
//! let scheduler = Scheduler::new(SchedulerConfig::default());
//! // scheduler.register_descriptor(...)?;
//!
//! let outcome = scheduler
//!     .start_nb_transaction()
//!     .set_value("/if/if1", Some(value("I1")))
//!     .commit(TxnContext::new().with_description("initial config"))
//!     .await?;
//! assert!(outcome.errors.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! | Layer | Module | Description |
//! |-------|--------|-------------|
//! | Data model | `model` | values, states, operations, transaction records |
//! | Graph store | `graph` | nodes, relations, edge index, history |
//! | Descriptors | `descriptor` | handler trait, typed adapter, registry, metadata maps |
//! | Scheduler | `scheduler` | queue, planning, execution, refresh, retry, revert |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod graph;
pub mod descriptor;
pub mod scheduler;

// ============================================================================
// Re-exports: Model
// ============================================================================

pub use model::{
    Value, ValueRef, Metadata, value, values_equal,
    KeySelector, key_selector, prefix_selector,
    ValueOrigin, ValueState, TxnOperation, TxnType, ResyncType,
    KeyValuePair, KvWithMetadata, KeyWithError, Dependency, AnyOf, RetryOpt,
    DescriptorError, DescriptorResult,
    RecordedTxn, RecordedTxnOp, RecordedKvPair, ValueStatus, BaseValueStatus,
};

// ============================================================================
// Re-exports: Graph
// ============================================================================

pub use graph::{Graph, GraphOpts, GraphReader, GraphWriter, RecordedNode};

// ============================================================================
// Re-exports: Descriptors
// ============================================================================

pub use descriptor::{
    KvDescriptor, DescriptorCapabilities, TypedDescriptor, TypedAdapter,
    Registry, MetadataMap, MemMetadataMap,
};

// ============================================================================
// Re-exports: Scheduler
// ============================================================================

pub use scheduler::{
    KvScheduler, Scheduler, SchedulerConfig, Txn, TxnOutcome, TxnContext, CancelToken, View,
};

// ============================================================================
// Relations
// ============================================================================

/// Relation between a value and the values it depends on.
pub const DEPENDENCY_RELATION: &str = "depends-on";

/// Relation between a base value and the values derived from it.
pub const DERIVES_RELATION: &str = "derives";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("descriptor already exists: {0}")]
    DescriptorExists(String),

    #[error("descriptor is not registered: {0}")]
    UnknownDescriptor(String),

    #[error("descriptor {descriptor} does not support {operation}")]
    UnsupportedOperation { descriptor: String, operation: &'static str },

    #[error("transaction queue is full")]
    QueueFull,

    #[error("scheduler was closed")]
    ClosedScheduler,

    #[error("waiting for the transaction result was canceled")]
    TxnWaitCanceled,

    #[error("downstream resync combined with data change")]
    CombinedDownstreamResyncWithChange,

    #[error("revert is not supported with resync")]
    RevertNotSupportedWithResync,

    #[error("unknown key prefix: {0}")]
    UnknownKeyPrefix(String),

    #[error("descriptor {descriptor} failed: {source}")]
    Descriptor { descriptor: String, source: DescriptorError },

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("graph inconsistency: {0}")]
    Inconsistent(String),
}

pub type Result<T> = std::result::Result<T, Error>;
