//! Key-value DTOs shared by the graph, the descriptors and the scheduler.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{DescriptorError, Metadata, ValueRef};

/// Predicate selecting a subset of keys.
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Build a [`KeySelector`] from a closure.
pub fn key_selector<F>(f: F) -> KeySelector
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Selector matching every key under `prefix`.
pub fn prefix_selector(prefix: impl Into<String>) -> KeySelector {
    let prefix = prefix.into();
    Arc::new(move |key: &str| key.starts_with(&prefix))
}

// ============================================================================
// Origin and state
// ============================================================================

/// Provenance of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueOrigin {
    #[default]
    Unknown,
    /// Requested by the northbound (desired state).
    FromNb,
    /// Observed in the southbound (actual state).
    FromSb,
}

impl fmt::Display for ValueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueOrigin::Unknown => write!(f, "UNKNOWN"),
            ValueOrigin::FromNb => write!(f, "from-NB"),
            ValueOrigin::FromSb => write!(f, "from-SB"),
        }
    }
}

/// State of a value as tracked by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueState {
    /// Not known to the scheduler.
    #[default]
    Nonexistent,
    /// Configured by NB but found missing in SB by a refresh.
    Missing,
    /// NB value without a descriptor.
    Unimplemented,
    /// Removed; the node is deleted at the end of the transaction.
    Removed,
    /// Applied as requested by NB.
    Configured,
    /// Created externally and reported by SB.
    Obtained,
    /// Found by a refresh with NB origin but not (yet) requested.
    Discovered,
    /// Waiting for dependencies.
    Pending,
    /// Rejected by `validate`.
    Invalid,
    /// Last operation failed and will not be retried.
    Failed,
    /// Last operation failed and a retry is scheduled.
    Retrying,
}

impl ValueState {
    /// Provenance implied by the state.
    pub fn origin(self) -> ValueOrigin {
        match self {
            ValueState::Nonexistent => ValueOrigin::Unknown,
            ValueState::Obtained => ValueOrigin::FromSb,
            _ => ValueOrigin::FromNb,
        }
    }
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueState::Nonexistent => "NONEXISTENT",
            ValueState::Missing => "MISSING",
            ValueState::Unimplemented => "UNIMPLEMENTED",
            ValueState::Removed => "REMOVED",
            ValueState::Configured => "CONFIGURED",
            ValueState::Obtained => "OBTAINED",
            ValueState::Discovered => "DISCOVERED",
            ValueState::Pending => "PENDING",
            ValueState::Invalid => "INVALID",
            ValueState::Failed => "FAILED",
            ValueState::Retrying => "RETRYING",
        };
        f.write_str(s)
    }
}

/// Kind of an operation planned or executed by a transaction.
///
/// | Kind | Meaning |
/// |------|---------|
/// | `PreProcess` | input rejected before planning |
/// | `Add` | value created (descriptor `create`) |
/// | `Modify` | value changed in place (descriptor `update`) |
/// | `Delete` | value removed (descriptor `delete`) |
/// | `Update` | value re-confirmed with only its state changing |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxnOperation {
    #[default]
    Undefined,
    PreProcess,
    Add,
    Modify,
    Delete,
    Update,
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnOperation::Undefined => "UNDEFINED",
            TxnOperation::PreProcess => "PRE-PROCESS",
            TxnOperation::Add => "ADD",
            TxnOperation::Modify => "MODIFY",
            TxnOperation::Delete => "DELETE",
            TxnOperation::Update => "UPDATE",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Key-value pairs
// ============================================================================

/// Key with an optional value (`None` = removal).
#[derive(Debug, Clone)]
pub struct KeyValuePair {
    pub key: String,
    pub value: Option<ValueRef>,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: ValueRef) -> Self {
        Self { key: key.into(), value: Some(value) }
    }
}

/// Key-value pair extended with metadata and origin, as exchanged with
/// `retrieve` and SB notifications.
#[derive(Debug, Clone)]
pub struct KvWithMetadata {
    pub key: String,
    pub value: Option<ValueRef>,
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
}

impl KvWithMetadata {
    pub fn new(key: impl Into<String>, value: ValueRef, origin: ValueOrigin) -> Self {
        Self { key: key.into(), value: Some(value), metadata: None, origin }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Per-key failure reported by a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyWithError {
    pub key: String,
    pub operation: TxnOperation,
    pub error: DescriptorError,
}

impl fmt::Display for KeyWithError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.key, self.operation, self.error)
    }
}

// ============================================================================
// Dependencies
// ============================================================================

/// Dependency of a value on another value (or any of a set of values).
///
/// Either `key` is set (static dependency) or `any_of` describes the
/// acceptable targets (dynamic dependency).
#[derive(Clone)]
pub struct Dependency {
    /// Unique within the dependencies of one value.
    pub label: String,
    pub key: Option<String>,
    pub any_of: AnyOf,
}

/// Dynamic dependency target: keys under any of the prefixes (all keys if
/// none given) that also pass the selector.
#[derive(Clone, Default)]
pub struct AnyOf {
    pub key_prefixes: Vec<String>,
    pub key_selector: Option<KeySelector>,
}

impl Dependency {
    pub fn on_key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: Some(key.into()),
            any_of: AnyOf::default(),
        }
    }

    pub fn any_of(
        label: impl Into<String>,
        key_prefixes: Vec<String>,
        key_selector: Option<KeySelector>,
    ) -> Self {
        Self {
            label: label.into(),
            key: None,
            any_of: AnyOf { key_prefixes, key_selector },
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("label", &self.label)
            .field("key", &self.key)
            .field("key_prefixes", &self.any_of.key_prefixes)
            .field("has_selector", &self.any_of.key_selector.is_some())
            .finish()
    }
}

// ============================================================================
// Retry options
// ============================================================================

/// Retry policy of a NB transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOpt {
    pub period: Duration,
    /// Double the delay with every consecutive failure.
    pub exp_backoff: bool,
    /// Maximum number of attempts, 0 = unlimited.
    pub max_count: u32,
}

impl Default for RetryOpt {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            exp_backoff: false,
            max_count: 0,
        }
    }
}
