//! # Key-Value Model
//!
//! Plain DTOs shared by every layer: opaque values, origins and states,
//! dependencies, and the transaction log entries.
//!
//! Design rule: this module is pure data. No locks, no async, no graph.

pub mod value;
pub mod kv;
pub mod error;
pub mod record;

pub use value::{Value, ValueRef, Metadata, value, values_equal};
pub use kv::{
    KeySelector, key_selector, prefix_selector,
    ValueOrigin, ValueState, TxnOperation,
    KeyValuePair, KvWithMetadata, KeyWithError,
    Dependency, AnyOf, RetryOpt,
};
pub use error::{DescriptorError, DescriptorResult};
pub use record::{
    TxnType, ResyncType, RecordedKvPair, RecordedTxnOp, RecordedTxn,
    ValueStatus, BaseValueStatus,
};
