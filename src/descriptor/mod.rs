//! # Descriptors
//!
//! A descriptor is the contract between the scheduler and one kind of
//! configuration item in the external system. The scheduler never looks
//! inside values; everything it needs to know about them goes through
//! [`KvDescriptor`].
//!
//! | Piece | Module | Description |
//! |-------|--------|-------------|
//! | `KvDescriptor` | here | object-safe handler set over opaque values |
//! | `TypedDescriptor` / `TypedAdapter` | `adapter` | per-type implementation, downcast by the adapter |
//! | `Registry` | `registry` | registration, per-key lookup, retrieve ordering |
//! | `MetadataMap` / `MemMetadataMap` | `metadata` | label-keyed metadata with secondary indices |

pub mod adapter;
pub mod metadata;
pub mod registry;

use std::sync::Arc;

use crate::model::{
    Dependency, DescriptorError, DescriptorResult, KeyValuePair, KvWithMetadata, Metadata, Value,
};

pub use adapter::{TypedAdapter, TypedDescriptor};
pub use metadata::{IndexFn, MemMetadataMap, MetadataMap};
pub use registry::Registry;

// ============================================================================
// Capabilities
// ============================================================================

/// Optional handlers a descriptor provides.
///
/// All fields default to false. Descriptors override via `capabilities()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorCapabilities {
    /// `update` may be called; otherwise a change is applied as Delete+Create.
    pub supports_update: bool,
    /// `retrieve` may be called during resync and refresh.
    pub supports_retrieve: bool,
    /// Metadata returned by create/update is kept in a metadata map.
    pub with_metadata: bool,
}

// ============================================================================
// KvDescriptor Trait
// ============================================================================

/// Handler set for the values of one kind.
///
/// Only `name`, `key_selector`, `create` and `delete` are mandatory. The
/// handlers run on the scheduler's consumer task, one at a time.
pub trait KvDescriptor: Send + Sync + 'static {
    /// Unique among registered descriptors.
    fn name(&self) -> &str;

    /// Whether this descriptor owns `key`. At most one descriptor may claim
    /// a key.
    fn key_selector(&self, key: &str) -> bool;

    fn capabilities(&self) -> DescriptorCapabilities {
        DescriptorCapabilities::default()
    }

    /// Label of the value, used as the metadata map key.
    fn key_label(&self, key: &str) -> String {
        key.to_string()
    }

    /// Prefix of all NB keys of this descriptor. Descriptors of derived
    /// values only have none.
    fn nb_key_prefix(&self) -> Option<&str> {
        None
    }

    fn equivalent_values(&self, _key: &str, old: &dyn Value, new: &dyn Value) -> bool {
        old.equals(new)
    }

    /// Reject a value before any CRUD call.
    fn validate(&self, _key: &str, _value: &dyn Value) -> DescriptorResult<()> {
        Ok(())
    }

    fn create(&self, key: &str, value: &dyn Value) -> DescriptorResult<Option<Metadata>>;

    fn delete(&self, key: &str, value: &dyn Value, metadata: Option<&Metadata>) -> DescriptorResult<()>;

    /// Only called when `supports_update` is advertised.
    fn update(
        &self,
        _key: &str,
        _old: &dyn Value,
        _new: &dyn Value,
        _old_metadata: Option<&Metadata>,
    ) -> DescriptorResult<Option<Metadata>> {
        Err(DescriptorError::Unsupported {
            descriptor: self.name().to_string(),
            operation: "update",
        })
    }

    /// Whether the transition has to be applied as Delete+Create even
    /// though `update` is supported.
    fn update_with_recreate(
        &self,
        _key: &str,
        _old: &dyn Value,
        _new: &dyn Value,
        _metadata: Option<&Metadata>,
    ) -> bool {
        false
    }

    /// Dump the values present in the external system. `correlate` holds the
    /// values the scheduler expects, with their metadata.
    fn retrieve(&self, _correlate: &[KvWithMetadata]) -> DescriptorResult<Vec<KvWithMetadata>> {
        Err(DescriptorError::Unsupported {
            descriptor: self.name().to_string(),
            operation: "retrieve",
        })
    }

    fn is_retriable_failure(&self, _err: &DescriptorError) -> bool {
        true
    }

    fn derived_values(&self, _key: &str, _value: &dyn Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    fn dependencies(&self, _key: &str, _value: &dyn Value) -> Vec<Dependency> {
        Vec::new()
    }

    /// Descriptors whose `retrieve` has to run before this one.
    fn retrieve_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Metadata map for this descriptor (with `with_metadata`). Defaults to
    /// a [`MemMetadataMap`] without secondary indices.
    fn metadata_map_factory(&self) -> Arc<dyn MetadataMap> {
        Arc::new(MemMetadataMap::new(self.name()))
    }
}
