//! Typed descriptors.
//!
//! Implement [`TypedDescriptor`] for a concrete value type and register it
//! wrapped in a [`TypedAdapter`]; the adapter performs the downcasts.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::model::{
    Dependency, DescriptorError, DescriptorResult, KeyValuePair, KvWithMetadata, Metadata, Value,
};
use super::{DescriptorCapabilities, KvDescriptor, MemMetadataMap, MetadataMap};

/// Descriptor over one concrete value type and metadata type.
pub trait TypedDescriptor: Send + Sync + 'static {
    type Value: Value;
    /// Use `()` for descriptors without metadata.
    type Metadata: Value;

    fn name(&self) -> &str;
    fn key_selector(&self, key: &str) -> bool;

    fn capabilities(&self) -> DescriptorCapabilities {
        DescriptorCapabilities::default()
    }

    fn key_label(&self, key: &str) -> String {
        key.to_string()
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        None
    }

    fn equivalent_values(&self, _key: &str, old: &Self::Value, new: &Self::Value) -> bool {
        old.equals(new)
    }

    fn validate(&self, _key: &str, _value: &Self::Value) -> DescriptorResult<()> {
        Ok(())
    }

    fn create(&self, key: &str, value: &Self::Value) -> DescriptorResult<Option<Self::Metadata>>;

    fn delete(
        &self,
        key: &str,
        value: &Self::Value,
        metadata: Option<&Self::Metadata>,
    ) -> DescriptorResult<()>;

    fn update(
        &self,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _old_metadata: Option<&Self::Metadata>,
    ) -> DescriptorResult<Option<Self::Metadata>> {
        Err(DescriptorError::Unsupported {
            descriptor: self.name().to_string(),
            operation: "update",
        })
    }

    fn update_with_recreate(
        &self,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _metadata: Option<&Self::Metadata>,
    ) -> bool {
        false
    }

    fn retrieve(&self, _correlate: &[KvWithMetadata]) -> DescriptorResult<Vec<KvWithMetadata>> {
        Err(DescriptorError::Unsupported {
            descriptor: self.name().to_string(),
            operation: "retrieve",
        })
    }

    fn is_retriable_failure(&self, _err: &DescriptorError) -> bool {
        true
    }

    fn derived_values(&self, _key: &str, _value: &Self::Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    fn dependencies(&self, _key: &str, _value: &Self::Value) -> Vec<Dependency> {
        Vec::new()
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn metadata_map_factory(&self) -> Arc<dyn MetadataMap> {
        Arc::new(MemMetadataMap::new(self.name()))
    }
}

/// Exposes a [`TypedDescriptor`] as a [`KvDescriptor`].
pub struct TypedAdapter<D: TypedDescriptor> {
    inner: D,
    _marker: PhantomData<fn() -> D::Value>,
}

impl<D: TypedDescriptor> TypedAdapter<D> {
    pub fn new(inner: D) -> Self {
        Self { inner, _marker: PhantomData }
    }

    pub fn into_arc(inner: D) -> Arc<dyn KvDescriptor> {
        Arc::new(Self::new(inner))
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

fn cast<T: Value>(value: &dyn Value) -> DescriptorResult<&T> {
    value.downcast_ref::<T>().ok_or_else(|| DescriptorError::TypeMismatch {
        expected: std::any::type_name::<T>(),
        got: value.type_name(),
    })
}

fn cast_metadata<T: Value>(metadata: Option<&Metadata>) -> DescriptorResult<Option<&T>> {
    metadata.map(|m| cast::<T>(m.as_ref())).transpose()
}

fn wrap<T: Value>(metadata: Option<T>) -> Option<Metadata> {
    metadata.map(|m| Arc::new(m) as Metadata)
}

impl<D: TypedDescriptor> KvDescriptor for TypedAdapter<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn key_selector(&self, key: &str) -> bool {
        self.inner.key_selector(key)
    }

    fn capabilities(&self) -> DescriptorCapabilities {
        self.inner.capabilities()
    }

    fn key_label(&self, key: &str) -> String {
        self.inner.key_label(key)
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        self.inner.nb_key_prefix()
    }

    fn equivalent_values(&self, key: &str, old: &dyn Value, new: &dyn Value) -> bool {
        match (cast::<D::Value>(old), cast::<D::Value>(new)) {
            (Ok(old), Ok(new)) => self.inner.equivalent_values(key, old, new),
            _ => false,
        }
    }

    fn validate(&self, key: &str, value: &dyn Value) -> DescriptorResult<()> {
        self.inner.validate(key, cast(value)?)
    }

    fn create(&self, key: &str, value: &dyn Value) -> DescriptorResult<Option<Metadata>> {
        self.inner.create(key, cast(value)?).map(wrap)
    }

    fn delete(&self, key: &str, value: &dyn Value, metadata: Option<&Metadata>) -> DescriptorResult<()> {
        self.inner.delete(key, cast(value)?, cast_metadata(metadata)?)
    }

    fn update(
        &self,
        key: &str,
        old: &dyn Value,
        new: &dyn Value,
        old_metadata: Option<&Metadata>,
    ) -> DescriptorResult<Option<Metadata>> {
        self.inner
            .update(key, cast(old)?, cast(new)?, cast_metadata(old_metadata)?)
            .map(wrap)
    }

    fn update_with_recreate(
        &self,
        key: &str,
        old: &dyn Value,
        new: &dyn Value,
        metadata: Option<&Metadata>,
    ) -> bool {
        match (cast(old), cast(new), cast_metadata(metadata)) {
            (Ok(old), Ok(new), Ok(metadata)) => self.inner.update_with_recreate(key, old, new, metadata),
            // a type change can only be applied by re-creating
            _ => true,
        }
    }

    fn retrieve(&self, correlate: &[KvWithMetadata]) -> DescriptorResult<Vec<KvWithMetadata>> {
        self.inner.retrieve(correlate)
    }

    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        !matches!(err, DescriptorError::TypeMismatch { .. }) && self.inner.is_retriable_failure(err)
    }

    fn derived_values(&self, key: &str, value: &dyn Value) -> Vec<KeyValuePair> {
        cast(value).map(|v| self.inner.derived_values(key, v)).unwrap_or_default()
    }

    fn dependencies(&self, key: &str, value: &dyn Value) -> Vec<Dependency> {
        cast(value).map(|v| self.inner.dependencies(key, v)).unwrap_or_default()
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        self.inner.retrieve_dependencies()
    }

    fn metadata_map_factory(&self) -> Arc<dyn MetadataMap> {
        self.inner.metadata_map_factory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::model::value;

    #[derive(Debug, PartialEq)]
    struct Iface {
        mtu: u32,
    }

    #[derive(Debug, PartialEq)]
    struct IfaceMeta {
        index: u32,
    }

    struct IfaceDescriptor;

    impl TypedDescriptor for IfaceDescriptor {
        type Value = Iface;
        type Metadata = IfaceMeta;

        fn name(&self) -> &str {
            "iface"
        }

        fn key_selector(&self, key: &str) -> bool {
            key.starts_with("/if/")
        }

        fn validate(&self, _key: &str, value: &Iface) -> DescriptorResult<()> {
            if value.mtu < 68 {
                return Err(DescriptorError::invalid("mtu too small", &["mtu"]));
            }
            Ok(())
        }

        fn create(&self, _key: &str, value: &Iface) -> DescriptorResult<Option<IfaceMeta>> {
            Ok(Some(IfaceMeta { index: value.mtu / 100 }))
        }

        fn delete(&self, _key: &str, _value: &Iface, metadata: Option<&IfaceMeta>) -> DescriptorResult<()> {
            match metadata {
                Some(_) => Ok(()),
                None => Err(DescriptorError::failed("missing metadata")),
            }
        }

        fn derived_values(&self, key: &str, value: &Iface) -> Vec<KeyValuePair> {
            vec![KeyValuePair::new(format!("{key}/mtu"), crate::model::value(value.mtu))]
        }
    }

    #[test]
    fn adapter_downcasts() {
        let d = TypedAdapter::new(IfaceDescriptor);
        let v = value(Iface { mtu: 1500 });

        d.validate("/if/a", v.as_ref()).unwrap();
        let md = d.create("/if/a", v.as_ref()).unwrap().unwrap();
        assert_eq!(md.downcast_ref::<IfaceMeta>(), Some(&IfaceMeta { index: 15 }));
        d.delete("/if/a", v.as_ref(), Some(&md)).unwrap();

        let derived = d.derived_values("/if/a", v.as_ref());
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].key, "/if/a/mtu");
    }

    #[test]
    fn adapter_reports_type_mismatch() {
        let d = TypedAdapter::new(IfaceDescriptor);
        let wrong = value("not an interface");

        let err = d.create("/if/a", wrong.as_ref()).unwrap_err();
        assert!(matches!(err, DescriptorError::TypeMismatch { .. }));
        assert!(!d.is_retriable_failure(&err));
        assert!(d.is_retriable_failure(&DescriptorError::failed("busy")));

        let err = d.validate("/if/a", value(Iface { mtu: 10 }).as_ref()).unwrap_err();
        assert_eq!(err.invalid_fields(), ["mtu".to_string()]);

        assert!(d.update_with_recreate("/if/a", wrong.as_ref(), value(Iface { mtu: 1500 }).as_ref(), None));
        assert!(d.derived_values("/if/a", wrong.as_ref()).is_empty());
    }

    #[test]
    fn update_unsupported_by_default() {
        let d = TypedAdapter::new(IfaceDescriptor);
        let a = value(Iface { mtu: 1500 });
        let b = value(Iface { mtu: 9000 });
        let err = d.update("/if/a", a.as_ref(), b.as_ref(), None).unwrap_err();
        assert_eq!(err, DescriptorError::Unsupported { descriptor: "iface".into(), operation: "update" });
        assert!(!d.equivalent_values("/if/a", a.as_ref(), b.as_ref()));
        assert!(d.equivalent_values("/if/a", a.as_ref(), value(Iface { mtu: 1500 }).as_ref()));
    }
}
