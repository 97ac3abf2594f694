//! Descriptor registry.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::warn;

use crate::{Error, Result};
use super::KvDescriptor;

#[derive(Default)]
struct Inner {
    /// Registration order.
    descriptors: Vec<Arc<dyn KvDescriptor>>,
    /// Retrieve-dependency order.
    sorted: Vec<Arc<dyn KvDescriptor>>,
    /// key -> index into `descriptors`
    key_cache: HashMap<String, Option<usize>>,
}

/// Registered descriptors.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: Arc<dyn KvDescriptor>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.descriptors.iter().any(|d| d.name() == descriptor.name()) {
            return Err(Error::DescriptorExists(descriptor.name().to_string()));
        }
        inner.descriptors.push(descriptor);
        let sorted = sort_by_retrieve_deps(&inner.descriptors);
        inner.sorted = sorted;
        // keys may be claimed by the new descriptor
        inner.key_cache.retain(|_, idx| idx.is_some());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KvDescriptor>> {
        self.inner.read().descriptors.iter().find(|d| d.name() == name).cloned()
    }

    /// Descriptor owning `key` (the first registered one that claims it).
    pub fn get_for_key(&self, key: &str) -> Option<Arc<dyn KvDescriptor>> {
        {
            let inner = self.inner.read();
            if let Some(idx) = inner.key_cache.get(key) {
                return idx.map(|i| inner.descriptors[i].clone());
            }
        }
        let mut inner = self.inner.write();
        let idx = inner.descriptors.iter().position(|d| d.key_selector(key));
        inner.key_cache.insert(key.to_string(), idx);
        idx.map(|i| inner.descriptors[i].clone())
    }

    /// All descriptors; each comes after the descriptors it lists in
    /// `retrieve_dependencies`.
    pub fn all(&self) -> Vec<Arc<dyn KvDescriptor>> {
        self.inner.read().sorted.clone()
    }

    /// NB key prefixes of all descriptors that have one.
    pub fn nb_key_prefixes(&self) -> Vec<String> {
        self.inner
            .read()
            .descriptors
            .iter()
            .filter_map(|d| d.nb_key_prefix().map(str::to_string))
            .collect()
    }
}

/// Stable topological sort; ties keep registration order. Dependencies on
/// unregistered descriptors are ignored.
fn sort_by_retrieve_deps(descriptors: &[Arc<dyn KvDescriptor>]) -> Vec<Arc<dyn KvDescriptor>> {
    let deps: Vec<Vec<String>> = descriptors
        .iter()
        .map(|d| {
            d.retrieve_dependencies()
                .into_iter()
                .filter(|dep| descriptors.iter().any(|o| o.name() == dep))
                .collect()
        })
        .collect();
    let mut done = vec![false; descriptors.len()];
    let mut sorted = Vec::with_capacity(descriptors.len());

    while sorted.len() < descriptors.len() {
        let next = (0..descriptors.len()).find(|&i| {
            !done[i]
                && deps[i].iter().all(|dep| {
                    descriptors.iter().zip(&done).any(|(d, &ok)| ok && d.name() == dep)
                })
        });
        let i = match next {
            Some(i) => i,
            None => {
                // cycle: fall back to registration order for the rest
                let i = done.iter().position(|ok| !ok).unwrap_or(0);
                warn!(descriptor = descriptors[i].name(), "cycle in retrieve dependencies");
                i
            }
        };
        done[i] = true;
        sorted.push(descriptors[i].clone());
    }
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::model::{DescriptorResult, Metadata, Value};

    struct Stub {
        name: &'static str,
        prefix: &'static str,
        deps: Vec<String>,
    }

    impl KvDescriptor for Stub {
        fn name(&self) -> &str {
            self.name
        }

        fn key_selector(&self, key: &str) -> bool {
            key.starts_with(self.prefix)
        }

        fn nb_key_prefix(&self) -> Option<&str> {
            Some(self.prefix)
        }

        fn create(&self, _key: &str, _value: &dyn Value) -> DescriptorResult<Option<Metadata>> {
            Ok(None)
        }

        fn delete(&self, _key: &str, _value: &dyn Value, _md: Option<&Metadata>) -> DescriptorResult<()> {
            Ok(())
        }

        fn retrieve_dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }
    }

    fn stub(name: &'static str, prefix: &'static str, deps: &[&str]) -> Arc<dyn KvDescriptor> {
        Arc::new(Stub { name, prefix, deps: deps.iter().map(|s| s.to_string()).collect() })
    }

    fn names(ds: &[Arc<dyn KvDescriptor>]) -> Vec<&str> {
        ds.iter().map(|d| d.name()).collect()
    }

    #[test]
    fn retrieve_order() {
        let reg = Registry::new();
        reg.register(stub("route", "/route/", &["iface", "vrf"])).unwrap();
        reg.register(stub("acl", "/acl/", &[])).unwrap();
        reg.register(stub("iface", "/if/", &["unknown"])).unwrap();
        reg.register(stub("vrf", "/vrf/", &[])).unwrap();

        let all = reg.all();
        assert_eq!(names(&all), vec!["acl", "iface", "vrf", "route"]);
        assert_eq!(reg.nb_key_prefixes(), vec!["/route/", "/acl/", "/if/", "/vrf/"]);
    }

    #[test]
    fn duplicate_name_rejected() {
        let reg = Registry::new();
        reg.register(stub("iface", "/if/", &[])).unwrap();
        let err = reg.register(stub("iface", "/other/", &[])).unwrap_err();
        assert!(matches!(err, Error::DescriptorExists(name) if name == "iface"));
    }

    #[test]
    fn key_lookup_cached_and_refreshed() {
        let reg = Registry::new();
        reg.register(stub("iface", "/if/", &[])).unwrap();
        assert_eq!(reg.get_for_key("/if/a").map(|d| d.name().to_string()), Some("iface".into()));
        assert!(reg.get_for_key("/route/r1").is_none());

        reg.register(stub("route", "/route/", &[])).unwrap();
        assert_eq!(reg.get_for_key("/route/r1").map(|d| d.name().to_string()), Some("route".into()));
        assert_eq!(reg.get_for_key("/if/a").map(|d| d.name().to_string()), Some("iface".into()));
    }

    #[test]
    fn cyclic_dependencies_still_listed() {
        let reg = Registry::new();
        reg.register(stub("a", "/a/", &["b"])).unwrap();
        reg.register(stub("b", "/b/", &["a"])).unwrap();
        reg.register(stub("c", "/c/", &[])).unwrap();
        assert_eq!(names(&reg.all()), vec!["c", "a", "b"]);
    }
}
