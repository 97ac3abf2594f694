//! Label-keyed metadata maps with secondary indices.

use std::collections::BTreeSet;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::model::{Metadata, Value};

/// Extracts the values of one secondary-index field from metadata.
pub type IndexFn = Arc<dyn Fn(&dyn Value) -> Vec<String> + Send + Sync>;

/// Map of metadata by value label.
///
/// The scheduler writes into it when a value is created, updated or removed;
/// descriptors and other readers use it for lookups.
pub trait MetadataMap: Send + Sync {
    fn name(&self) -> &str;

    fn put(&self, label: &str, metadata: Metadata);

    fn delete(&self, label: &str);

    fn get(&self, label: &str) -> Option<Metadata>;

    /// All labels, sorted.
    fn list_labels(&self) -> Vec<String>;

    /// Secondary-index field values of one entry.
    fn list_fields(&self, label: &str) -> HashMap<String, Vec<String>>;

    /// Labels whose metadata has `value` in the secondary-index `field`.
    fn lookup_by_field(&self, field: &str, value: &str) -> Vec<String>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct Entries {
    by_label: HashMap<String, Metadata>,
    /// field -> field value -> labels
    by_field: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

/// Default [`MetadataMap`], backed by hash maps under a `RwLock`.
pub struct MemMetadataMap {
    name: String,
    indexes: Vec<(String, IndexFn)>,
    entries: RwLock<Entries>,
}

impl MemMetadataMap {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            indexes: Vec::new(),
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Add a secondary index.
    pub fn with_index<F>(mut self, field: &str, index_fn: F) -> Self
    where
        F: Fn(&dyn Value) -> Vec<String> + Send + Sync + 'static,
    {
        self.indexes.push((field.to_string(), Arc::new(index_fn)));
        self
    }

    fn fields_of(&self, metadata: &Metadata) -> Vec<(&str, Vec<String>)> {
        self.indexes
            .iter()
            .map(|(field, index_fn)| (field.as_str(), index_fn(metadata.as_ref())))
            .collect()
    }

    fn unindex(&self, entries: &mut Entries, label: &str, metadata: &Metadata) {
        for (field, values) in self.fields_of(metadata) {
            let Some(index) = entries.by_field.get_mut(field) else { continue };
            for value in values {
                if let Some(labels) = index.get_mut(&value) {
                    labels.remove(label);
                    if labels.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }
}

impl MetadataMap for MemMetadataMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, label: &str, metadata: Metadata) {
        let mut entries = self.entries.write();
        if let Some(old) = entries.by_label.remove(label) {
            self.unindex(&mut entries, label, &old);
        }
        for (field, values) in self.fields_of(&metadata) {
            let index = entries.by_field.entry(field.to_string()).or_default();
            for value in values {
                index.entry(value).or_default().insert(label.to_string());
            }
        }
        entries.by_label.insert(label.to_string(), metadata);
    }

    fn delete(&self, label: &str) {
        let mut entries = self.entries.write();
        if let Some(old) = entries.by_label.remove(label) {
            self.unindex(&mut entries, label, &old);
        }
    }

    fn get(&self, label: &str) -> Option<Metadata> {
        self.entries.read().by_label.get(label).cloned()
    }

    fn list_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.entries.read().by_label.keys().cloned().collect();
        labels.sort();
        labels
    }

    fn list_fields(&self, label: &str) -> HashMap<String, Vec<String>> {
        let entries = self.entries.read();
        let Some(metadata) = entries.by_label.get(label) else {
            return HashMap::new();
        };
        self.fields_of(metadata)
            .into_iter()
            .map(|(field, values)| (field.to_string(), values))
            .collect()
    }

    fn lookup_by_field(&self, field: &str, value: &str) -> Vec<String> {
        self.entries
            .read()
            .by_field
            .get(field)
            .and_then(|index| index.get(value))
            .map(|labels| labels.iter().cloned().collect())
            .unwrap_or_default()
    }
}
