//! Graph node and its relation targets.
//!
//! Nodes reference each other by key only. Matched target keys and the
//! inverse "sources" live in per-node sorted lists keyed by
//! `(relation, label)`; the edges that produced them live in the
//! [`EdgeLookup`](super::EdgeLookup).

use std::collections::BTreeSet;
use std::fmt;

use smallvec::SmallVec;

use crate::model::{KeySelector, Metadata, ValueRef};
use super::flags::Flags;

/// Ordered set of keys.
pub type KeySet = BTreeSet<String>;

// ============================================================================
// Target definitions
// ============================================================================

/// Dynamic target: keys under any of the prefixes (all keys if none) that
/// pass the selector.
#[derive(Clone, Default)]
pub struct TargetSelector {
    pub key_prefixes: Vec<String>,
    pub key_selector: Option<KeySelector>,
}

/// Definition of one `(relation, label)` target of a node.
#[derive(Clone)]
pub struct RelationTargetDef {
    pub relation: String,
    /// Unique within `(source, relation)`.
    pub label: String,
    /// Static target; `selector` is ignored when set.
    pub key: Option<String>,
    pub selector: TargetSelector,
}

impl RelationTargetDef {
    pub fn to_key(relation: &str, label: &str, key: &str) -> Self {
        Self {
            relation: relation.to_string(),
            label: label.to_string(),
            key: Some(key.to_string()),
            selector: TargetSelector::default(),
        }
    }

    pub fn to_selection(relation: &str, label: &str, selector: TargetSelector) -> Self {
        Self {
            relation: relation.to_string(),
            label: label.to_string(),
            key: None,
            selector,
        }
    }

    pub(crate) fn id(&self) -> (&str, &str) {
        (self.relation.as_str(), self.label.as_str())
    }

    /// Same definition, ignoring the selector predicate (closures cannot be
    /// compared; a selector target is re-evaluated instead).
    pub(crate) fn same_as(&self, other: &RelationTargetDef) -> bool {
        self.id() == other.id()
            && self.key == other.key
            && self.selector.key_prefixes == other.selector.key_prefixes
            && self.selector.key_selector.is_some() == other.selector.key_selector.is_some()
    }

    pub(crate) fn is_dynamic(&self) -> bool {
        self.key.is_none()
            && (self.selector.key_selector.is_some() || !self.selector.key_prefixes.is_empty())
    }

    /// Whether `key` satisfies this definition.
    pub fn matches(&self, key: &str) -> bool {
        if let Some(expected) = &self.key {
            return expected == key;
        }
        if !self.is_dynamic() {
            return false;
        }
        let prefix_ok = self.selector.key_prefixes.is_empty()
            || self.selector.key_prefixes.iter().any(|p| key.starts_with(p.as_str()));
        prefix_ok && self.selector.key_selector.as_ref().is_none_or(|sel| sel(key))
    }
}

impl fmt::Debug for RelationTargetDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationTargetDef")
            .field("relation", &self.relation)
            .field("label", &self.label)
            .field("key", &self.key)
            .field("key_prefixes", &self.selector.key_prefixes)
            .field("has_selector", &self.selector.key_selector.is_some())
            .finish()
    }
}

// ============================================================================
// Resolved targets
// ============================================================================

/// Keys matched by one `(relation, label)`; for sources, the keys of the
/// nodes pointing at this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub relation: String,
    pub label: String,
    /// Static target key, `None` for selector targets and sources.
    pub expected_key: Option<String>,
    pub matching_keys: KeySet,
}

/// Targets sorted by `(relation, label)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets(SmallVec<[Target; 2]>);

impl Targets {
    fn lookup_idx(&self, relation: &str, label: &str) -> Result<usize, usize> {
        self.0
            .binary_search_by(|t| (t.relation.as_str(), t.label.as_str()).cmp(&(relation, label)))
    }

    pub fn get(&self, relation: &str, label: &str) -> Option<&Target> {
        self.lookup_idx(relation, label).ok().map(|i| &self.0[i])
    }

    pub(crate) fn get_mut(&mut self, relation: &str, label: &str) -> Option<&mut Target> {
        self.lookup_idx(relation, label).ok().map(move |i| &mut self.0[i])
    }

    /// Get or create the entry for `(relation, label)`.
    pub(crate) fn entry(&mut self, relation: &str, label: &str) -> &mut Target {
        let idx = match self.lookup_idx(relation, label) {
            Ok(i) => i,
            Err(i) => {
                self.0.insert(i, Target {
                    relation: relation.to_string(),
                    label: label.to_string(),
                    expected_key: None,
                    matching_keys: KeySet::new(),
                });
                i
            }
        };
        &mut self.0[idx]
    }

    pub(crate) fn remove(&mut self, relation: &str, label: &str) -> Option<Target> {
        self.lookup_idx(relation, label).ok().map(|i| self.0.remove(i))
    }

    /// All targets of one relation, ordered by label.
    pub fn relation(&self, relation: &str) -> &[Target] {
        let begin = self.0.partition_point(|t| t.relation.as_str() < relation);
        let end = self.0.partition_point(|t| t.relation.as_str() <= relation);
        &self.0[begin..end]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Targets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut relation: Option<&str> = None;
        for target in self.iter() {
            if relation != Some(target.relation.as_str()) {
                if relation.is_some() {
                    write!(f, "}} ")?;
                }
                write!(f, "{}:{{", target.relation)?;
                relation = Some(&target.relation);
            } else {
                write!(f, ", ")?;
            }
            let keys: Vec<&str> = target.matching_keys.iter().map(String::as_str).collect();
            write!(f, "{}->[{}]", target.label, keys.join(", "))?;
        }
        if relation.is_some() {
            write!(f, "}}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Node
// ============================================================================

/// Vertex of the graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) key: String,
    pub(crate) label: String,
    pub(crate) value: Option<ValueRef>,
    pub(crate) flags: Flags,
    pub(crate) metadata: Option<Metadata>,
    pub(crate) metadata_map: Option<String>,
    /// Metadata currently stored in the metadata map under `label`.
    pub(crate) metadata_added: bool,

    pub(crate) target_defs: Vec<RelationTargetDef>,
    pub(crate) targets: Targets,
    pub(crate) sources: Targets,

    pub(crate) data_updated: bool,
    pub(crate) targets_updated: bool,
    pub(crate) sources_updated: bool,
}

impl Node {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            label: String::new(),
            value: None,
            flags: Flags::default(),
            metadata: None,
            metadata_map: None,
            metadata_added: false,
            target_defs: Vec::new(),
            targets: Targets::default(),
            sources: Targets::default(),
            data_updated: true,
            targets_updated: false,
            sources_updated: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> Option<&ValueRef> {
        self.value.as_ref()
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn metadata_map(&self) -> Option<&str> {
        self.metadata_map.as_deref()
    }

    pub fn target_defs(&self) -> &[RelationTargetDef] {
        &self.target_defs
    }

    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    pub fn sources(&self) -> &Targets {
        &self.sources
    }

    /// Matched targets of one relation grouped by label.
    pub fn targets_of(&self, relation: &str) -> &[Target] {
        self.targets.relation(relation)
    }

    /// Sources of one relation grouped by label.
    pub fn sources_of(&self, relation: &str) -> &[Target] {
        self.sources.relation(relation)
    }
}
