//! # Graph Store
//!
//! In-memory graph of key-value pairs and their relations, with per-key
//! revision history.
//!
//! ## Access model
//!
//! | Handle | Lock | Visibility of changes |
//! |--------|------|-----------------------|
//! | [`Graph::read`] | shared, until release | n/a |
//! | [`Graph::write`] `in_place = true` | exclusive, until release | immediate |
//! | [`Graph::write`] `in_place = false` | exclusive only inside `save()`/`release()` | on `save()` |
//!
//! Nodes reference each other by key; edges are kept out-of-line in the
//! [`EdgeLookup`], so a private copy of the graph costs a clone of the node
//! table plus an overlay of the index.

pub mod edge_lookup;
pub mod flags;
pub mod node;
pub mod record;
mod write;

use std::cell::Cell;
use std::fmt::Write as _;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use hashbrown::{HashMap, HashSet};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::descriptor::MetadataMap;
use crate::{Error, Result};

pub use edge_lookup::{Edge, EdgeLookup};
pub use flags::{Flag, FlagKind, FlagSelector, Flags, LastUpdate, MAX_FLAGS};
pub use node::{KeySet, Node, RelationTargetDef, Target, TargetSelector, Targets};
pub use record::{FlagStats, RecordedNode};
pub use write::{GraphWriter, NodeMut};

// ============================================================================
// Options
// ============================================================================

/// History options of the graph.
#[derive(Debug, Clone)]
pub struct GraphOpts {
    pub record_old_revs: bool,
    /// Sealed revisions older than this are trimmed.
    pub record_age_limit: Duration,
    /// Revisions recorded within this period after start are never trimmed.
    pub permanent_init_period: Duration,
    /// Minimal interval between two trimming passes.
    pub trimming_period: Duration,
}

impl Default for GraphOpts {
    fn default() -> Self {
        Self {
            record_old_revs: true,
            record_age_limit: Duration::from_secs(24 * 60 * 60),
            permanent_init_period: Duration::from_secs(60 * 60),
            trimming_period: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Graph
// ============================================================================

thread_local! {
    /// Address of the graph whose write lock this thread holds in place.
    static WRITE_LOCKED: Cell<usize> = const { Cell::new(0) };
}

pub struct Graph {
    state: RwLock<GraphState>,
    opts: GraphOpts,
    start_time: DateTime<Utc>,
}

impl Graph {
    pub fn new(opts: GraphOpts) -> Self {
        let now = Utc::now();
        Self {
            state: RwLock::new(GraphState::new(now)),
            opts,
            start_time: now,
        }
    }

    /// Shared read access, valid until the handle is released (dropped).
    pub fn read(&self) -> GraphReader<'_> {
        self.check_not_write_locked();
        GraphReader { guard: self.state.read() }
    }

    /// Read-write access; see the module docs for `in_place`. With `record`,
    /// saved changes are appended to the history on release.
    pub fn write(&self, in_place: bool, record: bool) -> GraphWriter<'_> {
        self.check_not_write_locked();
        GraphWriter::new(self, in_place, record)
    }

    fn addr(&self) -> usize {
        self as *const Graph as usize
    }

    /// Taking the lock again from the thread holding it in place would
    /// deadlock, e.g. a descriptor handler calling back into the scheduler.
    fn check_not_write_locked(&self) {
        debug_assert!(
            WRITE_LOCKED.with(Cell::get) != self.addr(),
            "graph re-entered while this thread holds its write lock"
        );
    }

    fn set_write_locked(&self, locked: bool) {
        WRITE_LOCKED.with(|cell| cell.set(if locked { self.addr() } else { 0 }));
    }

    pub fn opts(&self) -> &GraphOpts {
        &self.opts
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(GraphOpts::default())
    }
}

/// Read handle.
pub struct GraphReader<'g> {
    guard: RwLockReadGuard<'g, GraphState>,
}

impl GraphReader<'_> {
    pub fn release(self) {}
}

impl Deref for GraphReader<'_> {
    type Target = GraphState;

    fn deref(&self) -> &GraphState {
        &self.guard
    }
}

// ============================================================================
// GraphState: read API
// ============================================================================

/// Graph content; reachable through [`GraphReader`] and [`GraphWriter`].
pub struct GraphState {
    nodes: HashMap<String, Node>,
    edges: EdgeLookup,
    mappings: HashMap<String, Arc<dyn MetadataMap>>,
    timeline: HashMap<String, Vec<RecordedNode>>,
    /// Keys touched by the current write handle.
    unsaved: HashSet<String>,
    last_trimming: DateTime<Utc>,
    last_stamp: DateTime<Utc>,
}

impl GraphState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            nodes: HashMap::new(),
            edges: EdgeLookup::new(),
            mappings: HashMap::new(),
            timeline: HashMap::new(),
            unsaved: HashSet::new(),
            last_trimming: now,
            last_stamp: now,
        }
    }

    /// Private copy for a non-in-place write handle. The history is left
    /// behind; it is only appended to under the lock on release.
    fn private_copy(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            edges: self.edges.make_overlay(),
            mappings: self.mappings.clone(),
            timeline: HashMap::new(),
            unsaved: HashSet::new(),
            last_trimming: self.last_trimming,
            last_stamp: self.last_stamp,
        }
    }

    /// Strictly increasing timestamp.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let t = if now > self.last_stamp { now } else { self.last_stamp + TimeDelta::nanoseconds(1) };
        self.last_stamp = t;
        t
    }

    pub fn get_metadata_map(&self, name: &str) -> Option<Arc<dyn MetadataMap>> {
        self.mappings.get(name).cloned()
    }

    pub fn get_key_count(&self) -> usize {
        self.nodes.len()
    }

    /// All keys, sorted.
    pub fn get_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.nodes.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get_node(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    /// Nodes passing the key selector (if any) and all flag selectors,
    /// sorted by key.
    pub fn get_nodes(
        &self,
        key_selector: Option<&dyn Fn(&str) -> bool>,
        flag_selectors: &[FlagSelector],
    ) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| key_selector.is_none_or(|sel| sel(&n.key)))
            .filter(|n| flag_selectors.iter().all(|sel| sel.matches(&n.flags)))
            .collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        nodes
    }

    /// Counts of the values of one flag kind across all recorded revisions
    /// (target-only revisions excluded).
    pub fn get_flag_stats(
        &self,
        kind: FlagKind,
        key_selector: Option<&dyn Fn(&str) -> bool>,
    ) -> FlagStats {
        let mut stats = FlagStats::default();
        for (key, records) in &self.timeline {
            if !key_selector.is_none_or(|sel| sel(key)) {
                continue;
            }
            for record in records.iter().filter(|r| !r.target_update_only) {
                if let Some(flag) = record.flags.get(kind) {
                    stats.total_count += 1;
                    *stats.per_value_count.entry(flag.value()).or_insert(0) += 1;
                }
            }
        }
        stats
    }

    /// Recorded revisions of a key, oldest first.
    pub fn get_node_timeline(&self, key: &str) -> &[RecordedNode] {
        self.timeline.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Revisions valid at `time`, sorted by key.
    pub fn get_snapshot(&self, time: DateTime<Utc>) -> Vec<&RecordedNode> {
        let mut snapshot: Vec<&RecordedNode> = self
            .timeline
            .values()
            .filter_map(|records| records.iter().find(|r| r.valid_at(time)))
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    /// Human-readable listing of all nodes.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "GRAPH ({} nodes)", self.nodes.len());
        for key in self.get_keys() {
            let Some(node) = self.nodes.get(&key) else { continue };
            let _ = write!(out, "- {key}");
            if !node.label.is_empty() && node.label != key {
                let _ = write!(out, " ({})", node.label);
            }
            let _ = writeln!(out, " {}", node.flags);
            if let Some(value) = &node.value {
                let _ = writeln!(out, "    value: {value:?}");
            }
            if !node.targets.is_empty() {
                let _ = writeln!(out, "    targets: {}", node.targets);
            }
            if !node.sources.is_empty() {
                let _ = writeln!(out, "    sources: {}", node.sources);
            }
            if let Some(metadata) = &node.metadata {
                let _ = writeln!(out, "    metadata: {metadata:?}");
            }
        }
        out
    }

    /// Check that targets and sources mirror each other and that every
    /// target definition is resolved exactly.
    pub fn validate_edges(&self) -> Result<()> {
        for (key, node) in &self.nodes {
            for def in &node.target_defs {
                let target = node.targets.get(&def.relation, &def.label).ok_or_else(|| {
                    Error::Inconsistent(format!("{key}: missing target entry {}/{}", def.relation, def.label))
                })?;
                let expected = self.resolve(def);
                if expected != target.matching_keys {
                    return Err(Error::Inconsistent(format!(
                        "{key}: target {}/{} matches {:?}, expected {:?}",
                        def.relation, def.label, target.matching_keys, expected
                    )));
                }
            }
            for target in node.targets.iter() {
                for t in &target.matching_keys {
                    let has_source = self
                        .nodes
                        .get(t)
                        .and_then(|n| n.sources.get(&target.relation, &target.label))
                        .is_some_and(|s| s.matching_keys.contains(key));
                    if !has_source {
                        return Err(Error::Inconsistent(format!(
                            "{t}: missing source {key} for {}/{}",
                            target.relation, target.label
                        )));
                    }
                }
            }
            for source in node.sources.iter() {
                for s in &source.matching_keys {
                    let has_target = self
                        .nodes
                        .get(s)
                        .and_then(|n| n.targets.get(&source.relation, &source.label))
                        .is_some_and(|t| t.matching_keys.contains(key));
                    if !has_target {
                        return Err(Error::Inconsistent(format!(
                            "{s}: missing target {key} for {}/{}",
                            source.relation, source.label
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Keys currently matching a target definition.
    fn resolve(&self, def: &RelationTargetDef) -> KeySet {
        let mut keys = KeySet::new();
        if let Some(key) = &def.key {
            self.edges.iter_targets(key, false, |k| {
                keys.insert(k.to_string());
            });
        } else if def.is_dynamic() {
            if def.selector.key_prefixes.is_empty() {
                self.edges.iter_targets("", true, |k| {
                    if def.matches(k) {
                        keys.insert(k.to_string());
                    }
                });
            } else {
                for prefix in &def.selector.key_prefixes {
                    self.edges.iter_targets(prefix, true, |k| {
                        if def.matches(k) {
                            keys.insert(k.to_string());
                        }
                    });
                }
            }
        }
        keys
    }
}
