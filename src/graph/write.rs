//! Write access: node mutations, relation maintenance, save and history.

use std::cmp::Ordering;
use std::ops::Deref;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLockWriteGuard;

use crate::descriptor::MetadataMap;
use crate::model::{Metadata, ValueRef, values_equal};
use super::edge_lookup::Edge;
use super::flags::{Flag, FlagKind};
use super::node::{KeySet, Node, RelationTargetDef};
use super::record::{RecordedNode, Retention, to_delta, trim_timeline};
use super::{Graph, GraphState};

enum Access<'g> {
    InPlace(RwLockWriteGuard<'g, GraphState>),
    Copy(Box<GraphState>),
}

/// Read-write handle returned by [`Graph::write`].
///
/// Dropping the handle releases it: an in-place handle saves first, then
/// (with `record`) saved revisions are appended to the history. Changes of a
/// copy handle that were never saved are discarded.
pub struct GraphWriter<'g> {
    graph: &'g Graph,
    access: Access<'g>,
    record: bool,
    /// key -> data updated (false = only targets changed)
    new_revs: HashMap<String, bool>,
}

impl<'g> GraphWriter<'g> {
    pub(super) fn new(graph: &'g Graph, in_place: bool, record: bool) -> Self {
        let access = if in_place {
            let guard = graph.state.write();
            graph.set_write_locked(true);
            Access::InPlace(guard)
        } else {
            Access::Copy(Box::new(graph.state.read().private_copy()))
        };
        Self { graph, access, record, new_revs: HashMap::new() }
    }

    pub fn is_in_place(&self) -> bool {
        matches!(self.access, Access::InPlace(_))
    }

    fn state_mut(&mut self) -> &mut GraphState {
        match &mut self.access {
            Access::InPlace(guard) => &mut **guard,
            Access::Copy(copy) => &mut **copy,
        }
    }

    pub fn register_metadata_map(&mut self, name: &str, map: Arc<dyn MetadataMap>) {
        self.state_mut().mappings.insert(name.to_string(), map);
    }

    /// Write access to a node, created if missing.
    pub fn set_node(&mut self, key: &str) -> NodeMut<'_> {
        let in_place = self.is_in_place();
        let state = self.state_mut();
        state.ensure_node(key);
        NodeMut { state, key: key.to_string(), in_place }
    }

    /// Returns false if the node did not exist.
    pub fn delete_node(&mut self, key: &str) -> bool {
        let in_place = self.is_in_place();
        self.state_mut().remove_node(key, in_place)
    }

    /// Publish changes made so far.
    pub fn save(&mut self) {
        match &mut self.access {
            Access::InPlace(state) => {
                for key in std::mem::take(&mut state.unsaved) {
                    match state.nodes.get_mut(&key) {
                        None => {
                            self.new_revs.insert(key, true);
                        }
                        Some(node) => {
                            note_revision(&mut self.new_revs, &key, node);
                            clear_dirty(node);
                        }
                    }
                }
            }
            Access::Copy(copy) => {
                let mut dest = self.graph.state.write();
                for (name, map) in &copy.mappings {
                    dest.mappings.entry(name.clone()).or_insert_with(|| map.clone());
                }
                for key in std::mem::take(&mut copy.unsaved) {
                    match copy.nodes.get_mut(&key) {
                        None => {
                            if let Some(old) = dest.nodes.remove(&key) {
                                delete_metadata(&dest.mappings, &old);
                            }
                            self.new_revs.insert(key, true);
                        }
                        Some(node) => {
                            if !(node.data_updated || node.targets_updated || node.sources_updated) {
                                continue;
                            }
                            note_revision(&mut self.new_revs, &key, node);
                            sync_metadata(&dest.mappings, node);
                            clear_dirty(node);
                            dest.nodes.insert(key, node.clone());
                        }
                    }
                }
                dest.edges.save_overlay(&mut copy.edges);
            }
        }
    }

    /// Release the handle (same as dropping it).
    pub fn release(self) {}

    /// Save and record what an in-place handle changed so far, so that the
    /// next changes form separate revisions.
    pub(crate) fn checkpoint(&mut self) {
        if self.is_in_place() {
            self.save();
            self.record_history();
        }
    }

    fn record_history(&mut self) {
        if !self.record || !self.graph.opts.record_old_revs || self.new_revs.is_empty() {
            return;
        }
        let new_revs = std::mem::take(&mut self.new_revs);
        let mut guard = None;
        let dest: &mut GraphState = match &mut self.access {
            Access::InPlace(state) => &mut **state,
            Access::Copy(_) => &mut **guard.insert(self.graph.state.write()),
        };

        let now = dest.stamp();
        for (key, data_updated) in new_revs {
            let node = dest.nodes.get(&key);
            if node.is_none() && !dest.timeline.contains_key(&key) {
                continue;
            }
            let recorded = node.map(|n| {
                RecordedNode::capture(n, metadata_fields(&dest.mappings, n), !data_updated, now)
            });
            let records = dest.timeline.entry(key).or_default();
            if let Some(last) = records.last_mut() {
                if last.until.is_none() {
                    last.until = Some(now);
                }
            }
            records.extend(recorded);
        }

        let opts = &self.graph.opts;
        if now - dest.last_trimming >= to_delta(opts.trimming_period) {
            let retention = Retention {
                start_time: self.graph.start_time,
                permanent_init_period: to_delta(opts.permanent_init_period),
                age_limit: to_delta(opts.record_age_limit),
            };
            for records in dest.timeline.values_mut() {
                trim_timeline(records, now, retention);
            }
            dest.timeline.retain(|_, records| !records.is_empty());
            dest.last_trimming = now;
        }
    }
}

impl Deref for GraphWriter<'_> {
    type Target = GraphState;

    fn deref(&self) -> &GraphState {
        match &self.access {
            Access::InPlace(guard) => &**guard,
            Access::Copy(copy) => &**copy,
        }
    }
}

impl Drop for GraphWriter<'_> {
    fn drop(&mut self) {
        if self.is_in_place() {
            self.save();
        }
        self.record_history();
        if self.is_in_place() {
            self.graph.set_write_locked(false);
        }
    }
}

fn note_revision(new_revs: &mut HashMap<String, bool>, key: &str, node: &Node) {
    if node.data_updated || node.targets_updated {
        let data = new_revs.entry(key.to_string()).or_insert(false);
        *data |= node.data_updated;
    }
}

fn clear_dirty(node: &mut Node) {
    node.data_updated = false;
    node.targets_updated = false;
    node.sources_updated = false;
}

fn sync_metadata(mappings: &HashMap<String, Arc<dyn MetadataMap>>, node: &mut Node) {
    let Some(map) = node.metadata_map.as_ref().and_then(|name| mappings.get(name)) else {
        return;
    };
    match &node.metadata {
        Some(metadata) => {
            map.put(&node.label, metadata.clone());
            node.metadata_added = true;
        }
        None if node.metadata_added => {
            map.delete(&node.label);
            node.metadata_added = false;
        }
        None => {}
    }
}

fn delete_metadata(mappings: &HashMap<String, Arc<dyn MetadataMap>>, node: &Node) {
    if !node.metadata_added {
        return;
    }
    if let Some(map) = node.metadata_map.as_ref().and_then(|name| mappings.get(name)) {
        map.delete(&node.label);
    }
}

fn metadata_fields(
    mappings: &HashMap<String, Arc<dyn MetadataMap>>,
    node: &Node,
) -> HashMap<String, Vec<String>> {
    if node.metadata.is_none() {
        return HashMap::new();
    }
    node.metadata_map
        .as_ref()
        .and_then(|name| mappings.get(name))
        .map(|map| map.list_fields(&node.label))
        .unwrap_or_default()
}

/// Edges installed into the lookup index for a target definition.
fn edges_of(source: &str, def: &RelationTargetDef) -> Vec<Edge> {
    if let Some(key) = &def.key {
        return vec![Edge::new(source, &def.relation, &def.label, key, false)];
    }
    if !def.is_dynamic() {
        return Vec::new();
    }
    if def.selector.key_prefixes.is_empty() {
        return vec![Edge::new(source, &def.relation, &def.label, "", true)];
    }
    let mut edges: Vec<Edge> = def
        .selector
        .key_prefixes
        .iter()
        .map(|prefix| Edge::new(source, &def.relation, &def.label, prefix, true))
        .collect();
    edges.sort();
    edges.dedup();
    edges
}

// ============================================================================
// GraphState: mutations
// ============================================================================

impl GraphState {
    fn mark(&mut self, key: &str) {
        if !self.unsaved.contains(key) {
            self.unsaved.insert(key.to_string());
        }
    }

    fn ensure_node(&mut self, key: &str) {
        self.mark(key);
        if self.nodes.contains_key(key) {
            return;
        }
        self.nodes.insert(key.to_string(), Node::new(key));
        self.edges.add_node_key(key);

        let mut incoming = Vec::new();
        self.edges.iter_sources(key, |edge| incoming.push(edge.clone()));
        for edge in incoming {
            let matches = self
                .nodes
                .get(&edge.source_node)
                .and_then(|src| {
                    src.target_defs
                        .iter()
                        .find(|d| d.relation == edge.relation && d.label == edge.label)
                })
                .is_some_and(|def| def.matches(key));
            if matches {
                self.link(&edge.source_node, &edge.relation, &edge.label, key);
            }
        }
    }

    fn remove_node(&mut self, key: &str, in_place: bool) -> bool {
        let Some(node) = self.nodes.remove(key) else {
            return false;
        };
        self.mark(key);
        self.edges.del_node_key(key);
        for def in &node.target_defs {
            for edge in edges_of(key, def) {
                self.edges.del_edge(&edge);
            }
        }
        for target in node.targets.iter() {
            for t in &target.matching_keys {
                self.drop_source(t, &target.relation, &target.label, key);
            }
        }
        for source in node.sources.iter() {
            for s in &source.matching_keys {
                if let Some(src) = self.nodes.get_mut(s) {
                    if let Some(t) = src.targets.get_mut(&source.relation, &source.label) {
                        if t.matching_keys.remove(key) {
                            src.targets_updated = true;
                        }
                    }
                }
                self.mark(s);
            }
        }
        if in_place {
            delete_metadata(&self.mappings, &node);
        }
        true
    }

    /// Add `target` to the targets of `source` and mirror it in sources.
    fn link(&mut self, source: &str, relation: &str, label: &str, target: &str) {
        if let Some(src) = self.nodes.get_mut(source) {
            if src.targets.entry(relation, label).matching_keys.insert(target.to_string()) {
                src.targets_updated = true;
            }
        }
        if let Some(dst) = self.nodes.get_mut(target) {
            if dst.sources.entry(relation, label).matching_keys.insert(source.to_string()) {
                dst.sources_updated = true;
            }
        }
        self.mark(source);
        self.mark(target);
    }

    fn unlink(&mut self, source: &str, relation: &str, label: &str, target: &str) {
        if let Some(src) = self.nodes.get_mut(source) {
            if let Some(t) = src.targets.get_mut(relation, label) {
                if t.matching_keys.remove(target) {
                    src.targets_updated = true;
                }
            }
        }
        self.mark(source);
        self.drop_source(target, relation, label, source);
    }

    fn drop_source(&mut self, node: &str, relation: &str, label: &str, source: &str) {
        if let Some(n) = self.nodes.get_mut(node) {
            if let Some(s) = n.sources.get_mut(relation, label) {
                if s.matching_keys.remove(source) {
                    n.sources_updated = true;
                }
                if s.matching_keys.is_empty() {
                    n.sources.remove(relation, label);
                }
            }
        }
        self.mark(node);
    }

    /// Diff the previous target definitions of `key` against `defs` in one
    /// merge pass over both sorted lists.
    fn set_targets(&mut self, key: &str, mut defs: Vec<RelationTargetDef>) {
        defs.sort_by(|a, b| a.id().cmp(&b.id()));
        defs.dedup_by(|a, b| a.id() == b.id());
        let Some(node) = self.nodes.get_mut(key) else {
            return;
        };
        let old = std::mem::take(&mut node.target_defs);
        self.mark(key);

        let (mut i, mut j) = (0, 0);
        loop {
            let ord = match (old.get(i), defs.get(j)) {
                (Some(o), Some(n)) => o.id().cmp(&n.id()),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => break,
            };
            match ord {
                Ordering::Less => {
                    self.remove_target(key, &old[i]);
                    i += 1;
                }
                Ordering::Greater => {
                    self.add_target(key, &defs[j]);
                    j += 1;
                }
                Ordering::Equal => {
                    if old[i].same_as(&defs[j]) {
                        if defs[j].is_dynamic() {
                            self.refresh_target(key, &defs[j]);
                        }
                    } else {
                        self.remove_target(key, &old[i]);
                        self.add_target(key, &defs[j]);
                    }
                    i += 1;
                    j += 1;
                }
            }
        }

        if let Some(node) = self.nodes.get_mut(key) {
            node.target_defs = defs;
        }
    }

    fn remove_target(&mut self, key: &str, def: &RelationTargetDef) {
        for edge in edges_of(key, def) {
            self.edges.del_edge(&edge);
        }
        let removed = self.nodes.get_mut(key).and_then(|n| {
            n.targets_updated = true;
            n.targets.remove(&def.relation, &def.label)
        });
        if let Some(target) = removed {
            for t in &target.matching_keys {
                self.drop_source(t, &def.relation, &def.label, key);
            }
        }
    }

    fn add_target(&mut self, key: &str, def: &RelationTargetDef) {
        for edge in edges_of(key, def) {
            self.edges.add_edge(edge);
        }
        let matching = self.resolve(def);
        if let Some(n) = self.nodes.get_mut(key) {
            n.targets.entry(&def.relation, &def.label).expected_key = def.key.clone();
            n.targets_updated = true;
        }
        for t in &matching {
            self.link(key, &def.relation, &def.label, t);
        }
    }

    /// Re-evaluate an unchanged selector target.
    fn refresh_target(&mut self, key: &str, def: &RelationTargetDef) {
        let now = self.resolve(def);
        let prev: KeySet = self
            .nodes
            .get(key)
            .and_then(|n| n.targets.get(&def.relation, &def.label))
            .map(|t| t.matching_keys.clone())
            .unwrap_or_default();
        for t in prev.difference(&now) {
            self.unlink(key, &def.relation, &def.label, t);
        }
        for t in now.difference(&prev) {
            self.link(key, &def.relation, &def.label, t);
        }
    }
}

// ============================================================================
// NodeMut
// ============================================================================

/// Write access to one node, returned by [`GraphWriter::set_node`].
pub struct NodeMut<'w> {
    state: &'w mut GraphState,
    key: String,
    in_place: bool,
}

impl NodeMut<'_> {
    fn update(&mut self, f: impl FnOnce(&mut Node) -> bool) -> &mut Self {
        if let Some(node) = self.state.nodes.get_mut(&self.key) {
            if f(node) {
                node.data_updated = true;
            }
        }
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn set_label(&mut self, label: &str) -> &mut Self {
        self.update(|n| {
            if n.label == label {
                return false;
            }
            n.label = label.to_string();
            true
        })
    }

    pub fn set_value(&mut self, value: Option<ValueRef>) -> &mut Self {
        self.update(|n| {
            if values_equal(n.value.as_ref(), value.as_ref()) {
                return false;
            }
            n.value = value;
            true
        })
    }

    pub fn set_flag(&mut self, flag: Flag) -> &mut Self {
        self.update(|n| n.flags.set(flag))
    }

    pub fn del_flags(&mut self, kinds: &[FlagKind]) -> &mut Self {
        self.update(|n| kinds.iter().fold(false, |changed, kind| n.flags.del(*kind) || changed))
    }

    pub fn set_metadata_map(&mut self, name: &str) -> &mut Self {
        self.update(|n| {
            if n.metadata_map.as_deref() == Some(name) {
                return false;
            }
            n.metadata_map = Some(name.to_string());
            true
        })
    }

    /// With an in-place handle the metadata map is updated immediately,
    /// otherwise on save.
    pub fn set_metadata(&mut self, metadata: Option<Metadata>) -> &mut Self {
        let in_place = self.in_place;
        let GraphState { nodes, mappings, .. } = &mut *self.state;
        if let Some(node) = nodes.get_mut(&self.key) {
            node.metadata = metadata;
            node.data_updated = true;
            if in_place {
                sync_metadata(mappings, node);
            }
        }
        self
    }

    pub fn set_targets(&mut self, defs: Vec<RelationTargetDef>) -> &mut Self {
        self.state.set_targets(&self.key, defs);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
