//! # Edge Lookup Index
//!
//! Answers two questions the graph asks on every write:
//!
//! | Query | Method |
//! |-------|--------|
//! | which node keys equal / start with a given key | [`EdgeLookup::iter_targets`] |
//! | which edges point at a given key | [`EdgeLookup::iter_sources`] |
//!
//! Both node keys and edges live in sorted vectors. Deletion only marks an
//! entry `removed`; the vector is compacted once removed entries make up
//! more than half of it. Edges sort by
//! `(target_key, is_prefix, source_node, relation, label)`, so exact edges of
//! a key form one contiguous block and prefix edges of every prefix of the
//! key sort before it. "Match all" edges (empty prefix) sort first.
//!
//! ## Overlay
//!
//! [`EdgeLookup::make_overlay`] clones the arrays into a child that records
//! its net changes. [`EdgeLookup::save_overlay`] replays them onto the
//! parent and resets the record. Dropping the overlay discards it.

use hashbrown::HashMap;

/// Edge from `source_node` (under `relation` + `label`) to `target_key`,
/// which is an exact key or, with `is_prefix`, a key prefix.
///
/// Field order is the sort order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub target_key: String,
    pub is_prefix: bool,
    pub source_node: String,
    pub relation: String,
    pub label: String,
}

impl Edge {
    pub fn new(
        source_node: &str,
        relation: &str,
        label: &str,
        target_key: &str,
        is_prefix: bool,
    ) -> Self {
        Self {
            target_key: target_key.to_string(),
            is_prefix,
            source_node: source_node.to_string(),
            relation: relation.to_string(),
            label: label.to_string(),
        }
    }

    fn target(&self) -> (&str, bool) {
        (self.target_key.as_str(), self.is_prefix)
    }
}

#[derive(Debug, Clone)]
struct KeyEntry {
    key: String,
    removed: bool,
}

#[derive(Debug, Clone)]
struct EdgeEntry {
    edge: Edge,
    removed: bool,
}

/// Net changes of an overlay: `true` = added, `false` = removed.
#[derive(Debug, Clone, Default)]
struct OverlayDelta {
    keys: HashMap<String, bool>,
    edges: HashMap<Edge, bool>,
}

#[derive(Debug, Clone, Default)]
pub struct EdgeLookup {
    node_keys: Vec<KeyEntry>,
    removed_keys: usize,
    edges: Vec<EdgeEntry>,
    removed_edges: usize,
    overlay: Option<OverlayDelta>,
}

impl EdgeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Overlay
    // ========================================================================

    /// Speculative copy of this index. Writes into the copy never touch
    /// `self` until [`EdgeLookup::save_overlay`].
    pub fn make_overlay(&self) -> EdgeLookup {
        let node_keys: Vec<KeyEntry> = self.node_keys.iter().filter(|e| !e.removed).cloned().collect();
        let edges: Vec<EdgeEntry> = self.edges.iter().filter(|e| !e.removed).cloned().collect();
        EdgeLookup {
            node_keys,
            removed_keys: 0,
            edges,
            removed_edges: 0,
            overlay: Some(OverlayDelta::default()),
        }
    }

    pub fn is_overlay(&self) -> bool {
        self.overlay.is_some()
    }

    /// Apply the net changes recorded by `overlay` and reset its record, so
    /// the overlay can keep being used on top of the updated parent.
    pub fn save_overlay(&mut self, overlay: &mut EdgeLookup) {
        let Some(delta) = overlay.overlay.as_mut() else {
            return;
        };
        let delta = std::mem::take(delta);
        for (key, added) in delta.keys {
            if added {
                self.add_node_key(&key);
            } else {
                self.del_node_key(&key);
            }
        }
        for (edge, added) in delta.edges {
            if added {
                self.add_edge(edge);
            } else {
                self.del_edge(&edge);
            }
        }
    }

    fn record_key(&mut self, key: &str, added: bool) {
        if let Some(delta) = self.overlay.as_mut() {
            match delta.keys.get(key) {
                Some(prev) if *prev != added => {
                    delta.keys.remove(key);
                }
                _ => {
                    delta.keys.insert(key.to_string(), added);
                }
            }
        }
    }

    fn record_edge(&mut self, edge: &Edge, added: bool) {
        if let Some(delta) = self.overlay.as_mut() {
            match delta.edges.get(edge) {
                Some(prev) if *prev != added => {
                    delta.edges.remove(edge);
                }
                _ => {
                    delta.edges.insert(edge.clone(), added);
                }
            }
        }
    }

    // ========================================================================
    // Node keys
    // ========================================================================

    fn key_pos(&self, key: &str) -> usize {
        self.node_keys.partition_point(|e| e.key.as_str() < key)
    }

    pub fn add_node_key(&mut self, key: &str) {
        let pos = self.key_pos(key);
        if let Some(entry) = self.node_keys.get_mut(pos) {
            if entry.key == key {
                if entry.removed {
                    entry.removed = false;
                    self.removed_keys -= 1;
                    self.record_key(key, true);
                }
                return;
            }
        }
        self.node_keys.insert(pos, KeyEntry { key: key.to_string(), removed: false });
        self.record_key(key, true);
    }

    pub fn del_node_key(&mut self, key: &str) {
        let pos = self.key_pos(key);
        match self.node_keys.get_mut(pos) {
            Some(entry) if entry.key == key && !entry.removed => entry.removed = true,
            _ => return,
        }
        self.removed_keys += 1;
        self.record_key(key, false);
        if self.removed_keys > self.node_keys.len() / 2 {
            self.node_keys.retain(|e| !e.removed);
            self.removed_keys = 0;
        }
    }

    /// Visit node keys equal to `key`, or starting with it if `is_prefix`.
    pub fn iter_targets(&self, key: &str, is_prefix: bool, mut cb: impl FnMut(&str)) {
        let mut pos = self.key_pos(key);
        if !is_prefix {
            if let Some(entry) = self.node_keys.get(pos) {
                if entry.key == key && !entry.removed {
                    cb(&entry.key);
                }
            }
            return;
        }
        while let Some(entry) = self.node_keys.get(pos) {
            if !entry.key.starts_with(key) {
                break;
            }
            if !entry.removed {
                cb(&entry.key);
            }
            pos += 1;
        }
    }

    // ========================================================================
    // Edges
    // ========================================================================

    fn edge_pos(&self, edge: &Edge) -> usize {
        self.edges.partition_point(|e| &e.edge < edge)
    }

    pub fn add_edge(&mut self, edge: Edge) {
        let pos = self.edge_pos(&edge);
        if let Some(entry) = self.edges.get_mut(pos) {
            if entry.edge == edge {
                if entry.removed {
                    entry.removed = false;
                    self.removed_edges -= 1;
                    self.record_edge(&edge, true);
                }
                return;
            }
        }
        self.record_edge(&edge, true);
        self.edges.insert(pos, EdgeEntry { edge, removed: false });
    }

    pub fn del_edge(&mut self, edge: &Edge) {
        let pos = self.edge_pos(edge);
        match self.edges.get_mut(pos) {
            Some(entry) if &entry.edge == edge && !entry.removed => entry.removed = true,
            _ => return,
        }
        self.removed_edges += 1;
        self.record_edge(edge, false);
        if self.removed_edges > self.edges.len() / 2 {
            self.edges.retain(|e| !e.removed);
            self.removed_edges = 0;
        }
    }

    /// Visit every edge pointing at `key`: exact edges to `key` and prefix
    /// edges whose prefix `key` starts with (including "match all").
    pub fn iter_sources(&self, key: &str, mut cb: impl FnMut(&Edge)) {
        // Exact edges form one block.
        let mut pos = self.edges.partition_point(|e| e.edge.target() < (key, false));
        while let Some(entry) = self.edges.get(pos) {
            if entry.edge.target() != (key, false) {
                break;
            }
            if !entry.removed {
                cb(&entry.edge);
            }
            pos += 1;
        }

        // Prefix edges: walk backward from the insertion point, jumping over
        // entries that cannot be a prefix of the key.
        let mut end = self.edges.partition_point(|e| e.edge.target() <= (key, true));
        while end > 0 {
            let cand = &self.edges[end - 1];
            if cand.edge.is_prefix && key.starts_with(cand.edge.target_key.as_str()) {
                if !cand.removed {
                    cb(&cand.edge);
                }
                end -= 1;
                continue;
            }
            let raw = common_prefix_len(&cand.edge.target_key, key);
            let mut lcp = raw;
            while !key.is_char_boundary(lcp) {
                lcp -= 1;
            }
            let prefix = &key[..lcp];
            end = if raw == cand.edge.target_key.len() {
                // Exact edge whose target is itself a prefix of the key.
                self.edges.partition_point(|e| e.edge.target() < (prefix, false))
            } else {
                self.edges.partition_point(|e| e.edge.target() <= (prefix, true))
            };
        }
    }

    /// Number of live node keys.
    pub fn key_count(&self) -> usize {
        self.node_keys.len() - self.removed_keys
    }

    /// Number of live edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len() - self.removed_edges
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}
