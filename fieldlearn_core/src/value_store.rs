//! Hierarchical set-valued store of observed field values.
//!
//! Keys are canonicalized path components (`chunk_3` is stored under `chunk`). Interior nodes are
//! maps, leaves are sets of hex-encoded byte strings. Two blacklists keep field kinds out of the
//! store: one for fields wider than the learnable bound, one for fields whose value set grew past
//! the cardinality cap. A name on either list never has a leaf anywhere in the tree.

use crate::span::canonicalize_component;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// One node of the value tree.
///
/// Serializes untagged: a leaf is a JSON array of values, an interior node a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Leaf(BTreeSet<String>),
    Interior(BTreeMap<String, Node>),
}

pub type ValueTree = BTreeMap<String, Node>;

/// The two blacklists, both keyed by canonicalized field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blacklists {
    pub by_size: BTreeSet<String>,
    pub by_count: BTreeSet<String>,
}

impl Blacklists {
    pub fn contains(&self, name: &str) -> bool {
        self.by_size.contains(name) || self.by_count.contains(name)
    }

    pub fn len(&self) -> usize {
        self.by_size.union(&self.by_count).count()
    }

    pub fn is_empty(&self) -> bool {
        self.by_size.is_empty() && self.by_count.is_empty()
    }

    /// Every blacklisted name, deduplicated and sorted.
    pub fn all(&self) -> BTreeSet<String> {
        self.by_size.union(&self.by_count).cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueStore {
    root: ValueTree,
    blacklists: Blacklists,
    max_unique_values: usize,
}

impl ValueStore {
    pub fn new(max_unique_values: usize) -> Self {
        Self {
            root: ValueTree::new(),
            blacklists: Blacklists::default(),
            max_unique_values,
        }
    }

    /// Rebuilds a store from checkpointed parts, re-establishing the blacklist invariant.
    pub fn from_parts(root: ValueTree, blacklists: Blacklists, max_unique_values: usize) -> Self {
        let mut store = Self {
            root,
            blacklists,
            max_unique_values,
        };
        store.enforce_limits();
        store
    }

    pub fn tree(&self) -> &ValueTree {
        &self.root
    }

    pub fn blacklists(&self) -> &Blacklists {
        &self.blacklists
    }

    pub fn max_unique_values(&self) -> usize {
        self.max_unique_values
    }

    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklists.contains(canonicalize_component(name))
    }

    /// Adds `value` to the leaf at `path` (verbose components, canonicalized here).
    ///
    /// Returns `true` when the value was not already present. Blacklisted leaf names are a no-op.
    pub fn insert<S: AsRef<str>>(&mut self, path: &[S], value: &str) -> bool {
        let keys: Vec<&str> = path
            .iter()
            .map(|component| canonicalize_component(component.as_ref()))
            .collect();
        let Some((leaf_name, parents)) = keys.split_last() else {
            return false;
        };
        if self.blacklists.contains(leaf_name) {
            return false;
        }

        let mut current = &mut self.root;
        for key in parents {
            let node = current
                .entry((*key).to_string())
                .or_insert_with(|| Node::Interior(BTreeMap::new()));
            if matches!(*node, Node::Leaf(_)) {
                tracing::debug!("Promoting leaf '{key}' to an interior node");
                *node = Node::Interior(BTreeMap::new());
            }
            let Node::Interior(children) = node else {
                return false;
            };
            current = children;
        }

        match current
            .entry((*leaf_name).to_string())
            .or_insert_with(|| Node::Leaf(BTreeSet::new()))
        {
            Node::Leaf(values) => values.insert(value.to_string()),
            Node::Interior(_) => {
                tracing::debug!("'{leaf_name}' is an interior node, value {value} not stored");
                false
            }
        }
    }

    /// Blacklists the leaf at `path` by cardinality once its value set exceeds the cap.
    ///
    /// Returns `true` when this call blacklisted the name.
    pub fn check_cardinality<S: AsRef<str>>(&mut self, path: &[S]) -> bool {
        let size = match self.leaf(path) {
            Some(values) => values.len(),
            None => return false,
        };
        if size <= self.max_unique_values {
            return false;
        }
        let Some(name) = path
            .last()
            .map(|c| canonicalize_component(c.as_ref()).to_string())
        else {
            return false;
        };
        tracing::debug!(
            "Blacklisting '{name}' by count: {size} values (limit {})",
            self.max_unique_values
        );
        self.blacklist_by_count(&name)
    }

    /// `insert` followed by `check_cardinality`.
    pub fn record<S: AsRef<str>>(&mut self, path: &[S], value: &str) {
        if self.insert(path, value) {
            self.check_cardinality(path);
        }
    }

    /// Permanently excludes a field kind wider than the learnable bound. Returns `true` if new.
    pub fn blacklist_by_size(&mut self, name: &str) -> bool {
        let name = canonicalize_component(name);
        let added = self.blacklists.by_size.insert(name.to_string());
        if added {
            self.purge(name);
        }
        added
    }

    /// Excludes a field kind whose value set outgrew the cap. Returns `true` if new.
    pub fn blacklist_by_count(&mut self, name: &str) -> bool {
        let name = canonicalize_component(name);
        let added = self.blacklists.by_count.insert(name.to_string());
        if added {
            self.purge(name);
        }
        added
    }

    /// Removes every leaf named `name` at any depth, then any interior node left empty.
    ///
    /// Interior nodes sharing the name are kept: a struct too wide to learn as a whole still
    /// holds learnable children. Returns the number of removed leaves.
    pub fn purge(&mut self, name: &str) -> usize {
        purge_map(&mut self.root, name)
    }

    /// Structural merge of `other` into `self`: matching interior keys recurse, matching leaves
    /// are set-unioned, keys only in `other` are adopted. Blacklists are unioned and then
    /// re-enforced over the whole tree, including the cardinality cap.
    pub fn union(&mut self, other: ValueStore) {
        let ValueStore {
            root, blacklists, ..
        } = other;
        self.blacklists.by_size.extend(blacklists.by_size);
        self.blacklists.by_count.extend(blacklists.by_count);
        merge_maps(&mut self.root, root);
        self.enforce_limits();
    }

    /// Purges every blacklisted name and blacklists any leaf above the cardinality cap.
    ///
    /// Returns the names newly blacklisted by count.
    pub fn enforce_limits(&mut self) -> Vec<String> {
        let blacklisted = self.blacklists.all();
        for name in &blacklisted {
            purge_map(&mut self.root, name);
        }

        let mut oversized = BTreeSet::new();
        collect_oversized(&self.root, self.max_unique_values, &mut oversized);
        let mut newly = Vec::new();
        for name in oversized {
            if self.blacklist_by_count(&name) {
                tracing::debug!("Post-merge blacklist (by count): '{name}'");
                newly.push(name);
            }
        }
        newly
    }

    /// Values stored at `path` (verbose components, canonicalized here).
    pub fn leaf<S: AsRef<str>>(&self, path: &[S]) -> Option<&BTreeSet<String>> {
        let (last, parents) = path.split_last()?;
        let mut current = &self.root;
        for key in parents {
            match current.get(canonicalize_component(key.as_ref()))? {
                Node::Interior(children) => current = children,
                Node::Leaf(_) => return None,
            }
        }
        match current.get(canonicalize_component(last.as_ref()))? {
            Node::Leaf(values) => Some(values),
            Node::Interior(_) => None,
        }
    }

    /// True if a leaf named `name` exists anywhere in the tree.
    pub fn contains_name(&self, name: &str) -> bool {
        contains_leaf(&self.root, name)
    }

    pub fn leaf_count(&self) -> usize {
        count_leaves(&self.root).0
    }

    pub fn value_count(&self) -> usize {
        count_leaves(&self.root).1
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

fn purge_map(map: &mut ValueTree, name: &str) -> usize {
    let mut removed = 0;
    map.retain(|key, node| match node {
        Node::Leaf(_) if key == name => {
            removed += 1;
            false
        }
        Node::Leaf(_) => true,
        Node::Interior(children) => {
            let had_children = !children.is_empty();
            removed += purge_map(children, name);
            !(had_children && children.is_empty())
        }
    });
    removed
}

fn merge_maps(into: &mut ValueTree, from: ValueTree) {
    for (key, node) in from {
        match into.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(node);
            }
            Entry::Occupied(mut slot) => merge_nodes(slot.get_mut(), node),
        }
    }
}

// Interior wins over leaf regardless of merge order, matching `insert`'s promotion rule.
fn merge_nodes(into: &mut Node, from: Node) {
    match from {
        Node::Leaf(values) => match into {
            Node::Leaf(existing) => existing.extend(values),
            Node::Interior(_) => {}
        },
        Node::Interior(children) => match into {
            Node::Interior(existing) => merge_maps(existing, children),
            Node::Leaf(_) => *into = Node::Interior(children),
        },
    }
}

fn collect_oversized(map: &ValueTree, cap: usize, out: &mut BTreeSet<String>) {
    for (key, node) in map {
        match node {
            Node::Leaf(values) if values.len() > cap => {
                out.insert(key.clone());
            }
            Node::Leaf(_) => {}
            Node::Interior(children) => collect_oversized(children, cap, out),
        }
    }
}

fn contains_leaf(map: &ValueTree, name: &str) -> bool {
    map.iter().any(|(key, node)| match node {
        Node::Leaf(_) => key == name,
        Node::Interior(children) => contains_leaf(children, name),
    })
}

fn count_leaves(map: &ValueTree) -> (usize, usize) {
    map.values().fold((0, 0), |(leaves, values), node| match node {
        Node::Leaf(set) => (leaves + 1, values + set.len()),
        Node::Interior(children) => {
            let (l, v) = count_leaves(children);
            (leaves + l, values + v)
        }
    })
}
