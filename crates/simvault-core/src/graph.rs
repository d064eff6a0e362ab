//! Id- and tick-indexed arena of checkpoint nodes.
//!
//! The graph owns every node of one in-memory store, keyed by the id the
//! node was created with. Parent/child links are arena keys. Physical
//! removal splices a node's children onto its parent, so the structure
//! stays a forest rooted at the single head.

use std::collections::{BTreeMap, BTreeSet};

use crate::checkpoint::{Checkpoint, ChkptId};
use crate::container::Tick;
use crate::error::{CheckpointError, Result};

/// Arena of checkpoint nodes with id and tick indexes.
#[derive(Debug, Default)]
pub struct CheckpointGraph {
    nodes: BTreeMap<ChkptId, Checkpoint>,
    by_tick: BTreeMap<Tick, BTreeSet<ChkptId>>,
}

impl CheckpointGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the arena, flagged-deleted nodes included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the arena holds no nodes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node by arena key.
    #[must_use]
    pub fn node(&self, key: ChkptId) -> Option<&Checkpoint> {
        self.nodes.get(&key)
    }

    /// Looks up a node by arena key for mutation.
    pub fn node_mut(&mut self, key: ChkptId) -> Option<&mut Checkpoint> {
        self.nodes.get_mut(&key)
    }

    /// True if `id` refers to a live (not flagged-deleted) node.
    #[must_use]
    pub fn is_live(&self, id: ChkptId) -> bool {
        self.nodes.get(&id).is_some_and(|n| !n.is_flagged_deleted())
    }

    /// Publishes a fresh node into the graph, linking it under its parent.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvariantViolation`] if the key is already
    /// taken, the parent is missing, the child's tick precedes the parent's,
    /// or a second head is being introduced.
    pub fn insert(&mut self, node: Checkpoint) -> Result<()> {
        let key = node.arena_key();
        if self.nodes.contains_key(&key) {
            return Err(CheckpointError::invariant(format!(
                "checkpoint id {key} is already present in the graph"
            )));
        }
        match node.prev() {
            Some(parent_key) => {
                let parent = self.nodes.get(&parent_key).ok_or_else(|| {
                    CheckpointError::invariant(format!(
                        "checkpoint {key} links to parent {parent_key} which is not in the graph"
                    ))
                })?;
                if node.tick() < parent.tick() {
                    return Err(CheckpointError::invariant(format!(
                        "checkpoint {key} at tick {} precedes its parent at tick {}",
                        node.tick(),
                        parent.tick()
                    )));
                }
                if parent.nexts().contains(&key) {
                    return Err(CheckpointError::invariant(format!(
                        "checkpoint {key} is already a child of {parent_key}"
                    )));
                }
            }
            None => {
                if !self.nodes.is_empty() {
                    return Err(CheckpointError::invariant(format!(
                        "checkpoint {key} has no parent but the graph already has a head"
                    )));
                }
                if !node.is_snapshot() {
                    return Err(CheckpointError::invariant(format!(
                        "head checkpoint {key} must be a snapshot"
                    )));
                }
            }
        }

        if let Some(parent_key) = node.prev() {
            if let Some(parent) = self.nodes.get_mut(&parent_key) {
                parent.add_next(key);
            }
        }
        self.by_tick.entry(node.tick()).or_default().insert(key);
        self.nodes.insert(key, node);
        Ok(())
    }

    /// Live checkpoint ids in ascending order.
    #[must_use]
    pub fn list(&self) -> Vec<ChkptId> {
        self.nodes
            .values()
            .filter(|n| !n.is_flagged_deleted())
            .map(Checkpoint::id)
            .collect()
    }

    /// Live checkpoint ids taken at tick `t`, ascending.
    #[must_use]
    pub fn list_at(&self, t: Tick) -> Vec<ChkptId> {
        let Some(keys) = self.by_tick.get(&t) else {
            return Vec::new();
        };
        keys.iter()
            .filter(|k| self.is_live(**k))
            .copied()
            .collect()
    }

    /// Iterates all nodes in arena-key order, flagged nodes included.
    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.nodes.values()
    }

    /// Flags a node deleted, retiring its public id.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] for an unknown key, or
    /// [`CheckpointError::DoubleDelete`] if the node is already flagged.
    pub fn flag_deleted(&mut self, key: ChkptId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&key)
            .ok_or(CheckpointError::NotFound(key))?;
        node.flag_deleted()
    }

    /// True once `key` may be physically removed: the node is flagged
    /// deleted and every descendant is flagged deleted or a snapshot.
    #[must_use]
    pub fn can_delete(&self, key: ChkptId) -> bool {
        let Some(node) = self.nodes.get(&key) else {
            return false;
        };
        if !node.is_flagged_deleted() {
            return false;
        }
        node.nexts()
            .iter()
            .all(|&n| self.node(n).is_some_and(Checkpoint::is_snapshot) || self.can_delete(n))
    }

    /// Physically removes `key`, splicing its children onto its parent.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] for an unknown key.
    pub fn remove(&mut self, key: ChkptId) -> Result<Checkpoint> {
        let node = self
            .nodes
            .remove(&key)
            .ok_or(CheckpointError::NotFound(key))?;

        if let Some(set) = self.by_tick.get_mut(&node.tick()) {
            set.remove(&key);
            if set.is_empty() {
                self.by_tick.remove(&node.tick());
            }
        }

        let parent_key = node.prev();
        if let Some(p) = parent_key {
            if let Some(parent) = self.nodes.get_mut(&p) {
                parent.remove_next(key);
            }
        }
        for &child in node.nexts() {
            if let Some(c) = self.nodes.get_mut(&child) {
                c.set_prev(parent_key);
            }
            if let Some(p) = parent_key {
                if let Some(parent) = self.nodes.get_mut(&p) {
                    parent.add_next(child);
                }
            }
        }
        Ok(node)
    }

    /// Removes the chain of removable nodes starting at `key` and walking
    /// parent links upward. Returns the arena keys removed, in removal
    /// order.
    ///
    /// # Errors
    ///
    /// Propagates removal errors; the walk stops at the first node that is
    /// not removable.
    pub fn sweep_from(&mut self, key: ChkptId) -> Result<Vec<ChkptId>> {
        let mut removed = Vec::new();
        let mut cur = Some(key);
        while let Some(k) = cur {
            if !self.can_delete(k) {
                break;
            }
            let node = self.remove(k)?;
            removed.push(k);
            cur = node.prev();
        }
        Ok(removed)
    }

    /// Drains every node in descending arena-key order, for teardown.
    pub fn drain_reverse(&mut self) -> Vec<Checkpoint> {
        let keys: Vec<ChkptId> = self.nodes.keys().rev().copied().collect();
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some(node) = self.nodes.remove(&k) {
                out.push(node);
            }
        }
        self.by_tick.clear();
        out
    }
}
