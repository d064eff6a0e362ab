//! Backing-store contract and the all-in-memory store.
//!
//! A backing store owns every live checkpoint node. The checkpointer core
//! talks to it exclusively through [`CheckpointAccessor`], so the memory
//! store here and the windowed/durable store are interchangeable.

use std::io::Write;

use tracing::{debug, info};

use crate::chain::{replay, restore_chain, CheckpointArena};
use crate::checkpoint::{Checkpoint, ChkptId, DetachedCheckpoint, UNIDENTIFIED_CHECKPOINT};
use crate::container::{layouts, SharedContainer, Tick};
use crate::error::{CheckpointError, Result};
use crate::graph::CheckpointGraph;
use crate::trace::trace_value;

/// Copyable summary of one node, for graph walks that do not need bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMeta {
    /// Public id; [`UNIDENTIFIED_CHECKPOINT`] once flagged deleted.
    pub id: ChkptId,
    /// Stable arena key.
    pub arena_key: ChkptId,
    /// Capture tick.
    pub tick: Tick,
    /// Arena key of the parent.
    pub prev: Option<ChkptId>,
    /// Whether the node holds complete state.
    pub is_snapshot: bool,
}

impl NodeMeta {
    /// True if the node has been flagged deleted.
    #[must_use]
    pub fn is_flagged_deleted(&self) -> bool {
        self.id == UNIDENTIFIED_CHECKPOINT
    }
}

impl From<&Checkpoint> for NodeMeta {
    fn from(node: &Checkpoint) -> Self {
        Self {
            id: node.id(),
            arena_key: node.arena_key(),
            tick: node.tick(),
            prev: node.prev(),
            is_snapshot: node.is_snapshot(),
        }
    }
}

/// Capability contract every backing store implements.
///
/// All methods take `&mut self`: in windowed mode a lookup may hydrate
/// checkpoints from the database, and the cache bookkeeping moves even on
/// reads.
pub trait CheckpointAccessor: Send {
    /// Freezes the ordered container list used for loads and tracing.
    fn set_containers(&mut self, containers: Vec<SharedContainer>);

    /// Publishes a newly captured node.
    ///
    /// # Errors
    ///
    /// Returns an error if graph invariants are violated or the pipeline
    /// refuses the clone.
    fn insert(&mut self, node: Checkpoint) -> Result<()>;

    /// True if `id` refers to a live checkpoint.
    fn has(&mut self, id: ChkptId) -> bool;

    /// Number of nodes held, flagged-deleted nodes included.
    fn node_count(&mut self) -> u64;

    /// Copyable summary of the node at `key`, hydrating if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if hydration fails.
    fn node_meta(&mut self, key: ChkptId) -> Result<Option<NodeMeta>>;

    /// Live checkpoint ids, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing database cannot be enumerated.
    fn list(&mut self) -> Result<Vec<ChkptId>>;

    /// Live checkpoint ids taken at tick `t`, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing database cannot be enumerated.
    fn list_at(&mut self, t: Tick) -> Result<Vec<ChkptId>>;

    /// Standalone clone of the live checkpoint `id`, hydrating if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if hydration fails.
    fn find_detached(&mut self, id: ChkptId) -> Result<Option<DetachedCheckpoint>>;

    /// Replays the restore chain of `id` into the frozen container list.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] for unknown or flagged ids;
    /// on replay failure the simulator state is undefined.
    fn load_into(&mut self, id: ChkptId) -> Result<()>;

    /// Traces the value at `[offset, offset + size)` of the container at
    /// `container_index` through the history chain of `id`.
    ///
    /// # Errors
    ///
    /// See [`crate::trace::trace_value`].
    fn trace_value(
        &mut self,
        out: &mut dyn Write,
        id: ChkptId,
        container_index: usize,
        offset: u64,
        size: u32,
    ) -> Result<()>;

    /// Flags `id` deleted and sweeps any chain of removable ancestors.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] for unknown or already-flagged
    /// ids, or [`CheckpointError::Unsupported`] where deletion is not
    /// available.
    fn delete(&mut self, id: ChkptId) -> Result<()>;

    /// Physically removes the removable node at `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not removable.
    fn erase(&mut self, key: ChkptId) -> Result<()>;

    /// Nearest ancestor of `key` that is still live.
    ///
    /// # Errors
    ///
    /// Returns an error if hydration fails.
    fn nearest_live_ancestor(&mut self, key: ChkptId) -> Result<Option<ChkptId>>;

    /// Flags every remaining node deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be drained.
    fn flag_all_deleted(&mut self) -> Result<()>;

    /// Stops intake, drains any pipeline, flags all nodes deleted, and
    /// destroys them in reverse id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline cannot be drained.
    fn teardown(&mut self) -> Result<()>;

    /// Total memory held by the store's nodes, bookkeeping included.
    fn mem_total(&mut self) -> u64;

    /// Memory held by checkpointed content alone.
    fn mem_content(&mut self) -> u64;

    /// One description line per node, in id order.
    ///
    /// # Errors
    ///
    /// Propagates writer errors.
    fn dump_list(&mut self, out: &mut dyn Write) -> Result<()>;

    /// Raw hex data of every node, in id order.
    ///
    /// # Errors
    ///
    /// Propagates writer errors.
    fn dump_data(&mut self, out: &mut dyn Write) -> Result<()>;

    /// Description line plus hex data for every node, in id order.
    ///
    /// # Errors
    ///
    /// Propagates writer errors.
    fn dump_annotated_data(&mut self, out: &mut dyn Write) -> Result<()>;
}

/// Backing store holding every checkpoint in memory until deleted.
#[derive(Default)]
pub struct MemoryStore {
    graph: CheckpointGraph,
    containers: Vec<SharedContainer>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("nodes", &self.graph.len())
            .field("containers", &self.containers.len())
            .finish()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: CheckpointGraph::new(),
            containers: Vec::new(),
        }
    }

    /// The underlying graph, for inspection in tests.
    #[must_use]
    pub fn graph(&self) -> &CheckpointGraph {
        &self.graph
    }
}

impl CheckpointArena for MemoryStore {
    fn node(&mut self, key: ChkptId) -> Result<Option<&Checkpoint>> {
        Ok(self.graph.node(key))
    }

    fn node_mut(&mut self, key: ChkptId) -> Result<Option<&mut Checkpoint>> {
        Ok(self.graph.node_mut(key))
    }
}

impl CheckpointAccessor for MemoryStore {
    fn set_containers(&mut self, containers: Vec<SharedContainer>) {
        self.containers = containers;
    }

    fn insert(&mut self, node: Checkpoint) -> Result<()> {
        debug!(id = node.id(), tick = node.tick(), snapshot = node.is_snapshot(), "storing checkpoint");
        self.graph.insert(node)
    }

    fn has(&mut self, id: ChkptId) -> bool {
        self.graph.is_live(id)
    }

    fn node_count(&mut self) -> u64 {
        self.graph.len() as u64
    }

    fn node_meta(&mut self, key: ChkptId) -> Result<Option<NodeMeta>> {
        Ok(self.graph.node(key).map(NodeMeta::from))
    }

    fn list(&mut self) -> Result<Vec<ChkptId>> {
        Ok(self.graph.list())
    }

    fn list_at(&mut self, t: Tick) -> Result<Vec<ChkptId>> {
        Ok(self.graph.list_at(t))
    }

    fn find_detached(&mut self, id: ChkptId) -> Result<Option<DetachedCheckpoint>> {
        if !self.graph.is_live(id) {
            return Ok(None);
        }
        Ok(self.graph.node(id).map(Checkpoint::detach))
    }

    fn load_into(&mut self, id: ChkptId) -> Result<()> {
        if !self.graph.is_live(id) {
            return Err(CheckpointError::NotFound(id));
        }
        let containers = self.containers.clone();
        let chain = restore_chain(self, id)?;
        replay(self, &chain, &containers)
    }

    fn trace_value(
        &mut self,
        out: &mut dyn Write,
        id: ChkptId,
        container_index: usize,
        offset: u64,
        size: u32,
    ) -> Result<()> {
        if !self.graph.is_live(id) {
            return Err(CheckpointError::NotFound(id));
        }
        let lay = layouts(&self.containers);
        trace_value(self, out, &lay, id, container_index, offset, size)
    }

    fn delete(&mut self, id: ChkptId) -> Result<()> {
        if !self.graph.is_live(id) {
            return Err(CheckpointError::NotFound(id));
        }
        self.graph.flag_deleted(id)?;
        let removed = self.graph.sweep_from(id)?;
        debug!(id, removed = removed.len(), "flagged checkpoint deleted");
        Ok(())
    }

    fn erase(&mut self, key: ChkptId) -> Result<()> {
        if !self.graph.can_delete(key) {
            return Err(CheckpointError::invariant(format!(
                "checkpoint {key} is not removable: it is live or has live delta descendants"
            )));
        }
        self.graph.remove(key)?;
        Ok(())
    }

    fn nearest_live_ancestor(&mut self, key: ChkptId) -> Result<Option<ChkptId>> {
        let mut cur = self.graph.node(key).and_then(Checkpoint::prev);
        while let Some(k) = cur {
            let node = self.graph.node(k).ok_or_else(|| {
                CheckpointError::invariant(format!("ancestor walk hit missing node {k}"))
            })?;
            if !node.is_flagged_deleted() {
                return Ok(Some(k));
            }
            cur = node.prev();
        }
        Ok(None)
    }

    fn flag_all_deleted(&mut self) -> Result<()> {
        let keys: Vec<ChkptId> = self.graph.list();
        for key in keys {
            self.graph.flag_deleted(key)?;
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.flag_all_deleted()?;
        let dropped = self.graph.drain_reverse();
        info!(count = dropped.len(), "memory store torn down");
        Ok(())
    }

    fn mem_total(&mut self) -> u64 {
        self.graph.iter().map(Checkpoint::total_memory).sum()
    }

    fn mem_content(&mut self) -> u64 {
        self.graph.iter().map(Checkpoint::content_memory).sum()
    }

    fn dump_list(&mut self, out: &mut dyn Write) -> Result<()> {
        for node in self.graph.iter() {
            writeln!(out, "{node}")?;
        }
        Ok(())
    }

    fn dump_data(&mut self, out: &mut dyn Write) -> Result<()> {
        for node in self.graph.iter() {
            node.storage().dump(out)?;
            writeln!(out)?;
        }
        Ok(())
    }

    fn dump_annotated_data(&mut self, out: &mut dyn Write) -> Result<()> {
        for node in self.graph.iter() {
            writeln!(out, "{node}")?;
            node.storage().dump(out)?;
            writeln!(out)?;
        }
        Ok(())
    }
}
