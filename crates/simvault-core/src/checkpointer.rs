//! The checkpointer core: public create/delete/load/list operations.
//!
//! Single-threaded with respect to the simulator; called between ticks and
//! never suspends (a windowed backing store may block internally on
//! database hydration). Snapshot promotion is purely a threshold on the
//! delta streak behind the current checkpoint.

use std::io::Write;

use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, ChkptId, DetachedCheckpoint, UNIDENTIFIED_CHECKPOINT};
use crate::container::{SharedContainer, Tick};
use crate::error::{CheckpointError, Result};
use crate::store::{CheckpointAccessor, MemoryStore, NodeMeta};

/// Configuration for a [`Checkpointer`].
#[derive(Debug, Clone)]
pub struct CheckpointerConfig {
    /// After this many consecutive deltas following a snapshot, the next
    /// checkpoint is promoted to a snapshot. Must be at least 1.
    pub snapshot_threshold: u32,
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: 20,
        }
    }
}

impl CheckpointerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the snapshot threshold.
    #[must_use]
    pub fn with_snapshot_threshold(mut self, threshold: u32) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidConfig`] if the threshold is zero.
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_threshold == 0 {
            return Err(CheckpointError::InvalidConfig(
                "snapshot_threshold must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Records and restores complete simulator state at chosen ticks.
///
/// Owns a backing store and the frozen, ordered list of state containers.
/// Checkpoint ids are allocated monotonically starting at 1; id 0 is the
/// reserved "unidentified" value.
pub struct Checkpointer {
    store: Box<dyn CheckpointAccessor>,
    containers: Vec<SharedContainer>,
    config: CheckpointerConfig,
    head: ChkptId,
    current: ChkptId,
    next_id: ChkptId,
}

impl Checkpointer {
    /// Creates a checkpointer over an explicit backing store.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidConfig`] for a bad configuration.
    pub fn new(
        mut store: Box<dyn CheckpointAccessor>,
        containers: Vec<SharedContainer>,
        config: CheckpointerConfig,
    ) -> Result<Self> {
        config.validate()?;
        store.set_containers(containers.clone());
        Ok(Self {
            store,
            containers,
            config,
            head: UNIDENTIFIED_CHECKPOINT,
            current: UNIDENTIFIED_CHECKPOINT,
            next_id: 1,
        })
    }

    /// Creates a checkpointer over an all-in-memory backing store.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidConfig`] for a bad configuration.
    pub fn in_memory(
        containers: Vec<SharedContainer>,
        config: CheckpointerConfig,
    ) -> Result<Self> {
        Self::new(Box::new(MemoryStore::new()), containers, config)
    }

    /// The configured snapshot threshold.
    #[must_use]
    pub fn snapshot_threshold(&self) -> u32 {
        self.config.snapshot_threshold
    }

    /// Id of the head checkpoint, if one has been created.
    #[must_use]
    pub fn head_id(&self) -> Option<ChkptId> {
        (self.head != UNIDENTIFIED_CHECKPOINT).then_some(self.head)
    }

    /// Id of the current checkpoint (the head of the current timeline).
    #[must_use]
    pub fn current_id(&self) -> Option<ChkptId> {
        (self.current != UNIDENTIFIED_CHECKPOINT).then_some(self.current)
    }

    /// The frozen container list.
    #[must_use]
    pub fn containers(&self) -> &[SharedContainer] {
        &self.containers
    }

    fn alloc_id(&mut self) -> Result<ChkptId> {
        if self.next_id == ChkptId::MAX {
            return Err(CheckpointError::IdExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    /// Creates the first, always-snapshot checkpoint with no parent and
    /// makes it both head and current.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvariantViolation`] if a head already
    /// exists.
    pub fn create_head(&mut self, tick: Tick) -> Result<ChkptId> {
        if self.head != UNIDENTIFIED_CHECKPOINT {
            return Err(CheckpointError::invariant(format!(
                "cannot create head at tick {tick}: head checkpoint {} already exists",
                self.head
            )));
        }
        let id = self.alloc_id()?;
        let node = Checkpoint::capture(id, tick, None, true, &self.containers)?;
        self.store.insert(node)?;
        self.head = id;
        self.current = id;
        info!(id, tick, "created head checkpoint");
        Ok(id)
    }

    /// Creates a new checkpoint following the current one.
    ///
    /// The new node is a delta unless the delta streak behind the current
    /// checkpoint has reached the snapshot threshold, or the previous
    /// checkpoint's bytes are no longer available (flagged deleted), in
    /// which case it is promoted to a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::OrderViolation`] if `tick` precedes the
    /// current checkpoint's tick, or [`CheckpointError::InvariantViolation`]
    /// if no head exists.
    pub fn create_checkpoint(&mut self, tick: Tick) -> Result<ChkptId> {
        if self.head == UNIDENTIFIED_CHECKPOINT {
            return Err(CheckpointError::invariant(format!(
                "cannot create a checkpoint at tick {tick} before the head checkpoint exists"
            )));
        }

        let prev_key = self.current;
        let is_snapshot = match self.store.node_meta(prev_key)? {
            Some(meta) => {
                if tick < meta.tick {
                    return Err(CheckpointError::OrderViolation {
                        tick,
                        prev_tick: meta.tick,
                    });
                }
                if meta.is_flagged_deleted() {
                    // The previous bytes are going away; a delta would have
                    // nothing stable to build on.
                    true
                } else {
                    self.distance_via_meta(prev_key)? >= self.config.snapshot_threshold
                }
            }
            None => true,
        };

        let id = self.alloc_id()?;
        let node = Checkpoint::capture(id, tick, Some(prev_key), is_snapshot, &self.containers)?;
        self.store.insert(node)?;
        self.current = id;
        debug!(id, tick, snapshot = is_snapshot, "created checkpoint");
        Ok(id)
    }

    /// Flags `id` deleted and physically removes every chain of removable
    /// nodes. If `id` is the current checkpoint, current moves to the
    /// nearest live ancestor (the head if none survives).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] for unknown or already-flagged
    /// ids, and [`CheckpointError::InvariantViolation`] when deleting the
    /// head while any other node survives.
    pub fn delete_checkpoint(&mut self, id: ChkptId) -> Result<()> {
        if !self.store.has(id) {
            return Err(CheckpointError::NotFound(id));
        }

        if id == self.head {
            if self.store.node_count() > 1 {
                return Err(CheckpointError::invariant(format!(
                    "cannot delete head checkpoint {id} while descendants survive"
                )));
            }
            self.store.delete(id)?;
            self.head = UNIDENTIFIED_CHECKPOINT;
            self.current = UNIDENTIFIED_CHECKPOINT;
            info!(id, "deleted head checkpoint");
            return Ok(());
        }

        let new_current = if id == self.current {
            Some(self.store.nearest_live_ancestor(id)?.unwrap_or(self.head))
        } else {
            None
        };

        self.store.delete(id)?;
        if let Some(c) = new_current {
            self.current = c;
        }
        debug!(id, "deleted checkpoint");
        Ok(())
    }

    /// Restores the simulator state recorded by checkpoint `id` and makes
    /// it current.
    ///
    /// In windowed mode this may block while checkpoints are hydrated from
    /// the database. On failure the simulator state is undefined; there is
    /// no partial-recovery guarantee.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if `id` is unknown or flagged
    /// deleted.
    pub fn load_checkpoint(&mut self, id: ChkptId) -> Result<()> {
        self.store.load_into(id)?;
        self.current = id;
        info!(id, "loaded checkpoint");
        Ok(())
    }

    /// Live checkpoint ids, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing database cannot be enumerated.
    pub fn list(&mut self) -> Result<Vec<ChkptId>> {
        self.store.list()
    }

    /// Live checkpoint ids taken at tick `t`, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing database cannot be enumerated.
    pub fn list_at(&mut self, t: Tick) -> Result<Vec<ChkptId>> {
        self.store.list_at(t)
    }

    /// Standalone clone of the live checkpoint `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if hydration from the database fails.
    pub fn find_checkpoint(&mut self, id: ChkptId) -> Result<Option<DetachedCheckpoint>> {
        self.store.find_detached(id)
    }

    /// Whether the live checkpoint `id` is a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] for unknown or flagged ids.
    pub fn is_snapshot(&mut self, id: ChkptId) -> Result<bool> {
        match self.store.node_meta(id)? {
            Some(meta) if !meta.is_flagged_deleted() => Ok(meta.is_snapshot),
            _ => Err(CheckpointError::NotFound(id)),
        }
    }

    /// Number of parent edges between `id` and its nearest ancestor
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] for unknown or flagged ids.
    pub fn distance_to_prev_snapshot(&mut self, id: ChkptId) -> Result<u32> {
        if !self.store.has(id) {
            return Err(CheckpointError::NotFound(id));
        }
        self.distance_via_meta(id)
    }

    fn distance_via_meta(&mut self, key: ChkptId) -> Result<u32> {
        let mut cur = key;
        let mut dist = 0u32;
        loop {
            let meta = self.store.node_meta(cur)?.ok_or_else(|| {
                CheckpointError::invariant(format!(
                    "chain walk from {key} hit missing node {cur}"
                ))
            })?;
            if meta.is_snapshot {
                return Ok(dist);
            }
            cur = meta.prev.ok_or_else(|| {
                CheckpointError::invariant(format!(
                    "chain from {key} reached the head without a snapshot; every chain \
                     must be rooted in a snapshot"
                ))
            })?;
            dist += 1;
        }
    }

    /// Total memory held by live and flagged checkpoints.
    pub fn memory_use_total(&mut self) -> u64 {
        self.store.mem_total()
    }

    /// Memory held by checkpointed content alone.
    pub fn memory_use_content(&mut self) -> u64 {
        self.store.mem_content()
    }

    /// One description line per checkpoint.
    ///
    /// # Errors
    ///
    /// Propagates writer errors.
    pub fn dump_list(&mut self, out: &mut dyn Write) -> Result<()> {
        self.store.dump_list(out)
    }

    /// Raw hex data of every checkpoint.
    ///
    /// # Errors
    ///
    /// Propagates writer errors.
    pub fn dump_data(&mut self, out: &mut dyn Write) -> Result<()> {
        self.store.dump_data(out)
    }

    /// Description plus hex data for every checkpoint.
    ///
    /// # Errors
    ///
    /// Propagates writer errors.
    pub fn dump_annotated_data(&mut self, out: &mut dyn Write) -> Result<()> {
        self.store.dump_annotated_data(out)
    }

    /// Writes the restore chain of `id`, oldest first: snapshot ids in
    /// parentheses, flagged ids as `*<id>`, nodes separated by ` --> `.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] for an unknown id.
    pub fn dump_restore_chain(&mut self, out: &mut dyn Write, id: ChkptId) -> Result<()> {
        let mut chain = Vec::new();
        let mut cur = id;
        loop {
            let meta = self
                .store
                .node_meta(cur)?
                .ok_or(CheckpointError::NotFound(id))?;
            chain.push(meta);
            if meta.is_snapshot {
                break;
            }
            cur = meta.prev.ok_or_else(|| {
                CheckpointError::invariant(format!(
                    "restore chain of {id} did not terminate at a snapshot"
                ))
            })?;
        }
        chain.reverse();

        let mut first = true;
        for meta in chain {
            if !first {
                write!(out, " --> ")?;
            }
            first = false;
            let repr = meta_repr(&meta);
            if meta.is_snapshot {
                write!(out, "({repr})")?;
            } else {
                write!(out, "{repr}")?;
            }
        }
        Ok(())
    }

    /// Traces the value at `[offset, offset + size)` of the container at
    /// `container_index` through the history chain of `id`.
    ///
    /// # Errors
    ///
    /// See [`crate::trace::trace_value`].
    pub fn trace_value(
        &mut self,
        out: &mut dyn Write,
        id: ChkptId,
        container_index: usize,
        offset: u64,
        size: u32,
    ) -> Result<()> {
        self.store.trace_value(out, id, container_index, offset, size)
    }

    /// Synchronous teardown: stop intake, drain any pipeline, flag every
    /// remaining checkpoint deleted, destroy them in reverse id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline cannot be drained.
    pub fn teardown(&mut self) -> Result<()> {
        self.store.teardown()?;
        self.head = UNIDENTIFIED_CHECKPOINT;
        self.current = UNIDENTIFIED_CHECKPOINT;
        Ok(())
    }
}

fn meta_repr(meta: &NodeMeta) -> String {
    if meta.is_flagged_deleted() {
        format!("*{}", meta.arena_key)
    } else {
        meta.id.to_string()
    }
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("head", &self.head)
            .field("current", &self.current)
            .field("next_id", &self.next_id)
            .field("snapshot_threshold", &self.config.snapshot_threshold)
            .finish_non_exhaustive()
    }
}
