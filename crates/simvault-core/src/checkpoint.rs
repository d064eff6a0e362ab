//! A single checkpoint node: one delta or snapshot in the checkpoint graph.
//!
//! Nodes reference their parent and children by id, never by pointer; the
//! backing store owns the nodes in an arena keyed by the id each node was
//! created with. That key stays stable even after a node is flagged deleted
//! and its public id becomes [`UNIDENTIFIED_CHECKPOINT`].

use std::fmt;

use smallvec::SmallVec;

pub use crate::container::Tick;
use crate::container::SharedContainer;
use crate::error::{CheckpointError, Result};
use crate::storage::LineStorage;

/// Checkpoint identifier. Allocated monotonically starting at 1.
pub type ChkptId = u64;

/// Reserved id meaning "no checkpoint" or "flagged deleted".
pub const UNIDENTIFIED_CHECKPOINT: ChkptId = 0;

/// One node in the checkpoint graph, owning its line storage.
#[derive(Debug)]
pub struct Checkpoint {
    /// Public id; [`UNIDENTIFIED_CHECKPOINT`] once flagged deleted.
    id: ChkptId,
    /// Simulation tick at which the state was captured.
    tick: Tick,
    /// Arena key of the parent; `None` only for the head.
    prev: Option<ChkptId>,
    /// Arena keys of the children.
    nexts: SmallVec<[ChkptId; 2]>,
    /// Whether this node holds complete state for every container.
    is_snapshot: bool,
    /// Original id, preserved when the node is flagged deleted.
    deleted_id: ChkptId,
    /// Captured line segments.
    storage: LineStorage,
}

impl Checkpoint {
    /// Captures a new checkpoint from the ordered container list.
    ///
    /// A snapshot stores every line of every container (`save_all`); a delta
    /// stores only lines dirtied since the previous save (`save`). A node
    /// without a parent must be a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvariantViolation`] if `prev` is `None`
    /// and `is_snapshot` is false, or any error from the containers.
    pub fn capture(
        id: ChkptId,
        tick: Tick,
        prev: Option<ChkptId>,
        is_snapshot: bool,
        containers: &[SharedContainer],
    ) -> Result<Self> {
        if id == UNIDENTIFIED_CHECKPOINT {
            return Err(CheckpointError::invariant(
                "cannot create a checkpoint with the reserved unidentified id",
            ));
        }
        if prev.is_none() && !is_snapshot {
            return Err(CheckpointError::invariant(format!(
                "checkpoint {id} at tick {tick} has no previous checkpoint and so must be a snapshot"
            )));
        }

        let mut storage = LineStorage::new();
        for container in containers {
            let mut container = container.lock();
            if is_snapshot {
                container.save_all(&mut storage)?;
            } else {
                container.save(&mut storage)?;
            }
        }

        Ok(Self {
            id,
            tick,
            prev,
            nexts: SmallVec::new(),
            is_snapshot,
            deleted_id: UNIDENTIFIED_CHECKPOINT,
            storage,
        })
    }

    /// Public id, or [`UNIDENTIFIED_CHECKPOINT`] once flagged deleted.
    #[must_use]
    pub fn id(&self) -> ChkptId {
        self.id
    }

    /// Stable arena key: the id this node was created with.
    #[must_use]
    pub fn arena_key(&self) -> ChkptId {
        if self.is_flagged_deleted() {
            self.deleted_id
        } else {
            self.id
        }
    }

    /// Tick at which this checkpoint was taken.
    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Arena key of the parent, `None` for the head.
    #[must_use]
    pub fn prev(&self) -> Option<ChkptId> {
        self.prev
    }

    /// Arena keys of the children.
    #[must_use]
    pub fn nexts(&self) -> &[ChkptId] {
        &self.nexts
    }

    /// Whether this node holds complete state.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }

    /// Whether this node has been flagged deleted.
    #[must_use]
    pub fn is_flagged_deleted(&self) -> bool {
        self.id == UNIDENTIFIED_CHECKPOINT
    }

    /// Original id of a flagged-deleted node; [`UNIDENTIFIED_CHECKPOINT`]
    /// while the node is live.
    #[must_use]
    pub fn deleted_id(&self) -> ChkptId {
        self.deleted_id
    }

    /// Id representation for chain dumps: the id, or `*<old id>` once
    /// flagged deleted.
    #[must_use]
    pub fn deleted_repr(&self) -> String {
        if self.is_flagged_deleted() {
            format!("*{}", self.deleted_id)
        } else {
            self.id.to_string()
        }
    }

    /// Flags this node deleted, retiring its public id into `deleted_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::DoubleDelete`] if already flagged.
    pub fn flag_deleted(&mut self) -> Result<()> {
        if self.is_flagged_deleted() {
            return Err(CheckpointError::DoubleDelete(self.deleted_id));
        }
        self.deleted_id = self.id;
        self.id = UNIDENTIFIED_CHECKPOINT;
        Ok(())
    }

    pub(crate) fn set_prev(&mut self, prev: Option<ChkptId>) {
        self.prev = prev;
    }

    /// Records `next` as a child of this node.
    pub fn add_next(&mut self, next: ChkptId) {
        self.nexts.push(next);
    }

    pub(crate) fn remove_next(&mut self, next: ChkptId) {
        self.nexts.retain(|n| *n != next);
    }

    /// The captured line segments.
    #[must_use]
    pub fn storage(&self) -> &LineStorage {
        &self.storage
    }

    /// Mutable access for restore-cursor movement during replay.
    pub(crate) fn storage_mut(&mut self) -> &mut LineStorage {
        &mut self.storage
    }

    /// Memory held by this node including graph bookkeeping.
    #[must_use]
    pub fn total_memory(&self) -> u64 {
        self.content_memory()
            + std::mem::size_of::<Self>() as u64
            + (self.nexts.len() * std::mem::size_of::<ChkptId>()) as u64
    }

    /// Memory held by the checkpointed content alone.
    #[must_use]
    pub fn content_memory(&self) -> u64 {
        self.storage.size_in_bytes()
    }

    /// Produces the detached clone handed to the async pipeline: same ids,
    /// ticks, and flags, with storage bytes owned independently.
    #[must_use]
    pub fn detach(&self) -> DetachedCheckpoint {
        DetachedCheckpoint {
            id: self.id,
            prev: self.prev,
            nexts: self.nexts.to_vec(),
            tick: self.tick,
            deleted_id: self.deleted_id,
            is_snapshot: self.is_snapshot,
            storage: self.storage.detach(),
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<DeltaCheckpoint id=")?;
        if self.is_flagged_deleted() {
            write!(f, "DELETED")?;
        } else {
            write!(f, "{}", self.id)?;
        }
        write!(f, " at t={}", self.tick)?;
        if self.is_snapshot {
            write!(f, "(snapshot)")?;
        }
        write!(
            f,
            " {}kB ({}kB Data)>",
            self.total_memory() as f32 / 1000.0,
            self.content_memory() as f32 / 1000.0
        )
    }
}

/// Standalone checkpoint clone used by the persistence pipeline.
///
/// Carries ids (not references) for its parent and children and owns an
/// independent copy of the line bytes, so it can cross threads and be
/// serialized without touching the live graph.
#[derive(Debug, PartialEq)]
pub struct DetachedCheckpoint {
    /// Public id at detach time.
    pub id: ChkptId,
    /// Arena key of the parent, `None` for the head.
    pub prev: Option<ChkptId>,
    /// Arena keys of the children at detach time.
    pub nexts: Vec<ChkptId>,
    /// Simulation tick of the capture.
    pub tick: Tick,
    /// Original id if the node was flagged deleted.
    pub deleted_id: ChkptId,
    /// Whether the clone holds complete state.
    pub is_snapshot: bool,
    /// Independent copy of the captured segments.
    pub storage: LineStorage,
}

impl DetachedCheckpoint {
    /// Rebuilds a live graph node from this clone, used when a persisted
    /// window is hydrated back into the cache.
    #[must_use]
    pub fn into_node(self) -> Checkpoint {
        Checkpoint {
            id: self.id,
            tick: self.tick,
            prev: self.prev,
            nexts: SmallVec::from_vec(self.nexts),
            is_snapshot: self.is_snapshot,
            deleted_id: self.deleted_id,
            storage: self.storage,
        }
    }
}
