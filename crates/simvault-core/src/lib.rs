//! # simvault-core
//!
//! Incremental state checkpointing for a discrete-event simulator: delta
//! and snapshot checkpoints over fixed-layout state containers, a branching
//! checkpoint graph with deferred deletion, and a pluggable backing-store
//! contract.
//!
//! ## Architecture
//!
//! ```text
//! simulator thread:
//!   Checkpointer ──▶ StateContainer.save()/save_all() ──▶ LineStorage
//!        │                                                    │
//!        ▼                                                    ▼
//!   CheckpointAccessor (MemoryStore | windowed store) ──▶ CheckpointGraph
//! ```
//!
//! On create, every container dumps its changed (or all) lines into the new
//! checkpoint's line storage and the node is linked after the current one.
//! On load, the restore chain back to the nearest snapshot is replayed
//! oldest-first into the containers.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Restore-chain and history-chain walking over a checkpoint arena.
pub mod chain;

/// A single checkpoint node and its detached pipeline clone.
pub mod checkpoint;

/// The checkpointer core: create/delete/load/list operations.
pub mod checkpointer;

/// State-container boundary contract and the reference RAM region.
pub mod container;

/// Error types for checkpoint operations.
pub mod error;

/// Id- and tick-indexed arena of checkpoint nodes.
pub mod graph;

/// Backing-store contract and the all-in-memory store.
pub mod store;

/// Line-segment storage for checkpoint data.
pub mod storage;

/// Value tracing across a checkpoint history chain.
pub mod trace;

pub use checkpoint::{Checkpoint, ChkptId, DetachedCheckpoint, UNIDENTIFIED_CHECKPOINT};
pub use checkpointer::{Checkpointer, CheckpointerConfig};
pub use container::{
    layouts, ContainerLayout, RamContainer, SharedContainer, StateContainer, Tick,
};
pub use error::{CheckpointError, Result};
pub use graph::CheckpointGraph;
pub use storage::{LineIdx, LineStorage, INVALID_LINE, MAX_LINE_SIZE};
pub use store::{CheckpointAccessor, MemoryStore, NodeMeta};
