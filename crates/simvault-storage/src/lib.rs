//! # simvault-storage
//!
//! Durability layer for simvault: a windowed backing store that keeps a hot
//! cache of checkpoints in memory while an asynchronous pipeline batches
//! older ones into windows, serializes, compresses, and persists them to a
//! keyed blob database.
//!
//! ## Pipeline
//!
//! ```text
//! insert ──▶ buffer ──▶ tag ──▶ serialize ──▶ compress ──▶ write ──▶ evict
//!   │          (window_len clones per window)        (zstd)    │       │
//!   └── original stays in the cache ◀── durable notifications ─┴───────┘
//! ```
//!
//! Every stage runs on its own worker thread behind a bounded queue;
//! publishers block when a queue is full. Random-access loads hydrate whole
//! windows back into the cache through a synchronous request to the write
//! worker, which is the sole owner of the database handle.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// zstd compression helpers for window blobs.
pub mod compress;

/// Keyed blob-database contract and in-memory/file implementations.
pub mod database;

/// The staged persistence pipeline.
pub mod pipeline;

/// Serialized window byte layout.
pub mod window;

/// The windowed backing store.
pub mod windowed;

pub use database::{FileWindowDatabase, MemoryWindowDatabase, WindowDatabase};
pub use pipeline::PipelineHandle;
pub use window::{decode_window, encode_window};
pub use windowed::{WindowedStore, WindowedStoreConfig};
