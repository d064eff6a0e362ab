//! End-to-end tests for the windowed store behind a checkpointer.

use std::sync::Arc;

use parking_lot::Mutex;
use simvault_core::{
    Checkpointer, CheckpointerConfig, DetachedCheckpoint, RamContainer, SharedContainer,
};
use simvault_storage::{
    FileWindowDatabase, MemoryWindowDatabase, PipelineHandle, WindowDatabase, WindowedStore,
    WindowedStoreConfig,
};

fn region(line_size: u32, line_count: u64) -> (Arc<Mutex<RamContainer>>, Vec<SharedContainer>) {
    let ram = Arc::new(Mutex::new(
        RamContainer::new("top.core0.regs", line_size, line_count).unwrap(),
    ));
    let shared: SharedContainer = ram.clone();
    (ram, vec![shared])
}

fn windowed_checkpointer(
    db: Arc<dyn WindowDatabase>,
    threshold: u32,
    max_cached_windows: usize,
    containers: Vec<SharedContainer>,
) -> (Checkpointer, PipelineHandle) {
    let store = WindowedStore::new(
        db,
        WindowedStoreConfig::new()
            .with_window_len(threshold)
            .with_max_cached_windows(max_cached_windows),
    )
    .unwrap();
    let handle = store.handle();
    let cp = Checkpointer::new(
        Box::new(store),
        containers,
        CheckpointerConfig::new().with_snapshot_threshold(threshold),
    )
    .unwrap();
    (cp, handle)
}

/// With a window length of 2 and six checkpoints, the drained pipeline has
/// written three window rows and six id rows, and every id resolves to a
/// checkpoint whose storage is byte-identical to the original.
#[test]
fn windowed_pipeline_persists_all_checkpoints() {
    let (ram, containers) = region(8, 4);
    let db = Arc::new(MemoryWindowDatabase::new());
    let (mut cp, handle) = windowed_checkpointer(db.clone(), 2, 8, containers);

    cp.create_head(0).unwrap();
    for tick in 1..=5u64 {
        ram.lock().write((tick % 4) * 8, &[tick as u8]);
        cp.create_checkpoint(tick).unwrap();
    }

    // Originals captured while everything is still cached.
    let originals: Vec<DetachedCheckpoint> = (1..=6)
        .map(|id| cp.find_checkpoint(id).unwrap().unwrap())
        .collect();

    handle.flush().unwrap();
    assert_eq!(db.window_count().unwrap(), 3);
    assert_eq!(db.id_count().unwrap(), 6);
    assert_eq!(db.ids().unwrap(), vec![1, 2, 3, 4, 5, 6]);

    for original in &originals {
        let found = cp.find_checkpoint(original.id).unwrap().unwrap();
        assert_eq!(found.storage, original.storage, "id {}", original.id);
        assert_eq!(found.tick, original.tick);
        assert_eq!(found.is_snapshot, original.is_snapshot);
    }
}

/// Loading a checkpoint whose window was evicted hydrates it back from the
/// database and restores the exact bytes.
#[test]
fn load_after_eviction_hydrates() {
    let (ram, containers) = region(8, 4);
    let db = Arc::new(MemoryWindowDatabase::new());
    let (mut cp, handle) = windowed_checkpointer(db, 2, 1, containers);

    cp.create_head(0).unwrap();
    for tick in 1..=7u64 {
        ram.lock().write(0, &[tick as u8]);
        cp.create_checkpoint(tick).unwrap();
    }
    handle.flush().unwrap();

    // Checkpoint 2's window is long evicted under a one-window budget.
    cp.load_checkpoint(2).unwrap();
    assert_eq!(ram.lock().read(0, 1), &[1]);

    cp.load_checkpoint(7).unwrap();
    assert_eq!(ram.lock().read(0, 1), &[6]);
}

/// Snapshot promotion runs on the same streak rule in windowed mode.
#[test]
fn windowed_snapshot_promotion() {
    let (_ram, containers) = region(8, 2);
    let db = Arc::new(MemoryWindowDatabase::new());
    let (mut cp, handle) = windowed_checkpointer(db, 3, 8, containers);

    cp.create_head(0).unwrap();
    for tick in 1..=8u64 {
        cp.create_checkpoint(tick).unwrap();
    }
    handle.flush().unwrap();

    for id in 1..=9u64 {
        let expect = id == 1 || id == 5 || id == 9;
        assert_eq!(cp.is_snapshot(id).unwrap(), expect, "id {id}");
    }
}

/// Listings and tick lookups union the cache with the database.
#[test]
fn listings_union_cache_and_database() {
    let (_ram, containers) = region(8, 2);
    let db = Arc::new(MemoryWindowDatabase::new());
    let (mut cp, handle) = windowed_checkpointer(db, 2, 1, containers);

    cp.create_head(7).unwrap();
    for _ in 0..4 {
        cp.create_checkpoint(7).unwrap();
    }
    handle.flush().unwrap();

    assert_eq!(cp.list().unwrap(), vec![1, 2, 3, 4, 5]);
    assert_eq!(cp.list_at(7).unwrap(), vec![1, 2, 3, 4, 5]);
    assert!(cp.list_at(99).unwrap().is_empty());

    let mut out = Vec::new();
    cp.dump_list(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.lines().count(), 5);
    assert!(text.contains("<DeltaCheckpoint id=1 at t=7(snapshot)"));
}

/// Deletion is not supported by the windowed store; the graph is unchanged
/// after the failed attempt.
#[test]
fn windowed_deletion_unsupported() {
    let (_ram, containers) = region(8, 2);
    let db = Arc::new(MemoryWindowDatabase::new());
    let (mut cp, _handle) = windowed_checkpointer(db, 2, 8, containers);

    cp.create_head(0).unwrap();
    cp.create_checkpoint(1).unwrap();

    assert!(cp.delete_checkpoint(2).is_err());
    assert_eq!(cp.list().unwrap(), vec![1, 2]);
    cp.load_checkpoint(2).unwrap();
}

/// Teardown drains every window, including a partial one, before stopping.
#[test]
fn teardown_flushes_partial_window() {
    let (_ram, containers) = region(8, 2);
    let db = Arc::new(MemoryWindowDatabase::new());
    let (mut cp, _handle) = windowed_checkpointer(db.clone(), 4, 8, containers);

    cp.create_head(0).unwrap();
    for tick in 1..=5u64 {
        cp.create_checkpoint(tick).unwrap();
    }

    cp.teardown().unwrap();
    // Six checkpoints over window length 4: one full window, one partial.
    assert_eq!(db.window_count().unwrap(), 2);
    assert_eq!(db.id_count().unwrap(), 6);
}

/// The file-backed database round-trips windows across a reopen.
#[test]
fn file_database_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (ram, containers) = region(8, 4);

    {
        let db = Arc::new(FileWindowDatabase::open(dir.path()).unwrap());
        let (mut cp, handle) = windowed_checkpointer(db, 2, 8, containers.clone());
        cp.create_head(0).unwrap();
        for tick in 1..=3u64 {
            ram.lock().write(8, &[0x10 + tick as u8]);
            cp.create_checkpoint(tick).unwrap();
        }
        handle.flush().unwrap();
        cp.teardown().unwrap();
    }

    let db = Arc::new(FileWindowDatabase::open(dir.path()).unwrap());
    assert_eq!(db.window_count().unwrap(), 2);
    assert_eq!(db.ids().unwrap(), vec![1, 2, 3, 4]);
    let blob = db.window_for(2).unwrap().unwrap();
    assert!(!blob.is_empty());
}

/// A database that refuses every write, for failure-path coverage.
struct BrokenDatabase;

impl WindowDatabase for BrokenDatabase {
    fn insert_window(&self, _bytes: &[u8], _ids: &[u64]) -> simvault_core::Result<u64> {
        Err(simvault_core::CheckpointError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk gone",
        )))
    }

    fn window_for(&self, _id: u64) -> simvault_core::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn all_windows(&self) -> simvault_core::Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    fn ids(&self) -> simvault_core::Result<Vec<u64>> {
        Ok(Vec::new())
    }

    fn window_count(&self) -> simvault_core::Result<u64> {
        Ok(0)
    }

    fn id_count(&self) -> simvault_core::Result<u64> {
        Ok(0)
    }
}

/// A write-stage failure is fatal to persistence but leaves the cached
/// graph intact and usable.
#[test]
fn pipeline_failure_keeps_memory_state() {
    let (ram, containers) = region(8, 2);
    let (mut cp, handle) = windowed_checkpointer(Arc::new(BrokenDatabase), 2, 8, containers);

    cp.create_head(0).unwrap();
    for tick in 1..=4u64 {
        ram.lock().write(0, &[tick as u8]);
        cp.create_checkpoint(tick).unwrap();
    }
    handle.flush().unwrap();
    assert!(handle.is_failed());

    // Everything is still cached (nothing was ever reported durable), so
    // reads and loads keep working.
    assert_eq!(cp.list().unwrap(), vec![1, 2, 3, 4, 5]);
    cp.load_checkpoint(3).unwrap();
    assert_eq!(ram.lock().read(0, 1), &[2]);
}

/// Value tracing works across hydrated windows.
#[test]
fn windowed_trace_value() {
    let (ram, containers) = region(8, 4);
    let db = Arc::new(MemoryWindowDatabase::new());
    let (mut cp, handle) = windowed_checkpointer(db, 2, 1, containers);

    cp.create_head(0).unwrap();
    ram.lock().write(8, &[1, 2, 3, 4, 5, 6, 7, 8]);
    for tick in 1..=4u64 {
        cp.create_checkpoint(tick).unwrap();
    }
    handle.flush().unwrap();

    let mut out = Vec::new();
    cp.trace_value(&mut out, 2, 0, 12, 4).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("trace: Checkpoint 2\ntrace: Value changed (line 1)"));
    assert!(text.contains("trace: Value: 05 06 07 08"));
}
