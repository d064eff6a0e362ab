//! End-to-end scenarios for the in-memory checkpointer.

use std::sync::Arc;

use parking_lot::Mutex;
use simvault_core::{
    CheckpointError, Checkpointer, CheckpointerConfig, LineStorage, RamContainer, SharedContainer,
};

fn region(line_size: u32, line_count: u64) -> (Arc<Mutex<RamContainer>>, Vec<SharedContainer>) {
    let ram = Arc::new(Mutex::new(
        RamContainer::new("top.core0.regs", line_size, line_count).unwrap(),
    ));
    let shared: SharedContainer = ram.clone();
    (ram, vec![shared])
}

fn checkpointer(threshold: u32, containers: Vec<SharedContainer>) -> Checkpointer {
    Checkpointer::in_memory(
        containers,
        CheckpointerConfig::new().with_snapshot_threshold(threshold),
    )
    .unwrap()
}

/// Single container, 4 lines x 8 bytes, one dirty line between two
/// checkpoints: loading either checkpoint reproduces its exact bytes.
#[test]
fn delta_checkpoint_round_trip() {
    let (ram, containers) = region(8, 4);
    let mut cp = checkpointer(20, containers);

    assert_eq!(cp.create_head(0).unwrap(), 1);

    ram.lock().write(8, &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(cp.create_checkpoint(1).unwrap(), 2);
    assert!(!cp.is_snapshot(2).unwrap());

    cp.load_checkpoint(1).unwrap();
    assert_eq!(ram.lock().read(8, 8), &[0u8; 8]);

    cp.load_checkpoint(2).unwrap();
    assert_eq!(ram.lock().read(8, 8), &[1, 2, 3, 4, 5, 6, 7, 8]);
}

/// With snapshot_threshold = 3, snapshots recur at ids 1 and 5.
#[test]
fn snapshot_promotion_at_threshold() {
    let (_ram, containers) = region(8, 4);
    let mut cp = checkpointer(3, containers);

    cp.create_head(0).unwrap();
    for tick in 1..=4 {
        cp.create_checkpoint(tick).unwrap();
    }

    for id in 1..=5u64 {
        let expect = id == 1 || id == 5;
        assert_eq!(cp.is_snapshot(id).unwrap(), expect, "id {id}");
    }
}

/// Branching plus deferred deletion: a flagged delta is retained while a
/// live descendant depends on its bytes, and swept once the descendant
/// goes away.
#[test]
fn branch_deletion_is_deferred() {
    let (ram, containers) = region(8, 4);
    let mut cp = checkpointer(20, containers);

    cp.create_head(0).unwrap();
    for tick in 1..=4 {
        ram.lock().write(0, &[tick as u8]);
        cp.create_checkpoint(tick).unwrap();
    }
    assert_eq!(cp.list().unwrap(), vec![1, 2, 3, 4, 5]);

    // Branch off id 3.
    cp.load_checkpoint(3).unwrap();
    ram.lock().write(8, &[0x66]);
    let id6 = cp.create_checkpoint(10).unwrap();
    ram.lock().write(8, &[0x77]);
    let id7 = cp.create_checkpoint(11).unwrap();
    assert_eq!((id6, id7), (6, 7));

    // Deleting 6 while 7 is live only flags it: 7 still loads, which
    // requires 6's bytes to survive.
    cp.delete_checkpoint(6).unwrap();
    assert!(matches!(
        cp.load_checkpoint(6),
        Err(CheckpointError::NotFound(6))
    ));
    cp.load_checkpoint(7).unwrap();
    assert_eq!(ram.lock().read(8, 1), &[0x77]);

    // Deleting 7 sweeps both nodes; the branch point survives.
    cp.delete_checkpoint(7).unwrap();
    assert_eq!(cp.list().unwrap(), vec![1, 2, 3, 4, 5]);
    cp.load_checkpoint(3).unwrap();
    assert_eq!(ram.lock().read(0, 1), &[3]);
}

/// Value tracing across the chain reports exactly one change event, at the
/// delta that wrote the line, with the reconstructed bytes.
#[test]
fn trace_value_across_chain() {
    let (ram, containers) = region(8, 4);
    let mut cp = checkpointer(20, containers);

    cp.create_head(0).unwrap();
    ram.lock().write(8, &[1, 2, 3, 4, 5, 6, 7, 8]);
    cp.create_checkpoint(1).unwrap();

    let mut out = Vec::new();
    cp.trace_value(&mut out, 2, 0, 12, 4).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(text.matches("trace: Value changed").count(), 1);
    assert!(text.contains("trace: Checkpoint 2\ntrace: Value changed (line 1)"));
    assert!(text.contains("trace: Value: 05 06 07 08"));
}

/// Deleting the head fails while any descendant survives; once every
/// descendant is physically removed the head may go.
#[test]
fn head_deletion_requires_empty_graph() {
    let (_ram, containers) = region(8, 4);
    let mut cp = checkpointer(20, containers);

    cp.create_head(0).unwrap();
    cp.create_checkpoint(1).unwrap();
    cp.create_checkpoint(2).unwrap();

    assert!(cp.delete_checkpoint(1).is_err());

    cp.delete_checkpoint(3).unwrap();
    // 2 is still live.
    assert!(cp.delete_checkpoint(1).is_err());

    cp.delete_checkpoint(2).unwrap();
    cp.delete_checkpoint(1).unwrap();
    assert!(cp.list().unwrap().is_empty());
}

/// Restoring a checkpoint twice yields byte-identical container contents.
#[test]
fn restore_is_idempotent() {
    let (ram, containers) = region(8, 4);
    let mut cp = checkpointer(3, containers.clone());

    cp.create_head(0).unwrap();
    for tick in 1..=6 {
        ram.lock().write((tick % 4) * 8, &[tick as u8, 0xcc]);
        cp.create_checkpoint(tick).unwrap();
    }

    for id in cp.list().unwrap() {
        cp.load_checkpoint(id).unwrap();
        let mut first = LineStorage::new();
        containers[0].lock().save_all(&mut first).unwrap();

        cp.load_checkpoint(id).unwrap();
        let mut second = LineStorage::new();
        containers[0].lock().save_all(&mut second).unwrap();

        assert_eq!(first, second, "id {id}");
    }
}

/// Loading an intermediate checkpoint and then its descendant matches
/// loading the descendant directly.
#[test]
fn chain_prefix_loads_compose() {
    let (ram, containers) = region(8, 4);
    let mut cp = checkpointer(4, containers.clone());

    cp.create_head(0).unwrap();
    for tick in 1..=7 {
        ram.lock().write((tick % 4) * 8, &[0xa0 + tick as u8]);
        cp.create_checkpoint(tick).unwrap();
    }

    // Direct load of id 6.
    cp.load_checkpoint(6).unwrap();
    let mut direct = LineStorage::new();
    containers[0].lock().save_all(&mut direct).unwrap();

    // Load an ancestor on the same chain first, then id 6.
    cp.load_checkpoint(3).unwrap();
    cp.load_checkpoint(6).unwrap();
    let mut via_prefix = LineStorage::new();
    containers[0].lock().save_all(&mut via_prefix).unwrap();

    assert_eq!(direct, via_prefix);
}

/// Every live checkpoint sits within snapshot_threshold of a snapshot.
#[test]
fn snapshot_distance_is_bounded() {
    let (ram, containers) = region(8, 2);
    let threshold = 4;
    let mut cp = checkpointer(threshold, containers);

    cp.create_head(0).unwrap();
    for tick in 1..=25 {
        ram.lock().write(0, &[tick as u8]);
        cp.create_checkpoint(tick).unwrap();
    }

    for id in cp.list().unwrap() {
        assert!(cp.distance_to_prev_snapshot(id).unwrap() <= threshold);
    }
}

/// Multiple containers are visited in list order on both save and restore.
#[test]
fn multi_container_ordering() {
    let regs = Arc::new(Mutex::new(RamContainer::new("regs", 8, 2).unwrap()));
    let mem = Arc::new(Mutex::new(RamContainer::new("mem", 16, 3).unwrap()));
    let containers: Vec<SharedContainer> = vec![regs.clone(), mem.clone()];
    let mut cp = checkpointer(10, containers);

    cp.create_head(0).unwrap();
    regs.lock().write(0, &[0x11]);
    mem.lock().write(32, &[0x22]);
    cp.create_checkpoint(1).unwrap();

    regs.lock().write(0, &[0xff]);
    mem.lock().write(32, &[0xff]);

    cp.load_checkpoint(2).unwrap();
    assert_eq!(regs.lock().read(0, 1), &[0x11]);
    assert_eq!(mem.lock().read(32, 1), &[0x22]);

    cp.load_checkpoint(1).unwrap();
    assert_eq!(regs.lock().read(0, 1), &[0]);
    assert_eq!(mem.lock().read(32, 1), &[0]);
}
