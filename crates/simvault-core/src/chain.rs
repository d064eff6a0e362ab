//! Restore-chain and history-chain walking over a checkpoint arena.
//!
//! The algorithms here are shared by every backing store. Lookups go
//! through [`CheckpointArena`] so a windowed store can hydrate missing
//! nodes from its database on the way.

use crate::checkpoint::{Checkpoint, ChkptId};
use crate::container::SharedContainer;
use crate::error::{CheckpointError, Result};

/// Arena-keyed node lookup.
///
/// Lookups take `&mut self` because a windowed store may need to hydrate a
/// persisted window into its cache to answer. `Ok(None)` means the key is
/// unknown to the store entirely.
pub trait CheckpointArena {
    /// Looks up a node by arena key.
    ///
    /// # Errors
    ///
    /// Returns an error if hydration from the backing database fails.
    fn node(&mut self, key: ChkptId) -> Result<Option<&Checkpoint>>;

    /// Looks up a node by arena key for mutation (restore-cursor movement).
    ///
    /// # Errors
    ///
    /// Returns an error if hydration from the backing database fails.
    fn node_mut(&mut self, key: ChkptId) -> Result<Option<&mut Checkpoint>>;
}

fn missing(key: ChkptId) -> CheckpointError {
    CheckpointError::invariant(format!(
        "checkpoint chain references node {key} which is not present in the store"
    ))
}

/// Collects the chain that must be replayed to restore `key`: the nearest
/// ancestor snapshot (inclusive) through `key`, ordered oldest-first.
///
/// # Errors
///
/// Returns [`CheckpointError::InvariantViolation`] if the chain walks off
/// the head without encountering a snapshot, or if a referenced node is
/// missing.
pub fn restore_chain(arena: &mut dyn CheckpointArena, key: ChkptId) -> Result<Vec<ChkptId>> {
    let mut chain = Vec::new();
    let mut cur = key;
    loop {
        let node = arena.node(cur)?.ok_or_else(|| missing(cur))?;
        chain.push(cur);
        if node.is_snapshot() {
            break;
        }
        cur = node.prev().ok_or_else(|| {
            CheckpointError::invariant(format!(
                "restore chain of checkpoint {key} did not terminate at a snapshot"
            ))
        })?;
    }
    chain.reverse();
    Ok(chain)
}

/// Collects the full path from the head through `key`, ordered oldest-first.
/// A superset of the restore chain, used for value tracing.
///
/// # Errors
///
/// Returns an error if a referenced node is missing.
pub fn history_chain(arena: &mut dyn CheckpointArena, key: ChkptId) -> Result<Vec<ChkptId>> {
    let mut chain = Vec::new();
    let mut cur = Some(key);
    while let Some(k) = cur {
        let node = arena.node(k)?.ok_or_else(|| missing(k))?;
        chain.push(k);
        cur = node.prev();
    }
    chain.reverse();
    Ok(chain)
}

/// Number of parent edges between `key` and its nearest ancestor snapshot.
/// Zero if the node itself is a snapshot.
///
/// # Errors
///
/// The absence of any snapshot in the chain is a fatal
/// [`CheckpointError::InvariantViolation`].
pub fn distance_to_prev_snapshot(arena: &mut dyn CheckpointArena, key: ChkptId) -> Result<u32> {
    let mut cur = Some(key);
    let mut dist = 0u32;
    while let Some(k) = cur {
        let node = arena.node(k)?.ok_or_else(|| missing(k))?;
        if node.is_snapshot() {
            return Ok(dist);
        }
        cur = node.prev();
        dist += 1;
    }
    Err(CheckpointError::invariant(format!(
        "reached a checkpoint without a previous link while measuring the distance \
         from {key} to a snapshot; every chain must be rooted in a snapshot"
    )))
}

/// Replays `chain` oldest-first into the ordered container list: snapshots
/// through `restore_all`, deltas through `restore`.
///
/// On failure the simulator state is undefined; there is no partial
/// recovery.
///
/// # Errors
///
/// Returns an error if a node is missing, a storage cursor is not in a good
/// state, or a container rejects its segment stream.
pub fn replay(
    arena: &mut dyn CheckpointArena,
    chain: &[ChkptId],
    containers: &[SharedContainer],
) -> Result<()> {
    for &key in chain {
        let node = arena.node_mut(key)?.ok_or_else(|| missing(key))?;
        let is_snapshot = node.is_snapshot();
        let storage = node.storage_mut();
        storage.prepare_for_load();
        if !storage.good() {
            return Err(CheckpointError::invariant(format!(
                "checkpoint {key} has a bad data buffer and cannot be replayed"
            )));
        }
        for container in containers {
            let mut container = container.lock();
            if is_snapshot {
                container.restore_all(storage)?;
            } else {
                container.restore(storage)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::container::RamContainer;
    use std::collections::BTreeMap;

    /// Minimal arena over a plain map, enough to drive the chain walkers.
    struct MapArena(BTreeMap<ChkptId, Checkpoint>);

    impl CheckpointArena for MapArena {
        fn node(&mut self, key: ChkptId) -> Result<Option<&Checkpoint>> {
            Ok(self.0.get(&key))
        }

        fn node_mut(&mut self, key: ChkptId) -> Result<Option<&mut Checkpoint>> {
            Ok(self.0.get_mut(&key))
        }
    }

    fn build_chain() -> (MapArena, Vec<SharedContainer>) {
        let containers = vec![RamContainer::new("regs", 8, 4).unwrap().into_shared()];
        let mut arena = BTreeMap::new();

        let head = Checkpoint::capture(1, 0, None, true, &containers).unwrap();
        arena.insert(1, head);
        for id in 2..=4u64 {
            let cp = Checkpoint::capture(id, id, Some(id - 1), false, &containers).unwrap();
            arena.insert(id, cp);
        }
        // A later snapshot closes the first delta run.
        let snap = Checkpoint::capture(5, 5, Some(4), true, &containers).unwrap();
        arena.insert(5, snap);
        (MapArena(arena), containers)
    }

    #[test]
    fn test_restore_chain_stops_at_snapshot() {
        let (mut arena, _) = build_chain();
        assert_eq!(restore_chain(&mut arena, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(restore_chain(&mut arena, 5).unwrap(), vec![5]);
        assert_eq!(restore_chain(&mut arena, 1).unwrap(), vec![1]);
    }

    #[test]
    fn test_history_chain_reaches_head() {
        let (mut arena, _) = build_chain();
        assert_eq!(history_chain(&mut arena, 5).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_distance_to_prev_snapshot() {
        let (mut arena, _) = build_chain();
        assert_eq!(distance_to_prev_snapshot(&mut arena, 1).unwrap(), 0);
        assert_eq!(distance_to_prev_snapshot(&mut arena, 4).unwrap(), 3);
        assert_eq!(distance_to_prev_snapshot(&mut arena, 5).unwrap(), 0);
    }

    #[test]
    fn test_chain_without_snapshot_is_fatal() {
        let containers = vec![RamContainer::new("regs", 8, 2).unwrap().into_shared()];
        // Hand-build a rootless delta by capturing against a parent that is
        // itself a delta with no snapshot above it.
        let head = Checkpoint::capture(1, 0, None, true, &containers).unwrap();
        let mut orphan = Checkpoint::capture(2, 1, Some(1), false, &containers).unwrap();
        orphan.set_prev(None);

        let mut arena = MapArena(BTreeMap::new());
        arena.0.insert(1, head);
        arena.0.insert(2, orphan);

        assert!(restore_chain(&mut arena, 2).is_err());
        assert!(distance_to_prev_snapshot(&mut arena, 2).is_err());
    }

    #[test]
    fn test_replay_restores_state() {
        let ram = std::sync::Arc::new(parking_lot::Mutex::new(
            RamContainer::new("regs", 8, 4).unwrap(),
        ));
        let shared: SharedContainer = ram.clone();
        let containers = vec![shared];
        let mut arena = MapArena(BTreeMap::new());

        let head = Checkpoint::capture(1, 0, None, true, &containers).unwrap();
        arena.0.insert(1, head);

        ram.lock().write(16, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let delta = Checkpoint::capture(2, 1, Some(1), false, &containers).unwrap();
        arena.0.insert(2, delta);

        // Scribble over the region, then replay up to the delta.
        ram.lock().write(16, &[0xee; 8]);
        let chain = restore_chain(&mut arena, 2).unwrap();
        replay(&mut arena, &chain, &containers).unwrap();
        assert_eq!(ram.lock().read(16, 8), &[1, 2, 3, 4, 5, 6, 7, 8]);

        // Replaying just the head returns to all zeros.
        let chain = restore_chain(&mut arena, 1).unwrap();
        replay(&mut arena, &chain, &containers).unwrap();
        assert_eq!(ram.lock().read(16, 8), &[0u8; 8]);
    }
}
