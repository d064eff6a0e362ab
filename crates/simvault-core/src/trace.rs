//! Value tracing across a checkpoint history chain.
//!
//! Reconstructs how the bytes at a container offset evolved from the head
//! to a target checkpoint, by scanning every checkpoint's stored lines in
//! order. Deltas that store a line overlapping the traced range report a
//! change event; crossing a snapshot rewrites the accumulated value
//! wholesale (a snapshot stores every line).

use std::io::Write;

use crate::chain::{history_chain, CheckpointArena};
use crate::checkpoint::ChkptId;
use crate::container::ContainerLayout;
use crate::error::{CheckpointError, Result};
use crate::storage::INVALID_LINE;

/// Traces the value at `[offset, offset + size)` of the container at
/// `container_index` through the history chain of `key`, writing `trace:`
/// report lines to `out`.
///
/// # Errors
///
/// Returns [`CheckpointError::InvariantViolation`] if the traced range
/// spans two lines, if a checkpoint stores the range twice, or if the chain
/// is malformed; I/O errors from `out` are propagated.
pub fn trace_value(
    arena: &mut dyn CheckpointArena,
    out: &mut dyn Write,
    layouts: &[ContainerLayout],
    key: ChkptId,
    container_index: usize,
    offset: u64,
    size: u32,
) -> Result<()> {
    let target = layouts.get(container_index).ok_or_else(|| {
        CheckpointError::invariant(format!(
            "trace target container index {container_index} is out of range ({} containers)",
            layouts.len()
        ))
    })?;
    let line_size = u64::from(target.line_size);
    if u64::from(size) > line_size {
        return Err(CheckpointError::invariant(format!(
            "cannot trace a {size}-byte value: container {} has {line_size}-byte lines",
            target.name
        )));
    }

    // (value, known) accumulated per traced byte.
    let mut bytes: Vec<(u8, bool)> = vec![(0, false); size as usize];

    let chain = history_chain(arena, key)?;
    for k in chain {
        let node = arena.node_mut(k)?.ok_or_else(|| {
            CheckpointError::invariant(format!("history chain references missing node {k}"))
        })?;
        let repr = node.deleted_repr();
        let is_snapshot = node.is_snapshot();
        writeln!(
            out,
            "trace: Checkpoint {repr}{}",
            if is_snapshot { " (snapshot)" } else { "" }
        )?;

        let storage = node.storage_mut();
        storage.prepare_for_load();

        let mut changed = false;
        for (ci, layout) in layouts.iter().enumerate() {
            let is_target = ci == container_index;
            if is_target && is_snapshot {
                // The snapshot rewrites the whole container; whatever was
                // accumulated no longer applies.
                for b in &mut bytes {
                    b.1 = false;
                }
            }
            let mut buf = vec![0u8; layout.line_size as usize];
            loop {
                let idx = storage.next_restore_line()?;
                if idx == INVALID_LINE {
                    break;
                }
                // Every line must be read to keep the cursor in step.
                storage.copy_line_bytes(&mut buf)?;
                if !is_target {
                    continue;
                }
                let ln_off = idx * u64::from(layout.line_size);
                let ln_end = ln_off + u64::from(layout.line_size);
                if offset >= ln_off && offset < ln_end {
                    if offset + u64::from(size) > ln_end {
                        return Err(CheckpointError::invariant(format!(
                            "cannot trace a value which spans two lines of container {}",
                            layout.name
                        )));
                    }
                    if is_snapshot {
                        // Absorbed silently; the snapshot marker on the
                        // checkpoint line already says everything changed.
                        let start = (offset - ln_off) as usize;
                        for (i, b) in bytes.iter_mut().enumerate() {
                            *b = (buf[start + i], true);
                        }
                        continue;
                    }
                    if changed {
                        return Err(CheckpointError::invariant(format!(
                            "value being traced changed twice in checkpoint {repr}"
                        )));
                    }
                    changed = true;
                    writeln!(out, "trace: Value changed (line {idx})")?;
                    let start = (offset - ln_off) as usize;
                    for (i, b) in bytes.iter_mut().enumerate() {
                        *b = (buf[start + i], true);
                    }
                }
            }
        }

        write!(out, "trace: Value:")?;
        for (value, known) in &bytes {
            if *known {
                write!(out, " {value:02x}")?;
            } else {
                write!(out, " xx")?;
            }
        }
        writeln!(out)?;
    }
    writeln!(out)?;
    Ok(())
}
