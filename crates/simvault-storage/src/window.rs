//! Serialized checkpoint-window byte layout.
//!
//! Little-endian, unframed; the database blob is the frame. Layout:
//!
//! ```text
//! u32 count
//! count x {
//!   u64 id
//!   u64 prev_id            (0 if none)
//!   u32 next_count
//!   next_count x u64 next_id
//!   u64 tick
//!   u64 deleted_id
//!   u8  is_snapshot
//!   u32 container_count
//!   container_count x { (u64 line_index, line_size bytes)* u64 INVALID_LINE }
//! }
//! ```
//!
//! Line bytes carry no length prefix; the decoder takes the ordered
//! container layouts to know each container's line size.

use simvault_core::{
    CheckpointError, ContainerLayout, DetachedCheckpoint, LineStorage, Result, INVALID_LINE,
    UNIDENTIFIED_CHECKPOINT,
};

/// Encodes a window of detached checkpoints.
///
/// # Errors
///
/// Returns [`CheckpointError::InvariantViolation`] if a clone's storage is
/// not terminated per container.
pub fn encode_window(chkpts: &[DetachedCheckpoint]) -> Result<Vec<u8>> {
    let count = u32::try_from(chkpts.len()).map_err(|_| {
        CheckpointError::InvariantViolation("window holds more than u32::MAX checkpoints".to_string())
    })?;

    let mut out = Vec::new();
    out.extend_from_slice(&count.to_le_bytes());

    for chkpt in chkpts {
        out.extend_from_slice(&chkpt.id.to_le_bytes());
        out.extend_from_slice(
            &chkpt
                .prev
                .unwrap_or(UNIDENTIFIED_CHECKPOINT)
                .to_le_bytes(),
        );
        let next_count = u32::try_from(chkpt.nexts.len()).map_err(|_| {
            CheckpointError::InvariantViolation("checkpoint has more than u32::MAX children".to_string())
        })?;
        out.extend_from_slice(&next_count.to_le_bytes());
        for next in &chkpt.nexts {
            out.extend_from_slice(&next.to_le_bytes());
        }
        out.extend_from_slice(&chkpt.tick.to_le_bytes());
        out.extend_from_slice(&chkpt.deleted_id.to_le_bytes());
        out.push(u8::from(chkpt.is_snapshot));

        let container_count = chkpt
            .storage
            .segments()
            .filter(|(idx, _)| *idx == INVALID_LINE)
            .count();
        let container_count = u32::try_from(container_count).map_err(|_| {
            CheckpointError::InvariantViolation("checkpoint spans more than u32::MAX containers".to_string())
        })?;
        out.extend_from_slice(&container_count.to_le_bytes());

        for (idx, data) in chkpt.storage.segments() {
            out.extend_from_slice(&idx.to_le_bytes());
            if idx != INVALID_LINE {
                out.extend_from_slice(data);
            }
        }
    }
    Ok(out)
}

/// Cursor over a serialized window.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.bytes.len());
        let Some(end) = end else {
            return Err(CheckpointError::StorageCorruption(format!(
                "window blob truncated: wanted {n} bytes at offset {}, blob is {} bytes",
                self.pos,
                self.bytes.len()
            )));
        };
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Decodes a serialized window using the ordered container layouts the
/// writer saw.
///
/// # Errors
///
/// Returns [`CheckpointError::StorageCorruption`] on truncation, an invalid
/// flag byte, or a container count that does not match `layouts`.
pub fn decode_window(
    bytes: &[u8],
    layouts: &[ContainerLayout],
) -> Result<Vec<DetachedCheckpoint>> {
    let mut r = Reader { bytes, pos: 0 };
    let count = r.u32()?;

    let mut chkpts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = r.u64()?;
        let prev = match r.u64()? {
            UNIDENTIFIED_CHECKPOINT => None,
            p => Some(p),
        };
        let next_count = r.u32()?;
        let mut nexts = Vec::with_capacity(next_count as usize);
        for _ in 0..next_count {
            nexts.push(r.u64()?);
        }
        let tick = r.u64()?;
        let deleted_id = r.u64()?;
        let is_snapshot = match r.u8()? {
            0 => false,
            1 => true,
            b => {
                return Err(CheckpointError::StorageCorruption(format!(
                    "invalid snapshot flag byte {b:#04x} for checkpoint {id}"
                )))
            }
        };

        let container_count = r.u32()? as usize;
        if container_count != layouts.len() {
            return Err(CheckpointError::StorageCorruption(format!(
                "window stores {container_count} containers for checkpoint {id} but the \
                 simulator has {}",
                layouts.len()
            )));
        }

        let mut storage = LineStorage::new();
        for layout in layouts {
            loop {
                let idx = r.u64()?;
                if idx == INVALID_LINE {
                    storage.end_container();
                    break;
                }
                let data = r.take(layout.line_size as usize)?;
                storage.begin_line(idx)?;
                storage.write_line_bytes(data)?;
            }
        }

        chkpts.push(DetachedCheckpoint {
            id,
            prev,
            nexts,
            tick,
            deleted_id,
            is_snapshot,
            storage,
        });
    }

    if r.pos != bytes.len() {
        return Err(CheckpointError::StorageCorruption(format!(
            "window blob has {} trailing bytes after {count} checkpoints",
            bytes.len() - r.pos
        )));
    }
    Ok(chkpts)
}
