//! State-container boundary contract and a reference RAM region.
//!
//! A state container is a fixed-layout region of simulator state addressed
//! by line index, with per-line dirty tracking. The simulator owns the
//! containers; the checkpointer only drives the save/restore contract below.
//! [`RamContainer`] is the in-crate reference implementation, a dense byte
//! region backed by a dirty bitset.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CheckpointError, Result};
use crate::storage::{LineStorage, INVALID_LINE, MAX_LINE_SIZE};

/// Simulation tick type.
pub type Tick = u64;

/// Boundary contract every checkpointable state region implements.
///
/// `save` emits bytes only for currently-dirty lines and clears the dirty
/// set; `save_all` emits every line without clearing. `restore` and
/// `restore_all` consume matching segment streams produced by the
/// corresponding save call. Line size is fixed per run and must be
/// `1..=MAX_LINE_SIZE`.
pub trait StateContainer {
    /// Diagnostic name of the owning simulator node.
    fn name(&self) -> &str;

    /// Fixed line size in bytes.
    fn line_size(&self) -> u32;

    /// Number of lines in this container.
    fn line_count(&self) -> u64;

    /// Number of lines currently flagged dirty.
    fn dirty_line_count(&self) -> u64;

    /// Emits every dirty line into `sink` and clears the dirty set, then
    /// terminates the container's segments.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects a segment.
    fn save(&mut self, sink: &mut LineStorage) -> Result<()>;

    /// Emits every line into `sink` without touching the dirty set, then
    /// terminates the container's segments.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink rejects a segment.
    fn save_all(&mut self, sink: &mut LineStorage) -> Result<()>;

    /// Consumes one container's segment stream from `src`, applying each
    /// stored line.
    ///
    /// # Errors
    ///
    /// Returns an error on cursor misuse, line-size mismatch, or an
    /// out-of-range line index.
    fn restore(&mut self, src: &mut LineStorage) -> Result<()>;

    /// Like [`StateContainer::restore`], but requires the stream to cover
    /// every line of the container (a snapshot wrote all of them).
    ///
    /// # Errors
    ///
    /// Returns an error on cursor misuse, size mismatch, or incomplete
    /// coverage.
    fn restore_all(&mut self, src: &mut LineStorage) -> Result<()>;
}

/// Shared handle to a state container.
///
/// Containers are owned by the simulator and touched only on the simulator
/// thread; the mutex makes the handle freely storable alongside the
/// checkpointer without threading restrictions.
pub type SharedContainer = Arc<Mutex<dyn StateContainer + Send>>;

/// Copyable per-container metadata needed to decode serialized windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLayout {
    /// Diagnostic container name.
    pub name: String,
    /// Fixed line size in bytes.
    pub line_size: u32,
}

/// Captures the layout of an ordered container list.
#[must_use]
pub fn layouts(containers: &[SharedContainer]) -> Vec<ContainerLayout> {
    containers
        .iter()
        .map(|c| {
            let c = c.lock();
            ContainerLayout {
                name: c.name().to_string(),
                line_size: c.line_size(),
            }
        })
        .collect()
}

/// Dense RAM-backed state region with per-line dirty tracking.
pub struct RamContainer {
    name: String,
    line_size: u32,
    data: Vec<u8>,
    dirty: Vec<bool>,
}

impl RamContainer {
    /// Creates a zero-filled region of `line_count` lines of `line_size`
    /// bytes each.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InvalidConfig`] if `line_size` is zero or
    /// exceeds [`MAX_LINE_SIZE`], or if `line_count` is zero.
    pub fn new(name: impl Into<String>, line_size: u32, line_count: u64) -> Result<Self> {
        if line_size == 0 || line_size > MAX_LINE_SIZE {
            return Err(CheckpointError::InvalidConfig(format!(
                "container line size must be in 1..={MAX_LINE_SIZE}, got {line_size}"
            )));
        }
        if line_count == 0 {
            return Err(CheckpointError::InvalidConfig(
                "container line count must be > 0".to_string(),
            ));
        }
        let total = line_count
            .checked_mul(u64::from(line_size))
            .and_then(|t| usize::try_from(t).ok())
            .ok_or_else(|| {
                CheckpointError::InvalidConfig("container too large for this platform".to_string())
            })?;
        Ok(Self {
            name: name.into(),
            line_size,
            data: vec![0; total],
            dirty: vec![false; usize::try_from(line_count).unwrap_or(usize::MAX)],
        })
    }

    /// Wraps the container in a [`SharedContainer`] handle.
    #[must_use]
    pub fn into_shared(self) -> SharedContainer {
        Arc::new(Mutex::new(self))
    }

    /// Writes `bytes` at `offset`, flagging every touched line dirty.
    ///
    /// # Panics
    ///
    /// Panics if the write runs past the end of the region.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let start = usize::try_from(offset).expect("offset fits usize");
        let end = start + bytes.len();
        self.data[start..end].copy_from_slice(bytes);

        let first_line = offset / u64::from(self.line_size);
        let last_line = (offset + bytes.len() as u64 - 1) / u64::from(self.line_size);
        for line in first_line..=last_line {
            self.dirty[usize::try_from(line).expect("line fits usize")] = true;
        }
    }

    /// Reads `len` bytes at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the read runs past the end of the region.
    #[must_use]
    pub fn read(&self, offset: u64, len: usize) -> &[u8] {
        let start = usize::try_from(offset).expect("offset fits usize");
        &self.data[start..start + len]
    }

    fn line_range(&self, line: u64) -> std::ops::Range<usize> {
        let size = self.line_size as usize;
        let start = usize::try_from(line).expect("line fits usize") * size;
        start..start + size
    }

    fn apply_stream(&mut self, src: &mut LineStorage, require_all: bool) -> Result<()> {
        let mut seen = 0u64;
        loop {
            let idx = src.next_restore_line()?;
            if idx == INVALID_LINE {
                break;
            }
            if idx >= self.line_count() {
                return Err(CheckpointError::invariant(format!(
                    "container {} has {} lines but the checkpoint stores line {}",
                    self.name,
                    self.line_count(),
                    idx
                )));
            }
            let range = self.line_range(idx);
            // Copy through a scratch buffer so a size mismatch is reported
            // before the region is touched.
            let mut buf = vec![0u8; self.line_size as usize];
            src.copy_line_bytes(&mut buf)?;
            self.data[range].copy_from_slice(&buf);
            seen += 1;
        }
        if require_all && seen != self.line_count() {
            return Err(CheckpointError::invariant(format!(
                "snapshot restore of container {} covered {} of {} lines",
                self.name,
                seen,
                self.line_count()
            )));
        }
        Ok(())
    }
}

impl StateContainer for RamContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn line_size(&self) -> u32 {
        self.line_size
    }

    fn line_count(&self) -> u64 {
        self.dirty.len() as u64
    }

    fn dirty_line_count(&self) -> u64 {
        self.dirty.iter().filter(|d| **d).count() as u64
    }

    fn save(&mut self, sink: &mut LineStorage) -> Result<()> {
        for line in 0..self.line_count() {
            let i = usize::try_from(line).expect("line fits usize");
            if self.dirty[i] {
                sink.begin_line(line)?;
                sink.write_line_bytes(&self.data[self.line_range(line)])?;
                self.dirty[i] = false;
            }
        }
        sink.end_container();
        Ok(())
    }

    fn save_all(&mut self, sink: &mut LineStorage) -> Result<()> {
        for line in 0..self.line_count() {
            sink.begin_line(line)?;
            sink.write_line_bytes(&self.data[self.line_range(line)])?;
        }
        sink.end_container();
        Ok(())
    }

    fn restore(&mut self, src: &mut LineStorage) -> Result<()> {
        self.apply_stream(src, false)
    }

    fn restore_all(&mut self, src: &mut LineStorage) -> Result<()> {
        self.apply_stream(src, true)
    }
}

impl std::fmt::Debug for RamContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamContainer")
            .field("name", &self.name)
            .field("line_size", &self.line_size)
            .field("line_count", &self.line_count())
            .field("dirty_lines", &self.dirty_line_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_line_size() {
        assert!(RamContainer::new("r", 0, 4).is_err());
        assert!(RamContainer::new("r", MAX_LINE_SIZE + 1, 4).is_err());
        assert!(RamContainer::new("r", 0, 0).is_err());
        assert!(RamContainer::new("r", 8, 4).is_ok());
    }

    #[test]
    fn test_write_marks_dirty_lines() {
        let mut c = RamContainer::new("regs", 8, 4).unwrap();
        assert_eq!(c.dirty_line_count(), 0);

        c.write(16, &[1, 2, 3, 4]);
        assert_eq!(c.dirty_line_count(), 1);

        // Spanning write dirties both lines.
        c.write(6, &[9, 9, 9, 9]);
        assert_eq!(c.dirty_line_count(), 3);
    }

    #[test]
    fn test_save_emits_only_dirty_and_clears() {
        let mut c = RamContainer::new("regs", 8, 4).unwrap();
        c.write(16, &[1, 2, 3, 4]);

        let mut st = LineStorage::new();
        c.save(&mut st).unwrap();
        // One dirty line plus the boundary sentinel.
        assert_eq!(st.segment_count(), 2);
        assert_eq!(c.dirty_line_count(), 0);

        // A second save emits only the sentinel.
        let mut st2 = LineStorage::new();
        c.save(&mut st2).unwrap();
        assert_eq!(st2.segment_count(), 1);
    }

    #[test]
    fn test_save_all_does_not_clear_dirty() {
        let mut c = RamContainer::new("regs", 8, 4).unwrap();
        c.write(0, &[0xff]);

        let mut st = LineStorage::new();
        c.save_all(&mut st).unwrap();
        assert_eq!(st.segment_count(), 5);
        assert_eq!(c.dirty_line_count(), 1);
    }

    #[test]
    fn test_save_restore_round_trip() {
        let mut c = RamContainer::new("regs", 8, 4).unwrap();
        c.write(16, &[1, 2, 3, 4]);

        let mut st = LineStorage::new();
        c.save(&mut st).unwrap();

        // Clobber the region, then restore the delta.
        c.write(16, &[0, 0, 0, 0]);
        st.prepare_for_load();
        c.restore(&mut st).unwrap();
        assert_eq!(c.read(16, 4), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_restore_all_requires_full_coverage() {
        let mut c = RamContainer::new("regs", 8, 4).unwrap();
        c.write(0, &[1]);

        let mut delta = LineStorage::new();
        c.save(&mut delta).unwrap();
        delta.prepare_for_load();
        assert!(c.restore_all(&mut delta).is_err());

        let mut full = LineStorage::new();
        c.save_all(&mut full).unwrap();
        full.prepare_for_load();
        c.restore_all(&mut full).unwrap();
    }

    #[test]
    fn test_restore_rejects_out_of_range_line() {
        let mut small = RamContainer::new("small", 8, 1).unwrap();
        let mut big = RamContainer::new("big", 8, 4).unwrap();
        big.write(24, &[7]);

        let mut st = LineStorage::new();
        big.save(&mut st).unwrap();
        st.prepare_for_load();
        assert!(small.restore(&mut st).is_err());
    }

    #[test]
    fn test_layouts() {
        let a = RamContainer::new("a", 8, 2).unwrap().into_shared();
        let b = RamContainer::new("b", 16, 2).unwrap().into_shared();
        let l = layouts(&[a, b]);
        assert_eq!(l.len(), 2);
        assert_eq!(l[0].name, "a");
        assert_eq!(l[0].line_size, 8);
        assert_eq!(l[1].line_size, 16);
    }
}
