//! Keyed blob-database contract for persisted checkpoint windows.
//!
//! The schema mirrors two tables: `WINDOW_BYTES(id, bytes)` holding one
//! compressed blob per window, and `WINDOW_IDS(window_bytes_id, chkpt_id)`
//! mapping every member checkpoint to its window row. Only the pipeline's
//! write worker touches a database handle.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use simvault_core::{CheckpointError, ChkptId, Result};

/// Fsync a file to ensure its contents are durable on disk.
fn sync_file(path: &Path) -> std::io::Result<()> {
    // Must open with write access; Windows requires it for FlushFileBuffers.
    let f = std::fs::OpenOptions::new().write(true).open(path)?;
    f.sync_all()
}

/// Fsync a directory to make rename operations durable.
///
/// On Unix, this flushes directory metadata (new/renamed entries).
/// On Windows, directory sync is not supported; the OS handles durability.
#[allow(clippy::unnecessary_wraps)] // Returns Result on Unix, no-op on Windows
fn sync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let f = std::fs::File::open(path)?;
        f.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Blob-database contract of the windowed store.
pub trait WindowDatabase: Send + Sync {
    /// Inserts one window blob and its member-id rows, returning the new
    /// window row id (auto-incremented from 1).
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    fn insert_window(&self, bytes: &[u8], ids: &[ChkptId]) -> Result<u64>;

    /// Returns the blob of the window containing checkpoint `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the id index is inconsistent
    /// with the stored blobs.
    fn window_for(&self, id: ChkptId) -> Result<Option<Vec<u8>>>;

    /// Returns every window blob in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    fn all_windows(&self) -> Result<Vec<Vec<u8>>>;

    /// Returns every persisted checkpoint id, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    fn ids(&self) -> Result<Vec<ChkptId>>;

    /// Number of rows in the window-bytes table.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    fn window_count(&self) -> Result<u64>;

    /// Number of rows in the window-ids table.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    fn id_count(&self) -> Result<u64>;
}

#[derive(Default)]
struct MemoryTables {
    /// WINDOW_BYTES rows; the row id is the index plus one.
    window_bytes: Vec<Vec<u8>>,
    /// WINDOW_IDS rows as (window_bytes_id, chkpt_id) pairs.
    window_ids: Vec<(u64, ChkptId)>,
}

/// In-process window database, the default backend and the test double.
#[derive(Default)]
pub struct MemoryWindowDatabase {
    tables: Mutex<MemoryTables>,
}

impl MemoryWindowDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WindowDatabase for MemoryWindowDatabase {
    fn insert_window(&self, bytes: &[u8], ids: &[ChkptId]) -> Result<u64> {
        let mut tables = self.tables.lock();
        tables.window_bytes.push(bytes.to_vec());
        let row_id = tables.window_bytes.len() as u64;
        for &id in ids {
            tables.window_ids.push((row_id, id));
        }
        Ok(row_id)
    }

    fn window_for(&self, id: ChkptId) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.lock();
        let Some(&(row_id, _)) = tables.window_ids.iter().find(|(_, c)| *c == id) else {
            return Ok(None);
        };
        let blob = tables
            .window_bytes
            .get(row_id as usize - 1)
            .ok_or_else(|| {
                CheckpointError::StorageCorruption(format!(
                    "window id row for checkpoint {id} points at missing window row {row_id}"
                ))
            })?;
        Ok(Some(blob.clone()))
    }

    fn all_windows(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.tables.lock().window_bytes.clone())
    }

    fn ids(&self) -> Result<Vec<ChkptId>> {
        let tables = self.tables.lock();
        let mut ids: Vec<ChkptId> = tables.window_ids.iter().map(|(_, c)| *c).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn window_count(&self) -> Result<u64> {
        Ok(self.tables.lock().window_bytes.len() as u64)
    }

    fn id_count(&self) -> Result<u64> {
        Ok(self.tables.lock().window_ids.len() as u64)
    }
}

/// One persisted window in the file index.
#[derive(Debug, Serialize, Deserialize)]
struct WindowIndexEntry {
    row_id: u64,
    file: String,
    chkpt_ids: Vec<ChkptId>,
}

/// The on-disk id index, serialized as pretty-printed JSON.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WindowIndex {
    windows: Vec<WindowIndexEntry>,
}

/// Filesystem-backed window database.
///
/// Each window blob lands in its own `window_NNNNNN.bin` file; the id index
/// lives in `index.json`. Both are written to a temp file and renamed so
/// readers never observe a partial write.
#[derive(Debug)]
pub struct FileWindowDatabase {
    base_dir: PathBuf,
    index: Mutex<WindowIndex>,
}

impl FileWindowDatabase {
    /// Opens (or creates) a database rooted at `base_dir`, loading any
    /// existing index.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or an existing
    /// index cannot be parsed.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;

        let index_path = base_dir.join("index.json");
        let index = if index_path.exists() {
            let json = std::fs::read_to_string(&index_path)?;
            serde_json::from_str(&json).map_err(|e| {
                CheckpointError::StorageCorruption(format!(
                    "window index {} is unreadable: {e}",
                    index_path.display()
                ))
            })?
        } else {
            WindowIndex::default()
        };

        Ok(Self {
            base_dir,
            index: Mutex::new(index),
        })
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join("index.json")
    }

    fn window_path(&self, file: &str) -> PathBuf {
        self.base_dir.join(file)
    }

    /// Writes `bytes` to `path` through a temp file, fsync, and atomic
    /// rename, then fsyncs the parent directory so the rename survives a
    /// crash.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        sync_file(&tmp)?;
        std::fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            sync_dir(parent)?;
        }
        Ok(())
    }

    fn persist_index(&self, index: &WindowIndex) -> Result<()> {
        let json = serde_json::to_string_pretty(index).map_err(|e| {
            CheckpointError::StorageCorruption(format!("window index serialization failed: {e}"))
        })?;
        Self::write_atomic(&self.index_path(), json.as_bytes())
    }
}

impl WindowDatabase for FileWindowDatabase {
    fn insert_window(&self, bytes: &[u8], ids: &[ChkptId]) -> Result<u64> {
        let mut index = self.index.lock();
        let row_id = index.windows.len() as u64 + 1;
        let file = format!("window_{row_id:06}.bin");

        Self::write_atomic(&self.window_path(&file), bytes)?;
        index.windows.push(WindowIndexEntry {
            row_id,
            file,
            chkpt_ids: ids.to_vec(),
        });
        self.persist_index(&index)?;
        Ok(row_id)
    }

    fn window_for(&self, id: ChkptId) -> Result<Option<Vec<u8>>> {
        let index = self.index.lock();
        let Some(entry) = index.windows.iter().find(|w| w.chkpt_ids.contains(&id)) else {
            return Ok(None);
        };
        Ok(Some(std::fs::read(self.window_path(&entry.file))?))
    }

    fn all_windows(&self) -> Result<Vec<Vec<u8>>> {
        let index = self.index.lock();
        let mut out = Vec::with_capacity(index.windows.len());
        for entry in &index.windows {
            out.push(std::fs::read(self.window_path(&entry.file))?);
        }
        Ok(out)
    }

    fn ids(&self) -> Result<Vec<ChkptId>> {
        let index = self.index.lock();
        let mut ids: Vec<ChkptId> = index
            .windows
            .iter()
            .flat_map(|w| w.chkpt_ids.iter().copied())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn window_count(&self) -> Result<u64> {
        Ok(self.index.lock().windows.len() as u64)
    }

    fn id_count(&self) -> Result<u64> {
        Ok(self
            .index
            .lock()
            .windows
            .iter()
            .map(|w| w.chkpt_ids.len() as u64)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(db: &dyn WindowDatabase) {
        assert_eq!(db.window_count().unwrap(), 0);
        assert!(db.window_for(1).unwrap().is_none());

        let row1 = db.insert_window(b"blob-one", &[1, 2]).unwrap();
        let row2 = db.insert_window(b"blob-two", &[3, 4]).unwrap();
        assert_eq!((row1, row2), (1, 2));

        assert_eq!(db.window_count().unwrap(), 2);
        assert_eq!(db.id_count().unwrap(), 4);
        assert_eq!(db.ids().unwrap(), vec![1, 2, 3, 4]);

        assert_eq!(db.window_for(2).unwrap().unwrap(), b"blob-one");
        assert_eq!(db.window_for(3).unwrap().unwrap(), b"blob-two");
        assert!(db.window_for(9).unwrap().is_none());

        let all = db.all_windows().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], b"blob-one");
    }

    #[test]
    fn test_memory_database() {
        exercise(&MemoryWindowDatabase::new());
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileWindowDatabase::open(dir.path()).unwrap());
    }

    #[test]
    fn test_file_database_reopens_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = FileWindowDatabase::open(dir.path()).unwrap();
            db.insert_window(b"persisted", &[7, 8]).unwrap();
        }

        let db = FileWindowDatabase::open(dir.path()).unwrap();
        assert_eq!(db.window_count().unwrap(), 1);
        assert_eq!(db.window_for(8).unwrap().unwrap(), b"persisted");
        // Row ids continue past the reloaded index.
        assert_eq!(db.insert_window(b"next", &[9]).unwrap(), 2);
    }

    #[test]
    fn test_file_database_corrupt_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.json"), "{ not json").unwrap();
        let err = FileWindowDatabase::open(dir.path()).unwrap_err();
        assert!(matches!(err, CheckpointError::StorageCorruption(_)));
    }
}
