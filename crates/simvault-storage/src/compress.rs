//! zstd compression for serialized checkpoint windows.

use simvault_core::{CheckpointError, Result};

/// Compression level for window blobs. Level 3 is the zstd default and
/// keeps the write stage well ahead of checkpoint production.
const LEVEL: i32 = 3;

/// Compresses a serialized window.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] if the encoder fails.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::encode_all(data, LEVEL)?)
}

/// Decompresses a window blob read back from the database.
///
/// # Errors
///
/// Returns [`CheckpointError::StorageCorruption`] if the blob is not valid
/// zstd data.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data)
        .map_err(|e| CheckpointError::StorageCorruption(format!("zstd decompression failed: {e}")))
}
