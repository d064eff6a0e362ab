//! Error types for checkpoint operations.

use crate::checkpoint::{ChkptId, Tick};

/// Errors from checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The id is unknown to the store, or refers to a flagged-deleted node.
    #[error("checkpoint {0} not found")]
    NotFound(ChkptId),

    /// A structural invariant of the checkpoint graph or line storage was
    /// violated. Fatal to the current operation.
    #[error("checkpoint invariant violated: {0}")]
    InvariantViolation(String),

    /// `flag_deleted` was called on a node that is already flagged.
    #[error("checkpoint {0} is already flagged deleted")]
    DoubleDelete(ChkptId),

    /// A new checkpoint's tick went backwards relative to its parent.
    #[error("cannot create checkpoint at tick {tick}: parent checkpoint is at tick {prev_tick}")]
    OrderViolation {
        /// Tick requested for the new checkpoint.
        tick: Tick,
        /// Tick of the would-be parent.
        prev_tick: Tick,
    },

    /// Deserialization or decompression failure, or window metadata that is
    /// inconsistent with its blob.
    #[error("checkpoint storage corrupted: {0}")]
    StorageCorruption(String),

    /// Underlying database or filesystem error.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation is not supported by this backing store.
    #[error("operation not supported by this backing store: {0}")]
    Unsupported(&'static str),

    /// The async persistence pipeline has failed and refuses further writes.
    #[error("checkpoint pipeline failed: {0}")]
    Pipeline(String),

    /// Invalid configuration.
    #[error("invalid checkpoint config: {0}")]
    InvalidConfig(String),

    /// All 2^64 - 1 checkpoint ids have been allocated.
    #[error("exhausted all checkpoint ids")]
    IdExhausted,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CheckpointError>;

impl CheckpointError {
    /// Shorthand for an [`CheckpointError::InvariantViolation`] with a
    /// formatted message.
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CheckpointError::NotFound(42);
        assert_eq!(err.to_string(), "checkpoint 42 not found");

        let err = CheckpointError::OrderViolation {
            tick: 5,
            prev_tick: 10,
        };
        assert!(err.to_string().contains("tick 5"));
        assert!(err.to_string().contains("tick 10"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: CheckpointError = io.into();
        assert!(matches!(err, CheckpointError::Io(_)));
    }
}
