//! STRATA - Custom Error Types
//! Defines the error hierarchy for the segment engine.
//!
//! Capacity and contention signals (a full or frozen mutable segment,
//! another merge already running) are not errors. They travel as
//! [`OperationResult`](crate::types::OperationResult) and
//! [`MergeResult`](crate::types::MergeResult) values instead.

use thiserror::Error;

use crate::types::SegmentId;

/// Custom Result type for the Strata engine.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Error types for the Strata storage engine.
#[derive(Error, Debug)]
pub enum StrataError {
    /// I/O errors from file operations (WAL, segment devices, topology log).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (CRC mismatch, truncated frame).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Segment ordering invariants were violated while loading the topology.
    #[error("Topology corruption: {0}")]
    TopologyCorruption(String),

    /// A write was attempted on an engine marked read-only.
    #[error("Engine is read-only")]
    ReadOnly,

    /// Read-only segments did not finish freezing within the wait timeout.
    #[error("Read-only segments are not fully frozen yet, retry later")]
    ReadOnlySegmentsNotReady,

    /// A segment referenced by the topology has no backing storage.
    #[error("Segment {0} not found")]
    SegmentNotFound(SegmentId),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for StrataError {
    fn from(err: bincode::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}
