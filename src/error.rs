//! Error types for the visual index.

use thiserror::Error;

/// Errors that can occur while building, populating, querying, or
/// persisting a visual index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Invalid build or query parameters.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An image with this identifier has already been added.
    #[error("image {0} is already indexed")]
    DuplicateImage(u32),

    /// Operation requires a built vocabulary.
    #[error("index has no vocabulary; call build first")]
    NotBuilt,

    /// Operation requires a prepared index.
    #[error("index is not prepared; call prepare after adding images")]
    NotPrepared,

    /// Descriptor width disagrees with the built vocabulary.
    #[error("descriptor dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// I/O error during read/write.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid magic bytes, unsupported version, or truncated file.
    #[error("format error: {0}")]
    Format(String),

    /// Persisted payload failed its checksum (data corruption).
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Result type for visual index operations.
pub type Result<T> = std::result::Result<T, IndexError>;
