//! Error type for coordination store operations.

/// Errors surfaced by a [`crate::CoordStore`] backend.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// The backend could not be reached.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// A read operation failed.
    #[error("coordination store read failed: {0}")]
    Read(String),

    /// A write operation failed.
    #[error("coordination store write failed: {0}")]
    Write(String),

    /// A stored value could not be decoded.
    #[error("corrupt coordination entry at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}
