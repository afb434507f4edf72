use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the index core. Early-termination conditions during
/// search are not errors; they are successful returns with partial results.
#[derive(Debug, Error)]
pub enum Error {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector store capacity exceeded")]
    CapacityExceeded,

    #[error("snapshot not found: {commit_id}")]
    SnapshotNotFound { commit_id: Uuid },

    #[error("branch not found: {name}")]
    BranchNotFound { name: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("corrupted storage at address {address:#018x}: {detail}")]
    CorruptedStorage { address: u64, detail: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for deserialization/length failures tied to a chunk address.
    pub fn corrupted(address: u64, detail: impl Into<String>) -> Self {
        Self::CorruptedStorage {
            address,
            detail: detail.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
