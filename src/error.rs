// Error taxonomy for the reconciliation engine.
//
// Component-local problems (a bad block, a colliding merge key) are recovered
// by the caller and counted into run statistics. Everything else propagates
// to whoever triggered the operation: the CLI, or the scheduler loop which
// logs and waits for the next cycle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Malformed input, e.g. a duplicate stable_id within one snapshot.
    /// The offending write is rejected; stored data is untouched.
    #[error("validation error: {0}")]
    Validation(String),

    /// A diff or classification was requested against snapshots that are
    /// missing or not adjacent.
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    /// A single archive block could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A dedup key already exists with a different payload.
    #[error("merge conflict on {key}: existing row kept")]
    MergeConflict { key: String },

    /// A collection cycle or import is already in progress.
    #[error("{0} already running")]
    AlreadyRunning(&'static str),

    /// The operation was cancelled between batches.
    #[error("cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackerError {
    /// Shorthand used throughout the decoders.
    pub fn decode(msg: impl Into<String>) -> Self {
        TrackerError::Decode(msg.into())
    }
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;
