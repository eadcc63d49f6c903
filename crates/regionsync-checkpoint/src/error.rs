use regionsync_state::StateError;
use thiserror::Error;

pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The store rejected the operation with a non-retryable error.
    #[error("{op}: {error}")]
    Store { op: String, error: StateError },

    #[error("{op} gave up after {attempts} attempts: {last}")]
    Exhausted {
        op: String,
        attempts: u32,
        last: StateError,
    },

    #[error("{op} cancelled by shutdown")]
    Cancelled { op: String },

    #[error("resume position cipher: {0}")]
    Cipher(String),

    #[error("malformed checkpoint: {0}")]
    Malformed(String),

    #[error("copy of table {table} failed: {message}")]
    Copy { table: String, message: String },
}

impl CheckpointError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CheckpointError::Cancelled { .. })
    }
}
