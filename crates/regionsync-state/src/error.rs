//! Error types for the regionsync store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StateError {
    /// The store is temporarily unreachable or overloaded; retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Open(_) | StateError::Transaction(_) | StateError::Unavailable(_)
        )
    }

    /// A table or record that is expected to appear does not exist yet,
    /// e.g. while the store is mid-upgrade.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(StateError::Unavailable("overloaded".into()).is_transient());
        assert!(StateError::Transaction("conflict".into()).is_transient());
        assert!(!StateError::NotFound("checkpoints".into()).is_transient());
        assert!(StateError::NotFound("checkpoints".into()).is_not_found());
        assert!(!StateError::Deserialize("bad json".into()).is_transient());
        assert!(!StateError::Deserialize("bad json".into()).is_not_found());
    }
}
