use std::time::Duration;

use regionsync_state::StateError;
use thiserror::Error;

pub type ValidatorResult<T> = Result<T, ValidatorError>;

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("store error: {0}")]
    State(#[from] StateError),

    #[error("lead agent did not post its version within {waited:?}")]
    StartupTimeout { waited: Duration },

    #[error("group size mismatch: configured {ours}, lead reports {lead}")]
    GroupSizeMismatch { ours: u32, lead: u32 },

    #[error("another process claims the lead slot (ours {ours}, found {theirs})")]
    LeadConflict { ours: String, theirs: String },

    #[error("validation cancelled by shutdown")]
    Cancelled,
}

impl ValidatorError {
    /// The group is configured inconsistently; the agent must not run.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            ValidatorError::GroupSizeMismatch { .. } | ValidatorError::LeadConflict { .. }
        )
    }
}
