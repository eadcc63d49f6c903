//! Translation errors.

use regionsync_core::RegionId;
use regionsync_state::StateError;
use thiserror::Error;

pub type XlateResult<T> = Result<T, XlateError>;

#[derive(Debug, Error)]
pub enum XlateError {
    #[error("region map unavailable: {0}")]
    State(#[from] StateError),

    #[error("region id 0 is reserved")]
    ReservedId,

    #[error("source region {0} has no registered mapper")]
    UnknownSource(String),

    #[error("region id {id} is unknown at source region {region}")]
    UnknownSourceId { region: String, id: RegionId },

    #[error("region {name} (known to {region}) is not configured locally")]
    UnknownLocalRegion { region: String, name: String },
}

impl XlateError {
    /// Inconsistencies between region maps cannot be fixed by retrying.
    pub fn is_fatal(&self) -> bool {
        match self {
            XlateError::State(e) => !(e.is_transient() || e.is_not_found()),
            _ => true,
        }
    }
}
