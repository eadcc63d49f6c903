//! Engine error types.

use semver::Version;
use thiserror::Error;

use regionsync_checkpoint::CheckpointError;
use regionsync_state::{RequestId, StateError};
use regionsync_xlate::XlateError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("region translation error: {0}")]
    Xlate(#[from] XlateError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("running version {local} is older than the group minimum {required}")]
    VersionTooOld { local: Version, required: Version },

    #[error("group runs {group_floor}, older than the oldest version {min_compatible} this build supports")]
    VersionTooNew {
        group_floor: Version,
        min_compatible: Version,
    },

    #[error("request {request_id} names region {region}, which is not configured")]
    UnknownRegion { request_id: RequestId, region: String },

    #[error("internal request queue is full")]
    QueueFull,

    #[error("internal request queue is closed")]
    QueueClosed,
}

impl EngineError {
    /// Fatal to the whole agent: the group or its configuration disagree.
    pub fn is_misconfiguration(&self) -> bool {
        match self {
            EngineError::VersionTooOld { .. }
            | EngineError::VersionTooNew { .. }
            | EngineError::UnknownRegion { .. } => true,
            EngineError::Xlate(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
