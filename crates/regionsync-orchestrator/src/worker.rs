//! Boundary to the streaming engine: one worker per source region.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use regionsync_core::Region;
use regionsync_state::TableMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Stopping,
    Stopped,
    /// Terminated on its own; see [`RegionWorker::failure`].
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct WorkerError(pub String);

/// Streams a set of tables from one source region into the served region.
#[async_trait]
pub trait RegionWorker: Send + Sync {
    fn region(&self) -> &str;

    fn state(&self) -> WorkerState;

    /// Why the worker failed, once it has.
    fn failure(&self) -> Option<String>;

    /// Tables currently streaming.
    fn tables(&self) -> BTreeSet<String>;

    async fn add_tables(&self, tables: &[TableMetadata]) -> Result<(), WorkerError>;

    async fn remove_tables(&self, tables: &[TableMetadata]) -> Result<(), WorkerError>;

    async fn evolve_tables(&self, tables: &[TableMetadata]) -> Result<(), WorkerError>;

    /// Stop streaming. Must return promptly.
    async fn shutdown(&self);
}

#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Start a worker for `region`. It may still be `Starting` on return.
    async fn create(&self, region: &Region) -> Result<Arc<dyn RegionWorker>, WorkerError>;
}
