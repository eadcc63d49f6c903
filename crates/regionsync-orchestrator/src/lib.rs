//! regionsync-orchestrator — the agent's top-level control loop.
//!
//! The [`Orchestrator`] drains the internal request queue one item at a
//! time, keeps one [`RegionWorker`] per streaming source region, relays
//! table work to those workers and waits for each request's aggregator
//! before moving on. A worker that dies on its own aborts the agent with a
//! [`CompositeFailure`].

pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod worker;

pub use error::{CompositeFailure, OrchestratorError, OrchestratorResult, RegionFailure};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome};
pub use registry::{WorkerRegistry, WorkerSnapshot};
pub use worker::{RegionWorker, WorkerError, WorkerFactory, WorkerState};
