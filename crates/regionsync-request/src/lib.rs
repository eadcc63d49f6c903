//! regionsync-request — turns posted lifecycle requests into agent work.
//!
//! The [`RequestEngine`] polls the request table, skips what this agent has
//! already answered or is still working on, and expands each new request
//! into region-scoped [`RegionTask`]s. Every accepted request gets one
//! [`Aggregator`] that collects per-region outcomes and posts a single
//! durable response for this agent's slot.

pub mod aggregator;
pub mod engine;
pub mod error;
pub mod inflight;
pub mod negotiate;
pub mod plan;
pub mod queue;
pub mod tables;

pub use aggregator::{
    Aggregator, AggregatorContext, AggregatorHandle, AggregatorStatus, Completion, SuccessEffects,
};
pub use engine::{EngineConfig, PollSummary, RequestEngine};
pub use error::{EngineError, EngineResult};
pub use inflight::InFlight;
pub use negotiate::{NegotiatedVersion, negotiate};
pub use plan::{Plan, Planned, RegionTask, TableAction, Work, plan_request};
pub use queue::{AgentRequest, Dequeue, RequestQueue, RequestReceiver, request_queue};
pub use tables::{RequestTable, ResponseTable};
