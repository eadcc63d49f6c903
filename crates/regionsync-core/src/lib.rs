//! regionsync-core — shared types for the cross-region replication agent.
//!
//! Holds the pieces every other crate agrees on: who this agent is within
//! its group ([`AgentIdentity`]), what a [`Region`] is, how the agent is
//! configured ([`AgentConfig`]), and which software versions may run side
//! by side ([`ProtocolVersion`]).

pub mod backoff;
pub mod config;
pub mod duration;
pub mod shutdown;
pub mod types;
pub mod version;

pub use backoff::Backoff;
pub use config::{AgentConfig, ConfigError};
pub use duration::parse_duration;
pub use shutdown::{Shutdown, ShutdownTrigger, shutdown_channel};
pub use types::*;
pub use version::{ProtocolVersion, VersionVerdict};
