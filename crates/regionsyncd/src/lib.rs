//! regionsyncd — the replication agent daemon.
//!
//! One process runs one agent index of a region's replication group (or,
//! with `--whole-group`, every index sharing one store). The binary in
//! `main.rs` is a thin CLI over this library so the integration tests can
//! drive whole agents in-process.

pub mod agent;
pub mod exit;
pub mod source;

pub use agent::{Agent, AgentExit, local_store_path, open_local_store, restore_tasks};
pub use exit::{EXIT_FAILURE, EXIT_MISCONFIGURED, EXIT_OK, exit_code};
pub use source::{SourceStores, SourceWorker, SourceWorkerFactory, StreamOnlyCopier, store_path};
