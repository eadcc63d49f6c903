//! regionsync-checkpoint — durable progress for table initialization.
//!
//! While a table is first copied from a source region, the agent records
//! how far it got so a restart can pick up where it left off. This crate
//! owns that record: how it is written (with retry against a flaky store),
//! how the resume position is optionally encrypted, and how a restart
//! decides whether an old checkpoint still applies.

pub mod cipher;
pub mod error;
pub mod initializer;
pub mod resume;
pub mod retry;
pub mod store;

pub use cipher::{AesGcmCipher, PositionCipher};
pub use error::{CheckpointError, CheckpointResult};
pub use initializer::{CopiedBatch, CopyError, InitOutcome, TableCopier, TableInitializer};
pub use resume::{DropReason, ResumeDecision, decide};
pub use retry::{RetryPolicy, with_retry};
pub use store::{CheckpointStore, InitCheckpoint};
