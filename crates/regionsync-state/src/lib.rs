//! regionsync-state — the locally served store.
//!
//! Backed by [redb](https://docs.rs/redb). The request/response channel,
//! version exchange, streaming registry, initialization checkpoints, the
//! local table catalog and the region-id map all live here as ordinary
//! tables, so agents coordinate without a consensus service.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`request/{id}`, `{agent}/{source}/{table}`) enable
//! prefix scans for related rows.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod resolver;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use resolver::RegionResolver;
pub use store::{StateStore, epoch_secs};
pub use types::*;
