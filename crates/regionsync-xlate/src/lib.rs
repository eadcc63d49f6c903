//! regionsync-xlate — per-source-region numeric id translation.
//!
//! Every region's store numbers regions on its own, so a change record
//! streamed from a source region carries region ids in the *source's*
//! numbering. [`RegionIdTrans`] turns them into local ids.
//!
//! - **`mapping`** — [`RegionIdMapping`], a cache over one store's resolver
//! - **`trans`** — [`RegionIdTrans`], one translation table per source region

pub mod error;
pub mod mapping;
pub mod trans;

pub use error::{XlateError, XlateResult};
pub use mapping::RegionIdMapping;
pub use trans::{RegionIdTrans, TranslationEntry};
