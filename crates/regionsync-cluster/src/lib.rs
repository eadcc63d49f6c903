//! regionsync-cluster — keeps an agent group consistent without consensus.
//!
//! Agents of one group share a version row in the locally served store.
//! The lead (index 0) announces itself first; members wait for it, verify
//! they were configured with the same group size, and announce themselves.
//! The lead keeps checking that no other process has claimed its slot.

pub mod error;
pub mod validator;

pub use error::{ValidatorError, ValidatorResult};
pub use validator::{ConfigValidator, StartupReport, ValidatorRole};
