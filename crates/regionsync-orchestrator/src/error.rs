//! Orchestrator error types.

use std::fmt;

use thiserror::Error;

use regionsync_state::StateError;

/// One source region that failed, with the tables it was streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionFailure {
    pub region: String,
    pub tables: Vec<String>,
    pub cause: String,
}

/// Every region that failed in one pass, reported together.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompositeFailure {
    pub failures: Vec<RegionFailure>,
}

impl CompositeFailure {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.region.as_str())
    }
}

impl fmt::Display for CompositeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} region(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(
                f,
                "; {} [{}]: {}",
                failure.region,
                failure.tables.join(", "),
                failure.cause
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("source region workers terminated unexpectedly: {0}")]
    Composite(CompositeFailure),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_names_every_region_and_table() {
        let failure = CompositeFailure {
            failures: vec![
                RegionFailure {
                    region: "eu-west".into(),
                    tables: vec!["orders".into(), "items".into()],
                    cause: "stream reset".into(),
                },
                RegionFailure {
                    region: "ap-south".into(),
                    tables: vec![],
                    cause: "exited".into(),
                },
            ],
        };
        let text = OrchestratorError::Composite(failure.clone()).to_string();
        assert!(text.contains("2 region(s) failed"));
        assert!(text.contains("eu-west [orders, items]: stream reset"));
        assert!(text.contains("ap-south []: exited"));
        assert_eq!(failure.regions().collect::<Vec<_>>(), vec!["eu-west", "ap-south"]);
    }
}
