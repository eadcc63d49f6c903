//! Agent configuration file (`regionsync.toml`) parser.
//!
//! ```toml
//! queue_capacity = 64
//!
//! [agent]
//! group_size = 3
//! index = 0
//! data_dir = "/var/lib/regionsync"
//!
//! [serving]
//! name = "us-east"
//! store = "/var/lib/regionsync/us-east.redb"
//! endpoints = ["kv-east-1:5000"]
//!
//! [[regions]]
//! name = "eu-west"
//! store = "/mnt/eu-west/eu-west.redb"
//! endpoints = ["kv-eu-1:5000"]
//!
//! [timing]
//! poll_interval = "1s"
//! startup_timeout = "60m"
//!
//! [checkpoint]
//! max_attempts = 10
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::types::{AgentIdentity, Region};

/// Errors raised while loading or validating the agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub serving: Region,
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    pub group_size: u32,
    pub index: u32,
    pub data_dir: PathBuf,
}

/// Intervals and bounds, all as duration strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval: String,
    pub aggregator_tick: String,
    pub aggregator_timeout: String,
    pub worker_ready_timeout: String,
    pub dequeue_wait: String,
    pub validator_interval: String,
    pub startup_timeout: String,
    pub backoff_initial: String,
    pub backoff_max: String,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: "1s".to_string(),
            aggregator_tick: "1s".to_string(),
            aggregator_timeout: "10m".to_string(),
            worker_ready_timeout: "30s".to_string(),
            dequeue_wait: "1s".to_string(),
            validator_interval: "30s".to_string(),
            startup_timeout: "60m".to_string(),
            backoff_initial: "1s".to_string(),
            backoff_max: "30s".to_string(),
        }
    }
}

/// Timing values resolved to `Duration`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub poll_interval: Duration,
    pub aggregator_tick: Duration,
    pub aggregator_timeout: Duration,
    pub worker_ready_timeout: Duration,
    pub dequeue_wait: Duration,
    pub validator_interval: Duration,
    pub startup_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub max_attempts: u32,
    pub not_found_interval: String,
    /// AES-256 key as 64 hex characters. Absent means plaintext checkpoints.
    pub encryption_key: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            not_found_interval: "5s".to_string(),
            encryption_key: None,
        }
    }
}

fn default_queue_capacity() -> usize {
    64
}

impl AgentConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn identity(&self) -> Result<AgentIdentity, ConfigError> {
        AgentIdentity::new(self.agent.group_size, self.agent.index).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "agent index {} is not within a group of {}",
                self.agent.index, self.agent.group_size
            ))
        })
    }

    /// Look up a configured source region by case-insensitive name.
    pub fn source_region(&self, name: &str) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| r.name().eq_ignore_ascii_case(name))
    }

    pub fn timing(&self) -> Result<Timing, ConfigError> {
        let t = &self.timing;
        Ok(Timing {
            poll_interval: duration_field("poll_interval", &t.poll_interval)?,
            aggregator_tick: duration_field("aggregator_tick", &t.aggregator_tick)?,
            aggregator_timeout: duration_field("aggregator_timeout", &t.aggregator_timeout)?,
            worker_ready_timeout: duration_field("worker_ready_timeout", &t.worker_ready_timeout)?,
            dequeue_wait: duration_field("dequeue_wait", &t.dequeue_wait)?,
            validator_interval: duration_field("validator_interval", &t.validator_interval)?,
            startup_timeout: duration_field("startup_timeout", &t.startup_timeout)?,
            backoff_initial: duration_field("backoff_initial", &t.backoff_initial)?,
            backoff_max: duration_field("backoff_max", &t.backoff_max)?,
        })
    }

    pub fn not_found_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("not_found_interval", &self.checkpoint.not_found_interval)
    }

    /// Decode the checkpoint encryption key, if one is configured.
    pub fn encryption_key(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(hex_key) = &self.checkpoint.encryption_key else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| ConfigError::Invalid(format!("encryption_key: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            ConfigError::Invalid("encryption_key must be 32 bytes (64 hex characters)".into())
        })?;
        Ok(Some(key))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.identity()?;
        self.timing()?;
        self.not_found_interval()?;
        self.encryption_key()?;

        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".into()));
        }
        if self.checkpoint.max_attempts == 0 {
            return Err(ConfigError::Invalid("checkpoint.max_attempts must be > 0".into()));
        }

        let mut seen = HashSet::new();
        seen.insert(self.serving.key());
        for region in &self.regions {
            if !seen.insert(region.key()) {
                return Err(ConfigError::Invalid(format!(
                    "region {} is configured more than once",
                    region.name()
                )));
            }
        }
        Ok(())
    }
}

fn duration_field(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value)
        .ok_or_else(|| ConfigError::Invalid(format!("{field}: malformed duration {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[agent]
group_size = 3
index = 1
data_dir = "/tmp/regionsync"

[serving]
name = "us-east"
store = "east.redb"
endpoints = ["east-1:5000"]

[[regions]]
name = "eu-west"
store = "eu.redb"
endpoints = ["eu-1:5000", "eu-2:5000"]
"#;

    #[test]
    fn parse_minimal_with_defaults() {
        let config = AgentConfig::from_toml_str(MINIMAL).unwrap();
        let identity = config.identity().unwrap();
        assert_eq!(identity.group_size(), 3);
        assert_eq!(identity.index(), 1);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.checkpoint.max_attempts, 10);

        let timing = config.timing().unwrap();
        assert_eq!(timing.startup_timeout, Duration::from_secs(3600));
        assert_eq!(timing.poll_interval, Duration::from_secs(1));
        assert!(config.encryption_key().unwrap().is_none());
    }

    #[test]
    fn source_region_lookup_is_case_insensitive() {
        let config = AgentConfig::from_toml_str(MINIMAL).unwrap();
        let region = config.source_region("EU-WEST").unwrap();
        assert_eq!(region.endpoints().len(), 2);
        assert!(config.source_region("ap-south").is_none());
    }

    #[test]
    fn index_outside_group_rejected() {
        let bad = MINIMAL.replace("index = 1", "index = 3");
        let err = AgentConfig::from_toml_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn duplicate_region_rejected() {
        let bad = format!(
            "{MINIMAL}\n[[regions]]\nname = \"EU-West\"\nstore = \"x\"\nendpoints = []\n"
        );
        assert!(AgentConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn region_clashing_with_serving_rejected() {
        let bad = format!(
            "{MINIMAL}\n[[regions]]\nname = \"US-EAST\"\nstore = \"x\"\nendpoints = []\n"
        );
        assert!(AgentConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn encryption_key_must_be_32_bytes() {
        let good = format!("{MINIMAL}\n[checkpoint]\nencryption_key = \"{}\"\n", "ab".repeat(32));
        let config = AgentConfig::from_toml_str(&good).unwrap();
        assert_eq!(config.encryption_key().unwrap(), Some([0xab; 32]));

        let short = format!("{MINIMAL}\n[checkpoint]\nencryption_key = \"abcd\"\n");
        assert!(AgentConfig::from_toml_str(&short).is_err());
    }

    #[test]
    fn malformed_timing_rejected() {
        let bad = format!("{MINIMAL}\n[timing]\npoll_interval = \"often\"\n");
        assert!(AgentConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regionsync.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.serving.name(), "us-east");

        let missing = AgentConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
