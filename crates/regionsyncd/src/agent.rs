//! Agent assembly: one agent index of a replication group.
//!
//! Startup order matters. The local region map must be loaded before
//! requests are planned, and group validation must pass before the agent
//! answers anything. Workers a previous run had streaming are restored
//! before the request engine starts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use regionsync_checkpoint::{AesGcmCipher, CheckpointStore, RetryPolicy};
use regionsync_cluster::{ConfigValidator, ValidatorError};
use regionsync_core::config::Timing;
use regionsync_core::{AgentConfig, AgentIdentity, ConfigError, ShutdownTrigger, shutdown_channel};
use regionsync_orchestrator::{Orchestrator, OrchestratorConfig, RunOutcome, WorkerFactory};
use regionsync_request::{EngineConfig, RegionTask, RequestEngine, TableAction, request_queue};
use regionsync_state::{RequestId, StateStore, TableMetadata};
use regionsync_xlate::{RegionIdMapping, RegionIdTrans};

use crate::source::{SourceStores, SourceWorkerFactory, store_path};

/// How an agent run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Stopped by a signal or by the host.
    Stopped,
    /// Stopped by a Shutdown request, which it answered.
    Requested(RequestId),
}

/// Open the served region's store, creating it on first start.
pub fn open_local_store(config: &AgentConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.agent.data_dir)
        .with_context(|| format!("creating {}", config.agent.data_dir.display()))?;
    let path = store_path(&config.agent.data_dir, config.serving.store());
    let store = StateStore::open(&path).with_context(|| format!("opening {}", path.display()))?;
    info!(?path, region = %config.serving.name(), "served store opened");
    Ok(store)
}

pub struct Agent {
    config: AgentConfig,
    identity: AgentIdentity,
    timing: Timing,
    store: StateStore,
    stores: SourceStores,
    factory: Option<Arc<dyn WorkerFactory>>,
    trigger: ShutdownTrigger,
}

impl Agent {
    /// An agent at the configured index, serving from `store`.
    pub fn new(config: AgentConfig, store: StateStore) -> anyhow::Result<Self> {
        let identity = config.identity()?;
        let timing = config.timing()?;
        let (trigger, _) = shutdown_channel();
        Ok(Self {
            config,
            identity,
            timing,
            store,
            stores: SourceStores::new(),
            factory: None,
            trigger,
        })
    }

    /// Run as another index of the same group. Used when one process hosts
    /// the whole group.
    pub fn with_index(mut self, index: u32) -> anyhow::Result<Self> {
        self.identity = AgentIdentity::new(self.identity.group_size(), index).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "agent index {index} is not within a group of {}",
                self.identity.group_size()
            ))
        })?;
        Ok(self)
    }

    pub fn with_source_stores(mut self, stores: SourceStores) -> Self {
        self.stores = stores;
        self
    }

    /// Replace the worker factory. Without one, agents stream through
    /// [`SourceWorkerFactory`].
    pub fn with_factory(mut self, factory: Arc<dyn WorkerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn identity(&self) -> AgentIdentity {
        self.identity
    }

    /// Triggering it stops the agent.
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Run until shutdown. Errors are fatal to the agent; see
    /// [`crate::exit_code`] for how they map to an exit status.
    pub async fn run(self) -> anyhow::Result<AgentExit> {
        let identity = self.identity;
        let serving = self.config.serving.name().to_string();
        let shutdown = self.trigger.subscribe();
        info!(agent = %identity, region = %serving, sources = self.config.regions.len(), "agent starting");

        self.store
            .init_local_region(&serving)
            .context("claiming the served store")?;
        let trans = Arc::new(RegionIdTrans::new(RegionIdMapping::new(
            &serving,
            Arc::new(self.store.clone()),
        )));
        trans.local().refresh().context("loading the region map")?;

        let policy = RetryPolicy::from_config(&self.config)?;
        let mut checkpoints = CheckpointStore::new(
            self.store.clone(),
            &identity.agent_id(),
            &serving,
            policy,
            shutdown.clone(),
        );
        if let Some(key) = self.config.encryption_key()? {
            checkpoints = checkpoints.with_cipher(Arc::new(AesGcmCipher::new(&key)));
        }

        // ── Group validation ─────────────────────────────────────────
        let mut validator = ConfigValidator::new(self.store.clone(), identity, &self.timing);
        let report = match validator.validate_startup(&shutdown).await {
            Ok(report) => report,
            Err(ValidatorError::Cancelled) => {
                info!(agent = %identity, "stopped during group validation");
                return Ok(AgentExit::Stopped);
            }
            Err(e) => return Err(e).context("group validation failed"),
        };
        info!(agent = %identity, role = %report.role, waited = ?report.waited, "group validated");

        // ── Request path ─────────────────────────────────────────────
        let factory = match &self.factory {
            Some(factory) => factory.clone(),
            None => Arc::new(SourceWorkerFactory::new(
                self.config.agent.data_dir.clone(),
                self.stores.clone(),
                trans.clone(),
                checkpoints.clone(),
            )),
        };
        let (queue, receiver) = request_queue(self.config.queue_capacity);
        let engine = RequestEngine::new(
            self.store.clone(),
            identity,
            trans.clone(),
            checkpoints,
            queue,
            EngineConfig::from_timing(&self.timing),
            shutdown.clone(),
        )
        .with_sources(&self.config.regions);
        // Refused versions must not get as far as restoring workers.
        let negotiated = engine.negotiate().context("version negotiation failed")?;
        info!(agent = %identity, minimum = %negotiated.minimum, skew = negotiated.skew, "version accepted");
        let mut orchestrator = Orchestrator::new(
            &self.config.regions,
            factory,
            engine.responses().clone(),
            receiver,
            OrchestratorConfig::from_timing(&self.timing),
            self.trigger.clone(),
        );

        let tasks = restore_tasks(&self.store, &trans, &self.config)?;
        orchestrator.restore(tasks).await;

        let trigger = self.trigger.clone();
        let orchestrator_task = tokio::spawn(async move {
            let result = orchestrator.run().await;
            trigger.trigger();
            result
        });
        let trigger = self.trigger.clone();
        let engine_task = tokio::spawn(async move {
            let result = engine.run().await;
            if result.is_err() {
                trigger.trigger();
            }
            result
        });
        let trigger = self.trigger.clone();
        let validator_task = tokio::spawn(async move {
            let result = validator.run(shutdown).await;
            if result.is_err() {
                trigger.trigger();
            }
            result
        });

        let outcome = join("orchestrator", orchestrator_task).await;
        let engine = join("request engine", engine_task).await;
        let validator = join("validator", validator_task).await;

        // Misconfiguration found by the validator or engine explains any
        // failure the orchestrator saw while shutting down.
        let validator = validator?.context("group validation failed");
        let engine = engine?.context("request engine failed");
        validator?;
        engine?;
        let outcome = outcome?.context("orchestrator failed")?;

        info!(agent = %identity, ?outcome, "agent stopped");
        Ok(match outcome {
            RunOutcome::ShutdownRequested(request_id) => AgentExit::Requested(request_id),
            RunOutcome::Shutdown | RunOutcome::QueueClosed => AgentExit::Stopped,
        })
    }
}

async fn join<T>(name: &str, task: JoinHandle<T>) -> anyhow::Result<T> {
    task.await.map_err(|e| {
        error!(task = name, error = %e, "agent task panicked");
        anyhow::anyhow!("{name} task failed: {e}")
    })
}

/// Group the catalog's (table, source region) pairs by configured region.
///
/// A catalog table replicating from a region this agent is not configured
/// for is a misconfiguration.
pub fn restore_tasks(
    store: &StateStore,
    trans: &RegionIdTrans,
    config: &AgentConfig,
) -> anyhow::Result<Vec<RegionTask>> {
    let mut by_region: BTreeMap<String, Vec<TableMetadata>> = BTreeMap::new();
    for table in store.list_tables()? {
        for id in &table.regions {
            let Some(name) = trans.local().name_for(*id)? else {
                warn!(table = %table.name, region_id = id, "catalog names an unknown region id");
                continue;
            };
            let Some(region) = config.source_region(&name) else {
                return Err(ConfigError::Invalid(format!(
                    "table {} replicates from region {name}, which is not configured",
                    table.name
                ))
                .into());
            };
            by_region
                .entry(region.name().to_string())
                .or_default()
                .push(table.clone());
        }
    }
    Ok(by_region
        .into_iter()
        .map(|(region, tables)| RegionTask {
            region,
            action: TableAction::Add,
            tables,
        })
        .collect())
}

/// Path of the served store, for commands that open it directly.
pub fn local_store_path(config: &AgentConfig) -> std::path::PathBuf {
    store_path(Path::new(&config.agent.data_dir), config.serving.store())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[agent]
group_size = 1
index = 0
data_dir = "/tmp/regionsync"

[serving]
name = "us-east"
store = "east.redb"
endpoints = ["east-1:5000"]

[[regions]]
name = "eu-west"
store = "eu.redb"
endpoints = ["eu-1:5000"]
"#;

    fn setup() -> (AgentConfig, StateStore, RegionIdTrans) {
        let config = AgentConfig::from_toml_str(CONFIG).unwrap();
        let store = StateStore::open_in_memory().unwrap();
        store.init_local_region("us-east").unwrap();
        let trans = RegionIdTrans::new(RegionIdMapping::new("us-east", Arc::new(store.clone())));
        (config, store, trans)
    }

    #[test]
    fn restore_groups_tables_by_region() {
        let (config, store, trans) = setup();
        let eu = store.register_region("eu-west").unwrap();
        store.put_table(&TableMetadata::new("orders", 11, [eu])).unwrap();
        store.put_table(&TableMetadata::new("users", 12, [eu])).unwrap();
        store.put_table(&TableMetadata::new("local_only", 13, [])).unwrap();

        let tasks = restore_tasks(&store, &trans, &config).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].region, "eu-west");
        assert_eq!(tasks[0].action, TableAction::Add);
        let names: Vec<_> = tasks[0].tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "users"]);
    }

    #[test]
    fn restore_rejects_unconfigured_region() {
        let (config, store, trans) = setup();
        let ap = store.register_region("ap-south").unwrap();
        store.put_table(&TableMetadata::new("orders", 11, [ap])).unwrap();

        let err = restore_tasks(&store, &trans, &config).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn with_index_checks_group_bounds() {
        let (config, store, _) = setup();
        let agent = Agent::new(config, store).unwrap();
        assert!(agent.with_index(1).is_err());
    }

    #[test]
    fn relative_local_store_resolves_under_data_dir() {
        let (config, _, _) = setup();
        assert_eq!(
            local_store_path(&config),
            std::path::PathBuf::from("/tmp/regionsync/east.redb")
        );
    }
}
