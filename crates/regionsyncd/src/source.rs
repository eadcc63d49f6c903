//! Source-region workers backed by the source region's store.
//!
//! A worker holds a handle on one source region's store. Starting it probes
//! the store until its tables are visible; adding a table runs the
//! checkpointed initial copy before the table counts as streaming.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use regionsync_checkpoint::{
    CheckpointError, CheckpointStore, CopiedBatch, CopyError, InitOutcome, TableCopier,
    TableInitializer, with_retry,
};
use regionsync_core::{Region, RegionId};
use regionsync_orchestrator::{RegionWorker, WorkerError, WorkerFactory, WorkerState};
use regionsync_state::{StateStore, TableMetadata};
use regionsync_xlate::RegionIdTrans;

/// Resolve a configured store location against the data directory.
pub fn store_path(data_dir: &Path, store: &str) -> PathBuf {
    let path = Path::new(store);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    }
}

/// Source stores opened so far, shared by every agent of the process.
///
/// A redb file can be opened only once per process, so agents hosted
/// together must share handles.
#[derive(Clone, Default)]
pub struct SourceStores {
    open: Arc<Mutex<HashMap<PathBuf, StateStore>>>,
}

impl SourceStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already-open store under `path`.
    pub fn insert(&self, path: PathBuf, store: StateStore) {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, store);
    }

    pub fn open(&self, path: &Path) -> Result<StateStore, WorkerError> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = open.get(path) {
            return Ok(store.clone());
        }
        let store = StateStore::open_existing(path)
            .map_err(|e| WorkerError(format!("opening {}: {e}", path.display())))?;
        open.insert(path.to_path_buf(), store.clone());
        Ok(store)
    }
}

/// Copier for deployments where the streaming engine backfills rows itself.
/// Nothing is copied here; initialization only records the checkpoint
/// lifecycle.
pub struct StreamOnlyCopier;

#[async_trait]
impl TableCopier for StreamOnlyCopier {
    async fn copy_batch(
        &self,
        _table: &str,
        _after: Option<&[u8]>,
    ) -> Result<Option<CopiedBatch>, CopyError> {
        Ok(None)
    }
}

struct Status {
    state: WorkerState,
    tables: BTreeSet<String>,
    failure: Option<String>,
}

pub struct SourceWorker {
    region: String,
    /// The source region's id in the served store's numbering.
    source_id: RegionId,
    source: StateStore,
    trans: Arc<RegionIdTrans>,
    checkpoints: CheckpointStore,
    copier: Arc<dyn TableCopier>,
    status: Arc<Mutex<Status>>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl SourceWorker {
    /// Create the worker in `Starting` and probe the source store in the
    /// background.
    pub fn start(
        region: &str,
        source_id: RegionId,
        source: StateStore,
        trans: Arc<RegionIdTrans>,
        checkpoints: CheckpointStore,
        copier: Arc<dyn TableCopier>,
    ) -> Arc<Self> {
        let status = Arc::new(Mutex::new(Status {
            state: WorkerState::Starting,
            tables: BTreeSet::new(),
            failure: None,
        }));
        let probe = tokio::spawn(probe(
            region.to_string(),
            source.clone(),
            checkpoints.clone(),
            status.clone(),
        ));
        Arc::new(Self {
            region: region.to_string(),
            source_id,
            source,
            trans,
            checkpoints,
            copier,
            status,
            probe: Mutex::new(Some(probe)),
        })
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the worker failed. The orchestrator treats it as an unexpected
    /// termination.
    fn fail(&self, cause: &str) {
        let mut status = self.status();
        status.state = WorkerState::Failed;
        status.failure = Some(cause.to_string());
    }

    fn classify(&self, e: CheckpointError) -> WorkerError {
        match e {
            CheckpointError::Copy { table, message } => {
                WorkerError(format!("copying {table} from {}: {message}", self.region))
            }
            e if e.is_cancelled() => WorkerError("initialization interrupted by shutdown".into()),
            e => {
                let cause = format!("store unavailable: {e}");
                self.fail(&cause);
                WorkerError(cause)
            }
        }
    }

    /// Local names of the regions `remote` lists, translated from the
    /// source's numbering. Ids the served store cannot place are skipped.
    fn upstream_regions(&self, remote: &TableMetadata) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for id in &remote.regions {
            match self.trans.translate_entry(&self.region, *id) {
                Ok(entry) => {
                    names.insert(entry.local_name);
                }
                Err(e) => {
                    warn!(region = %self.region, table = %remote.name, source_id = id, error = %e, "region id not translated");
                }
            }
        }
        names
    }

    async fn initialize(&self, table: &TableMetadata) -> Result<(), WorkerError> {
        let remote = with_retry(
            "read source table",
            self.checkpoints.policy(),
            self.checkpoints.shutdown(),
            || self.source.get_table(&table.name),
        )
        .await
        .map_err(|e| self.classify(e))?;
        let Some(remote) = remote else {
            return Err(WorkerError(format!(
                "table {} does not exist in {}",
                table.name, self.region
            )));
        };

        let upstream = self.upstream_regions(&remote);
        debug!(region = %self.region, table = %table.name, ?upstream, "source table found");

        let initializer = TableInitializer::new(&self.checkpoints, self.copier.as_ref());
        let outcome = initializer
            .run(&self.region, self.source_id, table, remote.id)
            .await
            .map_err(|e| self.classify(e))?;
        match outcome {
            InitOutcome::Completed { rows, resumed } => {
                debug!(region = %self.region, table = %table.name, rows, resumed, "table initialized");
            }
            InitOutcome::AlreadyComplete => {
                debug!(region = %self.region, table = %table.name, "table already initialized");
            }
            InitOutcome::Abandoned(reason) => {
                return Err(WorkerError(format!("table {}: {reason}", table.name)));
            }
            InitOutcome::Interrupted { .. } => {
                return Err(WorkerError("initialization interrupted by shutdown".into()));
            }
        }

        self.status().tables.insert(table.name.clone());
        info!(region = %self.region, table = %table.name, "table streaming");
        Ok(())
    }
}

async fn probe(
    region: String,
    source: StateStore,
    checkpoints: CheckpointStore,
    status: Arc<Mutex<Status>>,
) {
    let result = with_retry(
        "probe source store",
        checkpoints.policy(),
        checkpoints.shutdown(),
        || source.list_tables(),
    )
    .await;

    let mut status = status.lock().unwrap_or_else(PoisonError::into_inner);
    if status.state != WorkerState::Starting {
        return;
    }
    match result {
        Ok(tables) => {
            status.state = WorkerState::Ready;
            info!(%region, tables = tables.len(), "source store reachable");
        }
        Err(e) => {
            warn!(%region, error = %e, "source store unreachable");
            status.state = WorkerState::Failed;
            status.failure = Some(format!("source store unreachable: {e}"));
        }
    }
}

#[async_trait]
impl RegionWorker for SourceWorker {
    fn region(&self) -> &str {
        &self.region
    }

    fn state(&self) -> WorkerState {
        self.status().state
    }

    fn failure(&self) -> Option<String> {
        self.status().failure.clone()
    }

    fn tables(&self) -> BTreeSet<String> {
        self.status().tables.clone()
    }

    async fn add_tables(&self, tables: &[TableMetadata]) -> Result<(), WorkerError> {
        let mut failed = Vec::new();
        for table in tables {
            if let Err(e) = self.initialize(table).await {
                failed.push(e.0);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(WorkerError(failed.join("; ")))
        }
    }

    async fn remove_tables(&self, tables: &[TableMetadata]) -> Result<(), WorkerError> {
        let mut status = self.status();
        for table in tables {
            if status.tables.remove(&table.name) {
                info!(region = %self.region, table = %table.name, "table no longer streaming");
            }
        }
        Ok(())
    }

    async fn evolve_tables(&self, tables: &[TableMetadata]) -> Result<(), WorkerError> {
        for table in tables {
            let streaming = self.status().tables.contains(&table.name);
            if streaming {
                info!(
                    region = %self.region,
                    table = %table.name,
                    schema_version = table.schema_version,
                    "table schema evolved"
                );
            } else {
                self.initialize(table).await?;
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        {
            let mut status = self.status();
            if matches!(status.state, WorkerState::Starting | WorkerState::Ready) {
                status.state = WorkerState::Stopping;
            }
        }
        let probe = self
            .probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(probe) = probe {
            probe.abort();
            let _ = probe.await;
        }
        let mut status = self.status();
        if status.state != WorkerState::Failed {
            status.state = WorkerState::Stopped;
        }
        debug!(region = %self.region, "source worker stopped");
    }
}

/// Creates [`SourceWorker`]s for configured source regions.
pub struct SourceWorkerFactory {
    data_dir: PathBuf,
    stores: SourceStores,
    trans: Arc<RegionIdTrans>,
    checkpoints: CheckpointStore,
    copier: Arc<dyn TableCopier>,
}

impl SourceWorkerFactory {
    pub fn new(
        data_dir: PathBuf,
        stores: SourceStores,
        trans: Arc<RegionIdTrans>,
        checkpoints: CheckpointStore,
    ) -> Self {
        Self {
            data_dir,
            stores,
            trans,
            checkpoints,
            copier: Arc::new(StreamOnlyCopier),
        }
    }

    pub fn with_copier(mut self, copier: Arc<dyn TableCopier>) -> Self {
        self.copier = copier;
        self
    }
}

#[async_trait]
impl WorkerFactory for SourceWorkerFactory {
    async fn create(&self, region: &Region) -> Result<Arc<dyn RegionWorker>, WorkerError> {
        let path = store_path(&self.data_dir, region.store());
        let source = self.stores.open(&path)?;
        let source_id = self
            .trans
            .local()
            .id_for(region.name())
            .map_err(|e| WorkerError(e.to_string()))?
            .ok_or_else(|| {
                WorkerError(format!("region {} has no id in the served store", region.name()))
            })?;
        if !self.trans.has_source(region.name()) {
            self.trans.add_source(region.name(), Arc::new(source.clone()));
        }

        info!(region = %region.name(), source_id, ?path, "starting source worker");
        let worker = SourceWorker::start(
            region.name(),
            source_id,
            source,
            self.trans.clone(),
            self.checkpoints.clone(),
            self.copier.clone(),
        );
        Ok(worker)
    }
}
