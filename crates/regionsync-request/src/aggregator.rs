//! Per-request outcome aggregation.
//!
//! One aggregator runs per accepted request. Downstream handlers report
//! each region's result through an [`AggregatorHandle`]; the aggregator
//! wakes on every report and on a fixed tick, and posts exactly one
//! outcome for this agent:
//!
//! * any region failed: post the joined failure causes and stop;
//! * every expected region succeeded: apply the [`Completion`] side
//!   effects, post success and stop;
//! * the timeout elapsed: stop without posting, leaving the request open
//!   for a later poll;
//! * shutdown or cancel: stop without posting.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use regionsync_checkpoint::CheckpointStore;
use regionsync_core::{Shutdown, region_key};
use regionsync_state::{RequestId, RequestKind, StateStore, TableMetadata};
use regionsync_xlate::RegionIdTrans;

use crate::error::{EngineError, EngineResult};
use crate::inflight::InFlight;
use crate::tables::ResponseTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorStatus {
    Waiting,
    Succeeded,
    Failed(String),
    /// Gave up waiting; nothing was posted.
    TimedOut,
    /// Shut down or cancelled; nothing was posted.
    Cancelled,
}

impl AggregatorStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AggregatorStatus::Waiting)
    }
}

/// Side effects applied once every region succeeded, by request kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Create/update: store the new catalog entry and forget checkpoints
    /// of regions the table no longer streams from.
    UpsertTable {
        table: TableMetadata,
        removed_sources: Vec<String>,
    },
    /// Drop: delete the catalog entries and their checkpoints.
    DropTables { tables: Vec<String> },
    RegionAdded { region: String },
    /// Drop the region from every catalog table, then delete its
    /// checkpoints and translation table.
    RegionRemoved { region: String },
}

/// Everything a [`Completion`] may touch.
#[derive(Clone)]
pub struct SuccessEffects {
    store: StateStore,
    checkpoints: CheckpointStore,
    trans: Arc<RegionIdTrans>,
}

impl SuccessEffects {
    pub fn new(store: StateStore, checkpoints: CheckpointStore, trans: Arc<RegionIdTrans>) -> Self {
        Self {
            store,
            checkpoints,
            trans,
        }
    }

    pub async fn apply(&self, completion: &Completion) -> EngineResult<()> {
        match completion {
            Completion::UpsertTable {
                table,
                removed_sources,
            } => {
                self.store.put_table(table)?;
                for source in removed_sources {
                    self.checkpoints.delete(source, &table.name).await?;
                }
            }
            Completion::DropTables { tables } => {
                for name in tables {
                    self.store.delete_table(name)?;
                    self.checkpoints.delete_for_table(name).await?;
                }
            }
            Completion::RegionAdded { region } => {
                debug!(%region, "region added");
            }
            Completion::RegionRemoved { region } => {
                if let Some(id) = self.trans.local().id_for(region)? {
                    for mut table in self.store.list_tables()? {
                        if table.regions.remove(&id) {
                            debug!(%region, table = %table.name, "region dropped from table");
                            self.store.put_table(&table)?;
                        }
                    }
                }
                self.checkpoints.delete_for_source(region).await?;
                self.trans.remove_source(region);
            }
        }
        Ok(())
    }
}

/// Shared settings for every aggregator the engine spawns.
#[derive(Clone)]
pub struct AggregatorContext {
    pub responses: ResponseTable,
    pub effects: SuccessEffects,
    pub inflight: InFlight,
    pub tick: Duration,
    pub timeout: Duration,
    pub shutdown: Shutdown,
}

#[derive(Default)]
struct Progress {
    succeeded: BTreeMap<String, Option<String>>,
    failed: BTreeMap<String, String>,
}

struct Shared {
    progress: Mutex<Progress>,
    notify: Notify,
    cancelled: AtomicBool,
}

impl Shared {
    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reporting side of an aggregator. Cheap to clone.
#[derive(Clone)]
pub struct AggregatorHandle {
    request_id: RequestId,
    kind: RequestKind,
    expected: Arc<BTreeSet<String>>,
    shared: Arc<Shared>,
    status: watch::Receiver<AggregatorStatus>,
}

impl fmt::Debug for AggregatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorHandle")
            .field("request_id", &self.request_id)
            .field("kind", &self.kind)
            .field("expected", &self.expected)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl AggregatorHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Region keys the aggregator waits for.
    pub fn expected(&self) -> &BTreeSet<String> {
        &self.expected
    }

    pub fn region_succeeded(&self, region: &str, detail: Option<String>) {
        let key = region_key(region);
        if !self.expected.contains(&key) {
            warn!(request_id = self.request_id, %region, "success reported for unexpected region");
            return;
        }
        self.shared.progress().succeeded.insert(key, detail);
        self.shared.notify.notify_one();
    }

    pub fn region_failed(&self, region: &str, cause: &str) {
        let key = region_key(region);
        if !self.expected.contains(&key) {
            warn!(request_id = self.request_id, %region, %cause, "failure reported for unexpected region");
            return;
        }
        warn!(request_id = self.request_id, %region, %cause, "region failed");
        self.shared.progress().failed.insert(key, cause.to_string());
        self.shared.notify.notify_one();
    }

    /// Stop the aggregator without posting.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    pub fn status(&self) -> AggregatorStatus {
        self.status.borrow().clone()
    }

    /// Wait until the aggregator stops and return how it ended.
    pub async fn wait(&self) -> AggregatorStatus {
        let mut rx = self.status.clone();
        match rx.wait_for(AggregatorStatus::is_terminal).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }
}

enum Verdict {
    Pending,
    Succeeded(usize),
    Failed(String),
}

pub struct Aggregator {
    request_id: RequestId,
    kind: RequestKind,
    expected: Arc<BTreeSet<String>>,
    completion: Completion,
    ctx: AggregatorContext,
    shared: Arc<Shared>,
    status_tx: watch::Sender<AggregatorStatus>,
}

impl Aggregator {
    /// Build an aggregator waiting for `regions`. Nothing runs until
    /// [`Aggregator::spawn`] or [`Aggregator::run`].
    pub fn new(
        request_id: RequestId,
        kind: RequestKind,
        regions: impl IntoIterator<Item = String>,
        completion: Completion,
        ctx: AggregatorContext,
    ) -> (Self, AggregatorHandle) {
        let expected: Arc<BTreeSet<String>> =
            Arc::new(regions.into_iter().map(|r| region_key(&r)).collect());
        let shared = Arc::new(Shared {
            progress: Mutex::new(Progress::default()),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        });
        let (status_tx, status_rx) = watch::channel(AggregatorStatus::Waiting);
        let handle = AggregatorHandle {
            request_id,
            kind,
            expected: expected.clone(),
            shared: shared.clone(),
            status: status_rx,
        };
        let aggregator = Self {
            request_id,
            kind,
            expected,
            completion,
            ctx,
            shared,
            status_tx,
        };
        (aggregator, handle)
    }

    pub fn spawn(self) -> JoinHandle<AggregatorStatus> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> AggregatorStatus {
        let request_id = self.request_id;
        let mut shutdown = self.ctx.shutdown.clone();
        let deadline = Instant::now() + self.ctx.timeout;
        debug!(request_id, kind = %self.kind, regions = ?self.expected, "aggregator started");

        let status = loop {
            if self.shared.cancelled.load(Ordering::SeqCst) || shutdown.is_triggered() {
                break AggregatorStatus::Cancelled;
            }

            match self.verdict() {
                Verdict::Failed(reason) => {
                    match self.ctx.responses.post_failure(request_id, self.kind, &reason) {
                        Ok(_) => break AggregatorStatus::Failed(reason),
                        Err(e) => warn!(request_id, error = %e, "posting failure, will retry"),
                    }
                }
                Verdict::Succeeded(regions) => match self.complete(regions).await {
                    Ok(status) => break status,
                    Err(e) => warn!(request_id, error = %e, "posting success, will retry"),
                },
                Verdict::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(request_id, timeout = ?self.ctx.timeout, "aggregator timed out, request left open");
                break AggregatorStatus::TimedOut;
            }

            let stopped = tokio::select! {
                _ = tokio::time::sleep(self.ctx.tick.min(deadline - now)) => false,
                _ = self.shared.notify.notified() => false,
                _ = shutdown.triggered() => true,
            };
            if stopped {
                break AggregatorStatus::Cancelled;
            }
        };

        self.ctx.inflight.remove(request_id);
        info!(request_id, kind = %self.kind, ?status, "aggregator finished");
        self.status_tx.send_replace(status.clone());
        status
    }

    fn verdict(&self) -> Verdict {
        let progress = self.shared.progress();
        if !progress.failed.is_empty() {
            let reason = progress
                .failed
                .iter()
                .map(|(region, cause)| format!("{region}: {cause}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Verdict::Failed(reason);
        }
        if self.expected.iter().all(|r| progress.succeeded.contains_key(r)) {
            return Verdict::Succeeded(self.expected.len());
        }
        Verdict::Pending
    }

    /// Apply side effects and post success. Side-effect failures that are
    /// not retryable are posted as the request's failure.
    async fn complete(&self, regions: usize) -> EngineResult<AggregatorStatus> {
        if let Err(e) = self.ctx.effects.apply(&self.completion).await {
            if let EngineError::Checkpoint(c) = &e {
                if c.is_cancelled() {
                    return Ok(AggregatorStatus::Cancelled);
                }
            }
            if is_retryable(&e) {
                return Err(e);
            }
            let reason = format!("completing request failed: {e}");
            self.ctx
                .responses
                .post_failure(self.request_id, self.kind, &reason)?;
            return Ok(AggregatorStatus::Failed(reason));
        }
        let detail = format!("{regions} region(s) succeeded");
        self.ctx
            .responses
            .post_success(self.request_id, self.kind, Some(detail))?;
        Ok(AggregatorStatus::Succeeded)
    }
}

fn is_retryable(e: &EngineError) -> bool {
    match e {
        EngineError::State(s) => s.is_transient() || s.is_not_found(),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use regionsync_checkpoint::{InitCheckpoint, RetryPolicy};
    use regionsync_core::{AgentIdentity, shutdown_channel};
    use regionsync_state::Outcome;
    use regionsync_xlate::RegionIdMapping;

    pub(crate) fn context(store: &StateStore, shutdown: Shutdown) -> AggregatorContext {
        let identity = AgentIdentity::new(1, 0).unwrap();
        let checkpoints = CheckpointStore::new(
            store.clone(),
            &identity.agent_id(),
            "us-east",
            RetryPolicy::default(),
            shutdown.clone(),
        );
        let trans = Arc::new(RegionIdTrans::new(RegionIdMapping::new(
            "us-east",
            Arc::new(store.clone()),
        )));
        AggregatorContext {
            responses: ResponseTable::new(store.clone(), identity),
            effects: SuccessEffects::new(store.clone(), checkpoints, trans),
            inflight: InFlight::new(),
            tick: Duration::from_secs(1),
            timeout: Duration::from_secs(600),
            shutdown,
        }
    }

    fn regions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn added(region: &str) -> Completion {
        Completion::RegionAdded {
            region: region.into(),
        }
    }

    fn outcome(store: &StateStore, id: RequestId) -> Option<Outcome> {
        store
            .get_response(id)
            .unwrap()
            .and_then(|r| r.outcomes.get(&0).map(|o| o.outcome.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_every_region_reports() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store, Shutdown::never());
        let (agg, handle) = Aggregator::new(1, RequestKind::AddRegion, regions(&["eu-west", "ap-south"]), added("eu-west"), ctx);
        let task = agg.spawn();

        handle.region_succeeded("EU-WEST", None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.status(), AggregatorStatus::Waiting);
        assert!(outcome(&store, 1).is_none());

        handle.region_succeeded("ap-south", None);
        assert_eq!(handle.wait().await, AggregatorStatus::Succeeded);
        assert_eq!(task.await.unwrap(), AggregatorStatus::Succeeded);
        assert!(outcome(&store, 1).unwrap().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn fails_fast_and_never_posts_success() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store, Shutdown::never());
        let (agg, handle) = Aggregator::new(2, RequestKind::CreateTable, regions(&["eu-west", "ap-south"]), added("x"), ctx);
        let task = agg.spawn();

        handle.region_failed("eu-west", "worker unreachable");
        handle.region_succeeded("ap-south", None);
        let status = task.await.unwrap();
        assert!(matches!(&status, AggregatorStatus::Failed(reason) if reason.contains("worker unreachable")));

        // A success arriving after the failure changes nothing.
        handle.region_succeeded("eu-west", None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(outcome(&store, 2), Some(Outcome::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_exits_without_posting() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store, Shutdown::never());
        let inflight = ctx.inflight.clone();
        let (agg, handle) = Aggregator::new(3, RequestKind::CreateTable, regions(&["eu-west"]), added("x"), ctx);
        assert!(inflight.try_insert(handle.clone()));

        let start = Instant::now();
        let status = agg.run().await;
        assert_eq!(status, AggregatorStatus::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(600));
        assert!(outcome(&store, 3).is_none());
        assert!(!inflight.contains(3));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wakes_and_exits_without_posting() {
        let store = StateStore::open_in_memory().unwrap();
        let (trigger, shutdown) = shutdown_channel();
        let ctx = context(&store, shutdown);
        let (agg, handle) = Aggregator::new(4, RequestKind::DropTable, regions(&["eu-west"]), added("x"), ctx);
        let task = agg.spawn();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let start = Instant::now();
        trigger.trigger();
        assert_eq!(task.await.unwrap(), AggregatorStatus::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.status(), AggregatorStatus::Cancelled);
        assert!(outcome(&store, 4).is_none());
    }

    #[tokio::test]
    async fn cancel_stops_one_aggregator() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store, Shutdown::never());
        let (agg, handle) = Aggregator::new(5, RequestKind::DropTable, regions(&["eu-west"]), added("x"), ctx);
        let task = agg.spawn();
        handle.cancel();
        assert_eq!(task.await.unwrap(), AggregatorStatus::Cancelled);
        assert!(outcome(&store, 5).is_none());
    }

    #[tokio::test]
    async fn no_regions_succeeds_immediately() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store, Shutdown::never());
        let table = TableMetadata::new("orders", 11, []);
        let (agg, _handle) = Aggregator::new(
            6,
            RequestKind::CreateTable,
            Vec::new(),
            Completion::UpsertTable {
                table: table.clone(),
                removed_sources: Vec::new(),
            },
            ctx,
        );
        assert_eq!(agg.run().await, AggregatorStatus::Succeeded);
        assert_eq!(store.get_table("orders").unwrap(), Some(table));
    }

    #[tokio::test]
    async fn drop_completion_clears_catalog_and_checkpoints() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store, Shutdown::never());
        let table = TableMetadata::new("orders", 11, [2]);
        store.put_table(&table).unwrap();
        let checkpoints = CheckpointStore::new(
            store.clone(),
            "agent-0-of-1",
            "us-east",
            RetryPolicy::default(),
            Shutdown::never(),
        );
        checkpoints
            .write(&InitCheckpoint::not_started("eu-west", &table, 91))
            .await
            .unwrap();

        let (agg, handle) = Aggregator::new(
            7,
            RequestKind::DropTable,
            regions(&["eu-west"]),
            Completion::DropTables {
                tables: vec!["orders".into()],
            },
            ctx,
        );
        handle.region_succeeded("eu-west", Some("stopped".into()));
        assert_eq!(agg.run().await, AggregatorStatus::Succeeded);
        assert!(store.get_table("orders").unwrap().is_none());
        assert!(checkpoints.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn region_removal_strips_catalog_and_checkpoints() {
        let store = StateStore::open_in_memory().unwrap();
        store.init_local_region("us-east").unwrap();
        let eu = store.register_region("eu-west").unwrap();
        let ap = store.register_region("ap-south").unwrap();
        let orders = TableMetadata::new("orders", 11, [eu, ap]);
        store.put_table(&orders).unwrap();
        store.put_table(&TableMetadata::new("users", 12, [eu])).unwrap();
        let ctx = context(&store, Shutdown::never());
        let checkpoints = CheckpointStore::new(
            store.clone(),
            "agent-0-of-1",
            "us-east",
            RetryPolicy::default(),
            Shutdown::never(),
        );
        checkpoints
            .write(&InitCheckpoint::not_started("ap-south", &orders, 91))
            .await
            .unwrap();

        let (agg, handle) = Aggregator::new(
            8,
            RequestKind::RemoveRegion,
            regions(&["ap-south"]),
            Completion::RegionRemoved {
                region: "AP-SOUTH".into(),
            },
            ctx,
        );
        handle.region_succeeded("ap-south", None);
        assert_eq!(agg.run().await, AggregatorStatus::Succeeded);

        let orders = store.get_table("orders").unwrap().unwrap();
        assert_eq!(orders.regions.iter().copied().collect::<Vec<_>>(), vec![eu]);
        assert_eq!(store.get_table("users").unwrap().unwrap().regions.len(), 1);
        assert!(checkpoints.list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_from_unrelated_region_is_ignored() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store, Shutdown::never());
        let (agg, handle) = Aggregator::new(9, RequestKind::UpdateTable, regions(&["ap-south"]), added("x"), ctx);
        let task = agg.spawn();

        handle.region_failed("eu-west", "mid-stream on another table");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.status(), AggregatorStatus::Waiting);

        handle.region_succeeded("ap-south", Some("removed".into()));
        assert_eq!(task.await.unwrap(), AggregatorStatus::Succeeded);
        assert!(outcome(&store, 9).unwrap().is_success());
    }
}
