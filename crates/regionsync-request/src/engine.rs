//! The request poller.
//!
//! One task polls the request table in bounded pages, starting from a low
//! water mark below which every request is already answered by this agent.
//! Transient read failures back off with jitter; everything else that goes
//! wrong while planning a request is fatal to the agent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use regionsync_checkpoint::CheckpointStore;
use regionsync_core::config::Timing;
use regionsync_core::{AgentIdentity, Backoff, ProtocolVersion, Region, Shutdown};
use regionsync_state::{LifecycleRequest, RequestId, StateStore};
use regionsync_xlate::RegionIdTrans;

use crate::aggregator::{Aggregator, AggregatorContext, SuccessEffects};
use crate::error::{EngineError, EngineResult};
use crate::inflight::InFlight;
use crate::negotiate::{NegotiatedVersion, negotiate};
use crate::plan::{Planned, Work, plan_request};
use crate::queue::{AgentRequest, RequestQueue};
use crate::tables::{RequestTable, ResponseTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// Requests read per cursor page.
    pub page_size: usize,
    pub aggregator_tick: Duration,
    pub aggregator_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl EngineConfig {
    pub fn from_timing(timing: &Timing) -> Self {
        Self {
            poll_interval: timing.poll_interval,
            page_size: 100,
            aggregator_tick: timing.aggregator_tick,
            aggregator_timeout: timing.aggregator_timeout,
            backoff_initial: timing.backoff_initial,
            backoff_max: timing.backoff_max,
        }
    }
}

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub accepted: Vec<RequestId>,
    pub rejected: Vec<RequestId>,
    pub skipped_answered: usize,
    pub skipped_in_flight: usize,
    /// Request left for the next poll because the queue was full.
    pub deferred: Option<RequestId>,
    pub shutdown_requested: Option<RequestId>,
}

enum Handled {
    Answered,
    InFlight,
    Accepted,
    Rejected,
    Deferred,
    Shutdown,
}

pub struct RequestEngine {
    store: StateStore,
    identity: AgentIdentity,
    requests: RequestTable,
    responses: ResponseTable,
    trans: Arc<RegionIdTrans>,
    sources: BTreeMap<String, String>,
    queue: RequestQueue,
    inflight: InFlight,
    effects: SuccessEffects,
    config: EngineConfig,
    version: ProtocolVersion,
    shutdown: Shutdown,
    low_water: Option<RequestId>,
}

impl RequestEngine {
    pub fn new(
        store: StateStore,
        identity: AgentIdentity,
        trans: Arc<RegionIdTrans>,
        checkpoints: CheckpointStore,
        queue: RequestQueue,
        config: EngineConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            requests: RequestTable::new(store.clone()),
            responses: ResponseTable::new(store.clone(), identity),
            effects: SuccessEffects::new(store.clone(), checkpoints, trans.clone()),
            store,
            identity,
            trans,
            sources: BTreeMap::new(),
            queue,
            inflight: InFlight::new(),
            config,
            version: ProtocolVersion::current(),
            shutdown,
            low_water: None,
        }
    }

    /// Source regions requests may name.
    pub fn with_sources<'a>(mut self, regions: impl IntoIterator<Item = &'a Region>) -> Self {
        self.sources = regions
            .into_iter()
            .map(|r| (r.key(), r.name().to_string()))
            .collect();
        self
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    pub fn responses(&self) -> &ResponseTable {
        &self.responses
    }

    pub fn negotiate(&self) -> EngineResult<NegotiatedVersion> {
        negotiate(&self.store, self.identity, &self.version)
    }

    /// Poll until shutdown, a Shutdown request, or a fatal error.
    pub async fn run(mut self) -> EngineResult<()> {
        self.negotiate()?;

        let mut shutdown = self.shutdown.clone();
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        info!(agent = %self.identity, interval = ?self.config.poll_interval, "request engine started");

        let result = loop {
            if shutdown.is_triggered() {
                break Ok(());
            }
            let delay = match self.poll_once() {
                Ok(summary) => {
                    backoff.reset();
                    if let Some(request_id) = summary.shutdown_requested {
                        info!(request_id, "shutdown request accepted, engine stopping");
                        break Ok(());
                    }
                    self.config.poll_interval
                }
                Err(e) if is_transient(&e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, ?delay, "request poll failed, backing off");
                    delay
                }
                Err(e) => {
                    error!(error = %e, "request engine stopping on fatal error");
                    break Err(e);
                }
            };
            if !shutdown.sleep(delay).await {
                break Ok(());
            }
        };

        self.inflight.cancel_all();
        info!(agent = %self.identity, "request engine stopped");
        result
    }

    /// Read every request above the low water mark once.
    pub fn poll_once(&mut self) -> EngineResult<PollSummary> {
        let mut summary = PollSummary::default();
        let mut cursor = self.low_water;
        let mut contiguous = true;

        loop {
            let page = self.requests.scan(cursor, self.config.page_size)?;
            let full_page = page.len() >= self.config.page_size;
            for request in &page {
                cursor = Some(request.id);
                let handled = self.handle(request, &mut summary)?;
                match handled {
                    Handled::Answered | Handled::Rejected => {
                        if contiguous {
                            self.low_water = Some(request.id);
                        }
                    }
                    Handled::InFlight | Handled::Accepted => contiguous = false,
                    Handled::Deferred => {
                        summary.deferred = Some(request.id);
                        return Ok(summary);
                    }
                    Handled::Shutdown => {
                        summary.shutdown_requested = Some(request.id);
                        return Ok(summary);
                    }
                }
            }
            if !full_page {
                break;
            }
        }

        debug!(
            accepted = summary.accepted.len(),
            answered = summary.skipped_answered,
            in_flight = summary.skipped_in_flight,
            low_water = ?self.low_water,
            "poll complete"
        );
        Ok(summary)
    }

    fn handle(&mut self, request: &LifecycleRequest, summary: &mut PollSummary) -> EngineResult<Handled> {
        let request_id = request.id;
        if self.responses.answered_by_me(request_id)? {
            summary.skipped_answered += 1;
            return Ok(Handled::Answered);
        }
        if self.inflight.contains(request_id) {
            summary.skipped_in_flight += 1;
            return Ok(Handled::InFlight);
        }

        let plan = match plan_request(request, &self.store, self.trans.local(), &self.sources)? {
            Planned::Work(plan) => plan,
            Planned::Rejected(reason) => {
                warn!(request_id, kind = %request.kind(), %reason, "request rejected");
                self.responses.post_failure(request_id, request.kind(), &reason)?;
                summary.rejected.push(request_id);
                return Ok(Handled::Rejected);
            }
            Planned::Shutdown => {
                return match self.queue.submit(AgentRequest::Shutdown { request_id }) {
                    Ok(()) => Ok(Handled::Shutdown),
                    Err(EngineError::QueueFull) => Ok(Handled::Deferred),
                    Err(e) => Err(e),
                };
            }
        };

        let (aggregator, handle) = Aggregator::new(
            request_id,
            plan.kind,
            plan.expected_regions(),
            plan.completion.clone(),
            self.aggregator_context(),
        );
        if !self.inflight.try_insert(handle.clone()) {
            summary.skipped_in_flight += 1;
            return Ok(Handled::InFlight);
        }

        let agent_request = match plan.work {
            Work::Tables(tasks) if tasks.is_empty() => None,
            Work::Tables(tasks) => Some(AgentRequest::Table {
                request_id,
                kind: plan.kind,
                tasks,
                aggregator: handle,
            }),
            Work::AddRegion(region) => Some(AgentRequest::AddRegion {
                request_id,
                region,
                aggregator: handle,
            }),
            Work::RemoveRegion(region) => Some(AgentRequest::RemoveRegion {
                request_id,
                region,
                aggregator: handle,
            }),
        };
        if let Some(agent_request) = agent_request {
            if let Err(e) = self.queue.submit(agent_request) {
                self.inflight.remove(request_id);
                return match e {
                    EngineError::QueueFull => {
                        debug!(request_id, "queue full, request deferred");
                        Ok(Handled::Deferred)
                    }
                    other => Err(other),
                };
            }
        }

        aggregator.spawn();
        info!(request_id, kind = %plan.kind, "request accepted");
        summary.accepted.push(request_id);
        Ok(Handled::Accepted)
    }

    fn aggregator_context(&self) -> AggregatorContext {
        AggregatorContext {
            responses: self.responses.clone(),
            effects: self.effects.clone(),
            inflight: self.inflight.clone(),
            tick: self.config.aggregator_tick,
            timeout: self.config.aggregator_timeout,
            shutdown: self.shutdown.clone(),
        }
    }
}

fn is_transient(e: &EngineError) -> bool {
    match e {
        EngineError::State(s) => s.is_transient() || s.is_not_found(),
        EngineError::Xlate(x) => !x.is_fatal(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regionsync_checkpoint::RetryPolicy;
    use regionsync_core::RegionId;
    use regionsync_state::{Outcome, RequestPayload, TableMetadata};
    use regionsync_xlate::RegionIdMapping;

    use crate::aggregator::AggregatorStatus;
    use crate::plan::TableAction;
    use crate::queue::{RequestReceiver, request_queue};

    struct Harness {
        store: StateStore,
        engine: RequestEngine,
        rx: RequestReceiver,
        requests: RequestTable,
        eu: RegionId,
        ap: RegionId,
    }

    fn harness(capacity: usize) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        store.init_local_region("us-east").unwrap();
        let eu = store.register_region("eu-west").unwrap();
        let ap = store.register_region("ap-south").unwrap();

        let identity = AgentIdentity::new(1, 0).unwrap();
        let trans = Arc::new(RegionIdTrans::new(RegionIdMapping::new(
            "us-east",
            Arc::new(store.clone()),
        )));
        let checkpoints = CheckpointStore::new(
            store.clone(),
            &identity.agent_id(),
            "us-east",
            RetryPolicy::default(),
            Shutdown::never(),
        );
        let (queue, rx) = request_queue(capacity);
        let config = EngineConfig {
            poll_interval: Duration::from_secs(1),
            page_size: 2,
            aggregator_tick: Duration::from_secs(1),
            aggregator_timeout: Duration::from_secs(600),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        };
        let regions = [
            Region::new("eu-west", "eu.redb", Vec::<String>::new()),
            Region::new("ap-south", "ap.redb", Vec::<String>::new()),
        ];
        let engine = RequestEngine::new(
            store.clone(),
            identity,
            trans,
            checkpoints,
            queue,
            config,
            Shutdown::never(),
        )
        .with_sources(&regions);
        Harness {
            requests: RequestTable::new(store.clone()),
            store,
            engine,
            rx,
            eu,
            ap,
        }
    }

    fn my_outcome(store: &StateStore, id: RequestId) -> Option<Outcome> {
        store
            .get_response(id)
            .unwrap()
            .and_then(|r| r.outcomes.get(&0).map(|o| o.outcome.clone()))
    }

    #[tokio::test]
    async fn answered_request_is_never_replayed() {
        let mut h = harness(8);
        let req = h
            .requests
            .submit(RequestPayload::AddRegion {
                region: "eu-west".into(),
            })
            .unwrap();

        let first = h.engine.poll_once().unwrap();
        assert_eq!(first.accepted, vec![req.id]);
        let Some(AgentRequest::AddRegion { aggregator, .. }) = h.rx.try_dequeue() else {
            panic!("expected an add-region request");
        };
        aggregator.region_succeeded("eu-west", None);
        assert_eq!(aggregator.wait().await, AggregatorStatus::Succeeded);

        let second = h.engine.poll_once().unwrap();
        assert!(second.accepted.is_empty());
        assert!(h.rx.try_dequeue().is_none());

        // Re-posting the same id does not re-trigger side effects either.
        h.store.put_request(&req).unwrap();
        let third = h.engine.poll_once().unwrap();
        assert!(third.accepted.is_empty());
        assert!(h.rx.try_dequeue().is_none());
        assert!(my_outcome(&h.store, req.id).unwrap().is_success());
    }

    #[tokio::test]
    async fn in_flight_request_is_not_accepted_twice() {
        let mut h = harness(8);
        let table = TableMetadata::new("orders", 11, [h.eu]);
        let req = h.requests.submit(RequestPayload::CreateTable { table }).unwrap();

        assert_eq!(h.engine.poll_once().unwrap().accepted, vec![req.id]);
        let second = h.engine.poll_once().unwrap();
        assert!(second.accepted.is_empty());
        assert_eq!(second.skipped_in_flight, 1);
        assert_eq!(h.engine.inflight().len(), 1);

        assert!(h.rx.try_dequeue().is_some());
        assert!(h.rx.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn update_dropping_region_waits_only_for_that_region() {
        let mut h = harness(8);
        h.store
            .put_table(&TableMetadata::new("orders", 11, [h.eu, h.ap]))
            .unwrap();
        let req = h
            .requests
            .submit(RequestPayload::UpdateTable {
                table: TableMetadata::new("orders", 11, [h.eu]),
            })
            .unwrap();
        h.engine.poll_once().unwrap();

        let Some(AgentRequest::Table { tasks, aggregator, .. }) = h.rx.try_dequeue() else {
            panic!("expected a table request");
        };
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].region, "ap-south");
        assert_eq!(tasks[0].action, TableAction::Remove);

        aggregator.region_succeeded("ap-south", None);
        assert_eq!(aggregator.wait().await, AggregatorStatus::Succeeded);
        assert!(my_outcome(&h.store, req.id).unwrap().is_success());
        let stored = h.store.get_table("orders").unwrap().unwrap();
        assert_eq!(stored.regions.into_iter().collect::<Vec<_>>(), vec![h.eu]);
    }

    #[tokio::test]
    async fn full_queue_defers_without_losing_the_request() {
        let mut h = harness(1);
        let a = h
            .requests
            .submit(RequestPayload::AddRegion {
                region: "eu-west".into(),
            })
            .unwrap();
        let b = h
            .requests
            .submit(RequestPayload::AddRegion {
                region: "ap-south".into(),
            })
            .unwrap();

        let first = h.engine.poll_once().unwrap();
        assert_eq!(first.accepted, vec![a.id]);
        assert_eq!(first.deferred, Some(b.id));
        assert!(!h.engine.inflight().contains(b.id));

        assert!(h.rx.try_dequeue().is_some());
        let second = h.engine.poll_once().unwrap();
        assert_eq!(second.accepted, vec![b.id]);
    }

    #[tokio::test]
    async fn rejected_request_posts_failure_and_advances() {
        let mut h = harness(8);
        let bad = h
            .requests
            .submit(RequestPayload::CreateChildTable {
                table: TableMetadata::new("order_lines", 12, []).with_parent("missing"),
            })
            .unwrap();
        let summary = h.engine.poll_once().unwrap();
        assert_eq!(summary.rejected, vec![bad.id]);
        assert!(matches!(my_outcome(&h.store, bad.id), Some(Outcome::Failed { .. })));
        assert_eq!(h.engine.low_water, Some(bad.id));
    }

    #[tokio::test]
    async fn cursor_pages_through_many_requests() {
        let mut h = harness(16);
        for _ in 0..5 {
            h.requests
                .submit(RequestPayload::RemoveRegion {
                    region: "ap-south".into(),
                })
                .unwrap();
        }
        let summary = h.engine.poll_once().unwrap();
        assert_eq!(summary.accepted.len(), 5);
        assert_eq!(h.engine.low_water, None);
    }

    #[tokio::test]
    async fn shutdown_request_stops_the_poll() {
        let mut h = harness(8);
        let stop = h.requests.submit(RequestPayload::Shutdown).unwrap();
        h.requests
            .submit(RequestPayload::AddRegion {
                region: "eu-west".into(),
            })
            .unwrap();
        let summary = h.engine.poll_once().unwrap();
        assert_eq!(summary.shutdown_requested, Some(stop.id));
        assert!(summary.accepted.is_empty());
        assert!(matches!(h.rx.try_dequeue(), Some(AgentRequest::Shutdown { .. })));
    }

    #[tokio::test]
    async fn add_region_outside_config_is_fatal() {
        let mut h = harness(8);
        let bad = h
            .requests
            .submit(RequestPayload::AddRegion {
                region: "mars-1".into(),
            })
            .unwrap();
        let err = h.engine.poll_once().unwrap_err();
        assert!(err.is_misconfiguration());
        assert!(my_outcome(&h.store, bad.id).is_none());
        assert!(h.rx.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn unconfigured_table_region_is_fatal() {
        let mut h = harness(8);
        let rogue = h.store.register_region("af-south").unwrap();
        h.requests
            .submit(RequestPayload::CreateTable {
                table: TableMetadata::new("orders", 11, [rogue]),
            })
            .unwrap();
        let err = h.engine.poll_once().unwrap_err();
        assert!(err.is_misconfiguration());
        assert!(!is_transient(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_on_shutdown_request() {
        let h = harness(8);
        h.requests.submit(RequestPayload::Shutdown).unwrap();
        h.engine.run().await.unwrap();
    }
}
