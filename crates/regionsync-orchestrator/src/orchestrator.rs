//! The serialized lifecycle loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use regionsync_core::config::Timing;
use regionsync_core::{Region, Shutdown, ShutdownTrigger, region_key};
use regionsync_request::{
    AgentRequest, AggregatorHandle, AggregatorStatus, Dequeue, RegionTask, RequestReceiver,
    ResponseTable, TableAction,
};
use regionsync_state::{RequestId, RequestKind};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::registry::WorkerRegistry;
use crate::worker::{RegionWorker, WorkerFactory, WorkerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub dequeue_wait: Duration,
    pub worker_ready_timeout: Duration,
    /// How often a starting worker's state is polled.
    pub ready_poll: Duration,
}

impl OrchestratorConfig {
    pub fn from_timing(timing: &Timing) -> Self {
        Self {
            dequeue_wait: timing.dequeue_wait,
            worker_ready_timeout: timing.worker_ready_timeout,
            ready_poll: Duration::from_millis(100),
        }
    }
}

/// Why the loop ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The shutdown signal fired.
    Shutdown,
    /// A Shutdown request was processed and answered.
    ShutdownRequested(RequestId),
    /// The request engine went away.
    QueueClosed,
}

pub struct Orchestrator {
    regions: BTreeMap<String, Region>,
    factory: Arc<dyn WorkerFactory>,
    registry: WorkerRegistry,
    responses: ResponseTable,
    receiver: RequestReceiver,
    config: OrchestratorConfig,
    shutdown: Shutdown,
    trigger: ShutdownTrigger,
}

impl Orchestrator {
    pub fn new(
        regions: &[Region],
        factory: Arc<dyn WorkerFactory>,
        responses: ResponseTable,
        receiver: RequestReceiver,
        config: OrchestratorConfig,
        trigger: ShutdownTrigger,
    ) -> Self {
        Self {
            regions: regions.iter().map(|r| (r.key(), r.clone())).collect(),
            factory,
            registry: WorkerRegistry::new(),
            responses,
            receiver,
            config,
            shutdown: trigger.subscribe(),
            trigger,
        }
    }

    pub fn registry(&self) -> WorkerRegistry {
        self.registry.clone()
    }

    /// Drain the queue until shutdown. Unexpected worker termination stops
    /// every worker and returns [`OrchestratorError::Composite`].
    pub async fn run(mut self) -> OrchestratorResult<RunOutcome> {
        info!(regions = self.regions.len(), "orchestrator started");
        let mut shutdown = self.shutdown.clone();

        let outcome = loop {
            if shutdown.is_triggered() {
                break Ok(RunOutcome::Shutdown);
            }

            let next = tokio::select! {
                next = self.receiver.dequeue(self.config.dequeue_wait) => Some(next),
                _ = shutdown.triggered() => None,
            };
            match next {
                None => break Ok(RunOutcome::Shutdown),
                Some(Dequeue::Request(AgentRequest::Shutdown { request_id })) => {
                    break self.shutdown_requested(request_id).await;
                }
                Some(Dequeue::Request(request)) => self.process(request).await,
                Some(Dequeue::Idle) => {}
                Some(Dequeue::Closed) => break Ok(RunOutcome::QueueClosed),
            }

            let failed = self.registry.unexpected_failures().await;
            if !failed.is_empty() {
                error!(%failed, "source region worker terminated unexpectedly");
                break Err(OrchestratorError::Composite(failed));
            }
        };

        self.stop_all().await;
        info!(?outcome, "orchestrator stopped");
        outcome
    }

    /// Handle one non-shutdown request to completion.
    pub async fn process(&mut self, request: AgentRequest) {
        let request_id = request.request_id();
        let kind = request.kind();
        debug!(request_id, %kind, "processing request");

        match request {
            AgentRequest::Table { tasks, aggregator, .. } => {
                self.process_tables(tasks, &aggregator).await;
            }
            AgentRequest::AddRegion { region, aggregator, .. } => {
                match self.ensure_worker(&region).await {
                    Ok(_) => aggregator.region_succeeded(&region, Some("worker running".into())),
                    Err(cause) => aggregator.region_failed(&region, &cause),
                }
                self.await_aggregator(&aggregator).await;
            }
            AgentRequest::RemoveRegion { region, aggregator, .. } => {
                self.stop_worker(&region).await;
                aggregator.region_succeeded(&region, Some("worker stopped".into()));
                self.await_aggregator(&aggregator).await;
            }
            AgentRequest::Shutdown { .. } => {}
        }

        self.publish_streaming().await;
    }

    /// Bring back the workers a previous run left streaming, before any
    /// request is served. Failures are logged per region; returns how many
    /// regions came back.
    pub async fn restore(&mut self, tasks: Vec<RegionTask>) -> usize {
        let mut restored = 0;
        for task in tasks {
            let worker = match self.ensure_worker(&task.region).await {
                Ok(worker) => worker,
                Err(cause) => {
                    warn!(region = %task.region, %cause, "could not restore source region");
                    continue;
                }
            };
            match worker.add_tables(&task.tables).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(region = %task.region, error = %e, "could not restore tables"),
            }
        }
        self.publish_streaming().await;
        info!(restored, "source regions restored");
        restored
    }

    async fn process_tables(&mut self, tasks: Vec<RegionTask>, aggregator: &AggregatorHandle) {
        let mut relays = JoinSet::new();
        for task in tasks {
            let worker = match task.action {
                TableAction::Remove => match self.registry.get(&task.region).await {
                    Some(worker) => worker,
                    None => {
                        aggregator.region_succeeded(&task.region, Some("not streaming".into()));
                        continue;
                    }
                },
                TableAction::Add | TableAction::Evolve => match self.ensure_worker(&task.region).await {
                    Ok(worker) => worker,
                    Err(cause) => {
                        aggregator.region_failed(&task.region, &cause);
                        continue;
                    }
                },
            };
            let aggregator = aggregator.clone();
            relays.spawn(relay(worker, task, aggregator));
        }

        self.await_aggregator(aggregator).await;
        if !relays.is_empty() {
            // Relays still running belong to a request that timed out or
            // was cancelled; do not let them outlive it.
            relays.abort_all();
            while relays.join_next().await.is_some() {}
        }
    }

    /// Block until the aggregator finishes or shutdown fires.
    async fn await_aggregator(&self, aggregator: &AggregatorHandle) -> AggregatorStatus {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            status = aggregator.wait() => {
                if status == AggregatorStatus::TimedOut {
                    warn!(request_id = aggregator.request_id(), "request timed out, continuing");
                }
                status
            }
            _ = shutdown.triggered() => AggregatorStatus::Cancelled,
        }
    }

    /// Return the live worker for `region`, creating it and waiting for it
    /// to become ready if needed.
    async fn ensure_worker(&mut self, region: &str) -> Result<Arc<dyn RegionWorker>, String> {
        if let Some(worker) = self.registry.get(region).await {
            match worker.state() {
                WorkerState::Starting | WorkerState::Ready => return Ok(worker),
                state => {
                    return Err(format!("worker for {region} is {state}"));
                }
            }
        }

        let Some(config) = self.regions.get(&region_key(region)) else {
            return Err(format!("region {region} is not configured"));
        };
        let worker = self
            .factory
            .create(config)
            .await
            .map_err(|e| format!("starting worker for {region}: {e}"))?;

        if let Err(cause) = self.wait_ready(worker.as_ref()).await {
            worker.shutdown().await;
            return Err(cause);
        }
        self.registry.insert(worker.clone()).await;
        info!(%region, "source region worker started");
        Ok(worker)
    }

    async fn wait_ready(&self, worker: &dyn RegionWorker) -> Result<(), String> {
        let mut shutdown = self.shutdown.clone();
        let deadline = Instant::now() + self.config.worker_ready_timeout;
        loop {
            match worker.state() {
                WorkerState::Ready => return Ok(()),
                WorkerState::Starting => {}
                state => {
                    let cause = worker.failure().unwrap_or_else(|| state.to_string());
                    return Err(format!("worker for {} failed to start: {cause}", worker.region()));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(format!(
                    "worker for {} not ready within {:?}",
                    worker.region(),
                    self.config.worker_ready_timeout
                ));
            }
            if !shutdown.sleep(self.config.ready_poll.min(deadline - now)).await {
                return Err("shutting down".to_string());
            }
        }
    }

    async fn stop_worker(&mut self, region: &str) {
        if let Some(worker) = self.registry.take(region).await {
            worker.shutdown().await;
            info!(%region, "source region worker stopped");
        }
    }

    async fn stop_all(&mut self) {
        for worker in self.registry.drain().await {
            worker.shutdown().await;
            debug!(region = %worker.region(), "source region worker stopped");
        }
    }

    async fn shutdown_requested(&mut self, request_id: RequestId) -> OrchestratorResult<RunOutcome> {
        info!(request_id, "shutdown requested");
        self.stop_all().await;
        self.publish_streaming().await;
        self.responses
            .post_success(request_id, RequestKind::Shutdown, Some("agent stopped".into()))?;
        self.trigger.trigger();
        Ok(RunOutcome::ShutdownRequested(request_id))
    }

    async fn publish_streaming(&self) {
        let streams = self.registry.streams().await;
        if let Err(e) = self.responses.publish_streaming(streams) {
            warn!(error = %e, "failed to publish streaming record");
        }
    }
}

async fn relay(worker: Arc<dyn RegionWorker>, task: RegionTask, aggregator: AggregatorHandle) {
    let result = match task.action {
        TableAction::Add => worker.add_tables(&task.tables).await,
        TableAction::Remove => worker.remove_tables(&task.tables).await,
        TableAction::Evolve => worker.evolve_tables(&task.tables).await,
    };
    match result {
        Ok(()) => aggregator.region_succeeded(&task.region, None),
        Err(e) => aggregator.region_failed(&task.region, &e.to_string()),
    }
}
