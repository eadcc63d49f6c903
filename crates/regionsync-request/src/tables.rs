//! Typed access to the request and response tables.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use regionsync_core::{AgentIdentity, Shutdown};
use regionsync_state::{
    AgentOutcome, LifecycleRequest, Outcome, RequestId, RequestKind, RequestPayload,
    ResponseRecord, StateResult, StateStore, StreamKey, StreamingRecord, epoch_secs,
};

/// The append-only request table.
#[derive(Clone)]
pub struct RequestTable {
    store: StateStore,
}

impl RequestTable {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Store a new request under the next free id.
    pub fn submit(&self, payload: RequestPayload) -> StateResult<LifecycleRequest> {
        let request = self.store.submit_request(payload)?;
        info!(request_id = request.id, kind = %request.kind(), "request submitted");
        Ok(request)
    }

    pub fn get(&self, id: RequestId) -> StateResult<Option<LifecycleRequest>> {
        self.store.get_request(id)
    }

    pub fn scan(&self, after: Option<RequestId>, limit: usize) -> StateResult<Vec<LifecycleRequest>> {
        self.store.scan_requests(after, limit)
    }
}

/// This agent's view of the response table.
#[derive(Clone)]
pub struct ResponseTable {
    store: StateStore,
    identity: AgentIdentity,
}

impl ResponseTable {
    pub fn new(store: StateStore, identity: AgentIdentity) -> Self {
        Self { store, identity }
    }

    pub fn identity(&self) -> AgentIdentity {
        self.identity
    }

    /// Whether this agent's slot for `request_id` is already filled.
    pub fn answered_by_me(&self, request_id: RequestId) -> StateResult<bool> {
        Ok(self
            .store
            .get_response(request_id)?
            .is_some_and(|r| r.answered_by(self.identity.index())))
    }

    pub fn get(&self, request_id: RequestId) -> StateResult<Option<ResponseRecord>> {
        self.store.get_response(request_id)
    }

    pub fn post_success(
        &self,
        request_id: RequestId,
        kind: RequestKind,
        detail: Option<String>,
    ) -> StateResult<bool> {
        self.post(request_id, kind, Outcome::Succeeded { detail })
    }

    pub fn post_failure(&self, request_id: RequestId, kind: RequestKind, reason: &str) -> StateResult<bool> {
        self.post(
            request_id,
            kind,
            Outcome::Failed {
                reason: reason.to_string(),
            },
        )
    }

    fn post(&self, request_id: RequestId, kind: RequestKind, outcome: Outcome) -> StateResult<bool> {
        let success = outcome.is_success();
        let posted = self.store.post_outcome(
            request_id,
            self.identity.index(),
            AgentOutcome {
                kind,
                outcome,
                posted_at: epoch_secs(),
            },
        )?;
        if posted {
            info!(request_id, %kind, success, agent = %self.identity, "response posted");
        } else {
            debug!(request_id, agent = %self.identity, "response slot already filled");
        }
        Ok(posted)
    }

    /// Block until every agent of the group answered `request_id`.
    ///
    /// Returns `None` when `timeout` elapses or shutdown is triggered first.
    pub async fn wait_for_response(
        &self,
        request_id: RequestId,
        timeout: Duration,
        poll_interval: Duration,
        shutdown: &Shutdown,
    ) -> StateResult<Option<ResponseRecord>> {
        let mut shutdown = shutdown.clone();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(record) = self.store.get_response(request_id)? {
                if record.is_fully_answered(self.identity.group_size()) {
                    return Ok(Some(record));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if !shutdown.sleep(poll_interval.min(deadline - now)).await {
                return Ok(None);
            }
        }
    }

    /// Replace this agent's streaming record.
    pub fn publish_streaming(&self, streams: impl IntoIterator<Item = StreamKey>) -> StateResult<()> {
        let record = StreamingRecord {
            agent_index: self.identity.index(),
            streams: streams.into_iter().collect(),
            updated_at: epoch_secs(),
        };
        debug!(agent = %self.identity, streams = record.streams.len(), "streaming record published");
        self.store.put_streaming(&record)
    }

    /// Indices of the agents currently streaming `table` from `region`.
    pub fn streaming_agents(&self, table: &str, region: &str) -> StateResult<Vec<u32>> {
        Ok(self
            .store
            .list_streaming()?
            .into_iter()
            .filter(|r| r.streams(table, region))
            .map(|r| r.agent_index)
            .collect())
    }
}
