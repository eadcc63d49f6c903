//! Bounded internal queue between the engine and the orchestrator.
//!
//! Submission never blocks: a full queue is reported back so the engine
//! can leave the request for its next poll.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use regionsync_state::{RequestId, RequestKind};

use crate::aggregator::AggregatorHandle;
use crate::error::{EngineError, EngineResult};
use crate::plan::RegionTask;

/// Work for the orchestrator.
#[derive(Debug)]
pub enum AgentRequest {
    Table {
        request_id: RequestId,
        kind: RequestKind,
        tasks: Vec<RegionTask>,
        aggregator: AggregatorHandle,
    },
    AddRegion {
        request_id: RequestId,
        region: String,
        aggregator: AggregatorHandle,
    },
    RemoveRegion {
        request_id: RequestId,
        region: String,
        aggregator: AggregatorHandle,
    },
    Shutdown {
        request_id: RequestId,
    },
}

impl AgentRequest {
    pub fn request_id(&self) -> RequestId {
        match self {
            AgentRequest::Table { request_id, .. }
            | AgentRequest::AddRegion { request_id, .. }
            | AgentRequest::RemoveRegion { request_id, .. }
            | AgentRequest::Shutdown { request_id } => *request_id,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            AgentRequest::Table { kind, .. } => *kind,
            AgentRequest::AddRegion { .. } => RequestKind::AddRegion,
            AgentRequest::RemoveRegion { .. } => RequestKind::RemoveRegion,
            AgentRequest::Shutdown { .. } => RequestKind::Shutdown,
        }
    }
}

#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::Sender<AgentRequest>,
}

pub struct RequestReceiver {
    rx: mpsc::Receiver<AgentRequest>,
}

/// Result of one bounded dequeue.
#[derive(Debug)]
pub enum Dequeue {
    Request(AgentRequest),
    /// Nothing arrived within the wait.
    Idle,
    /// Every sender is gone.
    Closed,
}

pub fn request_queue(capacity: usize) -> (RequestQueue, RequestReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RequestQueue { tx }, RequestReceiver { rx })
}

impl RequestQueue {
    /// Enqueue without waiting. Callers retry later on [`EngineError::QueueFull`].
    pub fn submit(&self, request: AgentRequest) -> EngineResult<()> {
        self.tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => EngineError::QueueFull,
            TrySendError::Closed(_) => EngineError::QueueClosed,
        })
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

impl RequestReceiver {
    pub async fn dequeue(&mut self, wait: Duration) -> Dequeue {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(request)) => Dequeue::Request(request),
            Ok(None) => Dequeue::Closed,
            Err(_) => Dequeue::Idle,
        }
    }

    /// Take a request if one is already waiting.
    pub fn try_dequeue(&mut self) -> Option<AgentRequest> {
        self.rx.try_recv().ok()
    }
}
