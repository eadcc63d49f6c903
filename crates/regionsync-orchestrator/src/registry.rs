//! Worker registry: source region key → live worker.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use regionsync_core::region_key;
use regionsync_state::StreamKey;

use crate::error::{CompositeFailure, RegionFailure};
use crate::worker::{RegionWorker, WorkerState};

/// Read-only view of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub region: String,
    pub state: WorkerState,
    pub tables: BTreeSet<String>,
}

/// Shared so collaborators can read it; only the orchestrator mutates it.
/// A worker leaves the registry before it is asked to stop, so anything
/// still registered in a terminal state ended on its own.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    slots: Arc<RwLock<BTreeMap<String, Arc<dyn RegionWorker>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, region: &str) -> Option<Arc<dyn RegionWorker>> {
        let slots = self.slots.read().await;
        slots.get(&region_key(region)).cloned()
    }

    pub(crate) async fn insert(&self, worker: Arc<dyn RegionWorker>) {
        let key = region_key(worker.region());
        self.slots.write().await.insert(key, worker);
    }

    pub(crate) async fn take(&self, region: &str) -> Option<Arc<dyn RegionWorker>> {
        self.slots.write().await.remove(&region_key(region))
    }

    pub(crate) async fn drain(&self) -> Vec<Arc<dyn RegionWorker>> {
        let mut slots = self.slots.write().await;
        std::mem::take(&mut *slots).into_values().collect()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let slots = self.slots.read().await;
        slots
            .values()
            .map(|w| WorkerSnapshot {
                region: w.region().to_string(),
                state: w.state(),
                tables: w.tables(),
            })
            .collect()
    }

    /// Every (table, region) pair currently streaming.
    pub async fn streams(&self) -> BTreeSet<StreamKey> {
        let slots = self.slots.read().await;
        slots
            .values()
            .flat_map(|w| {
                let region = w.region().to_string();
                w.tables().into_iter().map(move |table| StreamKey {
                    table,
                    region: region.clone(),
                })
            })
            .collect()
    }

    /// Workers that ended without being asked to.
    pub async fn unexpected_failures(&self) -> CompositeFailure {
        let slots = self.slots.read().await;
        let failures = slots
            .values()
            .filter_map(|w| {
                let state = w.state();
                if !matches!(state, WorkerState::Failed | WorkerState::Stopped) {
                    return None;
                }
                Some(RegionFailure {
                    region: w.region().to_string(),
                    tables: w.tables().into_iter().collect(),
                    cause: w
                        .failure()
                        .unwrap_or_else(|| format!("worker {state} without being asked to")),
                })
            })
            .collect();
        CompositeFailure { failures }
    }
}
