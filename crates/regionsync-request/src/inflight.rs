//! Registry of live aggregators, one per request id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use regionsync_state::RequestId;

use crate::aggregator::AggregatorHandle;

#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<Mutex<HashMap<RequestId, AggregatorHandle>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.lock().contains_key(&request_id)
    }

    /// Register `handle` unless its request already has a live aggregator.
    pub fn try_insert(&self, handle: AggregatorHandle) -> bool {
        let mut map = self.lock();
        if map.contains_key(&handle.request_id()) {
            return false;
        }
        map.insert(handle.request_id(), handle);
        true
    }

    pub fn get(&self, request_id: RequestId) -> Option<AggregatorHandle> {
        self.lock().get(&request_id).cloned()
    }

    pub fn remove(&self, request_id: RequestId) -> Option<AggregatorHandle> {
        self.lock().remove(&request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wake every aggregator and make it exit without posting.
    pub fn cancel_all(&self) {
        for handle in self.lock().values() {
            handle.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, AggregatorHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
