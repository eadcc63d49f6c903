//! Region name ↔ id resolution exposed by every store handle.

use regionsync_core::RegionId;

use crate::error::StateResult;
use crate::store::StateStore;

/// Read access to one store's region map.
///
/// Every region's store numbers regions independently; id 1 is always the
/// store's own region. Implementations may be remote and may fail with a
/// transient error at any call.
pub trait RegionResolver: Send + Sync {
    fn region_name(&self, id: RegionId) -> StateResult<Option<String>>;

    /// Case-insensitive lookup.
    fn region_id(&self, name: &str) -> StateResult<Option<RegionId>>;

    /// Every (id, name) pair the store knows.
    fn known_regions(&self) -> StateResult<Vec<(RegionId, String)>>;

    /// Monotonic counter that moves whenever the map changes.
    fn sequence(&self) -> StateResult<u64>;
}

impl RegionResolver for StateStore {
    fn region_name(&self, id: RegionId) -> StateResult<Option<String>> {
        StateStore::region_name(self, id)
    }

    fn region_id(&self, name: &str) -> StateResult<Option<RegionId>> {
        StateStore::region_id(self, name)
    }

    fn known_regions(&self) -> StateResult<Vec<(RegionId, String)>> {
        self.list_regions()
    }

    fn sequence(&self) -> StateResult<u64> {
        self.region_seq()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn store_resolves_through_trait_object() {
        let store = StateStore::open_in_memory().unwrap();
        store.init_local_region("us-east").unwrap();
        store.register_region("eu-west").unwrap();

        let resolver: Arc<dyn RegionResolver> = Arc::new(store);
        assert_eq!(resolver.region_id("Eu-West").unwrap(), Some(2));
        assert_eq!(resolver.region_name(1).unwrap().as_deref(), Some("us-east"));
        assert_eq!(resolver.known_regions().unwrap().len(), 2);
        assert_eq!(resolver.sequence().unwrap(), 2);
    }
}
