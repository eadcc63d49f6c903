//! Cached view of one store's region map.
//!
//! Lookups hit an in-memory map first. On a miss the whole map is reloaded
//! once (if the resolver's sequence moved) and the lookup retried before the
//! id or name is declared unknown.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use regionsync_core::{RegionId, region_key};
use regionsync_state::RegionResolver;

use crate::error::{XlateError, XlateResult};

#[derive(Default)]
struct Cache {
    by_id: HashMap<RegionId, String>,
    /// Lower-cased name → id.
    by_name: HashMap<String, RegionId>,
    /// Resolver sequence the cache was loaded at; `None` until first load.
    seq: Option<u64>,
}

/// Name ↔ id cache for one region's store.
pub struct RegionIdMapping {
    region: String,
    resolver: Arc<dyn RegionResolver>,
    cache: RwLock<Cache>,
}

impl RegionIdMapping {
    /// Create a mapping for `region`'s store. Nothing is loaded yet.
    pub fn new(region: &str, resolver: Arc<dyn RegionResolver>) -> Self {
        Self {
            region: region.to_string(),
            resolver,
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Name of the region whose store this maps.
    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn resolver(&self) -> &Arc<dyn RegionResolver> {
        &self.resolver
    }

    /// Whether the map has been loaded at least once.
    pub fn is_loaded(&self) -> bool {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .seq
            .is_some()
    }

    /// Reload the map if the resolver's sequence moved since the last load.
    pub fn refresh(&self) -> XlateResult<()> {
        let seq = self.resolver.sequence()?;
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if cache.seq == Some(seq) {
                return Ok(());
            }
        }

        let regions = self.resolver.known_regions()?;
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.by_id.clear();
        cache.by_name.clear();
        for (id, name) in regions {
            cache.by_name.insert(region_key(&name), id);
            cache.by_id.insert(id, name);
        }
        cache.seq = Some(seq);
        debug!(region = %self.region, seq, entries = cache.by_id.len(), "region map refreshed");
        Ok(())
    }

    /// Region name for `id`, refreshing once on a miss.
    pub fn name_for(&self, id: RegionId) -> XlateResult<Option<String>> {
        if id == regionsync_core::UNKNOWN_REGION_ID {
            return Err(XlateError::ReservedId);
        }
        if let Some(name) = self.cached_name(id) {
            return Ok(Some(name));
        }
        self.refresh()?;
        Ok(self.cached_name(id))
    }

    /// Region id for `name` (case-insensitive), refreshing once on a miss.
    pub fn id_for(&self, name: &str) -> XlateResult<Option<RegionId>> {
        let key = region_key(name);
        if let Some(id) = self.cached_id(&key) {
            return Ok(Some(id));
        }
        self.refresh()?;
        Ok(self.cached_id(&key))
    }

    /// Every known (id, name) pair after a refresh.
    pub fn known(&self) -> XlateResult<Vec<(RegionId, String)>> {
        self.refresh()?;
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = cache.by_id.iter().map(|(id, n)| (*id, n.clone())).collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        Ok(all)
    }

    fn cached_name(&self, id: RegionId) -> Option<String> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.by_id.get(&id).cloned()
    }

    fn cached_id(&self, key: &str) -> Option<RegionId> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.by_name.get(key).copied()
    }
}
