//! Translation tables: source-region id → local id.
//!
//! One table per source region, built lazily on first use:
//!
//! 1. seed the source's own region id (1) with the source's local id,
//! 2. enumerate the source's region map and keep every name that is also
//!    known locally.
//!
//! An id still missing after the build is looked up live at the source,
//! translated through the local map and cached, so the table grows instead
//! of being rebuilt. Entries are never overwritten; only [`RegionIdTrans::reset`]
//! or [`RegionIdTrans::clear`] drop a table wholesale.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use regionsync_core::{LOCAL_REGION_ID, RegionId, UNKNOWN_REGION_ID, region_key};
use regionsync_state::RegionResolver;

use crate::error::{XlateError, XlateResult};
use crate::mapping::RegionIdMapping;

/// Where a source-region id lands locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationEntry {
    pub local_id: RegionId,
    pub local_name: String,
}

struct SourceTable {
    name: String,
    mapper: Arc<dyn RegionResolver>,
    /// `None` until built.
    entries: Mutex<Option<HashMap<RegionId, TranslationEntry>>>,
}

/// Local region map plus one translation table per source region.
pub struct RegionIdTrans {
    local: RegionIdMapping,
    sources: RwLock<HashMap<String, Arc<SourceTable>>>,
}

impl RegionIdTrans {
    pub fn new(local: RegionIdMapping) -> Self {
        Self {
            local,
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// The local (target) region's mapping.
    pub fn local(&self) -> &RegionIdMapping {
        &self.local
    }

    /// Ready once the local region map has been loaded.
    pub fn is_ready(&self) -> bool {
        self.local.is_loaded()
    }

    /// Register the live resolver of a source region. Replaces any existing
    /// registration and its table.
    pub fn add_source(&self, name: &str, mapper: Arc<dyn RegionResolver>) {
        let table = Arc::new(SourceTable {
            name: name.to_string(),
            mapper,
            entries: Mutex::new(None),
        });
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(region_key(name), table);
        debug!(source = %name, "translation source registered");
    }

    /// Forget a source region entirely.
    pub fn remove_source(&self, name: &str) -> bool {
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&region_key(name))
            .is_some()
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&region_key(name))
    }

    /// Translate `source_id` (in `source`'s numbering) to a local id.
    pub fn translate(&self, source: &str, source_id: RegionId) -> XlateResult<RegionId> {
        Ok(self.translate_entry(source, source_id)?.local_id)
    }

    /// Translate and return the local name as well.
    pub fn translate_entry(
        &self,
        source: &str,
        source_id: RegionId,
    ) -> XlateResult<TranslationEntry> {
        if source_id == UNKNOWN_REGION_ID {
            return Err(XlateError::ReservedId);
        }
        let table = self.source_table(source)?;
        let mut entries = table.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if entries.is_none() {
            *entries = Some(self.build(&table)?);
        }
        let map = entries.get_or_insert_with(HashMap::new);
        if let Some(entry) = map.get(&source_id) {
            return Ok(entry.clone());
        }

        // A region the source learned about after the table was built.
        let entry = self.resolve_live(&table, source_id)?;
        map.insert(source_id, entry.clone());
        info!(
            source = %table.name,
            source_id,
            local_id = entry.local_id,
            region = %entry.local_name,
            "new region added to translation table"
        );
        Ok(entry)
    }

    /// Drop one source's table; it is rebuilt on next use.
    pub fn reset(&self, source: &str) {
        if let Ok(table) = self.source_table(source) {
            *table.entries.lock().unwrap_or_else(PoisonError::into_inner) = None;
            debug!(source = %source, "translation table reset");
        }
    }

    /// Drop every table (service shutdown).
    pub fn clear(&self) {
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        for table in sources.values() {
            *table.entries.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
        debug!(sources = sources.len(), "translation tables cleared");
    }

    /// Number of cached entries for `source`, `None` if not built yet.
    pub fn cached_len(&self, source: &str) -> Option<usize> {
        let table = self.source_table(source).ok()?;
        let entries = table.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.as_ref().map(HashMap::len)
    }

    fn source_table(&self, source: &str) -> XlateResult<Arc<SourceTable>> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&region_key(source))
            .cloned()
            .ok_or_else(|| XlateError::UnknownSource(source.to_string()))
    }

    fn build(&self, table: &SourceTable) -> XlateResult<HashMap<RegionId, TranslationEntry>> {
        let mut map = HashMap::new();

        let source_local = self.local.id_for(&table.name)?.ok_or_else(|| {
            XlateError::UnknownLocalRegion {
                region: table.name.clone(),
                name: table.name.clone(),
            }
        })?;
        map.insert(
            LOCAL_REGION_ID,
            TranslationEntry {
                local_id: source_local,
                local_name: table.name.clone(),
            },
        );

        for (source_id, name) in table.mapper.known_regions()? {
            if source_id == LOCAL_REGION_ID {
                continue;
            }
            match self.local.id_for(&name)? {
                Some(local_id) => {
                    map.insert(
                        source_id,
                        TranslationEntry {
                            local_id,
                            local_name: name,
                        },
                    );
                }
                None => {
                    debug!(source = %table.name, region = %name, "region unknown locally, skipped");
                }
            }
        }

        info!(source = %table.name, entries = map.len(), "translation table built");
        Ok(map)
    }

    fn resolve_live(&self, table: &SourceTable, source_id: RegionId) -> XlateResult<TranslationEntry> {
        let name = table.mapper.region_name(source_id)?.ok_or_else(|| {
            warn!(source = %table.name, source_id, "region id unknown at source");
            XlateError::UnknownSourceId {
                region: table.name.clone(),
                id: source_id,
            }
        })?;
        let local_id = self
            .local
            .id_for(&name)?
            .ok_or_else(|| XlateError::UnknownLocalRegion {
                region: table.name.clone(),
                name: name.clone(),
            })?;
        Ok(TranslationEntry {
            local_id,
            local_name: name,
        })
    }
}
