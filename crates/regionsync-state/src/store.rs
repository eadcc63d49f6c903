//! StateStore — redb-backed persistence for the regionsync agent.
//!
//! Provides typed operations over the request, response, checkpoint, table
//! catalog and region-map tables. Values are JSON-serialized into redb's
//! `&[u8]` value columns. Read-modify-write updates of shared rows (response
//! slots, version announcements) happen inside one write transaction.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use regionsync_core::{LOCAL_REGION_ID, RegionId};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// A missing table means the store has not been upgraded yet.
fn table_err(e: redb::TableError) -> StateError {
    match e {
        redb::TableError::TableDoesNotExist(name) => {
            StateError::NotFound(format!("table {name}"))
        }
        other => StateError::Table(other.to_string()),
    }
}

/// Thread-safe store handle backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) the locally served store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Open another region's store without creating anything in it.
    ///
    /// Tables the other region has not created yet surface as
    /// [`StateError::NotFound`].
    pub fn open_existing(path: &Path) -> StateResult<Self> {
        let db = Database::open(path).map_err(map_err!(Open))?;
        debug!(?path, "existing state store opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let store = Self::open_in_memory_bare()?;
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// In-memory store with no tables, standing in for a store that has not
    /// been upgraded yet.
    pub fn open_in_memory_bare() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Create all tables if they don't exist yet.
    pub fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(REQUESTS).map_err(table_err)?;
        txn.open_table(RESPONSES).map_err(table_err)?;
        txn.open_table(CHECKPOINTS).map_err(table_err)?;
        txn.open_table(TABLES).map_err(table_err)?;
        txn.open_table(REGION_IDS).map_err(table_err)?;
        txn.open_table(META).map_err(table_err)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── JSON row helpers ───────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(table_err)?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(table_err)?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(table_err)?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(table_err)?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Requests ───────────────────────────────────────────────────

    /// Store a request under its caller-assigned id.
    pub fn put_request(&self, request: &LifecycleRequest) -> StateResult<()> {
        let value = serde_json::to_vec(request).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REQUESTS).map_err(table_err)?;
            table
                .insert(request.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(request_id = request.id, kind = %request.kind(), "request stored");
        Ok(())
    }

    /// Append a request with the next free id.
    pub fn submit_request(&self, payload: RequestPayload) -> StateResult<LifecycleRequest> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let request;
        {
            let mut table = txn.open_table(REQUESTS).map_err(table_err)?;
            let next_id = {
                let last = table.last().map_err(map_err!(Read))?;
                last.map(|(k, _)| k.value() + 1).unwrap_or(1)
            };
            request = LifecycleRequest {
                id: next_id,
                payload,
                submitted_at: epoch_secs(),
            };
            let value = serde_json::to_vec(&request).map_err(map_err!(Serialize))?;
            table
                .insert(next_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(request_id = request.id, kind = %request.kind(), "request submitted");
        Ok(request)
    }

    pub fn get_request(&self, id: RequestId) -> StateResult<Option<LifecycleRequest>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REQUESTS).map_err(table_err)?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let request: LifecycleRequest =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    /// One page of requests with ids strictly greater than `after`.
    pub fn scan_requests(
        &self,
        after: Option<RequestId>,
        limit: usize,
    ) -> StateResult<Vec<LifecycleRequest>> {
        let start = after.map_or(0, |a| a.saturating_add(1));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REQUESTS).map_err(table_err)?;
        let mut results = Vec::new();
        for entry in table.range(start..).map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let request: LifecycleRequest =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(request);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    // ── Responses ──────────────────────────────────────────────────

    pub fn get_response(&self, request_id: RequestId) -> StateResult<Option<ResponseRecord>> {
        self.get_json(RESPONSES, &response_key(request_id))
    }

    pub fn list_responses(&self) -> StateResult<Vec<ResponseRecord>> {
        self.list_json(RESPONSES, "request/")
    }

    /// Fill one agent's slot of a request's response row.
    ///
    /// Slots are write-once: returns `false` and leaves the row untouched
    /// when the slot is already filled.
    pub fn post_outcome(
        &self,
        request_id: RequestId,
        agent_index: u32,
        outcome: AgentOutcome,
    ) -> StateResult<bool> {
        let key = response_key(request_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let posted;
        {
            let mut table = txn.open_table(RESPONSES).map_err(table_err)?;
            let mut record: ResponseRecord = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => ResponseRecord::new(request_id),
            };
            posted = !record.answered_by(agent_index);
            if posted {
                record.outcomes.insert(agent_index, outcome);
                let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(request_id, agent_index, posted, "response slot posted");
        Ok(posted)
    }

    // ── Versions ───────────────────────────────────────────────────

    /// All version announcements (empty when nobody has posted yet).
    pub fn get_versions(&self) -> StateResult<VersionRow> {
        Ok(self.get_json(RESPONSES, VERSIONS_KEY)?.unwrap_or_default())
    }

    /// Post (or refresh) one agent's version announcement.
    pub fn post_version(&self, record: &VersionRecord) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RESPONSES).map_err(table_err)?;
            let mut row: VersionRow = match table.get(VERSIONS_KEY).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => VersionRow::default(),
            };
            row.agents.insert(record.agent_index, record.clone());
            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            table
                .insert(VERSIONS_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(agent_index = record.agent_index, version = %record.version.version, "version posted");
        Ok(())
    }

    // ── Streaming ──────────────────────────────────────────────────

    pub fn put_streaming(&self, record: &StreamingRecord) -> StateResult<()> {
        self.put_json(RESPONSES, &streaming_key(record.agent_index), record)
    }

    pub fn get_streaming(&self, agent_index: u32) -> StateResult<Option<StreamingRecord>> {
        self.get_json(RESPONSES, &streaming_key(agent_index))
    }

    pub fn list_streaming(&self) -> StateResult<Vec<StreamingRecord>> {
        self.list_json(RESPONSES, "streaming/")
    }

    // ── Checkpoints ────────────────────────────────────────────────

    pub fn put_checkpoint(&self, checkpoint: &StoredCheckpoint) -> StateResult<()> {
        self.put_json(CHECKPOINTS, &checkpoint.table_key(), checkpoint)
    }

    pub fn get_checkpoint(&self, key: &str) -> StateResult<Option<StoredCheckpoint>> {
        self.get_json(CHECKPOINTS, key)
    }

    /// All checkpoints written by one agent.
    pub fn list_checkpoints(&self, agent_id: &str) -> StateResult<Vec<StoredCheckpoint>> {
        self.list_json(CHECKPOINTS, &format!("{agent_id}/"))
    }

    pub fn delete_checkpoint(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete_key(CHECKPOINTS, key)?;
        debug!(%key, existed, "checkpoint deleted");
        Ok(existed)
    }

    // ── Table catalog ──────────────────────────────────────────────

    pub fn put_table(&self, table: &TableMetadata) -> StateResult<()> {
        self.put_json(TABLES, &table.name, table)?;
        debug!(table = %table.name, id = table.id, "table metadata stored");
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> StateResult<Option<TableMetadata>> {
        self.get_json(TABLES, name)
    }

    pub fn list_tables(&self) -> StateResult<Vec<TableMetadata>> {
        self.list_json(TABLES, "")
    }

    pub fn delete_table(&self, name: &str) -> StateResult<bool> {
        self.delete_key(TABLES, name)
    }

    // ── Region map ─────────────────────────────────────────────────

    /// Claim id 1 for this store's own region.
    ///
    /// Fails if the store already belongs to a differently named region.
    pub fn init_local_region(&self, name: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REGION_IDS).map_err(table_err)?;
            let existing = table
                .get(LOCAL_REGION_ID)
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string());
            match existing {
                Some(current) if current.eq_ignore_ascii_case(name) => {}
                Some(current) => {
                    return Err(StateError::Write(format!(
                        "store belongs to region {current}, not {name}"
                    )));
                }
                None => {
                    table
                        .insert(LOCAL_REGION_ID, name)
                        .map_err(map_err!(Write))?;
                    let mut meta = txn.open_table(META).map_err(table_err)?;
                    bump_sequence(&mut meta)?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Return the id of `name`, assigning the next free id if it is new.
    pub fn register_region(&self, name: &str) -> StateResult<RegionId> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id;
        {
            let mut table = txn.open_table(REGION_IDS).map_err(table_err)?;
            let mut found = None;
            let mut max_id = LOCAL_REGION_ID;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (k, v) = entry.map_err(map_err!(Read))?;
                max_id = max_id.max(k.value());
                if v.value().eq_ignore_ascii_case(name) {
                    found = Some(k.value());
                }
            }
            match found {
                Some(existing) => id = existing,
                None => {
                    id = max_id + 1;
                    table.insert(id, name).map_err(map_err!(Write))?;
                    let mut meta = txn.open_table(META).map_err(table_err)?;
                    bump_sequence(&mut meta)?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(region = %name, id, "region registered");
        Ok(id)
    }

    pub fn region_name(&self, id: RegionId) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REGION_IDS).map_err(table_err)?;
        let name = table
            .get(id)
            .map_err(map_err!(Read))?
            .map(|g| g.value().to_string());
        Ok(name)
    }

    pub fn region_id(&self, name: &str) -> StateResult<Option<RegionId>> {
        Ok(self
            .list_regions()?
            .into_iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(id, _)| id))
    }

    pub fn list_regions(&self) -> StateResult<Vec<(RegionId, String)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REGION_IDS).map_err(table_err)?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (k, v) = entry.map_err(map_err!(Read))?;
            results.push((k.value(), v.value().to_string()));
        }
        Ok(results)
    }

    /// Monotonic counter bumped by every region registration.
    pub fn region_seq(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(table_err)?;
        let seq = table
            .get(REGION_SEQ_KEY)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(seq)
    }
}

fn bump_sequence(meta: &mut redb::Table<'_, &'static str, u64>) -> StateResult<()> {
    let current = meta
        .get(REGION_SEQ_KEY)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0);
    meta.insert(REGION_SEQ_KEY, current + 1)
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
