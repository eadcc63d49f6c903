//! Domain types persisted in the regionsync store.
//!
//! Requests, responses, version and streaming records are shared by every
//! agent of the group. Checkpoints are owned by the agent that wrote them but
//! readable by any agent resuming its work. All types are JSON in redb.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use regionsync_core::{ProtocolVersion, RegionId};

/// Caller-assigned, unique request number.
pub type RequestId = u64;

// ── Table metadata ─────────────────────────────────────────────────

/// Metadata of a multi-region table as known to the local store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableMetadata {
    pub name: String,
    /// Live table id. Changes when the table is dropped and recreated.
    pub id: u64,
    /// Parent table name for a nested (non-root) table.
    #[serde(default)]
    pub parent: Option<String>,
    /// Local ids of the remote regions this table replicates from.
    pub regions: BTreeSet<RegionId>,
    /// Bumped on every schema evolution.
    #[serde(default)]
    pub schema_version: u32,
}

impl TableMetadata {
    pub fn new(name: &str, id: u64, regions: impl IntoIterator<Item = RegionId>) -> Self {
        Self {
            name: name.to_string(),
            id,
            parent: None,
            regions: regions.into_iter().collect(),
            schema_version: 1,
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }
}

// ── Lifecycle requests ─────────────────────────────────────────────

/// What an externally posted request asks the group to do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestPayload {
    CreateTable { table: TableMetadata },
    /// Evolve a table: change its schema and/or its set of remote regions.
    UpdateTable { table: TableMetadata },
    DropTable { table: TableMetadata },
    /// Create a table nested under `table.parent`.
    CreateChildTable { table: TableMetadata },
    DropChildTable { table: TableMetadata },
    AddRegion { region: String },
    RemoveRegion { region: String },
    Shutdown,
}

/// Request kind without its payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    CreateTable,
    UpdateTable,
    DropTable,
    CreateChildTable,
    DropChildTable,
    AddRegion,
    RemoveRegion,
    Shutdown,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::CreateTable => "create_table",
            RequestKind::UpdateTable => "update_table",
            RequestKind::DropTable => "drop_table",
            RequestKind::CreateChildTable => "create_child_table",
            RequestKind::DropChildTable => "drop_child_table",
            RequestKind::AddRegion => "add_region",
            RequestKind::RemoveRegion => "remove_region",
            RequestKind::Shutdown => "shutdown",
        }
    }

    /// Table requests are serialized through the orchestrator one at a time.
    pub fn is_table_request(&self) -> bool {
        matches!(
            self,
            RequestKind::CreateTable
                | RequestKind::UpdateTable
                | RequestKind::DropTable
                | RequestKind::CreateChildTable
                | RequestKind::DropChildTable
        )
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::CreateTable { .. } => RequestKind::CreateTable,
            RequestPayload::UpdateTable { .. } => RequestKind::UpdateTable,
            RequestPayload::DropTable { .. } => RequestKind::DropTable,
            RequestPayload::CreateChildTable { .. } => RequestKind::CreateChildTable,
            RequestPayload::DropChildTable { .. } => RequestKind::DropChildTable,
            RequestPayload::AddRegion { .. } => RequestKind::AddRegion,
            RequestPayload::RemoveRegion { .. } => RequestKind::RemoveRegion,
            RequestPayload::Shutdown => RequestKind::Shutdown,
        }
    }

    /// The table this request is about, if any.
    pub fn table(&self) -> Option<&TableMetadata> {
        match self {
            RequestPayload::CreateTable { table }
            | RequestPayload::UpdateTable { table }
            | RequestPayload::DropTable { table }
            | RequestPayload::CreateChildTable { table }
            | RequestPayload::DropChildTable { table } => Some(table),
            _ => None,
        }
    }
}

/// A durable, uniquely numbered lifecycle request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleRequest {
    pub id: RequestId,
    pub payload: RequestPayload,
    /// Unix timestamp (seconds) when the request was posted.
    pub submitted_at: u64,
}

impl LifecycleRequest {
    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }
}

// ── Responses ──────────────────────────────────────────────────────

/// One agent's outcome for a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded {
        #[serde(default)]
        detail: Option<String>,
    },
    Failed {
        reason: String,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentOutcome {
    pub kind: RequestKind,
    pub outcome: Outcome,
    pub posted_at: u64,
}

/// The response row of one request: each agent's slot by agent index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResponseRecord {
    pub request_id: RequestId,
    pub outcomes: BTreeMap<u32, AgentOutcome>,
}

impl ResponseRecord {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn answered_by(&self, agent_index: u32) -> bool {
        self.outcomes.contains_key(&agent_index)
    }

    /// Every agent of the group has filled its slot.
    pub fn is_fully_answered(&self, group_size: u32) -> bool {
        (0..group_size).all(|i| self.answered_by(i))
    }

    /// Whether any agent reported failure.
    pub fn any_failed(&self) -> bool {
        self.outcomes.values().any(|o| !o.outcome.is_success())
    }
}

// ── Versions ───────────────────────────────────────────────────────

/// Version announcement posted by one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRecord {
    pub agent_index: u32,
    pub group_size: u32,
    pub version: ProtocolVersion,
    /// Random token identifying the posting process. A lead that finds a
    /// different token in its slot knows another process claims index 0.
    pub instance: String,
    pub posted_at: u64,
}

/// All version announcements, aggregated under one shared key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VersionRow {
    pub agents: BTreeMap<u32, VersionRecord>,
}

impl VersionRow {
    pub fn get(&self, agent_index: u32) -> Option<&VersionRecord> {
        self.agents.get(&agent_index)
    }

    /// Records of every agent except `agent_index`.
    pub fn peers_of(&self, agent_index: u32) -> impl Iterator<Item = &VersionRecord> {
        self.agents
            .iter()
            .filter(move |(i, _)| **i != agent_index)
            .map(|(_, r)| r)
    }
}

// ── Streaming ──────────────────────────────────────────────────────

/// A (table, source region) pair an agent is streaming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    pub table: String,
    pub region: String,
}

/// Which remote tables an agent is currently streaming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StreamingRecord {
    pub agent_index: u32,
    pub streams: BTreeSet<StreamKey>,
    pub updated_at: u64,
}

impl StreamingRecord {
    pub fn streams(&self, table: &str, region: &str) -> bool {
        self.streams
            .iter()
            .any(|k| k.table == table && k.region.eq_ignore_ascii_case(region))
    }
}

// ── Checkpoints ────────────────────────────────────────────────────

/// Current on-disk checkpoint format.
pub const CHECKPOINT_FORMAT: u32 = 1;

/// Progress of one table initialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointState {
    NotStart,
    InProgress,
    Complete,
    Error,
}

/// Checkpoint row as stored. The resume position is base64 text, encrypted
/// when `encrypted` is set; every other field stays plain so rows can be
/// filtered without the key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCheckpoint {
    pub format: u32,
    pub agent_id: String,
    pub source_region: String,
    pub target_region: String,
    pub table: String,
    pub local_table_id: u64,
    pub remote_table_id: u64,
    #[serde(default)]
    pub resume_position: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    pub state: CheckpointState,
    pub timestamp: u64,
    #[serde(default)]
    pub message: Option<String>,
}

impl StoredCheckpoint {
    pub fn table_key(&self) -> String {
        checkpoint_key(&self.agent_id, &self.source_region, &self.table)
    }
}

/// Composite checkpoint key. Region names are lower-cased.
pub fn checkpoint_key(agent_id: &str, source_region: &str, table: &str) -> String {
    format!(
        "{agent_id}/{}/{table}",
        regionsync_core::region_key(source_region)
    )
}
