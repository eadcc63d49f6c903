//! Retry-wrapped checkpoint persistence for one agent.
//!
//! Every read and write goes through [`with_retry`], so transient store
//! faults never reach the caller unless the attempt budget runs out.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info};

use regionsync_core::{Shutdown, region_key};
use regionsync_state::{
    CHECKPOINT_FORMAT, CheckpointState, StateStore, StoredCheckpoint, TableMetadata,
    checkpoint_key, epoch_secs,
};

use crate::cipher::PositionCipher;
use crate::error::{CheckpointError, CheckpointResult};
use crate::retry::{RetryPolicy, with_retry};

/// Decoded checkpoint: the resume position is plain bytes again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCheckpoint {
    pub source_region: String,
    pub table: String,
    pub local_table_id: u64,
    pub remote_table_id: u64,
    pub resume_position: Option<Vec<u8>>,
    pub state: CheckpointState,
    pub timestamp: u64,
    pub message: Option<String>,
}

impl InitCheckpoint {
    /// Fresh NOT_START checkpoint for copying `table` from `source_region`.
    pub fn not_started(source_region: &str, table: &TableMetadata, remote_table_id: u64) -> Self {
        Self {
            source_region: source_region.to_string(),
            table: table.name.clone(),
            local_table_id: table.id,
            remote_table_id,
            resume_position: None,
            state: CheckpointState::NotStart,
            timestamp: epoch_secs(),
            message: None,
        }
    }

    pub fn advance(&mut self, position: Vec<u8>) {
        self.resume_position = Some(position);
        self.state = CheckpointState::InProgress;
        self.timestamp = epoch_secs();
    }

    pub fn complete(&mut self) {
        self.state = CheckpointState::Complete;
        self.timestamp = epoch_secs();
        self.message = None;
    }

    pub fn fail(&mut self, message: &str) {
        self.state = CheckpointState::Error;
        self.timestamp = epoch_secs();
        self.message = Some(message.to_string());
    }
}

/// Checkpoint access scoped to one agent and the region it serves.
#[derive(Clone)]
pub struct CheckpointStore {
    store: StateStore,
    agent_id: String,
    target_region: String,
    cipher: Option<Arc<dyn PositionCipher>>,
    policy: RetryPolicy,
    shutdown: Shutdown,
}

impl CheckpointStore {
    pub fn new(
        store: StateStore,
        agent_id: &str,
        target_region: &str,
        policy: RetryPolicy,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            agent_id: agent_id.to_string(),
            target_region: target_region.to_string(),
            cipher: None,
            policy,
            shutdown,
        }
    }

    /// Encrypt resume positions with `cipher` from now on.
    pub fn with_cipher(mut self, cipher: Arc<dyn PositionCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub async fn write(&self, checkpoint: &InitCheckpoint) -> CheckpointResult<()> {
        let stored = self.encode(checkpoint)?;
        with_retry("write checkpoint", &self.policy, &self.shutdown, || {
            self.store.put_checkpoint(&stored)
        })
        .await?;
        debug!(
            source = %checkpoint.source_region,
            table = %checkpoint.table,
            state = ?checkpoint.state,
            "checkpoint written"
        );
        Ok(())
    }

    pub async fn read(&self, source: &str, table: &str) -> CheckpointResult<Option<InitCheckpoint>> {
        let key = checkpoint_key(&self.agent_id, source, table);
        let stored = with_retry("read checkpoint", &self.policy, &self.shutdown, || {
            self.store.get_checkpoint(&key)
        })
        .await?;
        stored.map(|s| self.decode(s)).transpose()
    }

    pub async fn delete(&self, source: &str, table: &str) -> CheckpointResult<bool> {
        let key = checkpoint_key(&self.agent_id, source, table);
        with_retry("delete checkpoint", &self.policy, &self.shutdown, || {
            self.store.delete_checkpoint(&key)
        })
        .await
    }

    /// Every checkpoint this agent owns.
    pub async fn list(&self) -> CheckpointResult<Vec<InitCheckpoint>> {
        let stored = with_retry("list checkpoints", &self.policy, &self.shutdown, || {
            self.store.list_checkpoints(&self.agent_id)
        })
        .await?;
        stored.into_iter().map(|s| self.decode(s)).collect()
    }

    /// Live catalog entry for `table`, read under the same retry policy.
    pub async fn table_metadata(&self, table: &str) -> CheckpointResult<Option<TableMetadata>> {
        with_retry("read table metadata", &self.policy, &self.shutdown, || {
            self.store.get_table(table)
        })
        .await
    }

    /// Delete every COMPLETE checkpoint. Returns how many were removed.
    pub async fn collect_completed(&self) -> CheckpointResult<usize> {
        self.delete_where(|c| c.state == CheckpointState::Complete).await
    }

    /// Delete the checkpoints of a dropped table, across all sources.
    ///
    /// Table names match exactly, as catalog keys do; only region names
    /// are case-insensitive.
    pub async fn delete_for_table(&self, table: &str) -> CheckpointResult<usize> {
        self.delete_where(|c| c.table == table).await
    }

    /// Delete the checkpoints copied from a removed source region.
    pub async fn delete_for_source(&self, source: &str) -> CheckpointResult<usize> {
        let source = region_key(source);
        self.delete_where(|c| region_key(&c.source_region) == source)
            .await
    }

    async fn delete_where<P>(&self, predicate: P) -> CheckpointResult<usize>
    where
        P: Fn(&StoredCheckpoint) -> bool,
    {
        let stored = with_retry("list checkpoints", &self.policy, &self.shutdown, || {
            self.store.list_checkpoints(&self.agent_id)
        })
        .await?;

        let mut removed = 0;
        for checkpoint in stored.iter().filter(|c| predicate(*c)) {
            let key = checkpoint.table_key();
            if with_retry("delete checkpoint", &self.policy, &self.shutdown, || {
                self.store.delete_checkpoint(&key)
            })
            .await?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(agent = %self.agent_id, removed, "checkpoints collected");
        }
        Ok(removed)
    }

    fn encode(&self, checkpoint: &InitCheckpoint) -> CheckpointResult<StoredCheckpoint> {
        let resume_position = match (&checkpoint.resume_position, &self.cipher) {
            (None, _) => None,
            (Some(pos), None) => Some(STANDARD.encode(pos)),
            (Some(pos), Some(cipher)) => Some(STANDARD.encode(cipher.encrypt(pos)?)),
        };
        Ok(StoredCheckpoint {
            format: CHECKPOINT_FORMAT,
            agent_id: self.agent_id.clone(),
            source_region: checkpoint.source_region.clone(),
            target_region: self.target_region.clone(),
            table: checkpoint.table.clone(),
            local_table_id: checkpoint.local_table_id,
            remote_table_id: checkpoint.remote_table_id,
            encrypted: resume_position.is_some() && self.cipher.is_some(),
            resume_position,
            state: checkpoint.state,
            timestamp: checkpoint.timestamp,
            message: checkpoint.message.clone(),
        })
    }

    fn decode(&self, stored: StoredCheckpoint) -> CheckpointResult<InitCheckpoint> {
        if stored.format > CHECKPOINT_FORMAT {
            return Err(CheckpointError::Malformed(format!(
                "checkpoint {} has format {}, newest understood is {CHECKPOINT_FORMAT}",
                stored.table_key(),
                stored.format
            )));
        }
        let resume_position = match stored.resume_position.as_deref() {
            None => None,
            Some(text) => {
                let raw = STANDARD
                    .decode(text)
                    .map_err(|e| CheckpointError::Malformed(e.to_string()))?;
                match (stored.encrypted, &self.cipher) {
                    (false, _) => Some(raw),
                    (true, Some(cipher)) => Some(cipher.decrypt(&raw)?),
                    (true, None) => {
                        return Err(CheckpointError::Cipher(format!(
                            "checkpoint {} is encrypted but no key is configured",
                            stored.table_key()
                        )));
                    }
                }
            }
        };
        Ok(InitCheckpoint {
            source_region: stored.source_region,
            table: stored.table,
            local_table_id: stored.local_table_id,
            remote_table_id: stored.remote_table_id,
            resume_position,
            state: stored.state,
            timestamp: stored.timestamp,
            message: stored.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::AesGcmCipher;

    fn table() -> TableMetadata {
        TableMetadata::new("orders", 11, [2, 3])
    }

    fn checkpoints(store: &StateStore) -> CheckpointStore {
        CheckpointStore::new(
            store.clone(),
            "agent-0-of-1",
            "us-east",
            RetryPolicy::default(),
            Shutdown::never(),
        )
    }

    #[tokio::test]
    async fn write_read_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let ckpts = checkpoints(&store);

        let mut ckpt = InitCheckpoint::not_started("eu-west", &table(), 91);
        ckpt.advance(b"row-17".to_vec());
        ckpts.write(&ckpt).await.unwrap();

        let read = ckpts.read("EU-WEST", "orders").await.unwrap().unwrap();
        assert_eq!(read.state, CheckpointState::InProgress);
        assert_eq!(read.resume_position.as_deref(), Some(&b"row-17"[..]));
        assert_eq!(read.remote_table_id, 91);

        let raw = store
            .get_checkpoint(&checkpoint_key("agent-0-of-1", "eu-west", "orders"))
            .unwrap()
            .unwrap();
        assert_eq!(raw.target_region, "us-east");
        assert!(!raw.encrypted);

        assert!(ckpts.delete("eu-west", "orders").await.unwrap());
        assert!(ckpts.read("eu-west", "orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn encryption_covers_position_only() {
        let store = StateStore::open_in_memory().unwrap();
        let ckpts = checkpoints(&store).with_cipher(Arc::new(AesGcmCipher::new(&[9u8; 32])));

        let mut ckpt = InitCheckpoint::not_started("eu-west", &table(), 91);
        ckpt.advance(b"secret-key".to_vec());
        ckpts.write(&ckpt).await.unwrap();

        let raw = store
            .get_checkpoint(&checkpoint_key("agent-0-of-1", "eu-west", "orders"))
            .unwrap()
            .unwrap();
        assert!(raw.encrypted);
        assert_eq!(raw.table, "orders");
        assert_eq!(raw.state, CheckpointState::InProgress);
        assert_ne!(raw.resume_position, Some(STANDARD.encode(b"secret-key")));

        let read = ckpts.read("eu-west", "orders").await.unwrap().unwrap();
        assert_eq!(read.resume_position.as_deref(), Some(&b"secret-key"[..]));

        // Without the key the encrypted row cannot be decoded.
        let plain = checkpoints(&store);
        assert!(matches!(
            plain.read("eu-west", "orders").await,
            Err(CheckpointError::Cipher(_))
        ));
    }

    #[tokio::test]
    async fn newer_format_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let ckpts = checkpoints(&store);
        ckpts
            .write(&InitCheckpoint::not_started("eu-west", &table(), 91))
            .await
            .unwrap();
        let key = checkpoint_key("agent-0-of-1", "eu-west", "orders");
        let mut raw = store.get_checkpoint(&key).unwrap().unwrap();
        raw.format = CHECKPOINT_FORMAT + 1;
        store.put_checkpoint(&raw).unwrap();

        assert!(matches!(
            ckpts.read("eu-west", "orders").await,
            Err(CheckpointError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn garbage_collection_by_state_table_and_source() {
        let store = StateStore::open_in_memory().unwrap();
        let ckpts = checkpoints(&store);
        let orders = table();
        let items = TableMetadata::new("items", 12, [2, 3]);

        let mut done = InitCheckpoint::not_started("eu-west", &orders, 91);
        done.complete();
        ckpts.write(&done).await.unwrap();
        ckpts
            .write(&InitCheckpoint::not_started("ap-south", &orders, 92))
            .await
            .unwrap();
        ckpts
            .write(&InitCheckpoint::not_started("eu-west", &items, 93))
            .await
            .unwrap();
        ckpts
            .write(&InitCheckpoint::not_started("ap-south", &items, 94))
            .await
            .unwrap();

        assert_eq!(ckpts.collect_completed().await.unwrap(), 1);
        assert_eq!(ckpts.delete_for_source("AP-SOUTH").await.unwrap(), 2);
        assert_eq!(ckpts.delete_for_table("items").await.unwrap(), 1);
        assert!(ckpts.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn table_names_match_exactly() {
        let store = StateStore::open_in_memory().unwrap();
        let ckpts = checkpoints(&store);
        let upper = TableMetadata::new("Orders", 12, [2]);
        ckpts
            .write(&InitCheckpoint::not_started("EU-West", &table(), 91))
            .await
            .unwrap();
        ckpts
            .write(&InitCheckpoint::not_started("eu-west", &upper, 92))
            .await
            .unwrap();

        assert_eq!(ckpts.delete_for_table("ORDERS").await.unwrap(), 0);
        assert_eq!(ckpts.delete_for_table("orders").await.unwrap(), 1);
        let left = ckpts.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].table, "Orders");
    }

    #[tokio::test]
    async fn other_agents_checkpoints_untouched() {
        let store = StateStore::open_in_memory().unwrap();
        let mine = checkpoints(&store);
        let theirs = CheckpointStore::new(
            store.clone(),
            "agent-1-of-2",
            "us-east",
            RetryPolicy::default(),
            Shutdown::never(),
        );
        let mut ckpt = InitCheckpoint::not_started("eu-west", &table(), 91);
        ckpt.complete();
        theirs.write(&ckpt).await.unwrap();

        assert_eq!(mine.collect_completed().await.unwrap(), 0);
        assert_eq!(theirs.list().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_system_table_exhausts_budget() {
        let store = StateStore::open_in_memory_bare().unwrap();
        let ckpts = CheckpointStore::new(
            store,
            "agent-0-of-1",
            "us-east",
            RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
            Shutdown::never(),
        );
        let err = ckpts.read("eu-west", "orders").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Exhausted { attempts: 3, .. }));
    }
}
