//! Resumable bulk copy of one table from one source region.
//!
//! The row copy itself belongs to the streaming engine and is reached
//! through [`TableCopier`]. This module only sequences it against the
//! checkpoint: NOT_START is durable before the first batch is requested,
//! each batch advances IN_PROGRESS, and the run ends in COMPLETE or ERROR.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use regionsync_core::RegionId;
use regionsync_state::TableMetadata;

use crate::error::{CheckpointError, CheckpointResult};
use crate::resume::{DropReason, ResumeDecision};
use crate::store::{CheckpointStore, InitCheckpoint};

/// One batch of copied rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedBatch {
    pub rows: u64,
    /// Primary key of the last row copied; the next batch starts after it.
    pub last_key: Vec<u8>,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct CopyError(pub String);

#[async_trait]
pub trait TableCopier: Send + Sync {
    /// Copy the next batch of `table` after `after` (from the start when
    /// `None`). `Ok(None)` means the table is fully copied.
    async fn copy_batch(
        &self,
        table: &str,
        after: Option<&[u8]>,
    ) -> Result<Option<CopiedBatch>, CopyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Completed { rows: u64, resumed: bool },
    /// A COMPLETE checkpoint was already present.
    AlreadyComplete,
    /// The stale checkpoint was dropped and the table needs no copy.
    Abandoned(DropReason),
    /// Shutdown stopped the copy between batches; the checkpoint stays
    /// IN_PROGRESS for the next run.
    Interrupted { rows: u64 },
}

pub struct TableInitializer<'a> {
    checkpoints: &'a CheckpointStore,
    copier: &'a dyn TableCopier,
}

impl<'a> TableInitializer<'a> {
    pub fn new(checkpoints: &'a CheckpointStore, copier: &'a dyn TableCopier) -> Self {
        Self {
            checkpoints,
            copier,
        }
    }

    /// Copy `table` from `source`, resuming from an existing checkpoint
    /// when one still applies.
    pub async fn run(
        &self,
        source: &str,
        source_id: RegionId,
        table: &TableMetadata,
        remote_table_id: u64,
    ) -> CheckpointResult<InitOutcome> {
        let decision = self
            .checkpoints
            .evaluate_resume(source, &table.name, Some(source_id))
            .await?;

        let (mut checkpoint, resumed) = match decision {
            ResumeDecision::Skip => return Ok(InitOutcome::AlreadyComplete),
            ResumeDecision::Drop(reason @ (DropReason::TableGone | DropReason::SourceRemoved)) => {
                return Ok(InitOutcome::Abandoned(reason));
            }
            ResumeDecision::Resume { position } => {
                let mut checkpoint = InitCheckpoint::not_started(source, table, remote_table_id);
                if let Some(position) = position {
                    checkpoint.advance(position);
                }
                (checkpoint, true)
            }
            ResumeDecision::Fresh | ResumeDecision::Drop(DropReason::TableRecreated { .. }) => {
                let checkpoint = InitCheckpoint::not_started(source, table, remote_table_id);
                self.checkpoints.write(&checkpoint).await?;
                (checkpoint, false)
            }
        };

        info!(%source, table = %table.name, resumed, "table initialization started");
        let mut shutdown = self.checkpoints.shutdown().clone();
        let mut rows = 0u64;

        loop {
            if shutdown.is_triggered() {
                info!(%source, table = %table.name, rows, "table initialization interrupted");
                return Ok(InitOutcome::Interrupted { rows });
            }

            let after = checkpoint.resume_position.clone();
            let batch = tokio::select! {
                batch = self.copier.copy_batch(&table.name, after.as_deref()) => batch,
                _ = shutdown.triggered() => {
                    return Ok(InitOutcome::Interrupted { rows });
                }
            };

            match batch {
                Ok(Some(batch)) => {
                    rows += batch.rows;
                    checkpoint.advance(batch.last_key);
                    self.checkpoints.write(&checkpoint).await?;
                }
                Ok(None) => {
                    checkpoint.complete();
                    self.checkpoints.write(&checkpoint).await?;
                    info!(%source, table = %table.name, rows, resumed, "table initialization complete");
                    return Ok(InitOutcome::Completed { rows, resumed });
                }
                Err(e) => {
                    warn!(%source, table = %table.name, error = %e, "table copy failed");
                    checkpoint.fail(&e.0);
                    self.checkpoints.write(&checkpoint).await?;
                    return Err(CheckpointError::Copy {
                        table: table.name.clone(),
                        message: e.0,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use regionsync_core::Shutdown;
    use regionsync_state::{CheckpointState, StateStore, checkpoint_key};

    use crate::retry::RetryPolicy;

    /// Serves `total` rows in batches of `batch`; records what it observed
    /// in the store when each batch was requested.
    struct FakeCopier {
        store: StateStore,
        total: u64,
        batch: u64,
        fail_at: Option<u64>,
        seen: Mutex<Vec<(Option<u64>, Option<CheckpointState>)>>,
    }

    impl FakeCopier {
        fn new(store: &StateStore, total: u64, batch: u64) -> Self {
            Self {
                store: store.clone(),
                total,
                batch,
                fail_at: None,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    fn decode_key(key: &[u8]) -> u64 {
        u64::from_be_bytes(key.try_into().unwrap())
    }

    #[async_trait]
    impl TableCopier for FakeCopier {
        async fn copy_batch(
            &self,
            table: &str,
            after: Option<&[u8]>,
        ) -> Result<Option<CopiedBatch>, CopyError> {
            let start = after.map(decode_key).unwrap_or(0);
            let state = self
                .store
                .get_checkpoint(&checkpoint_key("agent-0-of-1", "eu-west", table))
                .unwrap()
                .map(|c| c.state);
            self.seen.lock().unwrap().push((after.map(decode_key), state));

            if self.fail_at == Some(start) {
                return Err(CopyError("source unreachable".into()));
            }
            if start >= self.total {
                return Ok(None);
            }
            let end = (start + self.batch).min(self.total);
            Ok(Some(CopiedBatch {
                rows: end - start,
                last_key: end.to_be_bytes().to_vec(),
            }))
        }
    }

    fn setup() -> (StateStore, CheckpointStore, TableMetadata) {
        let store = StateStore::open_in_memory().unwrap();
        let table = TableMetadata::new("orders", 11, [2]);
        store.put_table(&table).unwrap();
        let ckpts = CheckpointStore::new(
            store.clone(),
            "agent-0-of-1",
            "us-east",
            RetryPolicy::default(),
            Shutdown::never(),
        );
        (store, ckpts, table)
    }

    #[tokio::test]
    async fn not_start_written_before_first_batch() {
        let (store, ckpts, table) = setup();
        let copier = FakeCopier::new(&store, 25, 10);
        let outcome = TableInitializer::new(&ckpts, &copier)
            .run("eu-west", 2, &table, 91)
            .await
            .unwrap();
        assert_eq!(outcome, InitOutcome::Completed { rows: 25, resumed: false });

        let seen = copier.seen.lock().unwrap().clone();
        assert_eq!(seen[0], (None, Some(CheckpointState::NotStart)));
        assert_eq!(seen[1], (Some(10), Some(CheckpointState::InProgress)));
        assert_eq!(seen.len(), 4);

        let done = ckpts.read("eu-west", "orders").await.unwrap().unwrap();
        assert_eq!(done.state, CheckpointState::Complete);
    }

    #[tokio::test]
    async fn failure_records_error_then_resumes() {
        let (store, ckpts, table) = setup();
        let mut copier = FakeCopier::new(&store, 30, 10);
        copier.fail_at = Some(20);
        let err = TableInitializer::new(&ckpts, &copier)
            .run("eu-west", 2, &table, 91)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Copy { .. }));
        let failed = ckpts.read("eu-west", "orders").await.unwrap().unwrap();
        assert_eq!(failed.state, CheckpointState::Error);
        assert_eq!(failed.message.as_deref(), Some("source unreachable"));

        // A restart resumes at row 20 instead of starting over.
        let copier = FakeCopier::new(&store, 30, 10);
        let outcome = TableInitializer::new(&ckpts, &copier)
            .run("eu-west", 2, &table, 91)
            .await
            .unwrap();
        assert_eq!(outcome, InitOutcome::Completed { rows: 10, resumed: true });
        assert_eq!(copier.seen.lock().unwrap()[0].0, Some(20));
    }

    #[tokio::test]
    async fn recreated_table_restarts_from_scratch() {
        let (store, ckpts, table) = setup();
        let mut ckpt = InitCheckpoint::not_started("eu-west", &table, 91);
        ckpt.advance(15u64.to_be_bytes().to_vec());
        ckpts.write(&ckpt).await.unwrap();

        let recreated = TableMetadata::new("orders", 12, [2]);
        store.put_table(&recreated).unwrap();
        let copier = FakeCopier::new(&store, 20, 10);
        let outcome = TableInitializer::new(&ckpts, &copier)
            .run("eu-west", 2, &recreated, 95)
            .await
            .unwrap();
        assert_eq!(outcome, InitOutcome::Completed { rows: 20, resumed: false });
        assert_eq!(copier.seen.lock().unwrap()[0], (None, Some(CheckpointState::NotStart)));
    }

    #[tokio::test]
    async fn completed_checkpoint_skips_copy() {
        let (store, ckpts, table) = setup();
        let mut ckpt = InitCheckpoint::not_started("eu-west", &table, 91);
        ckpt.complete();
        ckpts.write(&ckpt).await.unwrap();

        let copier = FakeCopier::new(&store, 20, 10);
        let outcome = TableInitializer::new(&ckpts, &copier)
            .run("eu-west", 2, &table, 91)
            .await
            .unwrap();
        assert_eq!(outcome, InitOutcome::AlreadyComplete);
        assert!(copier.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn removed_source_abandons() {
        let (store, ckpts, table) = setup();
        ckpts
            .write(&InitCheckpoint::not_started("eu-west", &table, 91))
            .await
            .unwrap();
        store.put_table(&TableMetadata::new("orders", 11, [3])).unwrap();

        let copier = FakeCopier::new(&store, 20, 10);
        let outcome = TableInitializer::new(&ckpts, &copier)
            .run("eu-west", 2, &table, 91)
            .await
            .unwrap();
        assert_eq!(outcome, InitOutcome::Abandoned(DropReason::SourceRemoved));
        assert!(ckpts.read("eu-west", "orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_leaves_checkpoint_resumable() {
        let (store, _, table) = setup();
        let (trigger, shutdown) = regionsync_core::shutdown_channel();
        let ckpts = CheckpointStore::new(
            store.clone(),
            "agent-0-of-1",
            "us-east",
            RetryPolicy::default(),
            shutdown,
        );
        let mut ckpt = InitCheckpoint::not_started("eu-west", &table, 91);
        ckpt.advance(10u64.to_be_bytes().to_vec());
        ckpts.write(&ckpt).await.unwrap();

        trigger.trigger();
        let copier = FakeCopier::new(&store, 20, 10);
        let err = TableInitializer::new(&ckpts, &copier)
            .run("eu-west", 2, &table, 91)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        let kept = store
            .get_checkpoint(&checkpoint_key("agent-0-of-1", "eu-west", "orders"))
            .unwrap()
            .unwrap();
        assert_eq!(kept.state, CheckpointState::InProgress);
    }
}
