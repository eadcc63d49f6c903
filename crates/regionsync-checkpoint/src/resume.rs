//! What to do with an existing checkpoint when initialization restarts.

use std::fmt;

use tracing::info;

use regionsync_core::RegionId;
use regionsync_state::{CheckpointState, TableMetadata};

use crate::error::CheckpointResult;
use crate::store::{CheckpointStore, InitCheckpoint};

/// Why a checkpoint no longer applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The local table no longer exists.
    TableGone,
    /// The table was dropped and recreated under a new id.
    TableRecreated { recorded: u64, live: u64 },
    /// The table no longer replicates from the checkpoint's source region.
    SourceRemoved,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::TableGone => write!(f, "table no longer exists"),
            DropReason::TableRecreated { recorded, live } => {
                write!(f, "table recreated (checkpoint id {recorded}, live id {live})")
            }
            DropReason::SourceRemoved => write!(f, "table no longer streams from this source"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// No checkpoint: start from the beginning.
    Fresh,
    /// Copy already finished.
    Skip,
    /// Continue from the stored position (`None` means nothing was copied yet).
    Resume { position: Option<Vec<u8>> },
    /// The checkpoint is stale and must be deleted.
    Drop(DropReason),
}

/// Decide from the checkpoint, the live catalog entry, and the source
/// region's local id (`None` if the source is unknown locally).
pub fn decide(
    checkpoint: Option<&InitCheckpoint>,
    live: Option<&TableMetadata>,
    source_id: Option<RegionId>,
) -> ResumeDecision {
    let Some(checkpoint) = checkpoint else {
        return ResumeDecision::Fresh;
    };
    let Some(live) = live else {
        return ResumeDecision::Drop(DropReason::TableGone);
    };
    if checkpoint.local_table_id != live.id {
        return ResumeDecision::Drop(DropReason::TableRecreated {
            recorded: checkpoint.local_table_id,
            live: live.id,
        });
    }
    if !source_id.is_some_and(|id| live.regions.contains(&id)) {
        return ResumeDecision::Drop(DropReason::SourceRemoved);
    }
    match checkpoint.state {
        CheckpointState::Complete => ResumeDecision::Skip,
        CheckpointState::NotStart | CheckpointState::InProgress | CheckpointState::Error => {
            ResumeDecision::Resume {
                position: checkpoint.resume_position.clone(),
            }
        }
    }
}

impl CheckpointStore {
    /// Read the checkpoint and live metadata for (`source`, `table`), decide,
    /// and delete the checkpoint if it is stale.
    pub async fn evaluate_resume(
        &self,
        source: &str,
        table: &str,
        source_id: Option<RegionId>,
    ) -> CheckpointResult<ResumeDecision> {
        let checkpoint = self.read(source, table).await?;
        let live = self.table_metadata(table).await?;
        let decision = decide(checkpoint.as_ref(), live.as_ref(), source_id);
        if let ResumeDecision::Drop(reason) = &decision {
            info!(%source, %table, %reason, "dropping stale checkpoint");
            self.delete(source, table).await?;
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use regionsync_core::Shutdown;
    use regionsync_state::StateStore;

    fn live() -> TableMetadata {
        TableMetadata::new("orders", 11, [2, 3])
    }

    fn checkpoint(state: CheckpointState, table_id: u64) -> InitCheckpoint {
        let mut c = InitCheckpoint::not_started("eu-west", &TableMetadata::new("orders", table_id, []), 91);
        c.state = state;
        c.resume_position = Some(b"k42".to_vec());
        c
    }

    #[test]
    fn no_checkpoint_is_fresh() {
        assert_eq!(decide(None, Some(&live()), Some(2)), ResumeDecision::Fresh);
    }

    #[test]
    fn stale_checkpoints_dropped() {
        let c = checkpoint(CheckpointState::InProgress, 11);
        assert_eq!(decide(Some(&c), None, Some(2)), ResumeDecision::Drop(DropReason::TableGone));

        let recreated = checkpoint(CheckpointState::InProgress, 10);
        assert_eq!(
            decide(Some(&recreated), Some(&live()), Some(2)),
            ResumeDecision::Drop(DropReason::TableRecreated { recorded: 10, live: 11 })
        );

        assert_eq!(
            decide(Some(&c), Some(&live()), Some(4)),
            ResumeDecision::Drop(DropReason::SourceRemoved)
        );
        assert_eq!(
            decide(Some(&c), Some(&live()), None),
            ResumeDecision::Drop(DropReason::SourceRemoved)
        );
    }

    #[test]
    fn complete_skips_and_partial_resumes() {
        let done = checkpoint(CheckpointState::Complete, 11);
        assert_eq!(decide(Some(&done), Some(&live()), Some(2)), ResumeDecision::Skip);

        let partial = checkpoint(CheckpointState::InProgress, 11);
        assert_eq!(
            decide(Some(&partial), Some(&live()), Some(3)),
            ResumeDecision::Resume { position: Some(b"k42".to_vec()) }
        );
    }

    #[tokio::test]
    async fn evaluate_deletes_stale_checkpoint() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_table(&TableMetadata::new("orders", 12, [2])).unwrap();
        let ckpts = CheckpointStore::new(
            store,
            "agent-0-of-1",
            "us-east",
            RetryPolicy::default(),
            Shutdown::never(),
        );
        ckpts.write(&checkpoint(CheckpointState::InProgress, 11)).await.unwrap();

        let decision = ckpts.evaluate_resume("eu-west", "orders", Some(2)).await.unwrap();
        assert!(matches!(decision, ResumeDecision::Drop(DropReason::TableRecreated { .. })));
        assert!(ckpts.read("eu-west", "orders").await.unwrap().is_none());
    }
}
