//! Position tracker: durable source cursors, consumer checkpoints and fault
//! markers
pub mod file;
pub mod memory;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{RelayError, Result},
    model::TableSchema,
    reader::SourceCursor,
};

/// Where a consumer resumes on one partition.
///
/// `offset` is the last applied channel offset, so reading resumes at
/// `offset + 1`. Schemas announced by markers travel with the checkpoint
/// so a restarted applier validates rows the same way it did before.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub offset: Option<u64>,
    #[serde(default)]
    pub schemas: BTreeMap<String, TableSchema>,
}

impl Checkpoint {
    /// Offset to read next
    pub fn next_offset(&self) -> u64 {
        self.offset.map_or(0, |o| o + 1)
    }
}

/// Persisted reason a consumer stopped on a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub reason: String,
    pub at: DateTime<Utc>,
    /// channel offset the consumer was about to apply
    pub offset: Option<u64>,
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn source_cursor(&self, source: &str) -> Result<SourceCursor>;

    /// Persists `cursor`. Fails with `CursorRegression` if it is behind the
    /// stored one.
    async fn save_source_cursor(&self, source: &str, cursor: &SourceCursor) -> Result<()>;

    async fn checkpoint(&self, consumer: &str, partition: u32) -> Result<Checkpoint>;

    /// Persists `checkpoint`. Fails with `CursorRegression` if it is behind
    /// the stored one.
    async fn save_checkpoint(
        &self,
        consumer: &str,
        partition: u32,
        checkpoint: &Checkpoint,
    ) -> Result<()>;

    async fn fault(&self, consumer: &str, partition: u32) -> Result<Option<Fault>>;

    async fn save_fault(&self, consumer: &str, partition: u32, fault: &Fault) -> Result<()>;

    /// Operator reset: clears the fault and makes the consumer resume at
    /// `offset`, moving the checkpoint backwards if needed
    async fn reset(&self, consumer: &str, partition: u32, offset: u64) -> Result<()>;
}

/// Rejects a cursor that moves backwards
pub(crate) fn check_advance(
    cursor: String,
    current: Option<u64>,
    requested: Option<u64>,
) -> Result<()> {
    match (current, requested) {
        (Some(current), Some(requested)) if requested < current => {
            Err(RelayError::CursorRegression {
                cursor,
                current,
                requested,
            })
        }
        (Some(current), None) => Err(RelayError::CursorRegression {
            cursor,
            current,
            requested: 0,
        }),
        _ => Ok(()),
    }
}

/// Checkpoint a reset leaves behind: the next read happens at `offset`
pub(crate) fn reset_checkpoint(mut checkpoint: Checkpoint, offset: u64) -> Checkpoint {
    checkpoint.offset = offset.checked_sub(1);
    checkpoint
}

/// Opens the file position store rooted at `state_dir`
pub async fn get_position_store(state_dir: &str) -> Result<Arc<dyn PositionStore>> {
    Ok(Arc::new(file::FilePositionStore::open(PathBuf::from(state_dir)).await?))
}
