//! File position store.
//!
//! Layout under the state dir:
//!
//! ```text
//! sources/<source>.json                  source cursor
//! consumers/<consumer>/<partition>.json  checkpoint
//! consumers/<consumer>/<partition>.fault.json
//! ```
//!
//! Every file is replaced atomically: written to a temp file, synced and
//! renamed over the old one, so a crash leaves either the old or the new
//! value.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, info};

use super::{check_advance, reset_checkpoint, Checkpoint, Fault, PositionStore};
use crate::{error::Result, reader::SourceCursor};

pub struct FilePositionStore {
    dir: PathBuf,
    /// serializes read-check-write cycles
    write: Mutex<()>,
}

impl FilePositionStore {
    pub async fn open(dir: PathBuf) -> Result<FilePositionStore> {
        fs::create_dir_all(dir.join("sources")).await?;
        fs::create_dir_all(dir.join("consumers")).await?;
        Ok(FilePositionStore {
            dir,
            write: Mutex::new(()),
        })
    }

    fn cursor_path(&self, source: &str) -> PathBuf {
        self.dir.join("sources").join(format!("{source}.json"))
    }

    fn checkpoint_path(&self, consumer: &str, partition: u32) -> PathBuf {
        self.dir
            .join("consumers")
            .join(consumer)
            .join(format!("{partition}.json"))
    }

    fn fault_path(&self, consumer: &str, partition: u32) -> PathBuf {
        self.dir
            .join("consumers")
            .join(consumer)
            .join(format!("{partition}.fault.json"))
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp).await?;
    file.write_all(&serde_json::to_vec_pretty(value)?).await?;
    file.sync_all().await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn source_cursor(&self, source: &str) -> Result<SourceCursor> {
        Ok(read_json(&self.cursor_path(source)).await?.unwrap_or_default())
    }

    async fn save_source_cursor(&self, source: &str, cursor: &SourceCursor) -> Result<()> {
        let _guard = self.write.lock().await;
        let path = self.cursor_path(source);
        let current: Option<SourceCursor> = read_json(&path).await?;
        check_advance(
            format!("source/{source}"),
            current.and_then(|c| c.position).map(|p| p.0),
            cursor.position.map(|p| p.0),
        )?;
        write_json(&path, cursor).await
    }

    async fn checkpoint(&self, consumer: &str, partition: u32) -> Result<Checkpoint> {
        Ok(read_json(&self.checkpoint_path(consumer, partition))
            .await?
            .unwrap_or_default())
    }

    async fn save_checkpoint(
        &self,
        consumer: &str,
        partition: u32,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        let _guard = self.write.lock().await;
        let path = self.checkpoint_path(consumer, partition);
        let current: Option<Checkpoint> = read_json(&path).await?;
        check_advance(
            format!("{consumer}/{partition}"),
            current.and_then(|c| c.offset),
            checkpoint.offset,
        )?;
        write_json(&path, checkpoint).await?;
        debug!(consumer, partition, offset = ?checkpoint.offset, "checkpoint_saved");
        Ok(())
    }

    async fn fault(&self, consumer: &str, partition: u32) -> Result<Option<Fault>> {
        read_json(&self.fault_path(consumer, partition)).await
    }

    async fn save_fault(&self, consumer: &str, partition: u32, fault: &Fault) -> Result<()> {
        let _guard = self.write.lock().await;
        write_json(&self.fault_path(consumer, partition), fault).await
    }

    async fn reset(&self, consumer: &str, partition: u32, offset: u64) -> Result<()> {
        let _guard = self.write.lock().await;
        let path = self.checkpoint_path(consumer, partition);
        let checkpoint: Checkpoint = read_json(&path).await?.unwrap_or_default();
        let previous = checkpoint.offset;
        write_json(&path, &reset_checkpoint(checkpoint, offset)).await?;
        remove(&self.fault_path(consumer, partition)).await?;
        info!(consumer, partition, ?previous, offset, "consumer_reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::RelayError,
        model::{SourcePosition, TableSchema},
    };
    use chrono::Utc;

    #[tokio::test]
    async fn test_positions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePositionStore::open(dir.path().to_path_buf()).await.unwrap();

        let mut cursor = SourceCursor {
            position: Some(SourcePosition(42)),
            ..Default::default()
        };
        cursor.schema_versions.insert("users".into(), 2);
        store.save_source_cursor("pg", &cursor).await.unwrap();

        let mut checkpoint = Checkpoint {
            offset: Some(17),
            ..Default::default()
        };
        checkpoint.schemas.insert(
            "users".into(),
            TableSchema {
                table: "users".into(),
                version: 2,
                primary_key: vec!["id".into()],
                columns: vec!["id".into(), "email".into()],
            },
        );
        store.save_checkpoint("ch", 3, &checkpoint).await.unwrap();
        drop(store);

        let store = FilePositionStore::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(store.source_cursor("pg").await.unwrap(), cursor);
        assert_eq!(store.checkpoint("ch", 3).await.unwrap(), checkpoint);
        assert_eq!(store.checkpoint("ch", 0).await.unwrap(), Checkpoint::default());
        assert!(dir.path().join("consumers/ch/3.json").exists());
        assert!(!dir.path().join("consumers/ch/3.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_regression_rejected_and_reset_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePositionStore::open(dir.path().to_path_buf()).await.unwrap();
        let at = |offset| Checkpoint {
            offset: Some(offset),
            ..Default::default()
        };
        store.save_checkpoint("ch", 0, &at(10)).await.unwrap();
        let err = store.save_checkpoint("ch", 0, &at(2)).await.unwrap_err();
        assert!(matches!(err, RelayError::CursorRegression { current: 10, requested: 2, .. }));

        let fault = Fault {
            reason: "rejected".into(),
            at: Utc::now(),
            offset: Some(11),
        };
        store.save_fault("ch", 0, &fault).await.unwrap();
        assert_eq!(store.fault("ch", 0).await.unwrap(), Some(fault));

        store.reset("ch", 0, 3).await.unwrap();
        assert_eq!(store.fault("ch", 0).await.unwrap(), None);
        assert_eq!(store.checkpoint("ch", 0).await.unwrap().offset, Some(2));
        // resetting a clean partition is fine too
        store.reset("ch", 1, 0).await.unwrap();
        assert_eq!(store.checkpoint("ch", 1).await.unwrap().next_offset(), 0);
    }
}
