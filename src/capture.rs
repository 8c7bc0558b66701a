//! Capture: reads one source log, encodes its records and appends them to
//! the channel
use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    channel::{publish, Channel},
    codec::Codec,
    encoder::Encoder,
    error::Result,
    model::{LogRecord, TableSchema},
    positions::PositionStore,
    reader::{LogReader, SourceCursor},
    retry::{with_retry, RetryConfig},
    source::ChangeLog,
};

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub retry: RetryConfig,
}

pub struct Capture {
    source: String,
    log: Arc<dyn ChangeLog>,
    encoder: Encoder,
    channel: Arc<dyn Channel>,
    codec: Arc<dyn Codec + Send + Sync>,
    positions: Arc<dyn PositionStore>,
    config: CaptureConfig,
    cancel: CancellationToken,
    /// covers every record appended so far
    cursor: SourceCursor,
    reader: LogReader,
}

impl Capture {
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        source: &str,
        log: Arc<dyn ChangeLog>,
        tables: impl IntoIterator<Item = TableSchema>,
        channel: Arc<dyn Channel>,
        codec: Arc<dyn Codec + Send + Sync>,
        positions: Arc<dyn PositionStore>,
        config: CaptureConfig,
        cancel: CancellationToken,
    ) -> Result<Capture> {
        let encoder = Encoder::new(tables)?;
        let cursor = positions.source_cursor(source).await?;
        info!(source, position = ?cursor.position, "capture_resumed");
        let reader = LogReader::new(
            log.clone(),
            cursor.clone(),
            config.batch_size,
            config.poll_interval,
            config.retry.clone(),
            cancel.clone(),
        );
        Ok(Capture {
            source: source.to_owned(),
            log,
            encoder,
            channel,
            codec,
            positions,
            config,
            cancel,
            cursor,
            reader,
        })
    }

    pub fn cursor(&self) -> &SourceCursor {
        &self.cursor
    }

    /// Captures one polled batch, returns how many records were appended.
    ///
    /// The cursor is saved after every append, so a crash re-appends at most
    /// the record in flight.
    pub async fn step(&mut self) -> Result<usize> {
        let records = self.reader.poll().await?;
        let mut appended = 0;
        for record in records {
            if self.cancel.is_cancelled() {
                // resume from the saved cursor, not from what was polled
                self.rewind();
                break;
            }
            match self.capture(record).await {
                Ok(true) => appended += 1,
                Ok(false) => {}
                Err(e) => {
                    self.rewind();
                    return Err(e);
                }
            }
        }
        Ok(appended)
    }

    /// Captures until cancelled
    pub async fn run(&mut self) -> Result<()> {
        while !self.cancel.is_cancelled() {
            self.step().await?;
        }
        info!(source = %self.source, position = ?self.cursor.position, "capture_stopped");
        Ok(())
    }

    async fn capture(&mut self, record: LogRecord) -> Result<bool> {
        let position = record.source_position();
        let event = match &record {
            LogRecord::Change(r) if self.encoder.handles(&r.table) => Some(self.encoder.encode(r)?),
            LogRecord::Schema(m) if self.encoder.handles(&m.table) => {
                if !m.schema.primary_key.is_empty() {
                    self.encoder.register(m.schema.clone())?;
                }
                Some(self.encoder.encode_marker(m))
            }
            _ => None,
        };

        if let Some(event) = &event {
            let (channel, codec) = (self.channel.clone(), self.codec.clone());
            let appended = with_retry(&self.config.retry, &self.cancel, "channel_append", || {
                let (channel, codec) = (channel.clone(), codec.clone());
                async move { publish(channel.as_ref(), codec.as_ref(), event).await }
            })
            .await?;
            debug!(
                source = %self.source,
                table = %record.table(),
                position = position.0,
                appended = ?appended,
                "record_captured"
            );
        } else {
            debug!(source = %self.source, table = %record.table(), position = position.0, "record_skipped");
        }

        let mut cursor = self.cursor.clone();
        cursor.position = Some(position);
        if let LogRecord::Schema(m) = &record {
            cursor
                .schema_versions
                .insert(m.table.clone(), m.schema.version);
        }
        self.positions
            .save_source_cursor(&self.source, &cursor)
            .await?;
        self.cursor = cursor;
        Ok(event.is_some())
    }

    fn rewind(&mut self) {
        self.reader = LogReader::new(
            self.log.clone(),
            self.cursor.clone(),
            self.config.batch_size,
            self.config.poll_interval,
            self.config.retry.clone(),
            self.cancel.clone(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{
            log::{LogChannel, Retention},
            replica::{MemoryReplica, Replica},
        },
        codec::json,
        model::{EventBody, Image, Value},
        positions::memory::MemoryPositionStore,
        source::memory::MemoryChangeLog,
    };

    fn users() -> TableSchema {
        TableSchema {
            table: "users".into(),
            version: 1,
            primary_key: vec!["id".into()],
            columns: vec![],
        }
    }

    fn row(id: i64) -> Image {
        let mut i = Image::new();
        i.insert("id".into(), Value::Int(id));
        i
    }

    async fn setup(
        partitions: u32,
    ) -> (Arc<MemoryChangeLog>, Arc<LogChannel>, Arc<MemoryPositionStore>, Capture) {
        let log = Arc::new(MemoryChangeLog::new("pg"));
        let replicas: Vec<Arc<dyn Replica>> = vec![Arc::new(MemoryReplica::new("r0"))];
        let channel = Arc::new(
            LogChannel::open("ch", replicas, 1, partitions, Retention::default())
                .await
                .unwrap(),
        );
        let positions = Arc::new(MemoryPositionStore::new());
        let capture = Capture::open(
            "pg",
            log.clone(),
            [users()],
            channel.clone(),
            Arc::new(json::Codec {}),
            positions.clone(),
            CaptureConfig {
                batch_size: 100,
                poll_interval: Duration::from_millis(1),
                retry: RetryConfig {
                    initial_backoff_ms: 1,
                    max_backoff_ms: 2,
                    ..Default::default()
                },
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (log, channel, positions, capture)
    }

    #[tokio::test]
    async fn test_appends_and_saves_cursor() {
        let (log, channel, positions, mut capture) = setup(1).await;
        log.insert("users", row(1));
        log.insert("orders", row(7));
        log.update("users", row(1), row(1));

        assert_eq!(capture.step().await.unwrap(), 2);
        let cursor = positions.source_cursor("pg").await.unwrap();
        assert_eq!(cursor.position.map(|p| p.0), Some(3));
        assert_eq!(channel.bounds(0).await.unwrap().next, 2);
    }

    #[tokio::test]
    async fn test_schema_marker_reaches_every_partition() {
        let (log, channel, positions, mut capture) = setup(3).await;
        let mut v2 = users();
        v2.columns = vec!["id".into(), "name".into()];
        log.alter(v2);
        capture.step().await.unwrap();
        for partition in 0..3 {
            let mut reader = channel.open_reader("t", partition, 0).await.unwrap();
            let batch = reader.next_batch(10, Duration::ZERO).await.unwrap();
            assert_eq!(batch.len(), 1);
            let payload = json::Codec {}.decode(&batch[0].1).unwrap();
            assert!(matches!(payload.body, EventBody::Schema { .. }));
            assert_eq!(payload.schema_version, 2);
        }
        let cursor = positions.source_cursor("pg").await.unwrap();
        assert_eq!(cursor.schema_versions.get("users"), Some(&2));
    }

    #[tokio::test]
    async fn test_resumes_after_saved_cursor() {
        let (log, channel, positions, mut capture) = setup(1).await;
        log.insert("users", row(1));
        capture.step().await.unwrap();
        log.insert("users", row(2));

        let mut resumed = Capture::open(
            "pg",
            log.clone(),
            [users()],
            channel.clone(),
            Arc::new(json::Codec {}),
            positions.clone(),
            capture.config.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(resumed.step().await.unwrap(), 1);
        assert_eq!(channel.bounds(0).await.unwrap().next, 2);
    }
}
