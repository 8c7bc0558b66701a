//! Log reader: tails a source change log in commit order
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::{RelayError, Result},
    model::{ChangeRecord, LogRecord, SchemaMarker, SourcePosition},
    retry::{with_retry, RetryConfig},
    source::{ChangeLog, LogEntry},
};

/// Where a reader resumes: last captured position and the schema version of
/// every table seen so far
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourceCursor {
    pub position: Option<SourcePosition>,
    #[serde(default)]
    pub schema_versions: BTreeMap<String, u32>,
}

pub struct LogReader {
    log: Arc<dyn ChangeLog>,
    cursor: SourceCursor,
    batch_size: usize,
    poll_interval: Duration,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl LogReader {
    pub fn new(
        log: Arc<dyn ChangeLog>,
        cursor: SourceCursor,
        batch_size: usize,
        poll_interval: Duration,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> LogReader {
        LogReader {
            log,
            cursor,
            batch_size,
            poll_interval,
            retry,
            cancel,
        }
    }

    /// Cursor covering everything returned by `poll` so far
    pub fn cursor(&self) -> &SourceCursor {
        &self.cursor
    }

    /// Returns the next records in commit order.
    ///
    /// Waits up to the poll interval when nothing new is committed and then
    /// returns an empty batch.
    pub async fn poll(&mut self) -> Result<Vec<LogRecord>> {
        let name = self.log.get_name();
        let log = self.log.clone();
        let bounds = with_retry(&self.retry, &self.cancel, "source_bounds", || log.bounds()).await?;

        if let Some(truncated_through) = bounds.truncated_through {
            if self.cursor.position.map_or(true, |p| truncated_through > p) {
                error!(
                    source = %name,
                    truncated_through = truncated_through.0,
                    last_captured = ?self.cursor.position,
                    "source_log_gap_detected"
                );
                return Err(RelayError::SourceLogGapDetected {
                    truncated_through,
                    last_captured: self.cursor.position,
                });
            }
        }

        let up_to = match bounds.committed_through {
            Some(c) if self.cursor.position.map_or(true, |p| c > p) => c,
            _ => {
                self.idle().await;
                return Ok(Vec::new());
            }
        };

        let after = self.cursor.position;
        let limit = self.batch_size;
        let entries = with_retry(&self.retry, &self.cancel, "source_fetch", || {
            log.fetch(after, up_to, limit)
        })
        .await?;
        if entries.is_empty() {
            self.idle().await;
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let position = entry.position();
            if let Some(last) = self.cursor.position {
                if position <= last {
                    return Err(RelayError::SourceOutOfOrder {
                        after: last,
                        got: position,
                    });
                }
            }
            records.push(self.convert(entry));
            self.cursor.position = Some(position);
        }
        debug!(source = %name, count = records.len(), up_to = up_to.0, "polled");
        Ok(records)
    }

    fn convert(&mut self, entry: LogEntry) -> LogRecord {
        match entry {
            LogEntry::Change {
                position,
                table,
                operation,
                before,
                after,
                commit_timestamp,
            } => {
                let schema_version = *self.cursor.schema_versions.get(&table).unwrap_or(&1);
                LogRecord::Change(ChangeRecord {
                    source_position: position,
                    table,
                    operation,
                    before,
                    after,
                    commit_timestamp,
                    schema_version,
                })
            }
            LogEntry::Schema {
                position,
                mut schema,
            } => {
                // tables start at version 1, every captured DDL bumps it
                let current = *self.cursor.schema_versions.get(&schema.table).unwrap_or(&1);
                schema.version = schema.version.max(current + 1);
                self.cursor
                    .schema_versions
                    .insert(schema.table.clone(), schema.version);
                info!(
                    source = %self.log.get_name(),
                    table = %schema.table,
                    version = schema.version,
                    "schema_change_captured"
                );
                LogRecord::Schema(SchemaMarker {
                    source_position: position,
                    table: schema.table.clone(),
                    schema,
                })
            }
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }
}
