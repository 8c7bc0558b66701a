//! Source change logs the relay can tail
pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{RelayError, Result},
    model::{Image, Operation, SourcePosition, TableSchema},
    settings,
};

/// Entry of a source change log, as the source stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogEntry {
    Change {
        position: SourcePosition,
        table: String,
        operation: Operation,
        #[serde(default)]
        before: Option<Image>,
        #[serde(default)]
        after: Option<Image>,
        commit_timestamp: DateTime<Utc>,
    },
    /// DDL observed in the log
    Schema {
        position: SourcePosition,
        schema: TableSchema,
    },
}

impl LogEntry {
    pub fn position(&self) -> SourcePosition {
        match self {
            LogEntry::Change { position, .. } | LogEntry::Schema { position, .. } => *position,
        }
    }
}

/// What the source currently retains and has committed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogBounds {
    /// highest position discarded by the source, if any
    pub truncated_through: Option<SourcePosition>,
    /// highest position of fully committed data, if any
    pub committed_through: Option<SourcePosition>,
}

/// Source collaborator: a committed, ordered change log that can be resumed
/// from a saved position
#[async_trait]
pub trait ChangeLog: Send + Sync {
    fn get_name(&self) -> String;

    async fn bounds(&self) -> Result<LogBounds>;

    /// Entries with `after < position <= up_to` in log order, at most `limit`
    async fn fetch(
        &self,
        after: Option<SourcePosition>,
        up_to: SourcePosition,
        limit: usize,
    ) -> Result<Vec<LogEntry>>;
}

/// Creates change log of specified kind.
/// If you add your own sources, register them here
pub fn get_source(name: &str, cfg: &settings::Source) -> Result<Arc<dyn ChangeLog>> {
    match cfg.kind.as_str() {
        "file" => match &cfg.path {
            Some(path) => Ok(Arc::new(file::FileChangeLog::new(name, path))),
            None => Err(RelayError::Config(format!("source {name}: file source needs path"))),
        },
        "memory" => Ok(Arc::new(memory::MemoryChangeLog::new(name))),
        other => Err(RelayError::Config(format!("source {name}: unknown kind {other}"))),
    }
}
