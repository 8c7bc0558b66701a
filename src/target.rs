//! Target stores the sink applier writes into
pub mod clickhouse;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{RelayError, Result},
    model::{Image, SourcePosition},
    settings,
};

/// Keyed mutation of one target row.
///
/// `version` is the source position of the change. Stores keep the highest
/// version per key and ignore older mutations, so replays cannot move a row
/// backwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Upsert {
        table: String,
        key: Image,
        row: Image,
        version: SourcePosition,
    },
    Delete {
        table: String,
        key: Image,
        version: SourcePosition,
    },
}

impl Mutation {
    pub fn table(&self) -> &str {
        match self {
            Mutation::Upsert { table, .. } | Mutation::Delete { table, .. } => table,
        }
    }
}

/// Target collaborator: upsert-by-key and delete-by-key, nothing else
#[async_trait]
pub trait TargetStore: Send + Sync {
    fn get_name(&self) -> String;

    /// Applies mutations in order. Fails with `TargetUnavailable` for
    /// transient faults and `TargetApplyRejected` otherwise.
    async fn apply(&self, batch: &[Mutation]) -> Result<()>;
}

/// Creates target store of specified kind.
/// If you add your own targets, register them here
pub fn get_target(name: &str, cfg: &settings::Sink) -> Result<Arc<dyn TargetStore>> {
    match cfg.kind.as_str() {
        "clickhouse" => match &cfg.clickhouse_url {
            Some(url) => Ok(Arc::new(clickhouse::ClickHouseTarget::new(
                name,
                url,
                cfg.tables.clone(),
            ))),
            None => Err(RelayError::Config(format!("sink {name}: clickhouse_url missing"))),
        },
        "memory" => Ok(Arc::new(memory::MemoryTarget::new(name))),
        other => Err(RelayError::Config(format!("sink {name}: unknown kind {other}"))),
    }
}
