//! Event encoder: turns captured records into self-describing change events
use std::collections::HashMap;

use crate::{
    error::{RelayError, Result},
    model::{ChangeEvent, ChangeRecord, EventBody, EventPayload, SchemaMarker, TableSchema, Value},
};

/// Encodes records of registered tables.
///
/// Encoding is deterministic: the same record always yields the same event.
pub struct Encoder {
    tables: HashMap<String, TableSchema>,
}

impl Encoder {
    /// Fails if any table has no primary key
    pub fn new(tables: impl IntoIterator<Item = TableSchema>) -> Result<Encoder> {
        let mut encoder = Encoder {
            tables: HashMap::new(),
        };
        for schema in tables {
            encoder.register(schema)?;
        }
        Ok(encoder)
    }

    pub fn register(&mut self, schema: TableSchema) -> Result<()> {
        if schema.primary_key.is_empty() {
            return Err(RelayError::Config(format!(
                "table {} has no primary key",
                schema.table
            )));
        }
        self.tables.insert(schema.table.clone(), schema);
        Ok(())
    }

    pub fn handles(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn encode(&self, record: &ChangeRecord) -> Result<ChangeEvent> {
        let schema = self.tables.get(&record.table).ok_or_else(|| {
            RelayError::Encoding(format!("table {} is not registered", record.table))
        })?;
        let partition_key = partition_key(schema, record)?;
        Ok(ChangeEvent {
            partition_key: partition_key.clone(),
            broadcast: false,
            payload: EventPayload {
                schema_version: record.schema_version,
                partition_key,
                body: EventBody::Row {
                    table: record.table.clone(),
                    operation: record.operation,
                    before: record.before.clone(),
                    after: record.after.clone(),
                    source_position: record.source_position,
                    commit_timestamp: record.commit_timestamp,
                },
            },
        })
    }

    /// Schema markers are broadcast to every partition, each partition must
    /// see them before rows encoded under the new version
    pub fn encode_marker(&self, marker: &SchemaMarker) -> ChangeEvent {
        ChangeEvent {
            partition_key: marker.table.clone(),
            broadcast: true,
            payload: EventPayload {
                schema_version: marker.schema.version,
                partition_key: marker.table.clone(),
                body: EventBody::Schema {
                    table: marker.table.clone(),
                    schema: marker.schema.clone(),
                    source_position: marker.source_position,
                },
            },
        }
    }
}

/// `<table>:<primary key values as a JSON array>`
fn partition_key(schema: &TableSchema, record: &ChangeRecord) -> Result<String> {
    let image = record.key_image().ok_or_else(|| {
        RelayError::Encoding(format!(
            "{:?} on {} at {} carries no row image",
            record.operation, record.table, record.source_position
        ))
    })?;
    let values = schema
        .primary_key
        .iter()
        .map(|column| {
            image.get(column).ok_or_else(|| {
                RelayError::Encoding(format!(
                    "{} at {} is missing primary key column {column}",
                    record.table, record.source_position
                ))
            })
        })
        .collect::<Result<Vec<&Value>>>()?;
    Ok(format!("{}:{}", record.table, serde_json::to_string(&values)?))
}
