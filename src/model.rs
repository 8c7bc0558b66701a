//! Records, events and schemas that flow through the relay
use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Location of a record in the source log (log sequence number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePosition(pub u64);

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single column value.
///
/// Untagged on the wire. Strings always decode as [`Value::Text`], UUIDs are
/// written as `{"uuid": "..."}` so text never turns into a UUID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(#[serde(with = "tagged_uuid")] Uuid),
}

mod tagged_uuid {
    use super::*;

    #[derive(Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Tagged {
        uuid: Uuid,
    }

    pub fn serialize<S: Serializer>(uuid: &Uuid, s: S) -> Result<S::Ok, S::Error> {
        Tagged { uuid: *uuid }.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Uuid, D::Error> {
        Ok(Tagged::deserialize(d)?.uuid)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(x: i64) -> Self {
        Value::Int(x)
    }
}

impl From<bool> for Value {
    fn from(x: bool) -> Self {
        Value::Bool(x)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<Uuid> for Value {
    fn from(x: Uuid) -> Self {
        Value::Uuid(x)
    }
}

/// Row image - column name to value, ordered by column name
pub type Image = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One row-level mutation observed in the source log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub source_position: SourcePosition,
    pub table: String,
    pub operation: Operation,
    pub before: Option<Image>,
    pub after: Option<Image>,
    pub commit_timestamp: DateTime<Utc>,
    /// schema version of `table` in force when the record was captured
    pub schema_version: u32,
}

impl ChangeRecord {
    /// Image that identifies the row: after image, or before image for deletes
    pub fn key_image(&self) -> Option<&Image> {
        match self.operation {
            Operation::Delete => self.before.as_ref(),
            _ => self.after.as_ref().or(self.before.as_ref()),
        }
    }
}

/// Explicit, versioned description of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    #[serde(default = "first_version")]
    pub version: u32,
    pub primary_key: Vec<String>,
    /// known columns; empty means unconstrained
    #[serde(default)]
    pub columns: Vec<String>,
}

fn first_version() -> u32 {
    1
}

impl TableSchema {
    /// Returns first column of `image` that this schema does not know about
    pub fn unknown_column<'a>(&self, image: &'a Image) -> Option<&'a str> {
        if self.columns.is_empty() {
            return None;
        }
        image
            .keys()
            .find(|c| !self.columns.iter().any(|k| k == *c))
            .map(String::as_str)
    }
}

/// Synthetic record emitted when a table's schema changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaMarker {
    pub source_position: SourcePosition,
    pub table: String,
    pub schema: TableSchema,
}

/// Unit emitted by the log reader
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Change(ChangeRecord),
    Schema(SchemaMarker),
}

impl LogRecord {
    pub fn source_position(&self) -> SourcePosition {
        match self {
            LogRecord::Change(r) => r.source_position,
            LogRecord::Schema(m) => m.source_position,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            LogRecord::Change(r) => &r.table,
            LogRecord::Schema(m) => &m.table,
        }
    }
}

/// Body of an event on the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventBody {
    Row {
        table: String,
        operation: Operation,
        before: Option<Image>,
        after: Option<Image>,
        source_position: SourcePosition,
        commit_timestamp: DateTime<Utc>,
    },
    Schema {
        table: String,
        schema: TableSchema,
        source_position: SourcePosition,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub schema_version: u32,
    pub partition_key: String,
    pub body: EventBody,
}

impl EventPayload {
    pub fn table(&self) -> &str {
        match &self.body {
            EventBody::Row { table, .. } | EventBody::Schema { table, .. } => table,
        }
    }

    pub fn source_position(&self) -> SourcePosition {
        match &self.body {
            EventBody::Row {
                source_position, ..
            }
            | EventBody::Schema {
                source_position, ..
            } => *source_position,
        }
    }
}

/// Change event before the channel assigns it an offset
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub partition_key: String,
    /// set for schema markers, which go to every partition
    pub broadcast: bool,
    pub payload: EventPayload,
}
