//! Avro envelope codec with Confluent wire header
use std::{collections::HashMap, io::BufReader};

use apache_avro::{from_avro_datum, to_avro_datum, types::Value as AvroValue, Schema};
use chrono::DateTime;
use serde::Deserialize;
use uuid::Uuid;

use super::CONFLUENT_HEADER_LEN;
use crate::{
    error::{RelayError, Result},
    model::{EventBody, EventPayload, Image, Operation, SourcePosition, TableSchema, Value},
};

const ENVELOPE_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "ChangeEvent",
    "namespace": "chrelay",
    "fields": [
        {"name": "schema_version", "type": "int"},
        {"name": "partition_key", "type": "string"},
        {"name": "kind", "type": {"type": "enum", "name": "Kind", "symbols": ["ROW", "SCHEMA"]}},
        {"name": "table", "type": "string"},
        {"name": "source_position", "type": "long"},
        {"name": "operation", "type": ["null", {"type": "enum", "name": "Operation", "symbols": ["INSERT", "UPDATE", "DELETE"]}]},
        {"name": "before", "type": ["null", {"type": "map", "values": ["null", "boolean", "long", "double", "string",
            {"type": "fixed", "name": "Uuid", "size": 16}]}]},
        {"name": "after", "type": ["null", {"type": "map", "values": ["null", "boolean", "long", "double", "string", "chrelay.Uuid"]}]},
        {"name": "commit_timestamp", "type": ["null", {"type": "long", "logicalType": "timestamp-micros"}]},
        {"name": "table_schema", "type": ["null", {
            "type": "record",
            "name": "TableSchema",
            "fields": [
                {"name": "version", "type": "int"},
                {"name": "primary_key", "type": {"type": "array", "items": "string"}},
                {"name": "columns", "type": {"type": "array", "items": "string"}}
            ]
        }]}
    ]
}
"#;

const OPERATIONS: [&str; 3] = ["INSERT", "UPDATE", "DELETE"];

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// schema id written to the Confluent header
    pub schema_id: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings { schema_id: 1 }
    }
}

pub struct Codec {
    schema: Schema,
    schema_id: u32,
}

pub fn new(settings: Settings) -> Result<Codec> {
    Ok(Codec {
        schema: Schema::parse_str(ENVELOPE_SCHEMA)?,
        schema_id: settings.schema_id,
    })
}

impl super::Codec for Codec {
    fn get_name(&self) -> String {
        String::from("avro")
    }

    fn encode(&self, payload: &EventPayload) -> Result<Vec<u8>> {
        let datum = to_avro_datum(&self.schema, envelope(payload))?;
        let mut message = Vec::with_capacity(CONFLUENT_HEADER_LEN + datum.len());
        message.push(0);
        message.extend_from_slice(&self.schema_id.to_be_bytes());
        message.extend(datum);
        Ok(message)
    }

    fn decode(&self, message: &[u8]) -> Result<EventPayload> {
        if message.len() < CONFLUENT_HEADER_LEN || message[0] != 0 {
            return Err(RelayError::Codec("missing confluent header".into()));
        }
        let schema_id = u32::from_be_bytes([message[1], message[2], message[3], message[4]]);
        if schema_id != self.schema_id {
            return Err(RelayError::Codec(format!(
                "unexpected schema id {schema_id}, expecting {}",
                self.schema_id
            )));
        }
        let mut datum = BufReader::new(&message[CONFLUENT_HEADER_LEN..]);
        let v = from_avro_datum(&self.schema, &mut datum, None)?;
        from_envelope(v)
    }
}

fn nullable(v: Option<AvroValue>) -> AvroValue {
    match v {
        None => AvroValue::Union(0, Box::new(AvroValue::Null)),
        Some(v) => AvroValue::Union(1, Box::new(v)),
    }
}

fn image2avro(image: &Image) -> AvroValue {
    let map = image
        .iter()
        .map(|(column, value)| {
            let v = match value {
                Value::Null => AvroValue::Union(0, Box::new(AvroValue::Null)),
                Value::Bool(x) => AvroValue::Union(1, Box::new(AvroValue::Boolean(*x))),
                Value::Int(x) => AvroValue::Union(2, Box::new(AvroValue::Long(*x))),
                Value::Float(x) => AvroValue::Union(3, Box::new(AvroValue::Double(*x))),
                Value::Text(x) => AvroValue::Union(4, Box::new(AvroValue::String(x.clone()))),
                Value::Uuid(x) => AvroValue::Union(5, Box::new(AvroValue::Fixed(16, x.as_bytes().to_vec()))),
            };
            (column.clone(), v)
        })
        .collect::<HashMap<_, _>>();
    AvroValue::Map(map)
}

fn strings(v: &[String]) -> AvroValue {
    AvroValue::Array(v.iter().cloned().map(AvroValue::String).collect())
}

fn envelope(payload: &EventPayload) -> AvroValue {
    let (kind, operation, before, after, commit_timestamp, table_schema) = match &payload.body {
        EventBody::Row {
            operation,
            before,
            after,
            commit_timestamp,
            ..
        } => {
            let idx = match operation {
                Operation::Insert => 0,
                Operation::Update => 1,
                Operation::Delete => 2,
            };
            (
                AvroValue::Enum(0, "ROW".into()),
                Some(AvroValue::Enum(idx, OPERATIONS[idx as usize].into())),
                before.as_ref().map(image2avro),
                after.as_ref().map(image2avro),
                Some(AvroValue::TimestampMicros(commit_timestamp.timestamp_micros())),
                None,
            )
        }
        EventBody::Schema { schema, .. } => (
            AvroValue::Enum(1, "SCHEMA".into()),
            None,
            None,
            None,
            None,
            Some(AvroValue::Record(vec![
                ("version".into(), AvroValue::Int(schema.version as i32)),
                ("primary_key".into(), strings(&schema.primary_key)),
                ("columns".into(), strings(&schema.columns)),
            ])),
        ),
    };
    AvroValue::Record(vec![
        ("schema_version".into(), AvroValue::Int(payload.schema_version as i32)),
        ("partition_key".into(), AvroValue::String(payload.partition_key.clone())),
        ("kind".into(), kind),
        ("table".into(), AvroValue::String(payload.table().to_owned())),
        ("source_position".into(), AvroValue::Long(payload.source_position().0 as i64)),
        ("operation".into(), nullable(operation)),
        ("before".into(), nullable(before)),
        ("after".into(), nullable(after)),
        ("commit_timestamp".into(), nullable(commit_timestamp)),
        ("table_schema".into(), nullable(table_schema)),
    ])
}

fn unexpected(what: &str, v: &AvroValue) -> RelayError {
    RelayError::Codec(format!("unexpected avro value for {what}: {v:?}"))
}

struct Fields(Vec<(String, AvroValue)>);

impl Fields {
    fn take(&mut self, name: &str) -> Result<AvroValue> {
        let idx = self
            .0
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| RelayError::Codec(format!("avro record misses field {name}")))?;
        Ok(self.0.swap_remove(idx).1)
    }

    fn string(&mut self, name: &str) -> Result<String> {
        match self.take(name)? {
            AvroValue::String(s) => Ok(s),
            v => Err(unexpected(name, &v)),
        }
    }

    fn int(&mut self, name: &str) -> Result<i32> {
        match self.take(name)? {
            AvroValue::Int(x) => Ok(x),
            v => Err(unexpected(name, &v)),
        }
    }

    fn strings(&mut self, name: &str) -> Result<Vec<String>> {
        match self.take(name)? {
            AvroValue::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    AvroValue::String(s) => Ok(s),
                    v => Err(unexpected(name, &v)),
                })
                .collect(),
            v => Err(unexpected(name, &v)),
        }
    }

    fn nullable(&mut self, name: &str) -> Result<Option<AvroValue>> {
        match self.take(name)? {
            AvroValue::Union(_, v) => match *v {
                AvroValue::Null => Ok(None),
                v => Ok(Some(v)),
            },
            v => Err(unexpected(name, &v)),
        }
    }
}

fn avro2image(v: AvroValue) -> Result<Image> {
    let AvroValue::Map(map) = v else {
        return Err(unexpected("image", &v));
    };
    map.into_iter()
        .map(|(column, v)| {
            let inner = match v {
                AvroValue::Union(_, inner) => *inner,
                other => other,
            };
            let value = match inner {
                AvroValue::Null => Value::Null,
                AvroValue::Boolean(x) => Value::Bool(x),
                AvroValue::Long(x) => Value::Int(x),
                AvroValue::Double(x) => Value::Float(x),
                AvroValue::String(s) => Value::Text(s),
                AvroValue::Fixed(16, bytes) => Uuid::from_slice(&bytes)
                    .map(Value::Uuid)
                    .map_err(|e| RelayError::Codec(format!("column {column}: {e}")))?,
                other => return Err(unexpected(&column, &other)),
            };
            Ok((column, value))
        })
        .collect()
}

fn from_envelope(v: AvroValue) -> Result<EventPayload> {
    let AvroValue::Record(fields) = v else {
        return Err(RelayError::Codec("avro message must be a record".into()));
    };
    let mut fields = Fields(fields);
    let schema_version = fields.int("schema_version")? as u32;
    let partition_key = fields.string("partition_key")?;
    let table = fields.string("table")?;
    let source_position = match fields.take("source_position")? {
        AvroValue::Long(x) => SourcePosition(x as u64),
        v => return Err(unexpected("source_position", &v)),
    };
    let body = match fields.take("kind")? {
        AvroValue::Enum(0, _) => {
            let operation = match fields.nullable("operation")? {
                Some(AvroValue::Enum(0, _)) => Operation::Insert,
                Some(AvroValue::Enum(1, _)) => Operation::Update,
                Some(AvroValue::Enum(2, _)) => Operation::Delete,
                other => return Err(RelayError::Codec(format!("bad operation {other:?}"))),
            };
            let commit_timestamp = match fields.nullable("commit_timestamp")? {
                Some(AvroValue::TimestampMicros(x)) | Some(AvroValue::Long(x)) => {
                    DateTime::from_timestamp_micros(x)
                        .ok_or_else(|| RelayError::Codec(format!("timestamp out of range: {x}")))?
                }
                other => return Err(RelayError::Codec(format!("bad commit timestamp {other:?}"))),
            };
            EventBody::Row {
                operation,
                before: fields.nullable("before")?.map(avro2image).transpose()?,
                after: fields.nullable("after")?.map(avro2image).transpose()?,
                commit_timestamp,
                source_position,
                table,
            }
        }
        AvroValue::Enum(1, _) => {
            let Some(AvroValue::Record(s)) = fields.nullable("table_schema")? else {
                return Err(RelayError::Codec("schema event without table schema".into()));
            };
            let mut s = Fields(s);
            EventBody::Schema {
                schema: TableSchema {
                    table: table.clone(),
                    version: s.int("version")? as u32,
                    primary_key: s.strings("primary_key")?,
                    columns: s.strings("columns")?,
                },
                source_position,
                table,
            }
        }
        v => return Err(unexpected("kind", &v)),
    };
    Ok(EventPayload {
        schema_version,
        partition_key,
        body,
    })
}
