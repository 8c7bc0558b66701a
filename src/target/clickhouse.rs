//! ClickHouse target.
//!
//! Tables are expected to be `ReplacingMergeTree(_version, _deleted)` ordered
//! by the primary key. Upserts insert the full row, deletes insert a
//! tombstone carrying only the key, both stamped with the source position as
//! `_version`. Re-inserting a row with the same version is harmless, which is
//! what makes replays idempotent. Null columns are left out so the column
//! default applies.
use std::collections::HashMap;

use async_trait::async_trait;
use clickhouse_rs::{
    errors::{codes, Error as ClickHouseError},
    types::Value as CHValue,
    Block, Pool,
};
use tracing::debug;

use super::{Mutation, TargetStore};
use crate::{
    error::{RelayError, Result},
    model::{Image, Value},
};

/// ClickHouse row - vector of columns, each column is tuple of its name and value
pub type Row = Vec<(String, CHValue)>;

pub const VERSION_COLUMN: &str = "_version";
pub const DELETED_COLUMN: &str = "_deleted";

pub struct ClickHouseTarget {
    name: String,
    pool: Pool,
    /// source table to ClickHouse table, unmapped tables keep their name
    tables: HashMap<String, String>,
}

impl ClickHouseTarget {
    pub fn new(name: &str, url: &str, tables: HashMap<String, String>) -> ClickHouseTarget {
        ClickHouseTarget {
            name: name.to_owned(),
            pool: Pool::new(url.to_owned()),
            tables,
        }
    }

    fn target_table<'a>(&'a self, table: &'a str) -> &'a str {
        self.tables.get(table).map_or(table, String::as_str)
    }
}

fn value2ch(v: &Value) -> Option<CHValue> {
    match v {
        Value::Null => None,
        Value::Bool(x) => Some(CHValue::from(*x)),
        Value::Int(x) => Some(CHValue::from(*x)),
        Value::Float(x) => Some(CHValue::from(*x)),
        Value::Uuid(x) => Some(CHValue::from(*x)),
        Value::Text(x) => Some(CHValue::from(x.clone())),
    }
}

fn image2row(image: &Image) -> Row {
    image
        .iter()
        .filter_map(|(column, v)| value2ch(v).map(|v| (column.clone(), v)))
        .collect()
}

/// Row to insert for a mutation
pub fn to_row(m: &Mutation) -> Row {
    let (mut row, version, deleted) = match m {
        Mutation::Upsert { row, version, .. } => (image2row(row), version, 0u8),
        Mutation::Delete { key, version, .. } => (image2row(key), version, 1u8),
    };
    row.push((VERSION_COLUMN.to_owned(), CHValue::from(version.0)));
    row.push((DELETED_COLUMN.to_owned(), CHValue::from(deleted)));
    row
}

/// Server error codes that mean the rows do not fit the table. Any other
/// server error (too many parts, memory limit, timeouts, readonly replica)
/// goes away on its own and is retried.
const REJECTING_CODES: &[u32] = &[
    codes::CANNOT_PARSE_TEXT,
    codes::NO_SUCH_COLUMN_IN_TABLE,
    codes::NUMBER_OF_COLUMNS_DOESNT_MATCH,
    codes::CANNOT_PARSE_QUOTED_STRING,
    codes::CANNOT_PARSE_INPUT_ASSERTION_FAILED,
    codes::CANNOT_PARSE_DATETIME,
    codes::UNKNOWN_IDENTIFIER,
    codes::TYPE_MISMATCH,
    codes::UNKNOWN_TABLE,
    codes::ARGUMENT_OUT_OF_BOUND,
    codes::CANNOT_CONVERT_TYPE,
    codes::UNKNOWN_DATABASE,
    codes::INCORRECT_DATA,
    codes::CANNOT_INSERT_NULL_IN_ORDINARY_COLUMN,
];

fn classify(table: &str, e: ClickHouseError) -> RelayError {
    let rejected = match &e {
        ClickHouseError::Server(server) => REJECTING_CODES.contains(&server.code),
        ClickHouseError::FromSql(_) => true,
        _ => false,
    };
    if rejected {
        RelayError::TargetApplyRejected {
            table: table.to_owned(),
            reason: e.to_string(),
        }
    } else {
        RelayError::TargetUnavailable(format!("clickhouse: {e}"))
    }
}

#[async_trait]
impl TargetStore for ClickHouseTarget {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    async fn apply(&self, batch: &[Mutation]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // one block per table and column layout, in first-seen order;
        // ReplacingMergeTree resolves order within a key through _version
        let mut blocks: Vec<(String, Vec<String>, Vec<Row>)> = Vec::new();
        for m in batch {
            let table = self.target_table(m.table());
            let row = to_row(m);
            let columns: Vec<String> = row.iter().map(|(c, _)| c.clone()).collect();
            match blocks
                .iter_mut()
                .find(|b| b.0 == table && b.1 == columns)
            {
                Some(b) => b.2.push(row),
                None => blocks.push((table.to_owned(), columns, vec![row])),
            }
        }

        let mut ch = self
            .pool
            .get_handle()
            .await
            .map_err(|e| RelayError::TargetUnavailable(format!("clickhouse: {e}")))?;
        for (table, _, rows) in blocks {
            let count = rows.len();
            let mut block = Block::with_capacity(count);
            for row in rows {
                block.push(row).map_err(|e| classify(&table, e))?;
            }
            ch.insert(table.as_str(), block)
                .await
                .map_err(|e| classify(&table, e))?;
            debug!(sink = %self.name, table = %table, rows = count, "inserted_block");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourcePosition;
    use clickhouse_rs::errors::ServerError;

    fn server_error(code: u32, name: &str) -> ClickHouseError {
        ClickHouseError::Server(ServerError {
            code,
            name: name.into(),
            message: format!("{name} while inserting"),
            stack_trace: String::new(),
        })
    }

    fn key(id: i64) -> Image {
        let mut k = Image::new();
        k.insert("id".into(), Value::Int(id));
        k
    }

    #[test]
    fn test_upsert_row_carries_version_and_live_flag() {
        let mut row = key(1);
        row.insert("email".into(), Value::from("john.doe@example.com"));
        row.insert("nickname".into(), Value::Null);
        let r = to_row(&Mutation::Upsert {
            table: "users".into(),
            key: key(1),
            row,
            version: SourcePosition(42),
        });
        let columns: Vec<&str> = r.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(columns, vec!["email", "id", VERSION_COLUMN, DELETED_COLUMN]);
        assert_eq!(r[2].1, CHValue::from(42u64));
        assert_eq!(r[3].1, CHValue::from(0u8));
    }

    #[test]
    fn test_delete_is_tombstone_with_key_only() {
        let r = to_row(&Mutation::Delete {
            table: "users".into(),
            key: key(2),
            version: SourcePosition(43),
        });
        let columns: Vec<&str> = r.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(columns, vec!["id", VERSION_COLUMN, DELETED_COLUMN]);
        assert_eq!(r[2].1, CHValue::from(1u8));
    }

    #[test]
    fn test_schema_errors_reject_and_load_errors_retry() {
        for (code, name) in [
            (codes::NO_SUCH_COLUMN_IN_TABLE, "NO_SUCH_COLUMN_IN_TABLE"),
            (codes::TYPE_MISMATCH, "TYPE_MISMATCH"),
            (codes::UNKNOWN_TABLE, "UNKNOWN_TABLE"),
        ] {
            let e = classify("users", server_error(code, name));
            assert!(matches!(e, RelayError::TargetApplyRejected { .. }), "{name}");
        }
        for (code, name) in [
            (codes::TIMEOUT_EXCEEDED, "TIMEOUT_EXCEEDED"),
            (codes::READONLY, "READONLY"),
            (codes::MEMORY_LIMIT_EXCEEDED, "MEMORY_LIMIT_EXCEEDED"),
            (codes::TOO_MANY_PARTS, "TOO_MANY_PARTS"),
        ] {
            let e = classify("users", server_error(code, name));
            assert!(e.is_transient(), "{name}");
        }
    }
}
