//! Keyed in-memory target, used by tests and the `memory` sink kind
use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;

use super::{Mutation, TargetStore};
use crate::{
    error::{RelayError, Result},
    model::{Image, SourcePosition},
};

#[derive(Debug, Clone)]
struct Stored {
    version: SourcePosition,
    /// None is a tombstone
    row: Option<Image>,
}

#[derive(Default)]
struct State {
    rows: BTreeMap<(String, String), Stored>,
    rejected_tables: HashSet<String>,
    failures: u32,
    applied: u64,
}

pub struct MemoryTarget {
    name: String,
    state: Mutex<State>,
}

fn key_string(key: &Image) -> String {
    serde_json::to_string(key).unwrap_or_default()
}

impl MemoryTarget {
    pub fn new(name: &str) -> MemoryTarget {
        MemoryTarget {
            name: name.to_owned(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn get(&self, table: &str, key: &Image) -> Option<Image> {
        let st = self.state.lock().unwrap();
        st.rows
            .get(&(table.to_owned(), key_string(key)))
            .and_then(|s| s.row.clone())
    }

    /// Live rows of `table`
    pub fn rows(&self, table: &str) -> Vec<Image> {
        let st = self.state.lock().unwrap();
        st.rows
            .iter()
            .filter(|((t, _), _)| t == table)
            .filter_map(|(_, s)| s.row.clone())
            .collect()
    }

    /// Number of mutations that reached the store, including ignored stale ones
    pub fn applied(&self) -> u64 {
        self.state.lock().unwrap().applied
    }

    /// Makes every write to `table` fail permanently
    pub fn reject_table(&self, table: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_tables
            .insert(table.to_owned());
    }

    pub fn fail_next(&self, calls: u32) {
        self.state.lock().unwrap().failures = calls;
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    async fn apply(&self, batch: &[Mutation]) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.failures > 0 {
            st.failures -= 1;
            return Err(RelayError::TargetUnavailable(format!("{} offline", self.name)));
        }
        if let Some(m) = batch.iter().find(|m| st.rejected_tables.contains(m.table())) {
            return Err(RelayError::TargetApplyRejected {
                table: m.table().to_owned(),
                reason: "table rejects writes".into(),
            });
        }
        for m in batch {
            let (table, key, version, row) = match m {
                Mutation::Upsert {
                    table,
                    key,
                    row,
                    version,
                } => (table, key, *version, Some(row.clone())),
                Mutation::Delete {
                    table,
                    key,
                    version,
                } => (table, key, *version, None),
            };
            st.applied += 1;
            let slot = (table.clone(), key_string(key));
            match st.rows.get(&slot) {
                Some(existing) if existing.version > version => {}
                _ => {
                    st.rows.insert(slot, Stored { version, row });
                }
            }
        }
        Ok(())
    }
}
