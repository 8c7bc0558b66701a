//! In-process change log, used by tests and the `memory` source kind
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{ChangeLog, LogBounds, LogEntry};
use crate::{
    error::{RelayError, Result},
    model::{Image, Operation, SourcePosition, TableSchema},
};

#[derive(Default)]
struct State {
    entries: Vec<LogEntry>,
    next_position: u64,
    truncated_through: Option<SourcePosition>,
    /// when set, nothing past this position is reported as committed
    commit_limit: Option<SourcePosition>,
    /// number of upcoming calls that fail with `SourceUnavailable`
    failures: u32,
}

pub struct MemoryChangeLog {
    name: String,
    state: Mutex<State>,
}

impl MemoryChangeLog {
    pub fn new(name: &str) -> MemoryChangeLog {
        MemoryChangeLog {
            name: name.to_owned(),
            state: Mutex::new(State {
                next_position: 1,
                ..Default::default()
            }),
        }
    }

    fn push(&self, f: impl FnOnce(SourcePosition) -> LogEntry) -> SourcePosition {
        let mut st = self.state.lock().unwrap();
        let pos = SourcePosition(st.next_position);
        st.next_position += 1;
        st.entries.push(f(pos));
        pos
    }

    pub fn insert(&self, table: &str, after: Image) -> SourcePosition {
        self.change(table, Operation::Insert, None, Some(after))
    }

    pub fn update(&self, table: &str, before: Image, after: Image) -> SourcePosition {
        self.change(table, Operation::Update, Some(before), Some(after))
    }

    pub fn delete(&self, table: &str, before: Image) -> SourcePosition {
        self.change(table, Operation::Delete, Some(before), None)
    }

    pub fn change(
        &self,
        table: &str,
        operation: Operation,
        before: Option<Image>,
        after: Option<Image>,
    ) -> SourcePosition {
        self.push(|position| LogEntry::Change {
            position,
            table: table.to_owned(),
            operation,
            before,
            after,
            commit_timestamp: Utc::now(),
        })
    }

    pub fn alter(&self, schema: TableSchema) -> SourcePosition {
        self.push(|position| LogEntry::Schema { position, schema })
    }

    /// Discards everything up to and including `through`
    pub fn truncate(&self, through: SourcePosition) {
        let mut st = self.state.lock().unwrap();
        st.entries.retain(|e| e.position() > through);
        st.truncated_through = Some(through);
    }

    pub fn limit_commit(&self, limit: Option<SourcePosition>) {
        self.state.lock().unwrap().commit_limit = limit;
    }

    pub fn fail_next(&self, calls: u32) {
        self.state.lock().unwrap().failures = calls;
    }

    fn check_available(st: &mut State) -> Result<()> {
        if st.failures > 0 {
            st.failures -= 1;
            return Err(RelayError::SourceUnavailable("memory log offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeLog for MemoryChangeLog {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    async fn bounds(&self) -> Result<LogBounds> {
        let mut st = self.state.lock().unwrap();
        Self::check_available(&mut st)?;
        let last = st.entries.last().map(LogEntry::position);
        let committed_through = match (last, st.commit_limit) {
            (Some(last), Some(limit)) if limit < last => Some(limit),
            (last, _) => last,
        };
        Ok(LogBounds {
            truncated_through: st.truncated_through,
            committed_through,
        })
    }

    async fn fetch(
        &self,
        after: Option<SourcePosition>,
        up_to: SourcePosition,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut st = self.state.lock().unwrap();
        Self::check_available(&mut st)?;
        Ok(st
            .entries
            .iter()
            .filter(|e| after.map_or(true, |a| e.position() > a) && e.position() <= up_to)
            .take(limit)
            .cloned()
            .collect())
    }
}
