//! In-memory position store for tests
use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use super::{check_advance, reset_checkpoint, Checkpoint, Fault, PositionStore};
use crate::{
    error::{RelayError, Result},
    reader::SourceCursor,
};

#[derive(Default)]
struct State {
    cursors: HashMap<String, SourceCursor>,
    checkpoints: HashMap<(String, u32), Checkpoint>,
    faults: HashMap<(String, u32), Fault>,
    fail_checkpoints: bool,
}

#[derive(Default)]
pub struct MemoryPositionStore {
    state: Mutex<State>,
}

impl MemoryPositionStore {
    pub fn new() -> MemoryPositionStore {
        MemoryPositionStore::default()
    }

    /// While set, checkpoint writes fail as if the process died before
    /// persisting them
    pub fn fail_checkpoints(&self, fail: bool) {
        self.state.lock().unwrap().fail_checkpoints = fail;
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn source_cursor(&self, source: &str) -> Result<SourceCursor> {
        let st = self.state.lock().unwrap();
        Ok(st.cursors.get(source).cloned().unwrap_or_default())
    }

    async fn save_source_cursor(&self, source: &str, cursor: &SourceCursor) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let current = st.cursors.get(source).and_then(|c| c.position).map(|p| p.0);
        check_advance(
            format!("source/{source}"),
            current,
            cursor.position.map(|p| p.0),
        )?;
        st.cursors.insert(source.to_owned(), cursor.clone());
        Ok(())
    }

    async fn checkpoint(&self, consumer: &str, partition: u32) -> Result<Checkpoint> {
        let st = self.state.lock().unwrap();
        Ok(st
            .checkpoints
            .get(&(consumer.to_owned(), partition))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_checkpoint(
        &self,
        consumer: &str,
        partition: u32,
        checkpoint: &Checkpoint,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail_checkpoints {
            return Err(RelayError::Io(std::io::Error::other("checkpoint write failed")));
        }
        let slot = (consumer.to_owned(), partition);
        check_advance(
            format!("{consumer}/{partition}"),
            st.checkpoints.get(&slot).and_then(|c| c.offset),
            checkpoint.offset,
        )?;
        st.checkpoints.insert(slot, checkpoint.clone());
        Ok(())
    }

    async fn fault(&self, consumer: &str, partition: u32) -> Result<Option<Fault>> {
        let st = self.state.lock().unwrap();
        Ok(st.faults.get(&(consumer.to_owned(), partition)).cloned())
    }

    async fn save_fault(&self, consumer: &str, partition: u32, fault: &Fault) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.faults
            .insert((consumer.to_owned(), partition), fault.clone());
        Ok(())
    }

    async fn reset(&self, consumer: &str, partition: u32, offset: u64) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let slot = (consumer.to_owned(), partition);
        let checkpoint = st.checkpoints.remove(&slot).unwrap_or_default();
        st.checkpoints
            .insert(slot.clone(), reset_checkpoint(checkpoint, offset));
        st.faults.remove(&slot);
        Ok(())
    }
}
