//! Durable channel: append-only, partitioned event log between capture and
//! the sink appliers
pub mod kafka;
pub mod log;
pub mod replica;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    codec::Codec,
    error::{RelayError, Result},
    model::ChangeEvent,
    settings,
};

/// Offsets a partition currently retains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionBounds {
    /// lowest retained offset
    pub earliest: u64,
    /// offset the next append will get
    pub next: u64,
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn get_name(&self) -> String;

    fn partitions(&self) -> u32;

    /// Appends to one partition, returns the assigned offset once the record
    /// is durable
    async fn append(&self, partition: u32, payload: &[u8]) -> Result<u64>;

    async fn bounds(&self, partition: u32) -> Result<PartitionBounds>;

    /// Reader of `partition` starting at `from`
    async fn open_reader(
        &self,
        consumer: &str,
        partition: u32,
        from: u64,
    ) -> Result<Box<dyn PartitionReader>>;

    /// Discards records past the retention horizon, returns how many went.
    /// Channels whose retention is enforced elsewhere keep everything.
    async fn enforce_retention(&self) -> Result<u64> {
        Ok(0)
    }

    async fn append_keyed(&self, partition_key: &str, payload: &[u8]) -> Result<(u32, u64)> {
        let partition = partition_for(partition_key, self.partitions());
        let offset = self.append(partition, payload).await?;
        Ok((partition, offset))
    }
}

/// Pull-based, restartable cursor over one partition
#[async_trait]
pub trait PartitionReader: Send {
    /// Up to `max` records in offset order. When caught up waits at most
    /// `wait` for new records and returns an empty batch if none arrive.
    async fn next_batch(&mut self, max: usize, wait: Duration) -> Result<Vec<(u64, Vec<u8>)>>;
}

/// Kafka's murmur2, so keys land on the same partition whether the built-in
/// log or a Kafka topic is used
fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = SEED ^ len as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }
    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }
    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

pub fn partition_for(partition_key: &str, partitions: u32) -> u32 {
    (murmur2(partition_key.as_bytes()) & 0x7fff_ffff) % partitions.max(1)
}

/// Encodes and appends one event. Broadcast events go to every partition.
pub async fn publish(
    channel: &dyn Channel,
    codec: &(dyn Codec + Send + Sync),
    event: &ChangeEvent,
) -> Result<Vec<(u32, u64)>> {
    let payload = codec.encode(&event.payload)?;
    if event.broadcast {
        let mut appended = Vec::with_capacity(channel.partitions() as usize);
        for partition in 0..channel.partitions() {
            appended.push((partition, channel.append(partition, &payload).await?));
        }
        Ok(appended)
    } else {
        Ok(vec![channel.append_keyed(&event.partition_key, &payload).await?])
    }
}

/// Creates channel of specified kind.
/// If you add your own channels, register them here
pub async fn get_channel(cfg: &settings::Channel) -> Result<Arc<dyn Channel>> {
    match cfg.kind.as_str() {
        "log" => Ok(Arc::new(log::LogChannel::open_files(cfg).await?)),
        "kafka" => Ok(Arc::new(kafka::KafkaChannel::new(cfg)?)),
        other => Err(RelayError::Config(format!("unknown channel kind {other}"))),
    }
}
