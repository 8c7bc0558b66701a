//! Kafka topic as the durable channel.
//!
//! Durability against replica failures comes from the broker: the producer
//! uses `acks=all`, so an append is acknowledged once the topic's
//! `min.insync.replicas` have the record. Consumers are assigned a single
//! partition at an explicit offset and never commit to Kafka, checkpoints
//! live in the position store.
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{BaseConsumer, Consumer, StreamConsumer},
    error::KafkaError,
    producer::{FutureProducer, FutureRecord},
    types::RDKafkaErrorCode,
    util::Timeout,
    Message, Offset, TopicPartitionList,
};
use tracing::debug;

use super::{Channel, PartitionBounds, PartitionReader};
use crate::{
    error::{RelayError, Result},
    settings,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaChannel {
    name: String,
    broker: String,
    topic: String,
    partitions: u32,
    delivery_timeout: Duration,
    producer: FutureProducer,
    meta: BaseConsumer,
}

fn unavailable(e: KafkaError) -> RelayError {
    RelayError::ChannelUnavailable(format!("kafka: {e}"))
}

impl KafkaChannel {
    pub fn new(cfg: &settings::Channel) -> Result<KafkaChannel> {
        let broker = cfg
            .kafka_broker
            .clone()
            .ok_or_else(|| RelayError::Config(format!("channel {}: kafka_broker missing", cfg.name)))?;
        let topic = cfg
            .topic
            .clone()
            .ok_or_else(|| RelayError::Config(format!("channel {}: topic missing", cfg.name)))?;
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &broker)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", cfg.delivery_timeout_ms.to_string())
            .create()
            .map_err(|e| RelayError::Config(format!("kafka producer: {e}")))?;
        let meta: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &broker)
            .set("group.id", format!("{}-meta", cfg.name))
            .create()
            .map_err(|e| RelayError::Config(format!("kafka consumer: {e}")))?;
        Ok(KafkaChannel {
            name: cfg.name.clone(),
            broker,
            topic,
            partitions: cfg.partitions,
            delivery_timeout: Duration::from_millis(cfg.delivery_timeout_ms),
            producer,
            meta,
        })
    }
}

fn watermarks(consumer: &impl Consumer, topic: &str, partition: u32) -> Result<PartitionBounds> {
    // librdkafka blocks here, keep the runtime's other tasks moving
    let (low, high) = tokio::task::block_in_place(|| {
        consumer.fetch_watermarks(topic, partition as i32, METADATA_TIMEOUT)
    })
    .map_err(unavailable)?;
    Ok(PartitionBounds {
        earliest: low.max(0) as u64,
        next: high.max(0) as u64,
    })
}

#[async_trait]
impl Channel for KafkaChannel {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn append(&self, partition: u32, payload: &[u8]) -> Result<u64> {
        let record = FutureRecord::<(), [u8]>::to(&self.topic)
            .partition(partition as i32)
            .payload(payload);
        match self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
        {
            Ok((_, offset)) => Ok(offset as u64),
            Err((e, _)) => Err(unavailable(e)),
        }
    }

    async fn bounds(&self, partition: u32) -> Result<PartitionBounds> {
        watermarks(&self.meta, &self.topic, partition)
    }

    async fn open_reader(
        &self,
        consumer: &str,
        partition: u32,
        from: u64,
    ) -> Result<Box<dyn PartitionReader>> {
        let stream: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.broker)
            .set("group.id", consumer)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            // surface expired offsets instead of silently jumping
            .set("auto.offset.reset", "error")
            .create()
            .map_err(|e| RelayError::Config(format!("kafka consumer: {e}")))?;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition as i32, Offset::Offset(from as i64))
            .map_err(unavailable)?;
        stream.assign(&tpl).map_err(unavailable)?;
        debug!(channel = %self.name, consumer, partition, from, "kafka_reader_assigned");
        Ok(Box::new(KafkaReader {
            topic: self.topic.clone(),
            partition,
            position: from,
            consumer: stream,
        }))
    }
}

struct KafkaReader {
    topic: String,
    partition: u32,
    position: u64,
    consumer: StreamConsumer,
}

fn is_offset_expired(e: &KafkaError) -> bool {
    matches!(
        e.rdkafka_error_code(),
        Some(RDKafkaErrorCode::AutoOffsetReset) | Some(RDKafkaErrorCode::OffsetOutOfRange)
    )
}

#[async_trait]
impl PartitionReader for KafkaReader {
    async fn next_batch(&mut self, max: usize, wait: Duration) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut batch = Vec::new();
        let deadline = Instant::now() + wait;
        while batch.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) if is_offset_expired(&e) => {
                    let bounds = watermarks(&self.consumer, &self.topic, self.partition)?;
                    return Err(RelayError::ChannelOffsetExpired {
                        partition: self.partition,
                        requested: self.position,
                        earliest: bounds.earliest,
                    });
                }
                Ok(Err(e)) => return Err(unavailable(e)),
                Ok(Ok(msg)) => {
                    let offset = msg.offset() as u64;
                    self.position = offset + 1;
                    batch.push((offset, msg.payload().unwrap_or_default().to_vec()));
                }
            }
        }
        Ok(batch)
    }
}
