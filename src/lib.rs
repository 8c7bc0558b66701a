//! ## chrelay
//! Change-data-capture relay: tails a database change log, buffers the
//! changes in a durable, partitioned channel and applies them to ClickHouse
//! (or any other [TargetStore]) as keyed upserts and deletes.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! state_dir = "/var/lib/chrelay"
//! log_format = "json"
//!
//! [channel]
//! kind = "log"                   # built-in replicated log, or "kafka"
//! partitions = 8
//! replicas = 3
//! min_insync = 2
//! retention_ms = 604800000
//! codec = "avro"
//! codec_settings.schema_id = 7   # written into the Confluent header
//!
//! [sources.pg]
//! kind = "file"
//! path = "/var/lib/pg/changes.jsonl"
//! tables.users = { primary_key = ["id"] }
//!
//! [sinks.warehouse]
//! kind = "clickhouse"
//! clickhouse_url = "tcp://localhost:9000"
//! tables = { users = "users_replica" }
//! batch_size = 10000
//! batch_timeout_seconds = 1
//! ```
//!
//! ## Pipeline
//! Each source runs a [capture] task: the [reader] polls committed records in
//! order, the [encoder] turns them into events keyed by primary key, and
//! events are appended to the [channel] partition their key hashes to.
//! Schema changes become markers that are appended to every partition.
//!
//! Each sink runs one [applier] per partition. An applier only checkpoints an
//! offset after the target acknowledged everything up to it, so a crash
//! replays a batch instead of losing it. Targets keep the highest source
//! position per key, which makes replays harmless.
//!
//! ## Failures
//! Unavailable sources, channels and targets are retried with backoff. A
//! truncated source log, an expired channel offset or a rejected mutation
//! stops the affected stage; an applier records a fault that holds its
//! partition until the operator runs `chrelay reset`.
//!
//! [TargetStore]: target::TargetStore

pub mod applier;
pub mod capture;
pub mod channel;
pub mod codec;
pub mod encoder;
pub mod error;
pub mod model;
pub mod positions;
pub mod reader;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod settings;
pub mod source;
pub mod target;
