//! Sink applier: consumes one channel partition and applies its events to a
//! target store as keyed mutations
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    channel::{Channel, PartitionReader},
    codec::Codec,
    error::{RelayError, Result},
    model::{EventBody, EventPayload, Image, Operation, TableSchema},
    positions::{Checkpoint, Fault, PositionStore},
    retry::{with_retry, RetryConfig},
    target::{Mutation, TargetStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    /// reading below the partition head observed at subscription
    CatchingUp,
    Live,
    /// stopped until an operator reset
    Faulted,
}

impl fmt::Display for ApplierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplierState::CatchingUp => "catching_up",
            ApplierState::Live => "live",
            ApplierState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ApplierConfig {
    pub batch_size: usize,
    /// how long a partial batch waits for more events
    pub batch_wait: Duration,
    pub retry: RetryConfig,
}

/// Collaborators an applier works with
#[derive(Clone)]
pub struct Wiring {
    pub channel: Arc<dyn Channel>,
    pub codec: Arc<dyn Codec + Send + Sync>,
    pub target: Arc<dyn TargetStore>,
    pub positions: Arc<dyn PositionStore>,
}

pub struct Applier {
    consumer: String,
    partition: u32,
    wiring: Wiring,
    config: ApplierConfig,
    cancel: CancellationToken,
    /// registered tables, overridden by schemas announced on the channel
    tables: BTreeMap<String, TableSchema>,
    checkpoint: Checkpoint,
    head: u64,
    state: ApplierState,
    reader: Option<Box<dyn PartitionReader>>,
}

impl Applier {
    /// Subscribes `consumer` to `partition`, resuming after its checkpoint.
    ///
    /// A partition with a persisted fault opens in the `Faulted` state and
    /// stays there until it is reset.
    pub async fn open(
        consumer: &str,
        partition: u32,
        tables: impl IntoIterator<Item = TableSchema>,
        wiring: Wiring,
        config: ApplierConfig,
        cancel: CancellationToken,
    ) -> Result<Applier> {
        let mut applier = Applier {
            consumer: consumer.to_owned(),
            partition,
            tables: tables.into_iter().map(|t| (t.table.clone(), t)).collect(),
            checkpoint: wiring.positions.checkpoint(consumer, partition).await?,
            head: 0,
            state: ApplierState::CatchingUp,
            reader: None,
            wiring,
            config,
            cancel,
        };

        if let Some(fault) = applier.wiring.positions.fault(consumer, partition).await? {
            warn!(consumer, partition, reason = %fault.reason, "applier_opened_faulted");
            applier.state = ApplierState::Faulted;
            return Ok(applier);
        }

        let channel = applier.wiring.channel.clone();
        let bounds = with_retry(&applier.config.retry, &applier.cancel, "channel_bounds", || {
            channel.bounds(partition)
        })
        .await?;
        applier.head = bounds.next;

        let from = applier.checkpoint.next_offset();
        if from < bounds.earliest {
            let err = RelayError::ChannelOffsetExpired {
                partition,
                requested: from,
                earliest: bounds.earliest,
            };
            applier.fault(Some(from), &err).await;
            return Ok(applier);
        }
        if from >= applier.head {
            applier.state = ApplierState::Live;
        }
        info!(
            consumer,
            partition,
            from,
            head = applier.head,
            state = %applier.state,
            "applier_subscribed"
        );
        Ok(applier)
    }

    pub fn state(&self) -> ApplierState {
        self.state
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Reads and applies one batch, returns how many events it covered.
    ///
    /// The checkpoint only moves after the target acknowledged the batch, a
    /// failure in between replays the batch on the next attempt.
    pub async fn step(&mut self) -> Result<usize> {
        if self.state == ApplierState::Faulted {
            return Err(self.faulted());
        }

        let batch = match self.read_batch().await {
            Ok(batch) => batch,
            Err(e @ RelayError::ChannelOffsetExpired { requested, .. }) => {
                return Err(self.fault(Some(requested), &e).await);
            }
            Err(e) => return Err(e),
        };
        let Some(&(last, _)) = batch.last() else {
            self.catch_up();
            return Ok(0);
        };
        let first = batch[0].0;
        let count = batch.len();

        let mut next = self.checkpoint.clone();
        let mut mutations = Vec::with_capacity(count);
        for (offset, bytes) in &batch {
            let payload = match self.wiring.codec.decode(bytes) {
                Ok(p) => p,
                Err(e) => return Err(self.fault(Some(*offset), &e).await),
            };
            match self.mutation(&mut next, payload) {
                Ok(Some(m)) => mutations.push(m),
                Ok(None) => {}
                Err(e) => return Err(self.fault(Some(*offset), &e).await),
            }
        }

        // keep trying until the target accepts the batch, only then checkpoint
        let target = self.wiring.target.clone();
        let applied = with_retry(&self.config.retry, &self.cancel, "target_apply", || {
            target.apply(&mutations)
        })
        .await;
        match applied {
            Ok(()) => {}
            Err(e @ RelayError::TargetApplyRejected { .. }) => {
                return Err(self.fault(Some(first), &e).await)
            }
            Err(e) => return Err(e),
        }

        next.offset = Some(last);
        self.wiring
            .positions
            .save_checkpoint(&self.consumer, self.partition, &next)
            .await?;
        self.checkpoint = next;
        debug!(
            consumer = %self.consumer,
            partition = self.partition,
            first,
            last,
            mutations = mutations.len(),
            "batch_applied"
        );
        self.catch_up();
        Ok(count)
    }

    /// Applies batches until cancelled. Cancellation is only observed between
    /// batches.
    pub async fn run(&mut self) -> Result<()> {
        while !self.cancel.is_cancelled() {
            self.step().await?;
        }
        info!(consumer = %self.consumer, partition = self.partition, "applier_stopped");
        Ok(())
    }

    async fn read_batch(&mut self) -> Result<Vec<(u64, Vec<u8>)>> {
        if self.reader.is_none() {
            let channel = self.wiring.channel.clone();
            let (consumer, partition) = (self.consumer.as_str(), self.partition);
            let from = self.checkpoint.next_offset();
            let reader = with_retry(&self.config.retry, &self.cancel, "channel_open_reader", || {
                channel.open_reader(consumer, partition, from)
            })
            .await?;
            self.reader = Some(reader);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Vec::new());
        };
        match reader
            .next_batch(self.config.batch_size, self.config.batch_wait)
            .await
        {
            Ok(batch) => Ok(batch),
            Err(e) => {
                // reopened from the checkpoint on the next step
                self.reader = None;
                Err(e)
            }
        }
    }

    /// Turns one event into a mutation. Schema markers only update `next`.
    fn mutation(&self, next: &mut Checkpoint, payload: EventPayload) -> Result<Option<Mutation>> {
        let version = payload.schema_version;
        match payload.body {
            EventBody::Schema { table, schema, .. } => {
                let known = next.schemas.get(&table).map_or(0, |s| s.version);
                if schema.version > known {
                    info!(
                        consumer = %self.consumer,
                        partition = self.partition,
                        table = %table,
                        version = schema.version,
                        "schema_applied"
                    );
                    next.schemas.insert(table, schema);
                }
                Ok(None)
            }
            EventBody::Row {
                table,
                operation,
                before,
                after,
                source_position,
                ..
            } => {
                let schema = next
                    .schemas
                    .get(&table)
                    .or_else(|| self.tables.get(&table))
                    .ok_or_else(|| rejected(&table, "table is not registered"))?;
                if version > schema.version {
                    return Err(rejected(
                        &table,
                        format!(
                            "row at schema version {version} arrived before its marker (known {})",
                            schema.version
                        ),
                    ));
                }
                let image = match operation {
                    Operation::Delete => before,
                    Operation::Insert | Operation::Update => after,
                }
                .ok_or_else(|| rejected(&table, format!("{operation:?} without row image")))?;
                if version == schema.version {
                    if let Some(column) = schema.unknown_column(&image) {
                        return Err(rejected(
                            &table,
                            format!("column {column} is not in schema version {version}"),
                        ));
                    }
                }
                let key = key_of(schema, &image).map_err(|e| rejected(&table, e))?;
                Ok(Some(match operation {
                    Operation::Delete => Mutation::Delete {
                        table,
                        key,
                        version: source_position,
                    },
                    Operation::Insert | Operation::Update => Mutation::Upsert {
                        table,
                        key,
                        row: image,
                        version: source_position,
                    },
                }))
            }
        }
    }

    fn catch_up(&mut self) {
        if self.state == ApplierState::CatchingUp && self.checkpoint.next_offset() >= self.head {
            self.state = ApplierState::Live;
            info!(
                consumer = %self.consumer,
                partition = self.partition,
                head = self.head,
                "applier_live"
            );
        }
    }

    /// Persists the fault and stops the applier
    async fn fault(&mut self, offset: Option<u64>, cause: &RelayError) -> RelayError {
        let fault = Fault {
            reason: cause.to_string(),
            at: Utc::now(),
            offset,
        };
        error!(
            consumer = %self.consumer,
            partition = self.partition,
            offset = ?offset,
            reason = %fault.reason,
            "applier_faulted"
        );
        if let Err(e) = self
            .wiring
            .positions
            .save_fault(&self.consumer, self.partition, &fault)
            .await
        {
            error!(
                consumer = %self.consumer,
                partition = self.partition,
                error = %e,
                "fault_persist_failed"
            );
        }
        self.state = ApplierState::Faulted;
        self.reader = None;
        self.faulted()
    }

    fn faulted(&self) -> RelayError {
        RelayError::Faulted {
            consumer: self.consumer.clone(),
            partition: self.partition,
            reason: "partition needs an operator reset".into(),
        }
    }
}

fn rejected(table: &str, reason: impl Into<String>) -> RelayError {
    RelayError::TargetApplyRejected {
        table: table.to_owned(),
        reason: reason.into(),
    }
}

/// Projects `image` onto the primary key
fn key_of(schema: &TableSchema, image: &Image) -> std::result::Result<Image, String> {
    schema
        .primary_key
        .iter()
        .map(|column| match image.get(column) {
            Some(v) => Ok((column.clone(), v.clone())),
            None => Err(format!("primary key column {column} missing")),
        })
        .collect()
}
