//! Built-in replicated log channel
//!
//! Every partition is written to all in-sync replicas and an append is only
//! acknowledged once `min_insync` of them persisted the record. A replica
//! that fails a write leaves the in-sync set. Later appends try to catch it
//! up from an in-sync replica and re-admit it, at most once per
//! [RESYNC_INTERVAL] while it keeps failing. On open every replica is caught
//! up from the longest one.
//!
//! As with Kafka's `acks=all`, an append that loses its quorum after the
//! write keeps its offset and stays readable, but is reported as failed to
//! the producer; a retry then appends a duplicate, which the appliers absorb.
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::{
    replica::{FileReplica, PartitionLog, RecordMeta, Replica, StoredRecord},
    Channel, PartitionBounds, PartitionReader,
};
use crate::{
    error::{RelayError, Result},
    settings,
};

/// Minimum pause between attempts to bring back a failing replica
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Retention horizon, unset limits are not enforced
#[derive(Debug, Clone, Copy, Default)]
pub struct Retention {
    pub max_age_ms: Option<i64>,
    pub max_bytes: Option<u64>,
}

struct PartitionState {
    earliest: u64,
    next: u64,
    records: VecDeque<RecordMeta>,
    bytes: u64,
    in_sync: Vec<bool>,
    /// when an out-of-sync replica is due for the next resync attempt
    resync_at: Vec<Instant>,
}

impl PartitionState {
    fn leader(&self) -> Option<usize> {
        self.in_sync.iter().position(|s| *s)
    }
}

struct Partition {
    state: Mutex<PartitionState>,
    appended: Notify,
}

struct Inner {
    name: String,
    replicas: Vec<Arc<dyn Replica>>,
    min_insync: usize,
    retention: Retention,
    partitions: Vec<Partition>,
}

pub struct LogChannel {
    inner: Arc<Inner>,
}

impl LogChannel {
    /// Opens a channel with one file replica per `replica-N` directory under
    /// the configured data dir
    pub async fn open_files(cfg: &settings::Channel) -> Result<LogChannel> {
        let data_dir = PathBuf::from(&cfg.data_dir);
        let mut replicas: Vec<Arc<dyn Replica>> = Vec::new();
        for i in 0..cfg.replicas {
            let name = format!("replica-{i}");
            replicas.push(Arc::new(FileReplica::open(&name, data_dir.join(&name)).await?));
        }
        let retention = Retention {
            max_age_ms: cfg.retention_ms,
            max_bytes: cfg.retention_bytes,
        };
        LogChannel::open(&cfg.name, replicas, cfg.min_insync, cfg.partitions, retention).await
    }

    /// Recovers every partition from the replicas and brings lagging
    /// replicas up to date
    pub async fn open(
        name: &str,
        replicas: Vec<Arc<dyn Replica>>,
        min_insync: usize,
        partitions: u32,
        retention: Retention,
    ) -> Result<LogChannel> {
        if replicas.is_empty() || min_insync == 0 || min_insync > replicas.len() {
            return Err(RelayError::Config(format!(
                "channel {name}: min_insync {min_insync} needs 1..={} replicas",
                replicas.len()
            )));
        }
        if partitions == 0 {
            return Err(RelayError::Config(format!("channel {name}: no partitions")));
        }

        let mut parts = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let state = recover(name, &replicas, min_insync, partition).await?;
            parts.push(Partition {
                state: Mutex::new(state),
                appended: Notify::new(),
            });
        }
        info!(
            channel = name,
            partitions,
            replicas = replicas.len(),
            min_insync,
            "channel_opened"
        );
        Ok(LogChannel {
            inner: Arc::new(Inner {
                name: name.to_owned(),
                replicas,
                min_insync,
                retention,
                partitions: parts,
            }),
        })
    }
}

async fn recover(
    name: &str,
    replicas: &[Arc<dyn Replica>],
    min_insync: usize,
    partition: u32,
) -> Result<PartitionState> {
    let mut loaded = Vec::with_capacity(replicas.len());
    for replica in replicas {
        match replica.load(partition).await {
            Ok(log) => loaded.push(Some(log)),
            Err(e) => {
                warn!(channel = name, replica = %replica.get_name(), partition, error = %e, "replica_unavailable_on_open");
                loaded.push(None);
            }
        }
    }
    let Some(leader) = (0..replicas.len())
        .filter(|i| loaded[*i].is_some())
        .max_by_key(|i| loaded[*i].as_ref().map_or(0, PartitionLog::end))
    else {
        return Err(RelayError::ChannelUnavailable(format!(
            "channel {name}: no replica of partition {partition} available"
        )));
    };
    // retention may have emptied every replica, the bases still hold the end
    let base = loaded.iter().flatten().map(|l| l.base).max().unwrap_or(0);
    let leader_log = loaded[leader].clone().unwrap_or_default();
    let next = leader_log.end().max(base);
    let records: VecDeque<RecordMeta> = leader_log
        .records
        .into_iter()
        .filter(|m| m.offset >= base)
        .collect();
    let earliest = records.front().map_or(next, |m| m.offset);

    let mut st = PartitionState {
        earliest,
        next,
        bytes: records.iter().map(|m| m.size as u64).sum(),
        records,
        in_sync: vec![false; replicas.len()],
        resync_at: vec![Instant::now(); replicas.len()],
    };
    st.in_sync[leader] = true;
    for (i, log) in loaded.iter().enumerate() {
        let Some(log) = log else { continue };
        if i != leader {
            let synced =
                sync_replica(replicas[leader].as_ref(), replicas[i].as_ref(), partition, log, &st)
                    .await;
            st.in_sync[i] = synced;
        }
    }
    let synced = st.in_sync.iter().filter(|s| **s).count();
    if synced < min_insync {
        warn!(channel = name, partition, in_sync = synced, min_insync, "partition_under_replicated");
    }
    Ok(st)
}

/// Brings `follower`, holding `log`, up to the partition end from `leader`.
/// Returns whether the follower is in sync afterwards.
async fn sync_replica(
    leader: &dyn Replica,
    follower: &dyn Replica,
    partition: u32,
    log: &PartitionLog,
    st: &PartitionState,
) -> bool {
    let has = log.end();
    if has > st.next {
        // holds a record no replica acknowledged, its offset will be reused
        return false;
    }
    if log.base < st.earliest && follower.truncate_before(partition, st.earliest).await.is_err() {
        return false;
    }
    catch_up(leader, follower, partition, has.max(st.earliest), st.next).await
}

/// Copies `[from, to)` from `leader` into `follower`
async fn catch_up(
    leader: &dyn Replica,
    follower: &dyn Replica,
    partition: u32,
    from: u64,
    to: u64,
) -> bool {
    let mut offset = from;
    while offset < to {
        let batch = match leader.read(partition, offset, 1000).await {
            Ok(b) if !b.is_empty() => b,
            _ => return false,
        };
        for record in batch.iter().filter(|r| r.offset < to) {
            if follower.append(partition, record).await.is_err() {
                return false;
            }
            offset = record.offset + 1;
        }
        if batch.first().is_some_and(|r| r.offset >= to) {
            return false;
        }
    }
    true
}

#[async_trait]
impl Channel for LogChannel {
    fn get_name(&self) -> String {
        self.inner.name.clone()
    }

    fn partitions(&self) -> u32 {
        self.inner.partitions.len() as u32
    }

    async fn append(&self, partition: u32, payload: &[u8]) -> Result<u64> {
        let inner = &self.inner;
        let p = inner.partition(partition)?;
        // appends to one partition are serialized by this lock
        let mut st = p.state.lock().await;
        inner.resync(partition, &mut st).await;

        let targets: Vec<usize> = (0..inner.replicas.len()).filter(|i| st.in_sync[*i]).collect();
        if targets.len() < inner.min_insync {
            return Err(RelayError::ChannelUnavailable(format!(
                "partition {partition}: {} in-sync replicas, {} required",
                targets.len(),
                inner.min_insync
            )));
        }

        let record = StoredRecord {
            offset: st.next,
            timestamp_ms: Utc::now().timestamp_millis(),
            payload: payload.to_vec(),
        };
        let results = join_all(
            targets
                .iter()
                .map(|i| inner.replicas[*i].append(partition, &record)),
        )
        .await;

        let mut acked = 0;
        for (i, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => acked += 1,
                Err(e) => {
                    st.in_sync[*i] = false;
                    st.resync_at[*i] = Instant::now();
                    error!(
                        channel = %inner.name,
                        replica = %inner.replicas[*i].get_name(),
                        partition,
                        error = %e,
                        "replica_left_in_sync_set"
                    );
                }
            }
        }
        if acked == 0 {
            return Err(RelayError::ChannelUnavailable(format!(
                "partition {partition}: no replica accepted the record"
            )));
        }

        st.next += 1;
        st.bytes += record.payload.len() as u64;
        st.records.push_back(RecordMeta::from(&record));
        p.appended.notify_waiters();

        if acked < inner.min_insync {
            return Err(RelayError::ChannelUnavailable(format!(
                "partition {partition}: offset {} reached {acked} replicas, {} required",
                record.offset, inner.min_insync
            )));
        }
        Ok(record.offset)
    }

    async fn bounds(&self, partition: u32) -> Result<PartitionBounds> {
        let st = self.inner.partition(partition)?.state.lock().await;
        Ok(PartitionBounds {
            earliest: st.earliest,
            next: st.next,
        })
    }

    async fn open_reader(
        &self,
        _consumer: &str,
        partition: u32,
        from: u64,
    ) -> Result<Box<dyn PartitionReader>> {
        self.inner.partition(partition)?;
        Ok(Box::new(LogReader {
            inner: self.inner.clone(),
            partition,
            position: from,
        }))
    }

    async fn enforce_retention(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let mut dropped = 0;
        for (partition, p) in self.inner.partitions.iter().enumerate() {
            let mut st = p.state.lock().await;
            let before = st.earliest;
            while let Some(oldest) = st.records.front().copied() {
                let too_old = self
                    .inner
                    .retention
                    .max_age_ms
                    .is_some_and(|age| now - oldest.timestamp_ms > age);
                let too_big = self.inner.retention.max_bytes.is_some_and(|max| st.bytes > max);
                if !too_old && !too_big {
                    break;
                }
                st.records.pop_front();
                st.bytes -= oldest.size as u64;
                st.earliest = oldest.offset + 1;
            }
            if st.earliest == before {
                continue;
            }
            dropped += st.earliest - before;
            for (i, replica) in self.inner.replicas.iter().enumerate() {
                if !st.in_sync[i] {
                    continue;
                }
                if let Err(e) = replica.truncate_before(partition as u32, st.earliest).await {
                    // harmless, data below `earliest` is never served
                    warn!(channel = %self.inner.name, replica = %replica.get_name(), error = %e, "retention_truncate_failed");
                }
            }
            debug!(
                channel = %self.inner.name,
                partition,
                earliest = st.earliest,
                "retention_enforced"
            );
        }
        Ok(dropped)
    }
}

impl Inner {
    fn partition(&self, partition: u32) -> Result<&Partition> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| RelayError::Config(format!("channel {}: no partition {partition}", self.name)))
    }

    /// Reads from the first in-sync replica that answers
    async fn read(
        &self,
        partition: u32,
        in_sync: &[bool],
        from: u64,
        next: u64,
        max: usize,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut last_err = None;
        for (i, replica) in self.replicas.iter().enumerate() {
            if !in_sync[i] {
                continue;
            }
            match replica.read(partition, from, max).await {
                Ok(records) => {
                    return Ok(records
                        .into_iter()
                        .filter(|r| r.offset < next)
                        .map(|r| (r.offset, r.payload))
                        .collect())
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            RelayError::ChannelUnavailable(format!("partition {partition}: no readable replica"))
        }))
    }

    /// Catches up and re-admits out-of-sync replicas that are due for a retry
    async fn resync(&self, partition: u32, st: &mut PartitionState) {
        let now = Instant::now();
        for i in 0..self.replicas.len() {
            if st.in_sync[i] || st.resync_at[i] > now {
                continue;
            }
            let replica = &self.replicas[i];
            let synced = match replica.load(partition).await {
                Ok(log) => match st.leader() {
                    Some(leader) => {
                        sync_replica(self.replicas[leader].as_ref(), replica.as_ref(), partition, &log, st)
                            .await
                    }
                    // every replica failed, one that kept all acknowledged
                    // records can lead again
                    None => log.end() == st.next,
                },
                Err(_) => false,
            };
            if synced {
                st.in_sync[i] = true;
                info!(channel = %self.name, replica = %replica.get_name(), partition, "replica_rejoined_in_sync_set");
            } else {
                st.resync_at[i] = now + RESYNC_INTERVAL;
            }
        }
    }
}

struct LogReader {
    inner: Arc<Inner>,
    partition: u32,
    position: u64,
}

impl LogReader {
    fn check_retained(&self, earliest: u64) -> Result<()> {
        if self.position < earliest {
            return Err(RelayError::ChannelOffsetExpired {
                partition: self.partition,
                requested: self.position,
                earliest,
            });
        }
        Ok(())
    }

    async fn try_read(&mut self, max: usize) -> Result<Option<Vec<(u64, Vec<u8>)>>> {
        let p = self.inner.partition(self.partition)?;
        // replica reads happen outside the partition lock so appends go on
        let (next, in_sync) = {
            let st = p.state.lock().await;
            self.check_retained(st.earliest)?;
            if self.position >= st.next {
                return Ok(None);
            }
            (st.next, st.in_sync.clone())
        };
        let batch = self
            .inner
            .read(self.partition, &in_sync, self.position, next, max)
            .await?;
        // retention may have run meanwhile
        self.check_retained(p.state.lock().await.earliest)?;
        if let Some((last, _)) = batch.last() {
            self.position = last + 1;
        }
        Ok(Some(batch))
    }
}

#[async_trait]
impl PartitionReader for LogReader {
    async fn next_batch(&mut self, max: usize, wait: Duration) -> Result<Vec<(u64, Vec<u8>)>> {
        let inner = self.inner.clone();
        let p = inner.partition(self.partition)?;
        let appended = p.appended.notified();
        tokio::pin!(appended);
        // register before checking so an append in between is not missed
        appended.as_mut().enable();

        if let Some(batch) = self.try_read(max).await? {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(wait, appended).await;
        Ok(self.try_read(max).await?.unwrap_or_default())
    }
}
