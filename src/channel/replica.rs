//! Replica stores backing the built-in log channel
use std::{
    collections::HashMap,
    io::SeekFrom,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::error::{RelayError, Result};

/// Frame header: offset (u64), append time in ms (i64), payload length (u32)
const FRAME_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub offset: u64,
    pub timestamp_ms: i64,
    pub payload: Vec<u8>,
}

/// Offset, timestamp and size of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub offset: u64,
    pub timestamp_ms: i64,
    pub size: usize,
}

/// What a replica holds of one partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionLog {
    /// offsets below this were truncated away
    pub base: u64,
    pub records: Vec<RecordMeta>,
}

impl PartitionLog {
    /// Offset the next record appended to this replica gets
    pub fn end(&self) -> u64 {
        self.records
            .last()
            .map_or(self.base, |m| m.offset + 1)
            .max(self.base)
    }
}

impl From<&StoredRecord> for RecordMeta {
    fn from(r: &StoredRecord) -> Self {
        RecordMeta {
            offset: r.offset,
            timestamp_ms: r.timestamp_ms,
            size: r.payload.len(),
        }
    }
}

#[async_trait]
pub trait Replica: Send + Sync {
    fn get_name(&self) -> String;

    /// Truncation watermark and metadata of every record of `partition`,
    /// discarding a torn tail
    async fn load(&self, partition: u32) -> Result<PartitionLog>;

    /// Durably appends one record
    async fn append(&self, partition: u32, record: &StoredRecord) -> Result<()>;

    /// Up to `max` records with offset >= `from`
    async fn read(&self, partition: u32, from: u64, max: usize) -> Result<Vec<StoredRecord>>;

    /// Drops every record below `offset` and remembers `offset` as the base,
    /// so the partition keeps its end even when no record is left
    async fn truncate_before(&self, partition: u32, offset: u64) -> Result<()>;
}

fn unavailable(name: &str, e: std::io::Error) -> RelayError {
    RelayError::ChannelUnavailable(format!("replica {name}: {e}"))
}

fn encode_frame(record: &StoredRecord) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + record.payload.len());
    frame.extend_from_slice(&record.offset.to_be_bytes());
    frame.extend_from_slice(&record.timestamp_ms.to_be_bytes());
    frame.extend_from_slice(&(record.payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&record.payload);
    frame
}

/// Parses complete frames from `buf`, returns them with their start position
/// and the length of the parsed prefix
fn decode_frames(buf: &[u8]) -> (Vec<(u64, StoredRecord)>, usize) {
    let mut frames = Vec::new();
    let mut pos = 0;
    while buf.len() - pos >= FRAME_HEADER_LEN {
        let header = &buf[pos..pos + FRAME_HEADER_LEN];
        let offset = u64::from_be_bytes(header[0..8].try_into().unwrap_or_default());
        let timestamp_ms = i64::from_be_bytes(header[8..16].try_into().unwrap_or_default());
        let len = u32::from_be_bytes(header[16..20].try_into().unwrap_or_default()) as usize;
        let end = pos + FRAME_HEADER_LEN + len;
        if end > buf.len() {
            break;
        }
        frames.push((
            pos as u64,
            StoredRecord {
                offset,
                timestamp_ms,
                payload: buf[pos + FRAME_HEADER_LEN..end].to_vec(),
            },
        ));
        pos = end;
    }
    (frames, pos)
}

#[derive(Default)]
struct Segment {
    /// (offset, byte position) of every record in the file
    index: Vec<(u64, u64)>,
    len: u64,
}

/// Replica keeping one append-only file per partition under `dir`
pub struct FileReplica {
    name: String,
    dir: PathBuf,
    segments: tokio::sync::Mutex<HashMap<u32, Segment>>,
}

impl FileReplica {
    pub async fn open(name: &str, dir: PathBuf) -> Result<FileReplica> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| unavailable(name, e))?;
        Ok(FileReplica {
            name: name.to_owned(),
            dir,
            segments: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    fn path(&self, partition: u32) -> PathBuf {
        self.dir.join(format!("{partition}.log"))
    }

    fn base_path(&self, partition: u32) -> PathBuf {
        self.dir.join(format!("{partition}.base"))
    }

    async fn read_file(&self, path: PathBuf) -> Result<Vec<u8>> {
        match fs::read(path).await {
            Ok(buf) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(unavailable(&self.name, e)),
        }
    }

    async fn read_base(&self, partition: u32) -> Result<u64> {
        let buf = self.read_file(self.base_path(partition)).await?;
        match <[u8; 8]>::try_from(buf.as_slice()) {
            Ok(b) => Ok(u64::from_be_bytes(b)),
            Err(_) if buf.is_empty() => Ok(0),
            Err(_) => Err(RelayError::ChannelUnavailable(format!(
                "replica {}: corrupt base of partition {partition}",
                self.name
            ))),
        }
    }

    /// Replaces `path` with `buf` through a synced temp file
    async fn write_file(&self, path: PathBuf, buf: &[u8]) -> Result<()> {
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut file = File::create(&tmp)
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        file.write_all(buf)
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        file.sync_all()
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| unavailable(&self.name, e))
    }
}

#[async_trait]
impl Replica for FileReplica {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    async fn load(&self, partition: u32) -> Result<PartitionLog> {
        let mut segments = self.segments.lock().await;
        let base = self.read_base(partition).await?;
        let buf = self.read_file(self.path(partition)).await?;
        let (frames, parsed) = decode_frames(&buf);
        if parsed < buf.len() {
            // torn write from a crash or a failed append, never acknowledged
            self.write_file(self.path(partition), &buf[..parsed]).await?;
        }
        segments.insert(
            partition,
            Segment {
                index: frames.iter().map(|(pos, r)| (r.offset, *pos)).collect(),
                len: parsed as u64,
            },
        );
        Ok(PartitionLog {
            base,
            records: frames.iter().map(|(_, r)| RecordMeta::from(r)).collect(),
        })
    }

    async fn append(&self, partition: u32, record: &StoredRecord) -> Result<()> {
        let mut segments = self.segments.lock().await;
        let segment = segments.entry(partition).or_default();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(partition))
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        let frame = encode_frame(record);
        file.write_all(&frame)
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        file.sync_data()
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        segment.index.push((record.offset, segment.len));
        segment.len += frame.len() as u64;
        Ok(())
    }

    async fn read(&self, partition: u32, from: u64, max: usize) -> Result<Vec<StoredRecord>> {
        let segments = self.segments.lock().await;
        let Some(segment) = segments.get(&partition) else {
            return Ok(Vec::new());
        };
        let first = segment.index.partition_point(|(offset, _)| *offset < from);
        if first == segment.index.len() || max == 0 {
            return Ok(Vec::new());
        }
        let start = segment.index[first].1;
        let end = segment
            .index
            .get(first + max)
            .map_or(segment.len, |(_, pos)| *pos);

        let mut file = File::open(self.path(partition))
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| unavailable(&self.name, e))?;
        Ok(decode_frames(&buf).0.into_iter().map(|(_, r)| r).collect())
    }

    async fn truncate_before(&self, partition: u32, offset: u64) -> Result<()> {
        let mut segments = self.segments.lock().await;
        // base goes first: records below it are ignored even if the log
        // rewrite below does not happen
        self.write_file(self.base_path(partition), &offset.to_be_bytes())
            .await?;
        let buf = self.read_file(self.path(partition)).await?;
        let (frames, _) = decode_frames(&buf);
        let kept: Vec<&StoredRecord> = frames
            .iter()
            .map(|(_, r)| r)
            .filter(|r| r.offset >= offset)
            .collect();
        let mut out = Vec::new();
        let mut index = Vec::with_capacity(kept.len());
        for r in kept {
            index.push((r.offset, out.len() as u64));
            out.extend(encode_frame(r));
        }
        self.write_file(self.path(partition), &out).await?;
        segments.insert(
            partition,
            Segment {
                index,
                len: out.len() as u64,
            },
        );
        Ok(())
    }
}

/// Replica held in memory. It can be switched off to simulate a failed node.
#[derive(Default)]
pub struct MemoryReplica {
    name: String,
    records: Mutex<HashMap<u32, Vec<StoredRecord>>>,
    bases: Mutex<HashMap<u32, u64>>,
    down: AtomicBool,
}

impl MemoryReplica {
    pub fn new(name: &str) -> MemoryReplica {
        MemoryReplica {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RelayError::ChannelUnavailable(format!(
                "replica {} is down",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Replica for MemoryReplica {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    async fn load(&self, partition: u32) -> Result<PartitionLog> {
        self.check()?;
        let records = self.records.lock().unwrap();
        Ok(PartitionLog {
            base: self.bases.lock().unwrap().get(&partition).copied().unwrap_or(0),
            records: records
                .get(&partition)
                .map(|rs| rs.iter().map(RecordMeta::from).collect())
                .unwrap_or_default(),
        })
    }

    async fn append(&self, partition: u32, record: &StoredRecord) -> Result<()> {
        self.check()?;
        self.records
            .lock()
            .unwrap()
            .entry(partition)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read(&self, partition: u32, from: u64, max: usize) -> Result<Vec<StoredRecord>> {
        self.check()?;
        let records = self.records.lock().unwrap();
        Ok(records
            .get(&partition)
            .map(|rs| {
                rs.iter()
                    .filter(|r| r.offset >= from)
                    .take(max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn truncate_before(&self, partition: u32, offset: u64) -> Result<()> {
        self.check()?;
        {
            let mut bases = self.bases.lock().unwrap();
            let base = bases.entry(partition).or_default();
            *base = (*base).max(offset);
        }
        if let Some(rs) = self.records.lock().unwrap().get_mut(&partition) {
            rs.retain(|r| r.offset >= offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: u64, payload: &str) -> StoredRecord {
        StoredRecord {
            offset,
            timestamp_ms: 1_700_000_000_000 + offset as i64,
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_file_replica_append_read_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let replica = FileReplica::open("r0", dir.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(replica.load(0).await.unwrap(), PartitionLog::default());
        for offset in 0..5 {
            replica
                .append(0, &record(offset, &format!("event-{offset}")))
                .await
                .unwrap();
        }
        let got = replica.read(0, 2, 2).await.unwrap();
        assert_eq!(got, vec![record(2, "event-2"), record(3, "event-3")]);

        replica.truncate_before(0, 3).await.unwrap();
        let got = replica.read(0, 0, 10).await.unwrap();
        assert_eq!(got.first().map(|r| r.offset), Some(3));
        assert_eq!(got.len(), 2);

        // reopen from disk
        let reopened = FileReplica::open("r0", dir.path().to_path_buf())
            .await
            .unwrap();
        let log = reopened.load(0).await.unwrap();
        assert_eq!(log.base, 3);
        assert_eq!(log.records.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(reopened.read(0, 4, 10).await.unwrap(), vec![record(4, "event-4")]);
    }

    #[tokio::test]
    async fn test_file_replica_discards_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let replica = FileReplica::open("r0", dir.path().to_path_buf())
            .await
            .unwrap();
        replica.load(0).await.unwrap();
        replica.append(0, &record(0, "complete")).await.unwrap();
        let mut torn = encode_frame(&record(1, "torn"));
        torn.truncate(torn.len() - 2);
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join("0.log"))
            .await
            .unwrap();
        f.write_all(&torn).await.unwrap();
        f.sync_all().await.unwrap();

        let reopened = FileReplica::open("r0", dir.path().to_path_buf())
            .await
            .unwrap();
        let log = reopened.load(0).await.unwrap();
        assert_eq!(log.records.len(), 1);
        assert_eq!(log.end(), 1);
        reopened.append(0, &record(1, "again")).await.unwrap();
        assert_eq!(
            reopened.read(0, 0, 10).await.unwrap(),
            vec![record(0, "complete"), record(1, "again")]
        );
    }

    #[tokio::test]
    async fn test_file_replica_keeps_end_when_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let replica = FileReplica::open("r0", dir.path().to_path_buf())
            .await
            .unwrap();
        replica.load(0).await.unwrap();
        for offset in 0..3 {
            replica.append(0, &record(offset, "x")).await.unwrap();
        }
        replica.truncate_before(0, 3).await.unwrap();

        let reopened = FileReplica::open("r0", dir.path().to_path_buf())
            .await
            .unwrap();
        let log = reopened.load(0).await.unwrap();
        assert!(log.records.is_empty());
        assert_eq!(log.end(), 3);
    }
}
