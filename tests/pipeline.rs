//! End-to-end behaviour of capture, channel and appliers over in-memory
//! collaborators
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use chrelay::{
    applier::{Applier, ApplierConfig, ApplierState, Wiring},
    capture::{Capture, CaptureConfig},
    channel::{
        log::{LogChannel, Retention},
        replica::{MemoryReplica, Replica},
        Channel, PartitionBounds, PartitionReader,
    },
    codec::{get_codec, Codec},
    error::RelayError,
    model::{Image, TableSchema, Value},
    positions::{memory::MemoryPositionStore, PositionStore},
    registry::Registry,
    relay::Relay,
    retry::RetryConfig,
    settings::{Settings, Sink, Source, TableDef},
    source::{memory::MemoryChangeLog, ChangeLog},
    target::{memory::MemoryTarget, Mutation, TargetStore},
};
use tokio_util::sync::CancellationToken;

const PARTITIONS: u32 = 4;

fn users() -> TableSchema {
    TableSchema {
        table: "users".into(),
        version: 1,
        primary_key: vec!["id".into()],
        columns: vec![],
    }
}

fn user(id: i64, name: &str, email: &str) -> Image {
    let mut row = Image::new();
    row.insert("id".into(), Value::Int(id));
    row.insert("name".into(), Value::from(name));
    row.insert("email".into(), Value::from(email));
    row
}

fn key(id: i64) -> Image {
    let mut k = Image::new();
    k.insert("id".into(), Value::Int(id));
    k
}

fn retry() -> RetryConfig {
    RetryConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        ..Default::default()
    }
}

struct Pipeline {
    log: Arc<MemoryChangeLog>,
    channel: Arc<LogChannel>,
    codec: Arc<dyn Codec + Send + Sync>,
    positions: Arc<MemoryPositionStore>,
    target: Arc<MemoryTarget>,
}

impl Pipeline {
    async fn new(retention: Retention) -> Pipeline {
        let replicas: Vec<Arc<dyn Replica>> = (0..3)
            .map(|i| Arc::new(MemoryReplica::new(&format!("r{i}"))) as Arc<dyn Replica>)
            .collect();
        Pipeline {
            log: Arc::new(MemoryChangeLog::new("pg")),
            channel: Arc::new(
                LogChannel::open("ch", replicas, 2, PARTITIONS, retention)
                    .await
                    .unwrap(),
            ),
            codec: get_codec("json", None).unwrap(),
            positions: Arc::new(MemoryPositionStore::new()),
            target: Arc::new(MemoryTarget::new("warehouse")),
        }
    }

    /// Captures everything committed so far
    async fn capture(&self) {
        let mut capture = Capture::open(
            "pg",
            self.log.clone(),
            [users()],
            self.channel.clone(),
            self.codec.clone(),
            self.positions.clone(),
            CaptureConfig {
                batch_size: 1000,
                poll_interval: Duration::from_millis(1),
                retry: retry(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        while capture.step().await.unwrap() > 0 {}
    }

    async fn applier(&self, partition: u32) -> Applier {
        Applier::open(
            "warehouse",
            partition,
            [users()],
            Wiring {
                channel: self.channel.clone(),
                codec: self.codec.clone(),
                target: self.target.clone(),
                positions: self.positions.clone(),
            },
            ApplierConfig {
                batch_size: 1000,
                batch_wait: Duration::from_millis(1),
                retry: retry(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    /// Applies every partition until caught up
    async fn apply(&self) {
        for partition in 0..PARTITIONS {
            let mut applier = self.applier(partition).await;
            while applier.step().await.unwrap() > 0 {}
            assert_eq!(applier.state(), ApplierState::Live);
        }
    }
}

#[tokio::test]
async fn test_update_reaches_target() {
    let p = Pipeline::new(Retention::default()).await;
    p.log.insert("users", user(1, "John Doe", "john@old.example"));
    p.log.update(
        "users",
        user(1, "John Doe", "john@old.example"),
        user(1, "John Doe", "john.doe@example.com"),
    );
    p.capture().await;
    p.apply().await;

    assert_eq!(
        p.target.get("users", &key(1)),
        Some(user(1, "John Doe", "john.doe@example.com"))
    );
}

#[tokio::test]
async fn test_insert_then_delete_leaves_no_row() {
    let p = Pipeline::new(Retention::default()).await;
    p.log.insert("users", user(2, "Jane Roe", "jane@example.com"));
    p.log.delete("users", user(2, "Jane Roe", "jane@example.com"));
    p.capture().await;
    p.apply().await;

    assert_eq!(p.target.get("users", &key(2)), None);
    assert!(p.target.rows("users").is_empty());
}

#[tokio::test]
async fn test_crash_between_apply_and_checkpoint_replays() {
    let p = Pipeline::new(Retention::default()).await;
    p.log.insert("users", user(1, "John Doe", "a@example.com"));
    p.log.update(
        "users",
        user(1, "John Doe", "a@example.com"),
        user(1, "John Doe", "b@example.com"),
    );
    p.capture().await;

    // both changes share a key, so they share a partition
    let mut partition = 0;
    for candidate in 0..PARTITIONS {
        if p.channel.bounds(candidate).await.unwrap().next > 0 {
            partition = candidate;
        }
    }

    p.positions.fail_checkpoints(true);
    let mut applier = p.applier(partition).await;
    assert!(applier.step().await.is_err());
    // the target saw the batch, the checkpoint did not move
    assert_eq!(p.target.applied(), 2);
    assert_eq!(p.positions.checkpoint("warehouse", partition).await.unwrap().offset, None);

    p.positions.fail_checkpoints(false);
    let mut restarted = p.applier(partition).await;
    assert_eq!(restarted.step().await.unwrap(), 2);
    assert_eq!(p.target.applied(), 4);
    assert_eq!(
        p.target.get("users", &key(1)),
        Some(user(1, "John Doe", "b@example.com"))
    );
    assert_eq!(
        p.positions.checkpoint("warehouse", partition).await.unwrap().offset,
        Some(1)
    );
}

#[tokio::test]
async fn test_replaying_everything_is_idempotent() {
    let p = Pipeline::new(Retention::default()).await;
    for id in 0..20 {
        p.log.insert("users", user(id, "n", &format!("{id}@example.com")));
    }
    for id in (0..20).step_by(3) {
        p.log.delete("users", user(id, "n", &format!("{id}@example.com")));
    }
    p.capture().await;
    p.apply().await;
    let mut first = p.target.rows("users");

    for partition in 0..PARTITIONS {
        p.positions.reset("warehouse", partition, 0).await.unwrap();
    }
    p.apply().await;
    let mut second = p.target.rows("users");

    let by_id = |a: &Image, b: &Image| format!("{:?}", a["id"]).cmp(&format!("{:?}", b["id"]));
    first.sort_by(by_id);
    second.sort_by(by_id);
    assert_eq!(first.len(), 13);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_last_write_per_key_wins_across_runs() {
    let p = Pipeline::new(Retention::default()).await;
    let mut previous = user(7, "n", "v0@example.com");
    p.log.insert("users", previous.clone());
    for round in 1..=5 {
        let next = user(7, "n", &format!("v{round}@example.com"));
        p.log.update("users", previous, next.clone());
        previous = next;
        // capture and apply in small increments, restarting each time
        p.capture().await;
        p.apply().await;
    }
    assert_eq!(p.target.get("users", &key(7)), Some(previous));
}

#[tokio::test]
async fn test_checkpoints_only_move_forward() {
    let p = Pipeline::new(Retention::default()).await;
    let mut seen = vec![None; PARTITIONS as usize];
    for id in 0..12 {
        p.log.insert("users", user(id, "n", "x@example.com"));
        p.capture().await;
        p.apply().await;
        for partition in 0..PARTITIONS {
            let offset = p
                .positions
                .checkpoint("warehouse", partition)
                .await
                .unwrap()
                .offset;
            assert!(offset >= seen[partition as usize]);
            seen[partition as usize] = offset;
        }
    }
    let total: u64 = seen.iter().map(|o| o.map_or(0, |o| o + 1)).sum();
    assert_eq!(total, 12);
}

#[tokio::test]
async fn test_expired_offset_faults_until_reset() {
    let p = Pipeline::new(Retention {
        max_age_ms: None,
        max_bytes: Some(1),
    })
    .await;
    for id in 0..8 {
        p.log.insert("users", user(id, "n", "x@example.com"));
    }
    p.capture().await;
    p.channel.enforce_retention().await.unwrap();

    let mut faulted = Vec::new();
    for partition in 0..PARTITIONS {
        let mut applier = p.applier(partition).await;
        if applier.state() == ApplierState::Faulted {
            assert!(matches!(
                applier.step().await.unwrap_err(),
                RelayError::Faulted { .. }
            ));
            faulted.push(partition);
        }
    }
    assert!(!faulted.is_empty());
    // nothing was silently skipped
    assert_eq!(p.target.applied(), 0);

    for partition in faulted {
        let bounds = p.channel.bounds(partition).await.unwrap();
        p.positions
            .reset("warehouse", partition, bounds.earliest)
            .await
            .unwrap();
        let applier = p.applier(partition).await;
        assert_ne!(applier.state(), ApplierState::Faulted);
    }
}

#[tokio::test]
async fn test_source_gap_stops_capture() {
    let p = Pipeline::new(Retention::default()).await;
    p.log.insert("users", user(1, "n", "x@example.com"));
    p.capture().await;
    p.log.insert("users", user(2, "n", "x@example.com"));
    p.log.insert("users", user(3, "n", "x@example.com"));
    p.log.truncate(chrelay::model::SourcePosition(3));

    let mut capture = Capture::open(
        "pg",
        p.log.clone(),
        [users()],
        p.channel.clone(),
        p.codec.clone(),
        p.positions.clone(),
        CaptureConfig {
            batch_size: 1000,
            poll_interval: Duration::from_millis(1),
            retry: retry(),
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let err = capture.step().await.unwrap_err();
    assert!(matches!(err, RelayError::SourceLogGapDetected { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_relay_runs_until_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let p = Pipeline::new(Retention::default()).await;

    let mut settings = Settings {
        state_dir: dir.path().to_string_lossy().into_owned(),
        ..Default::default()
    };
    settings.channel.partitions = PARTITIONS;
    settings.sources.insert(
        "pg".into(),
        Source {
            kind: "memory".into(),
            path: None,
            poll_interval_ms: Some(1),
            batch_size: Some(100),
            tables: HashMap::from([(
                "users".to_owned(),
                TableDef {
                    primary_key: vec!["id".into()],
                    columns: vec![],
                },
            )]),
        },
    );
    settings.sinks.insert(
        "warehouse".into(),
        Sink {
            kind: "memory".into(),
            consumer_group: Some("warehouse".into()),
            clickhouse_url: None,
            tables: HashMap::new(),
            batch_size: Some(100),
            batch_timeout_seconds: Some(1),
        },
    );
    settings.retry = retry();

    let registry = Registry::load(&settings.state_dir).await.unwrap();
    let relay = Arc::new(Relay::with_parts(
        settings,
        registry,
        p.channel.clone(),
        p.codec.clone(),
        p.positions.clone(),
    ));

    p.log.insert("users", user(1, "John Doe", "john@old.example"));
    p.log.update(
        "users",
        user(1, "John Doe", "john@old.example"),
        user(1, "John Doe", "john.doe@example.com"),
    );
    p.log.insert("users", user(2, "Jane Roe", "jane@example.com"));

    let cancel = CancellationToken::new();
    let running = {
        let (relay, cancel) = (relay.clone(), cancel.clone());
        let sources = HashMap::from([("pg".to_owned(), p.log.clone() as Arc<dyn ChangeLog>)]);
        let sinks =
            HashMap::from([("warehouse".to_owned(), p.target.clone() as Arc<dyn TargetStore>)]);
        tokio::spawn(async move { relay.run_with(sources, sinks, cancel).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while p.target.rows("users").len() < 2
        || p.target.get("users", &key(1)) != Some(user(1, "John Doe", "john.doe@example.com"))
    {
        assert!(tokio::time::Instant::now() < deadline, "relay did not converge");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    running.await.unwrap().unwrap();

    let lag = relay.lag().await.unwrap();
    assert_eq!(lag.len(), PARTITIONS as usize);
    assert!(lag.iter().all(|r| r.lag == 0 && r.fault.is_none()));
}

/// Channel whose chosen appends land but are reported as failed, like a
/// write that lost its quorum after reaching a replica
struct AckLosingChannel {
    inner: Arc<LogChannel>,
    calls: AtomicU32,
    lose: Vec<u32>,
}

#[async_trait]
impl Channel for AckLosingChannel {
    fn get_name(&self) -> String {
        self.inner.get_name()
    }

    fn partitions(&self) -> u32 {
        self.inner.partitions()
    }

    async fn append(&self, partition: u32, payload: &[u8]) -> chrelay::error::Result<u64> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let offset = self.inner.append(partition, payload).await?;
        if self.lose.contains(&call) {
            return Err(RelayError::ChannelUnavailable(format!(
                "acknowledgement of offset {offset} lost"
            )));
        }
        Ok(offset)
    }

    async fn bounds(&self, partition: u32) -> chrelay::error::Result<PartitionBounds> {
        self.inner.bounds(partition).await
    }

    async fn open_reader(
        &self,
        consumer: &str,
        partition: u32,
        from: u64,
    ) -> chrelay::error::Result<Box<dyn PartitionReader>> {
        self.inner.open_reader(consumer, partition, from).await
    }
}

/// Target that remembers the version of every mutation per key, in arrival
/// order
struct RecordingTarget {
    inner: Arc<MemoryTarget>,
    versions: Mutex<HashMap<String, Vec<u64>>>,
}

#[async_trait]
impl TargetStore for RecordingTarget {
    fn get_name(&self) -> String {
        self.inner.get_name()
    }

    async fn apply(&self, batch: &[Mutation]) -> chrelay::error::Result<()> {
        {
            let mut versions = self.versions.lock().unwrap();
            for m in batch {
                let (key, version) = match m {
                    Mutation::Upsert { key, version, .. } | Mutation::Delete { key, version, .. } => {
                        (key, version)
                    }
                };
                versions
                    .entry(format!("{key:?}"))
                    .or_default()
                    .push(version.0);
            }
        }
        self.inner.apply(batch).await
    }
}

#[tokio::test]
async fn test_events_per_key_arrive_in_source_order() {
    let p = Pipeline::new(Retention::default()).await;
    let mut latest = HashMap::new();
    for id in 0..6 {
        p.log.insert("users", user(id, "n", "v0@example.com"));
        latest.insert(id, user(id, "n", "v0@example.com"));
    }
    for round in 1..4 {
        for id in 0..6 {
            let next = user(id, "n", &format!("v{round}@example.com"));
            p.log.update("users", latest[&id].clone(), next.clone());
            latest.insert(id, next);
        }
    }

    let channel = Arc::new(AckLosingChannel {
        inner: p.channel.clone(),
        calls: AtomicU32::new(0),
        lose: vec![1, 7, 15],
    });
    let mut capture = Capture::open(
        "pg",
        p.log.clone(),
        [users()],
        channel.clone(),
        p.codec.clone(),
        p.positions.clone(),
        CaptureConfig {
            batch_size: 5,
            poll_interval: Duration::from_millis(1),
            retry: retry(),
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();
    while capture.step().await.unwrap() > 0 {}

    let target = Arc::new(RecordingTarget {
        inner: p.target.clone(),
        versions: Mutex::new(HashMap::new()),
    });
    for partition in 0..PARTITIONS {
        let mut applier = Applier::open(
            "warehouse",
            partition,
            [users()],
            Wiring {
                channel: channel.clone(),
                codec: p.codec.clone(),
                target: target.clone(),
                positions: p.positions.clone(),
            },
            ApplierConfig {
                batch_size: 3,
                batch_wait: Duration::from_millis(1),
                retry: retry(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        while applier.step().await.unwrap() > 0 {}
    }

    let versions = target.versions.lock().unwrap();
    assert_eq!(versions.len(), 6);
    let mut duplicates = 0;
    for (key, seen) in versions.iter() {
        assert!(
            seen.windows(2).all(|w| w[0] <= w[1]),
            "{key} went backwards: {seen:?}"
        );
        duplicates += seen.windows(2).filter(|w| w[0] == w[1]).count();
    }
    // every lost acknowledgement was retried into a duplicate
    assert_eq!(duplicates, 3);
    for (id, row) in latest {
        assert_eq!(p.target.get("users", &key(id)), Some(row));
    }
}
