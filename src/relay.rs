//! Relay runtime: wires sources, the channel and sinks together and keeps
//! their tasks running.
//!
//! One capture task runs per source and one applier task per sink and
//! partition. A task that fails with a recoverable error is restarted from
//! its persisted position with exponential backoff. Fatal errors stop only
//! the task that hit them.
use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    applier::{Applier, ApplierConfig, Wiring},
    capture::{Capture, CaptureConfig},
    channel::{get_channel, Channel},
    codec::{get_codec, Codec},
    error::{RelayError, Result},
    positions::{get_position_store, Fault, PositionStore},
    registry::Registry,
    settings::Settings,
    source::{get_source, ChangeLog},
    target::{get_target, TargetStore},
};

/// How failed tasks are restarted
#[derive(Debug, Clone, Copy)]
struct RestartPolicy {
    /// consecutive restarts of one task before it is given up on
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    /// a run this long counts as healthy and clears the restart count
    healthy_run: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            healthy_run: Duration::from_secs(300),
        }
    }
}

impl RestartPolicy {
    fn backoff(&self, restart_count: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.pow(restart_count.saturating_sub(1).min(8)))
            .min(self.max_backoff)
    }
}

/// Consumer position on one partition
#[derive(Debug, Clone, Serialize)]
pub struct LagReport {
    pub sink: String,
    pub consumer: String,
    pub partition: u32,
    /// last applied offset
    pub checkpoint: Option<u64>,
    pub earliest: u64,
    /// offset the next append will get
    pub head: u64,
    /// events appended but not applied yet
    pub lag: u64,
    pub fault: Option<Fault>,
}

pub struct Relay {
    settings: Settings,
    registry: Registry,
    channel: Arc<dyn Channel>,
    codec: Arc<dyn Codec + Send + Sync>,
    positions: Arc<dyn PositionStore>,
}

impl Relay {
    /// Opens the channel, position store and registry configured in `settings`
    pub async fn open(settings: Settings) -> Result<Relay> {
        let registry = Registry::load(&settings.state_dir).await?;
        let channel = get_channel(&settings.channel).await?;
        let codec = get_codec(
            &settings.channel.codec,
            settings.channel.codec_settings.clone(),
        )?;
        let positions = get_position_store(&settings.state_dir).await?;
        Ok(Relay::with_parts(settings, registry, channel, codec, positions))
    }

    pub fn with_parts(
        settings: Settings,
        registry: Registry,
        channel: Arc<dyn Channel>,
        codec: Arc<dyn Codec + Send + Sync>,
        positions: Arc<dyn PositionStore>,
    ) -> Relay {
        Relay {
            settings,
            registry,
            channel,
            codec,
            positions,
        }
    }

    /// Runs every configured source and sink until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut sources = HashMap::new();
        for (name, cfg) in &self.settings.sources {
            sources.insert(name.clone(), get_source(name, cfg)?);
        }
        let mut sinks = HashMap::new();
        for (name, cfg) in &self.settings.sinks {
            sinks.insert(name.clone(), get_target(name, cfg)?);
        }
        self.run_with(sources, sinks, cancel).await
    }

    /// Runs the given sources and sinks until `cancel` fires.
    ///
    /// Returns the first fatal error once every task stopped.
    pub async fn run_with(
        &self,
        sources: HashMap<String, Arc<dyn ChangeLog>>,
        sinks: HashMap<String, Arc<dyn TargetStore>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let instance = Uuid::new_v4();
        info!(
            %instance,
            channel = %self.channel.get_name(),
            partitions = self.channel.partitions(),
            sources = sources.len(),
            sinks = sinks.len(),
            "relay_started"
        );

        let mut tasks = JoinSet::new();
        for (name, log) in sources {
            self.spawn_capture(&mut tasks, name, log, &cancel)?;
        }
        for (name, target) in sinks {
            self.spawn_appliers(&mut tasks, name, target, &cancel)?;
        }

        let housekeeping = cancel.child_token();
        let retention = tokio::spawn(enforce_retention(
            self.channel.clone(),
            Duration::from_secs(self.settings.channel.retention_check_seconds.unwrap_or(60)),
            housekeeping.clone(),
        ));

        let mut first_fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_fatal.get_or_insert(e);
                }
                Err(e) => error!(error = %e, "task_panicked"),
            }
        }
        housekeeping.cancel();
        if let Err(e) = retention.await {
            error!(error = %e, "task_panicked");
        }
        info!(%instance, "relay_stopped");
        first_fatal.map_or(Ok(()), Err)
    }

    fn spawn_capture(
        &self,
        tasks: &mut JoinSet<Result<()>>,
        name: String,
        log: Arc<dyn ChangeLog>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cfg = self
            .settings
            .sources
            .get(&name)
            .ok_or_else(|| RelayError::Config(format!("source {name} is not configured")))?;
        let tables = self.registry.tables_for(&name, &self.settings);
        if tables.is_empty() {
            warn!(source = %name, "source_has_no_tables");
        }
        let config = CaptureConfig {
            batch_size: cfg.batch_size.unwrap_or(1000),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.unwrap_or(500)),
            retry: self.settings.retry.clone(),
        };
        let channel = self.channel.clone();
        let codec = self.codec.clone();
        let positions = self.positions.clone();
        let task_cancel = cancel.clone();
        let task = format!("capture/{name}");
        tasks.spawn(supervise(task, RestartPolicy::default(), cancel.clone(), move || {
            let (name, log, tables) = (name.clone(), log.clone(), tables.clone());
            let (channel, codec, positions) = (channel.clone(), codec.clone(), positions.clone());
            let (config, cancel) = (config.clone(), task_cancel.clone());
            async move {
                let mut capture =
                    Capture::open(&name, log, tables, channel, codec, positions, config, cancel)
                        .await?;
                capture.run().await
            }
        }));
        Ok(())
    }

    fn spawn_appliers(
        &self,
        tasks: &mut JoinSet<Result<()>>,
        name: String,
        target: Arc<dyn TargetStore>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cfg = self
            .settings
            .sinks
            .get(&name)
            .ok_or_else(|| RelayError::Config(format!("sink {name} is not configured")))?;
        let consumer = cfg.consumer_group.clone().unwrap_or_else(|| name.clone());
        let tables = self.registry.all_tables(&self.settings);
        let config = ApplierConfig {
            batch_size: cfg.batch_size.unwrap_or(1000),
            batch_wait: Duration::from_secs(cfg.batch_timeout_seconds.unwrap_or(1)),
            retry: self.settings.retry.clone(),
        };
        let wiring = Wiring {
            channel: self.channel.clone(),
            codec: self.codec.clone(),
            target,
            positions: self.positions.clone(),
        };
        for partition in 0..self.channel.partitions() {
            let (consumer, tables) = (consumer.clone(), tables.clone());
            let (wiring, config, task_cancel) = (wiring.clone(), config.clone(), cancel.clone());
            let task = format!("apply/{name}/{partition}");
            tasks.spawn(supervise(task, RestartPolicy::default(), cancel.clone(), move || {
                let (consumer, tables) = (consumer.clone(), tables.clone());
                let (wiring, config, cancel) = (wiring.clone(), config.clone(), task_cancel.clone());
                async move {
                    let mut applier =
                        Applier::open(&consumer, partition, tables, wiring, config, cancel).await?;
                    applier.run().await
                }
            }));
        }
        Ok(())
    }

    /// Checkpoint, head and fault state of every sink on every partition
    pub async fn lag(&self) -> Result<Vec<LagReport>> {
        let mut sinks: Vec<_> = self.settings.sinks.iter().collect();
        sinks.sort_by(|a, b| a.0.cmp(b.0));
        let mut reports = Vec::new();
        for (name, cfg) in sinks {
            let consumer = cfg.consumer_group.clone().unwrap_or_else(|| name.clone());
            for partition in 0..self.channel.partitions() {
                let bounds = self.channel.bounds(partition).await?;
                let checkpoint = self.positions.checkpoint(&consumer, partition).await?;
                reports.push(LagReport {
                    sink: name.clone(),
                    consumer: consumer.clone(),
                    partition,
                    checkpoint: checkpoint.offset,
                    earliest: bounds.earliest,
                    head: bounds.next,
                    lag: bounds.next.saturating_sub(checkpoint.next_offset()),
                    fault: self.positions.fault(&consumer, partition).await?,
                });
            }
        }
        Ok(reports)
    }

    /// Clears the fault of `sink` on `partition` and makes it resume at
    /// `offset`. Events between `offset` and the old checkpoint are applied
    /// again.
    pub async fn reset(&self, sink: &str, partition: u32, offset: u64) -> Result<()> {
        let cfg = self
            .settings
            .sinks
            .get(sink)
            .ok_or_else(|| RelayError::Config(format!("sink {sink} is not configured")))?;
        if partition >= self.channel.partitions() {
            return Err(RelayError::Config(format!(
                "channel has {} partitions, no partition {partition}",
                self.channel.partitions()
            )));
        }
        let bounds = self.channel.bounds(partition).await?;
        if offset < bounds.earliest || offset > bounds.next {
            return Err(RelayError::Config(format!(
                "offset {offset} is outside retained range {}..={}",
                bounds.earliest, bounds.next
            )));
        }
        let consumer = cfg.consumer_group.clone().unwrap_or_else(|| sink.to_owned());
        self.positions.reset(&consumer, partition, offset).await
    }
}

/// Runs the task `start` builds, restarting it after recoverable failures
async fn supervise<F, Fut>(
    task: String,
    policy: RestartPolicy,
    cancel: CancellationToken,
    mut start: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut restart_count = 0;
    loop {
        if cancel.is_cancelled() {
            info!(task = %task, "shutdown_before_restart");
            return Ok(());
        }
        let started = Instant::now();
        let result = start().await;
        if started.elapsed() >= policy.healthy_run {
            restart_count = 0;
        }
        let err = match result {
            Ok(()) => {
                info!(task = %task, "task_stopped_cleanly");
                return Ok(());
            }
            Err(e) if e.is_fatal() => {
                error!(task = %task, error = %e, "task_stopped_fatal");
                return Err(e);
            }
            Err(e) => e,
        };
        restart_count += 1;
        if restart_count >= policy.max_attempts {
            error!(task = %task, error = %err, restart_count, "max_restart_attempts_reached");
            return Err(err);
        }
        let backoff = policy.backoff(restart_count);
        warn!(
            task = %task,
            error = %err,
            restart_count,
            backoff_ms = backoff.as_millis() as u64,
            "task_failed_restarting"
        );
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

async fn enforce_retention(channel: Arc<dyn Channel>, every: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        match channel.enforce_retention().await {
            Ok(0) => {}
            Ok(dropped) => info!(channel = %channel.get_name(), dropped, "retention_applied"),
            Err(e) => warn!(channel = %channel.get_name(), error = %e, "retention_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> RestartPolicy {
        RestartPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            healthy_run: Duration::from_millis(30),
        }
    }

    fn flaky() -> RelayError {
        RelayError::Io(std::io::Error::other("flaky"))
    }

    #[test]
    fn test_restart_backoff_is_capped() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(5), Duration::from_secs(16));
        assert_eq!(policy.backoff(30), policy.max_backoff);
    }

    #[tokio::test]
    async fn test_supervise_restarts_recoverable_and_stops_on_fatal() {
        let mut attempts = 0;
        let result = supervise("t".into(), quick(), CancellationToken::new(), || {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt == 1 {
                    Err(flaky())
                } else {
                    Err(RelayError::Faulted {
                        consumer: "c".into(),
                        partition: 0,
                        reason: "rejected".into(),
                    })
                }
            }
        });
        let err = result.await.unwrap_err();
        assert!(matches!(err, RelayError::Faulted { .. }));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_supervise_gives_up_on_repeated_quick_failures() {
        let mut attempts = 0;
        let result = supervise("t".into(), quick(), CancellationToken::new(), || {
            attempts += 1;
            async { Err(flaky()) }
        });
        assert!(matches!(result.await, Err(RelayError::Io(_))));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_supervise_forgets_failures_after_healthy_run() {
        let policy = quick();
        let mut attempts = 0;
        let result = supervise("t".into(), policy, CancellationToken::new(), || {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt == 8 {
                    return Ok(());
                }
                // every run outlives the healthy threshold before failing
                tokio::time::sleep(policy.healthy_run).await;
                Err(flaky())
            }
        });
        assert!(result.await.is_ok());
        assert_eq!(attempts, 8);
    }
}
