//! Application config
use std::{collections::HashMap, path::Path};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::{model::TableSchema, retry::RetryConfig};

/// Declared table of a source
#[derive(Deserialize, Debug, Clone)]
pub struct TableDef {
    /// columns identifying a row, required
    pub primary_key: Vec<String>,
    /// known columns (default: unconstrained)
    #[serde(default)]
    pub columns: Vec<String>,
}

impl TableDef {
    pub fn schema(&self, table: &str) -> TableSchema {
        TableSchema {
            table: table.to_owned(),
            version: 1,
            primary_key: self.primary_key.clone(),
            columns: self.columns.clone(),
        }
    }
}

/// configuration of single source change log
#[derive(Deserialize, Debug, Clone)]
pub struct Source {
    /// kind of change log: `file` or `memory`
    pub kind: String,
    /// path of JSON-lines change log, for `file` sources
    pub path: Option<String>,
    /// how long to wait when nothing new is committed (default: 500ms)
    pub poll_interval_ms: Option<u64>,
    /// max records read per poll (default: 1000)
    pub batch_size: Option<usize>,
    /// tables to relay, keyed by name
    #[serde(default)]
    pub tables: HashMap<String, TableDef>,
}

/// configuration of the durable channel
#[derive(Deserialize, Debug, Clone)]
pub struct Channel {
    /// name of channel (default: chrelay)
    #[serde(default = "default_channel_name")]
    pub name: String,
    /// `log` for the built-in replicated log, or `kafka`
    #[serde(default = "default_channel_kind")]
    pub kind: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// name of payload codec (default: json)
    #[serde(default = "default_codec")]
    pub codec: String,
    /// codec-specific configuration
    pub codec_settings: Option<toml::Value>,
    /// where the built-in log keeps its replicas (default: `<state_dir>/channel`)
    #[serde(default)]
    pub data_dir: String,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// replicas that must persist an append before it is acknowledged
    #[serde(default = "default_min_insync")]
    pub min_insync: usize,
    /// retention by record age, unlimited when unset
    pub retention_ms: Option<i64>,
    /// retention by partition size, unlimited when unset
    pub retention_bytes: Option<u64>,
    /// how often retention is enforced (default: 60s)
    pub retention_check_seconds: Option<u64>,
    /// address of bootstrap kafka broker
    pub kafka_broker: Option<String>,
    /// topic to use as the channel
    pub topic: Option<String>,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

impl Default for Channel {
    fn default() -> Self {
        Channel {
            name: default_channel_name(),
            kind: default_channel_kind(),
            partitions: default_partitions(),
            codec: default_codec(),
            codec_settings: None,
            data_dir: String::new(),
            replicas: default_replicas(),
            min_insync: default_min_insync(),
            retention_ms: None,
            retention_bytes: None,
            retention_check_seconds: None,
            kafka_broker: None,
            topic: None,
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

fn default_channel_name() -> String {
    "chrelay".into()
}
fn default_channel_kind() -> String {
    "log".into()
}
fn default_partitions() -> u32 {
    4
}
fn default_codec() -> String {
    "json".into()
}
fn default_replicas() -> usize {
    3
}
fn default_min_insync() -> usize {
    2
}
fn default_delivery_timeout_ms() -> u64 {
    30_000
}

/// configuration of single sink
#[derive(Deserialize, Debug, Clone)]
pub struct Sink {
    /// kind of target: `clickhouse` or `memory`
    pub kind: String,
    /// consumer name checkpoints are kept under (default: use sink's name)
    pub consumer_group: Option<String>,
    /// URL of ClickHouse
    pub clickhouse_url: Option<String>,
    /// source table to target table, unmapped tables keep their name
    #[serde(default)]
    pub tables: HashMap<String, String>,
    /// max events applied per batch (default: 1000)
    pub batch_size: Option<usize>,
    /// how long a partial batch waits for more events (default: 1s)
    pub batch_timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Settings {
    /// where cursors, checkpoints and the table registry live (default: ./state)
    #[serde(default)]
    pub state_dir: String,
    /// `pretty` or `json` (default: pretty)
    pub log_format: Option<String>,
    #[serde(default)]
    pub channel: Channel,
    /// Map of source names and settings
    #[serde(default)]
    pub sources: HashMap<String, Source>,
    /// Map of sink names and settings
    #[serde(default)]
    pub sinks: HashMap<String, Sink>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Settings {
    pub fn new(cfgfile: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(cfgfile).required(true))
            .add_source(Environment::with_prefix("CHRELAY").separator("__"))
            .build()?;
        let mut settings: Settings = cfg.try_deserialize()?;
        settings.fill_defaults();
        Ok(settings)
    }

    fn fill_defaults(&mut self) {
        if self.state_dir.is_empty() {
            self.state_dir = "./state".into();
        }
        if self.log_format.is_none() {
            self.log_format = Some("pretty".into());
        }
        if self.channel.data_dir.is_empty() {
            self.channel.data_dir = Path::new(&self.state_dir)
                .join("channel")
                .to_string_lossy()
                .into_owned();
        }
        self.channel.retention_check_seconds = self.channel.retention_check_seconds.or(Some(60));
        for cfg in self.sources.values_mut() {
            cfg.poll_interval_ms = cfg.poll_interval_ms.or(Some(500));
            cfg.batch_size = cfg.batch_size.or(Some(1000));
        }
        for (name, cfg) in &mut self.sinks {
            cfg.batch_size = cfg.batch_size.or(Some(1000));
            cfg.batch_timeout_seconds = cfg.batch_timeout_seconds.or(Some(1));
            cfg.consumer_group = match &cfg.consumer_group {
                None => Some(name.to_owned()),
                Some(x) => Some(x.to_owned()),
            }
        }
    }
}
