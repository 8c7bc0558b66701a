use std::io::IsTerminal;

use anyhow::{bail, Context};
use chrelay::{model::TableSchema, registry::Registry, relay::Relay, settings::Settings};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, global = true, default_value = "chrelay.toml")]
    config: String,
    #[command(subcommand)]
    command: Command,
}

#[doc(hidden)]
#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured source and sink until interrupted
    Run,
    /// Register a source table for relaying
    Register {
        #[arg(long)]
        source: String,
        #[arg(long)]
        table: String,
        #[arg(long, value_delimiter = ',', required = true)]
        primary_key: Vec<String>,
        /// known columns, rows with other columns are rejected
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
    },
    /// Show checkpoint, head and fault state of every sink partition
    Lag {
        #[arg(long)]
        json: bool,
    },
    /// Clear a partition fault and resume the sink at an offset
    Reset {
        #[arg(long)]
        sink: String,
        #[arg(long)]
        partition: u32,
        #[arg(long)]
        offset: u64,
    },
}

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        "json" => builder.json().init(),
        _ => builder
            .with_ansi(std::io::stderr().is_terminal())
            .pretty()
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::new(&args.config).context("cannot load config")?;
    init_logging(settings.log_format.as_deref().unwrap_or("pretty"));

    match args.command {
        Command::Run => {
            let relay = Relay::open(settings).await.context("failed to open relay")?;
            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown_requested");
                    shutdown.cancel();
                }
            });
            relay.run(cancel).await?;
        }
        Command::Register {
            source,
            table,
            primary_key,
            columns,
        } => {
            if !settings.sources.contains_key(&source) {
                bail!("source {source} is not configured");
            }
            let mut registry = Registry::load(&settings.state_dir).await?;
            registry
                .register(
                    &source,
                    TableSchema {
                        table,
                        version: 1,
                        primary_key,
                        columns,
                    },
                )
                .await?;
        }
        Command::Lag { json } => {
            let relay = Relay::open(settings).await.context("failed to open relay")?;
            let reports = relay.lag().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                println!(
                    "{:<16} {:>9} {:>12} {:>12} {:>10}  state",
                    "sink", "partition", "checkpoint", "head", "lag"
                );
                for r in reports {
                    let checkpoint = r.checkpoint.map_or("-".to_owned(), |o| o.to_string());
                    let state = match &r.fault {
                        Some(f) => format!("faulted since {}: {}", f.at, f.reason),
                        None => "ok".to_owned(),
                    };
                    println!(
                        "{:<16} {:>9} {:>12} {:>12} {:>10}  {}",
                        r.sink, r.partition, checkpoint, r.head, r.lag, state
                    );
                }
            }
        }
        Command::Reset {
            sink,
            partition,
            offset,
        } => {
            let relay = Relay::open(settings).await.context("failed to open relay")?;
            relay.reset(&sink, partition, offset).await?;
            println!("{sink} partition {partition} resumes at offset {offset}");
        }
    }
    Ok(())
}
