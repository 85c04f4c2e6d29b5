//! Logship Agent - ships lines read from stdin
//!
//! Every line becomes a row of a single-column record block. Blocks are
//! buffered in a persistent store and shipped to the collector by the
//! background send loop.

use anyhow::{Context, Result};
use clap::Parser;
use logship_client::{ClientBufferStore, SenderConfig, WireProtocolClient};
use logship_common::config::Config;
use logship_common::StreamKey;
use logship_proto::RecordBlock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "logship-agent")]
#[command(about = "Logship shipping agent")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/logship/agent.toml")]
    config: String,

    /// Collector address
    #[arg(short, long)]
    server: Option<String>,

    /// Client identity byte
    #[arg(long)]
    client_id: Option<u8>,

    /// Stream name
    #[arg(long, default_value = "stdin")]
    stream_name: String,

    /// Stream (log) type
    #[arg(long, default_value = "lines")]
    stream_type: String,

    /// Shard of the stream
    #[arg(long, default_value = "0")]
    shard: i32,

    /// Hostname reported to the collector (defaults to this host)
    #[arg(long)]
    hostname: Option<String>,

    /// Snapshot file for crash recovery
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
    Ok(toml::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to parse config file: {}", e);
        Config::default()
    }))
}

/// Lines waiting to be turned into a record block
///
/// The pending block never grows past the buffer capacity: a line that
/// would not fit ships the block first. Only a line too large for a block
/// of its own is refused.
struct PendingLines {
    block: RecordBlock,
    capacity: usize,
    refused: u64,
}

impl PendingLines {
    fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            block: line_block()?,
            capacity,
            refused: 0,
        })
    }

    fn push(&mut self, line: String, store: &ClientBufferStore, key: &StreamKey) -> Result<()> {
        let row = vec![line];
        let row_len = RecordBlock::row_encoded_len(&row);
        if self.block.encoded_len() + row_len > self.capacity {
            self.flush(store, key)?;
            if self.block.encoded_len() + row_len > self.capacity {
                self.refused += 1;
                error!(
                    "Refusing a line of {} bytes for {}: it does not fit a {} byte buffer on its own ({} refused so far)",
                    row[0].len(),
                    key,
                    self.capacity,
                    self.refused
                );
                return Ok(());
            }
        }
        self.block.push_row(row)?;
        Ok(())
    }

    /// Hand the pending block to the store
    fn flush(&mut self, store: &ClientBufferStore, key: &StreamKey) -> Result<()> {
        if self.block.rows.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.block, line_block()?);
        store.put(key, &block.encode()?)?;
        Ok(())
    }
}

fn line_block() -> Result<RecordBlock> {
    Ok(RecordBlock::new(
        vec!["line".to_string()],
        vec!["string".to_string()],
    )?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    if let Some(server) = args.server {
        config.client.server_addr = server;
    }
    if let Some(client_id) = args.client_id {
        config.client.client_id = client_id;
    }
    if let Some(state_file) = args.state_file {
        config.client.state_file = state_file;
    }
    let log_level = if args.log_level != "info" {
        args.log_level
    } else {
        config.logging.level.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let hostname = args
        .hostname
        .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
    let key = StreamKey::new(args.stream_name, args.stream_type, hostname, args.shard, 1)
        .context("invalid stream key")?;

    info!("Starting Logship agent");
    info!("Shipping {} to {}", key, config.client.server_addr);

    let capacity = config.client.buffer_capacity;
    let store = Arc::new(ClientBufferStore::open(capacity, &config.client.state_file));
    let client = Arc::new(WireProtocolClient::new(
        SenderConfig::from(&config.client),
        Arc::clone(&store),
    ));
    let send_handle = client.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = PendingLines::new(capacity)?;
    let mut ticker = tokio::time::interval(config.client.send_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => pending.push(line, &store, &key)?,
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = ticker.tick() => pending.flush(&store, &key)?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    pending.flush(&store, &key)?;
    client.close().await;
    let _ = send_handle.await;

    // One last pass so a clean exit leaves nothing behind
    if let Err(e) = client.tick().await {
        warn!("Final send failed, {} payloads kept: {}", store.ready_len(), e);
    }
    client.close().await;
    store.close().context("persisting client state")?;

    info!("Agent stopped");
    Ok(())
}
