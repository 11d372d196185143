//! Courier relay replay binary.
//!
//! Reads newline-delimited JSON [`RelayEvent`]s, runs them through the relay
//! driver backed by in-memory storage, and writes every resulting action
//! except logs as NDJSON on stdout. Logs go to `tracing`.
//!
//! # Usage
//!
//! ```bash
//! # Replay a captured session
//! courier-relay --input session.ndjson
//!
//! # Pipe events in, one JSON object per line
//! cat events.ndjson | courier-relay --log-level debug
//! ```

use std::path::PathBuf;

use clap::Parser;
use courier_relay::{
    MemoryStorage, RelayAction, RelayConfig, RelayDriver, RelayEvent, SystemEnv, emit_log,
    execute_storage_actions,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Courier delivery relay
#[derive(Parser, Debug)]
#[command(name = "courier-relay")]
#[command(about = "Replay NDJSON relay events through the Courier delivery driver")]
#[command(version)]
struct Args {
    /// NDJSON event file; reads stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Maximum members per group
    #[arg(long, default_value = "256")]
    max_group_size: usize,

    /// Do not emit unread-count updates
    #[arg(long)]
    no_unread_deltas: bool,

    /// Deliver actors' own messages and updates back to them
    #[arg(long)]
    echo_to_sender: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = RelayConfig {
        max_group_size: args.max_group_size,
        emit_unread_deltas: !args.no_unread_deltas,
        echo_to_sender: args.echo_to_sender,
    };
    tracing::info!(?config, "Courier relay starting");

    match args.input {
        Some(path) => {
            let file = tokio::fs::File::open(&path).await?;
            tracing::info!("Replaying {}", path.display());
            replay(BufReader::new(file), config).await
        },
        None => replay(BufReader::new(tokio::io::stdin()), config).await,
    }
}

async fn replay<R>(reader: R, config: RelayConfig) -> Result<(), Box<dyn std::error::Error>>
where
    R: AsyncBufRead + Unpin,
{
    let storage = MemoryStorage::new();
    let mut driver = RelayDriver::new(SystemEnv::new(), storage.clone(), config);
    let mut stdout = tokio::io::stdout();
    let mut lines = reader.lines();
    let mut line_number = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: RelayEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = line_number, "Skipping malformed event: {}", e);
                continue;
            },
        };

        let actions = driver.process_event(event);
        if let Err(e) = execute_storage_actions(&storage, &actions) {
            tracing::error!(line = line_number, "Storage failure: {}", e);
        }

        for action in &actions {
            if let RelayAction::Log { .. } = action {
                emit_log(action);
                continue;
            }
            let mut encoded = serde_json::to_vec(action)?;
            encoded.push(b'\n');
            stdout.write_all(&encoded).await?;
        }
    }

    stdout.flush().await?;
    tracing::info!(
        events = line_number,
        messages = storage.message_count(),
        groups = storage.group_count(),
        "Replay finished"
    );
    Ok(())
}
