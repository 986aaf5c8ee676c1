use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tidecache::config::EngineConfig;
use tidecache::engine::ServiceEngine;
use tidecache::events::{HostEvent, MessageEnvelope};
use tidecache::net::HttpFetcher;
use tidecache::store::SqliteStore;

#[derive(Parser, Debug)]
#[command(name = "tidecache")]
#[command(about = "Offline-first request caching and background sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tidecache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the shell manifest for the configured version
  Install,
  /// Activate the installed version and collect old cache generations
  Activate,
  /// Print the engine status as JSON
  Status,
  /// Delete every cache namespace, current generation included
  Clear,
  /// Replay queued writes against the sync endpoint
  Drain,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  let config = EngineConfig::load(args.config.as_deref())?;
  let store = Arc::new(SqliteStore::open("tidecache", 1, |_, _, _| Ok(()))?);
  let engine = ServiceEngine::new(config, store, Arc::new(HttpFetcher::new()))?;

  match args.command {
    Command::Install => {
      engine.handle_event(HostEvent::Install).await?;
      println!("installed version {}", engine.config().version);
    }
    Command::Activate => {
      engine.handle_event(HostEvent::Activate).await?;
      println!("activated version {}", engine.config().version);
    }
    Command::Status => {
      let status = engine.status()?;
      println!("{}", serde_json::to_string_pretty(&status)?);
    }
    Command::Clear => {
      engine
        .handle_event(HostEvent::Message {
          envelope: MessageEnvelope::ClearCaches,
          reply: None,
        })
        .await?;
      println!("caches cleared");
    }
    Command::Drain => {
      let report = engine.drain_outbox().await?;
      println!(
        "replayed {} / retried {} / dropped {}",
        report.replayed, report.retried, report.dropped
      );
    }
  }

  engine.shutdown().await;
  Ok(())
}

/// Log to a file so engine output never interleaves with command output.
/// The guard must stay alive for the duration of the program.
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("tidecache");
  std::fs::create_dir_all(&log_dir)?;

  let file_appender = tracing_appender::rolling::never(log_dir, "tidecache.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
