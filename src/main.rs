use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use fieldsync::api::{HttpJobApi, JobApi};
use fieldsync::cache::{CacheSource, CacheStorage, NoopStorage, SqliteStorage};
use fieldsync::db::Database;
use fieldsync::gateway::{Gateway, HttpFetcher, LogSurface, SqliteAssetStore};
use fieldsync::{Config, ConnectivityMonitor, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first job sync for field technicians")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Keep syncing in the background until Ctrl-C
  Run,
  /// Run one sync pass now
  Sync,
  /// List queued offline mutations
  Queue,
  /// Print jobs, from the network or the local store when offline
  Jobs {
    /// Only jobs scheduled for today
    #[arg(long)]
    today: bool,
  },
  /// Precache static assets and drop stale asset caches
  Precache,
  /// Wipe cached data and queued mutations
  Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let path = config.storage.store_path()?;
  match SqliteStorage::open(&path) {
    Ok(storage) => run(args.command, &config, storage).await,
    Err(e) => {
      warn!(path = %path.display(), error = %e, "local store unavailable, running without cache");
      eprintln!("warning: local store unavailable ({}), offline data is disabled", e);
      run(args.command, &config, NoopStorage).await
    }
  }
}

/// Log to a daily rolling file under the data directory.
fn init_tracing() -> Option<WorkerGuard> {
  let dir = Database::default_path("logs")?;
  let appender = tracing_appender::rolling::daily(dir, "fieldsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("FIELDSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Some(guard)
}

async fn run<S: CacheStorage>(command: Command, config: &Config, storage: S) -> Result<()> {
  let token = Config::get_api_token().ok();
  let api = Arc::new(HttpJobApi::new(&config.api, token.clone())?);

  let online = api.health().await.is_ok();
  let monitor = ConnectivityMonitor::new(online);
  let engine = SyncEngine::new(Arc::clone(&api), storage, monitor.clone(), &config.sync);

  let require_token = || {
    token
      .as_ref()
      .map(|_| ())
      .ok_or_else(|| eyre!("Not signed in. Set the FIELDSYNC_TOKEN environment variable."))
  };

  match command {
    Command::Run => {
      require_token()?;
      let probe = monitor.spawn_probe(Arc::clone(&api), config.sync.probe_interval());
      engine.start().await;

      let mut status = engine.subscribe_status();
      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          changed = status.changed() => {
            if changed.is_err() {
              break;
            }
            let current = status.borrow_and_update().clone();
            println!(
              "{} | {:?} | {} pending | {} dropped",
              if current.online { "online" } else { "offline" },
              current.state,
              current.pending,
              current.dropped_total
            );
          }
        }
      }

      probe.abort();
      engine.stop();
    }
    Command::Sync => {
      require_token()?;
      engine.resume_session();
      match engine.sync_now().await? {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => println!("offline, nothing synced ({} pending)", engine.pending().await?.len()),
      }
    }
    Command::Queue => {
      for entry in engine.pending().await? {
        println!("{}", serde_json::to_string(&entry)?);
      }
    }
    Command::Jobs { today } => {
      if token.is_some() {
        engine.resume_session();
      }
      let result = if today {
        engine.today_jobs().await
      } else {
        engine.jobs().await
      };
      if result.source == CacheSource::Offline {
        let since = result
          .cached_at
          .map(|t| t.to_rfc3339())
          .unwrap_or_else(|| "never".to_string());
        eprintln!("offline: showing cached jobs (cached {})", since);
      }
      println!("{}", serde_json::to_string_pretty(&result.data)?);
    }
    Command::Logout => {
      engine.logout().await?;
      println!("local data cleared");
    }
    Command::Precache => precache(config).await?,
  }

  Ok(())
}

async fn precache(config: &Config) -> Result<()> {
  let assets = SqliteAssetStore::open(&config.storage.asset_store_path()?)?;
  let gateway = Gateway::new(
    config.gateway.clone(),
    config.gateway_origin()?,
    HttpFetcher::new(config.api.timeout())?,
    assets,
    LogSurface,
  );

  let (handle, task) = gateway.spawn();
  let count = handle.install().await?;
  let deleted = handle.activate().await?;
  drop(handle);
  task.await?;

  info!(count, deleted = deleted.len(), "precache complete");
  println!(
    "cached {} assets in {}; removed {} stale caches",
    count,
    config.gateway.cache_version,
    deleted.len()
  );
  Ok(())
}
