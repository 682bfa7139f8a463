use ciwatch::cache::Timestamped;
use ciwatch::ci::{Platform, Snapshot};
use ciwatch::config::Config;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ciwatch")]
#[command(about = "Inspect and manage the CI telemetry cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ciwatch/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the persisted snapshot's age and contents
  Snapshot,
  /// Delete the persisted snapshot
  ClearSnapshot,
  /// Print the effective cache policy and loop timings
  Config,
}

fn init_tracing() -> Result<WorkerGuard> {
  let log_dir = dirs::data_local_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("ciwatch");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::never(&log_dir, "ciwatch.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ciwatch=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let file_cache = config.cache.file_cache()?;

  match args.command {
    Command::Snapshot => match file_cache.load::<Snapshot>()? {
      Some(snapshot) => {
        println!("Snapshot: {}", file_cache.path().display());
        println!("Saved at: {}", snapshot.timestamp().to_rfc3339());
        println!("  projects:       {}", snapshot.projects.len());
        println!("  pipelines:      {}", snapshot.pipelines.len());
        println!("  branches:       {}", snapshot.branches.len());
        println!("  merge requests: {}", snapshot.merge_requests.len());
        println!("  issues:         {}", snapshot.issues.len());
        println!("  user profiles:  {}", snapshot.user_profiles.len());
      }
      None => println!("No snapshot at {}", file_cache.path().display()),
    },
    Command::ClearSnapshot => {
      file_cache.clear()?;
      info!(path = %file_cache.path().display(), "snapshot cleared");
      println!("Removed {}", file_cache.path().display());
    }
    Command::Config => {
      for platform in [Platform::Gitlab, Platform::Github] {
        let policy = config.cache.policy_for(platform);
        println!(
          "{}: fresh {}s, stale {}s",
          platform,
          policy.fresh_ttl.num_seconds(),
          policy.stale_ttl.num_seconds()
        );
      }
      let settings = config.cache.refresher_settings();
      println!(
        "refresh every {}s with {} workers (startup delay {}s, hydrate {})",
        settings.interval.as_secs(),
        settings.workers,
        settings.startup_delay.as_secs(),
        settings.hydrate
      );
      println!("event poll every {}s", config.cache.poller_interval().as_secs());
      println!("snapshot: {}", file_cache.path().display());
    }
  }

  Ok(())
}
