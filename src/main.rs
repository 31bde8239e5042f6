use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing_subscriber::EnvFilter;

use tracksync::config::Config;
use tracksync::{CacheStore, JiraClient, Orchestrator, RateLimiter, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "tracksync")]
#[command(about = "Sync issue-tracker data into the local dashboard cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tracksync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Refresh the cache for one saved query
  Sync {
    /// Profile name from the config file
    #[arg(short, long)]
    profile: String,
    /// Query id from the config file
    #[arg(short, long)]
    query: String,
  },
  /// Drop all cached data for one saved query
  Purge {
    #[arg(short, long)]
    profile: String,
    #[arg(short, long)]
    query: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Sync { profile, query } => run_sync(&config, &profile, &query).await,
    Command::Purge { profile, query } => run_purge(&config, &profile, &query),
  }
}

fn lookup<'a>(
  config: &'a Config,
  profile: &str,
  query: &str,
) -> Result<(&'a tracksync::config::ProfileConfig, &'a tracksync::config::QueryConfig)> {
  let profile_config = config
    .profiles
    .get(profile)
    .ok_or_else(|| eyre!("Unknown profile '{}'", profile))?;
  let query_config = profile_config
    .queries
    .get(query)
    .ok_or_else(|| eyre!("Unknown query '{}' in profile '{}'", query, profile))?;
  Ok((profile_config, query_config))
}

async fn run_sync(config: &Config, profile: &str, query: &str) -> Result<()> {
  let (profile_config, query_config) = lookup(config, profile, query)?;

  let token = Config::get_api_token()?;
  // One process-wide limiter; the remote enforces a single global limit.
  let limiter = RateLimiter::new(config.rate_limit.capacity, config.rate_limit.refill_per_sec)
    .map_err(|e| eyre!("{}", e))?;
  let client = JiraClient::new(
    &profile_config.url,
    token,
    limiter,
    config.retry.to_policy(),
    config.page_size,
    Duration::from_secs(config.http_timeout_secs),
  )
  .map_err(|e| eyre!("{}", e))?;

  let store = SqliteStore::open_default()?;
  let orchestrator = Orchestrator::new(
    client,
    store,
    chrono::Duration::minutes(config.freshness_minutes),
  );

  let result = orchestrator
    .sync(profile, query, &query_config.to_definition())
    .await
    .map_err(|e| eyre!("{}", e))?;

  println!(
    "{:?}: fetched {} issues, {} changelog entries, {} parents (cache: {}/{}/{})",
    result.strategy,
    result.fetched_issues,
    result.fetched_changelog,
    result.fetched_parents,
    result.cached_issues,
    result.cached_changelog,
    result.cached_parents,
  );
  if let Some(kind) = result.error {
    return Err(eyre!("sync finished with error: {:?} (prior cache kept)", kind));
  }

  Ok(())
}

fn run_purge(config: &Config, profile: &str, query: &str) -> Result<()> {
  lookup(config, profile, query)?;

  let store = SqliteStore::open_default()?;
  store.purge(profile, query)?;
  println!("Purged cache for {}/{}", profile, query);

  Ok(())
}
