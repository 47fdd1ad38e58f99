//! reveal-server binary.
//!
//! Reads `config.toml` (or the path specified with `--config`), opens the
//! SQLite contact store, and serves the provider callback plus the JSON API
//! over HTTP. Expired requests are swept in the background.
//!
//! # Password hash generation
//!
//! To generate the argon2 PHC string for `auth_password_hash` in config.toml:
//!
//! ```
//! cargo run -p reveal-server -- --hash-password
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use anyhow::Context as _;
use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use clap::Parser;
use rand_core::OsRng;
use reveal_pipeline::HttpProvider;
use reveal_server::{AppState, ServerConfig, sweeper};
use reveal_store_sqlite::SqliteStore;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Contact reveal pipeline server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  /// Submit the subject ids in this file (one per line) once listening.
  #[arg(long, value_name = "FILE")]
  subjects: Option<PathBuf>,

  /// Print the argon2 hash for a password entered on stdin and exit.
  #[arg(long)]
  hash_password: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Helper mode: hash a password and exit.
  if cli.hash_password {
    let password = rpassword_or_stdin()?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(password.as_bytes(), &salt)
      .map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?
      .to_string();
    println!("{hash}");
    return Ok(());
  }

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(
      config::Environment::with_prefix("REVEAL")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true),
    )
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  if server_cfg.auth_username.is_some() != server_cfg.auth_password_hash.is_some() {
    anyhow::bail!("auth_username and auth_password_hash must be set together");
  }
  if server_cfg.auth_username.is_none() {
    tracing::warn!("no credentials configured; /api is unauthenticated");
  }

  // Expand `~` in store path.
  let store_path = expand_tilde(&server_cfg.store_path);

  // Open SQLite store.
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  let provider = HttpProvider::new(
    server_cfg.provider_base_url.clone(),
    server_cfg.provider_api_key.clone(),
    Duration::from_secs(server_cfg.provider_timeout_secs),
  )
  .context("failed to build provider client")?;

  // Build application state.
  let state = AppState::new(Arc::new(store), provider, server_cfg.clone())
    .context("invalid pipeline configuration")?;

  let _sweeper = sweeper::spawn(
    state.api.tracker.clone(),
    Duration::from_secs(server_cfg.sweep_interval_secs),
  );

  let address = format!("{}:{}", server_cfg.host, server_cfg.port);
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;
  tracing::info!("Listening on http://{address}");

  // Startup submission runs once the callback endpoint is reachable.
  if let Some(path) = cli.subjects {
    let ids = read_subject_ids(&path)
      .with_context(|| format!("failed to read subject ids from {path:?}"))?;
    let submitter = state.api.submitter.clone();
    tokio::spawn(async move {
      match submitter.submit(ids, None).await {
        Ok(summary) => tracing::info!(
          accepted = summary.accepted,
          rejected = summary.rejected,
          requests = summary.request_ids.len(),
          "startup submission finished"
        ),
        Err(e) => tracing::error!(
          error = %e,
          accepted = e.partial().accepted,
          "startup submission stopped early"
        ),
      }
    });
  }

  let app = reveal_server::router(state);
  axum::serve(listener, app).await.context("server error")?;

  Ok(())
}

/// Non-blank lines of `path`, trimmed.
fn read_subject_ids(path: &Path) -> anyhow::Result<Vec<String>> {
  let text = std::fs::read_to_string(path)?;
  Ok(
    text
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty() && !line.starts_with('#'))
      .map(str::to_owned)
      .collect(),
  )
}

/// Read a password from stdin (no echo).
fn rpassword_or_stdin() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  let stdin = io::stdin();
  print!("Password: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  stdin.lock().read_line(&mut line)?;
  Ok(
    line
      .trim_end_matches('\n')
      .trim_end_matches('\r')
      .to_string(),
  )
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
