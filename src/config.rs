use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

/// Central configuration loaded from environment variables.
///
/// The .env file is loaded automatically at startup via dotenvy. Nothing
/// here is global: the loaded value is handed to `AppContext::new` and
/// flows from there.
#[derive(Debug, Clone)]
pub struct Config {
    /// The account being tracked (no leading @).
    pub bluesky_handle: String,
    /// Public AT Protocol API endpoint (defaults to https://public.api.bsky.app).
    pub public_api_url: String,
    pub db_path: String,
    /// Archive rows merged per transaction.
    pub import_batch_size: usize,
    /// Hours between collection cycles in `watch` mode.
    pub collect_interval_hours: u64,
    /// How many recent posts each cycle refreshes metrics for.
    pub recent_posts: usize,
    /// Attempts per remote fetch before a cycle gives up.
    pub fetch_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bluesky_handle: String::new(),
            public_api_url: crate::bluesky::client::DEFAULT_PUBLIC_API_URL.to_string(),
            db_path: "./tidemark.db".to_string(),
            import_batch_size: 500,
            collect_interval_hours: 24,
            recent_posts: 50,
            fetch_attempts: 3,
        }
    }
}

/// Read a numeric env var, falling back to `default` when unset.
fn env_number<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Only the handle lacks a default, and it's only required for commands
    /// that talk to the network.
    pub fn load() -> Result<Self> {
        let defaults = Config::default();

        let config = Self {
            bluesky_handle: env::var("BLUESKY_HANDLE")
                .unwrap_or_default()
                .trim()
                .trim_start_matches('@')
                .to_string(),
            public_api_url: env::var("PUBLIC_API_URL").unwrap_or(defaults.public_api_url),
            db_path: env::var("TIDEMARK_DB_PATH").unwrap_or(defaults.db_path),
            import_batch_size: env_number("TIDEMARK_IMPORT_BATCH_SIZE", defaults.import_batch_size)?,
            collect_interval_hours: env_number(
                "TIDEMARK_COLLECT_INTERVAL_HOURS",
                defaults.collect_interval_hours,
            )?,
            recent_posts: env_number("TIDEMARK_RECENT_POSTS", defaults.recent_posts)?,
            fetch_attempts: env_number("TIDEMARK_FETCH_ATTEMPTS", defaults.fetch_attempts)?,
        };

        if config.import_batch_size == 0 {
            anyhow::bail!("TIDEMARK_IMPORT_BATCH_SIZE must be at least 1");
        }
        if config.collect_interval_hours == 0 {
            anyhow::bail!("TIDEMARK_COLLECT_INTERVAL_HOURS must be at least 1");
        }
        Ok(config)
    }

    /// Check that the Bluesky handle is configured.
    /// Call this before any operation that needs to identify the tracked user.
    pub fn require_bluesky(&self) -> Result<()> {
        if self.bluesky_handle.is_empty() {
            anyhow::bail!(
                "BLUESKY_HANDLE not set. Add it to your .env file.\n\
                 See .env.example for the required variables."
            );
        }
        Ok(())
    }
}
