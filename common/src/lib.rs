/*!
common/src/lib.rs

Shared configuration types and DB helper functions for newsposter.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default config file with an override file
- Helpers to open the SQLite database backing the content store
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/processed.db")
    pub path: String,
}

/// Civil timezone used to resolve publishing windows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// IANA timezone name, e.g. "Europe/Moscow"
    pub timezone: Option<String>,
}

/// Channels polled for news items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Channel references, either bare names or `https://t.me/<name>` links
    #[serde(default)]
    pub channels: Vec<String>,
    pub limit_per_channel: Option<usize>,
    /// Base URL of the public channel preview (default "https://t.me/s")
    pub base_url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// Advertisement filter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    #[serde(default)]
    pub deny_words: Vec<String>,
}

/// Remote LLM config (OpenAI-compatible chat completions endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
    /// Local attempts before the literal fallback text is used
    pub attempts: Option<u32>,
}

/// Image search and selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub per_page: Option<u32>,
    pub allow_keywords: Option<Vec<String>>,
    pub deny_keywords: Option<Vec<String>>,
    /// Topic-anchor suffixes appended to each base query
    pub anchors: Option<Vec<String>>,
    /// Generic suffixes used to build noisier variants on retry rounds
    pub generic_suffixes: Option<Vec<String>>,
    pub max_variants: Option<usize>,
    pub max_rounds: Option<u32>,
    pub cover_dir: Option<String>,
    /// Lowest-ranked base topic, always tried after the generated query
    pub default_topic: Option<String>,
}

/// Telegram Bot API target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub api_url: Option<String>,
    pub bot_token_env: Option<String>,
    pub channel_id: Option<String>,
    pub channel_id_env: Option<String>,
}

/// Instagram Graph API target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstagramConfig {
    pub api_url: Option<String>,
    pub user_id_env: Option<String>,
    pub access_token_env: Option<String>,
    pub publish_delay_seconds: Option<u64>,
}

/// FreeImage.host asset host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeImageConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
}

/// Post event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    pub path: Option<String>,
}

/// Retry and timeout policy for remote calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub attempts: Option<u32>,
    pub backoff_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
}

/// Content store retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Rows older than this many days are pruned at the start of a run.
    /// Unset keeps every row forever.
    pub retention_days: Option<u32>,
}

/// Literal fallbacks used when the language model is unavailable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub fallback_summary: Option<String>,
    pub fallback_image_brief: Option<String>,
    pub fallback_search_query: Option<String>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub schedule: Option<ScheduleConfig>,
    pub sources: Option<SourcesConfig>,
    pub filters: Option<FiltersConfig>,
    pub llm: Option<RemoteLlmConfig>,
    pub images: Option<ImagesConfig>,
    pub telegram: Option<TelegramConfig>,
    pub instagram: Option<InstagramConfig>,
    pub freeimage: Option<FreeImageConfig>,
    pub events: Option<EventsConfig>,
    pub retry: Option<RetryConfig>,
    pub store: Option<StoreConfig>,
    pub pipeline: Option<PipelineConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    /// Resolve the config files the way the binaries do: `config.default.toml`
    /// in the working directory, overridden by `explicit` (which must exist) or
    /// else by `config.toml` when present.
    pub async fn load_for_cli(explicit: Option<&Path>) -> Result<Self> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);
        let override_path = match explicit {
            Some(p) if !p.exists() => anyhow::bail!("Config file not found: {}", p.display()),
            Some(p) => Some(p),
            None => Some(Path::new(OVERRIDE_CONFIG_FILE)),
        };
        Self::load_with_defaults(Some(default_path), override_path).await
    }
}

pub const DEFAULT_CONFIG_FILE: &str = "config.default.toml";
pub const OVERRIDE_CONFIG_FILE: &str = "config.toml";

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Read a secret from the environment variable named in the configuration.
pub fn secret_from_env(var: &str) -> Result<String> {
    let value = std::env::var(var).with_context(|| format!("env var '{}' not set", var))?;
    if value.trim().is_empty() {
        anyhow::bail!("env var '{}' is empty", var);
    }
    Ok(value)
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary and the DB file if missing. The
/// pipeline is single-threaded, so a small pool is plenty.
///
/// Example:
///   let pool = init_db_pool("data/processed.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Initialize a private in-memory SQLite pool.
///
/// Every connection to `sqlite::memory:` opens its own empty database, so the
/// pool is pinned to a single connection that is never recycled.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory sqlite database")?;
    Ok(pool)
}
