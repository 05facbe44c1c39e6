/*
newsposter - main.rs
Runs one publishing slot: collect channel news for the slot window, summarize,
pick a cover, and post to Telegram and Instagram. Meant to be started by cron
or a systemd timer once per slot.
*/

use anyhow::{Context, Result};
use clap::Parser;
use common::{secret_from_env, Config};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use newsposter::events::JsonlEventSink;
use newsposter::images::{download::HttpDownloader, pexels};
use newsposter::llm::remote::RemoteLlmProvider;
use newsposter::pipeline::{Collaborators, Pipeline, PipelineSettings};
use newsposter::publish::{freeimage, instagram, telegram};
use newsposter::retry::RetryPolicy;
use newsposter::sources::telegram_web;
use newsposter::store::ContentStore;
use newsposter::time_window::{parse_timezone, resolve_window_now, RunMode, DEFAULT_TIMEZONE};

#[derive(Parser, Debug)]
#[command(name = "newsposter", about = "Publish the news digest for one time slot")]
struct Args {
    /// Publishing slot to run
    #[arg(long, value_enum)]
    mode: RunMode,

    /// Publish the fallback digest even when no new messages were found
    #[arg(long)]
    force: bool,

    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = match Config::load_for_cli(args.config.as_deref()).await {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load configuration: {:#}", e);
            return Err(e);
        }
    };
    info!(config_override = ?args.config, "configuration loaded");

    let tz_name = config
        .schedule
        .as_ref()
        .and_then(|s| s.timezone.clone())
        .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
    let tz = parse_timezone(&tz_name)?;
    let window = resolve_window_now(args.mode, tz)?;
    info!(mode = %args.mode, timezone = %tz_name, %window, "window resolved");

    let store = match ContentStore::open(&config.database.path).await {
        Ok(store) => store,
        Err(e) => {
            error!(db_path = %config.database.path, "failed to open content store: {:#}", e);
            return Err(e);
        }
    };

    let collaborators = build_collaborators(&config).context("failed to initialize clients")?;
    let settings = PipelineSettings::from_config(&config);
    let pipeline = Pipeline::new(store, collaborators, settings);

    let outcome = pipeline.run(args.mode, window, args.force).await?;
    if !outcome.is_success() {
        anyhow::bail!("run {}", outcome);
    }
    Ok(())
}

/// Build every remote client from configuration. Secrets come from the
/// environment variables named in the config.
fn build_collaborators(config: &Config) -> Result<Collaborators> {
    let retry_cfg = config.retry.as_ref();
    let retry = RetryPolicy::new(
        retry_cfg.and_then(|r| r.attempts).unwrap_or(3),
        Duration::from_secs(retry_cfg.and_then(|r| r.backoff_seconds).unwrap_or(3)),
    );
    let timeout = retry_cfg.and_then(|r| r.timeout_seconds).unwrap_or(30);

    // Channel source
    let sources = config.sources.as_ref();
    let source = telegram_web::TelegramWebSource::new(
        sources
            .and_then(|s| s.base_url.clone())
            .unwrap_or_else(|| telegram_web::DEFAULT_BASE_URL.to_string()),
        sources.and_then(|s| s.timeout_seconds).unwrap_or(timeout),
        retry,
    )?;

    // Language model
    let llm_cfg = config.llm.as_ref().context("missing [llm] section")?;
    let llm_key = secret_from_env(llm_cfg.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY"))?;
    let llm = RemoteLlmProvider::new(
        llm_cfg
            .api_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
        llm_key,
        llm_cfg.model.clone().unwrap_or_else(|| "gpt-4o".to_string()),
    )
    .with_defaults(
        llm_cfg.timeout_seconds.unwrap_or(60),
        llm_cfg.max_tokens.unwrap_or(1500),
        0.7,
    );
    info!(model = llm.model(), "LLM provider initialized");

    // Image search and download
    let images_cfg = config.images.as_ref();
    let pexels_key = secret_from_env(
        images_cfg
            .and_then(|i| i.api_key_env.as_deref())
            .unwrap_or("PEXELS_API_KEY"),
    )?;
    let image_search = pexels::PexelsSearch::new(
        images_cfg
            .and_then(|i| i.api_url.clone())
            .unwrap_or_else(|| pexels::DEFAULT_API_URL.to_string()),
        pexels_key,
        images_cfg.and_then(|i| i.per_page).unwrap_or(30),
        timeout,
        retry,
    )?;
    let downloader = HttpDownloader::new(timeout, retry)?;

    // Asset host
    let freeimage_cfg = config.freeimage.as_ref();
    let freeimage_key = secret_from_env(
        freeimage_cfg
            .and_then(|f| f.api_key_env.as_deref())
            .unwrap_or("FREEIMAGE_API_KEY"),
    )?;
    let asset_host = freeimage::FreeImageHost::new(
        freeimage_cfg
            .and_then(|f| f.api_url.clone())
            .unwrap_or_else(|| freeimage::DEFAULT_API_URL.to_string()),
        freeimage_key,
        timeout,
        retry,
    )?;

    // Primary target: Telegram
    let tg_cfg = config.telegram.as_ref();
    let bot_token = secret_from_env(
        tg_cfg
            .and_then(|t| t.bot_token_env.as_deref())
            .unwrap_or("TELEGRAM_BOT_TOKEN"),
    )?;
    let chat_id = match tg_cfg.and_then(|t| t.channel_id.clone()) {
        Some(id) => id,
        None => secret_from_env(
            tg_cfg
                .and_then(|t| t.channel_id_env.as_deref())
                .unwrap_or("TELEGRAM_CHANNEL_ID"),
        )?,
    };
    let primary = telegram::TelegramTarget::new(
        tg_cfg
            .and_then(|t| t.api_url.clone())
            .unwrap_or_else(|| telegram::DEFAULT_API_URL.to_string()),
        bot_token,
        chat_id,
        timeout,
        retry,
    )?;

    // Secondary target: Instagram
    let ig_cfg = config.instagram.as_ref();
    let ig_user = secret_from_env(ig_cfg.and_then(|i| i.user_id_env.as_deref()).unwrap_or("IG_USER_ID"))?;
    let ig_token = secret_from_env(
        ig_cfg
            .and_then(|i| i.access_token_env.as_deref())
            .unwrap_or("IG_ACCESS_TOKEN"),
    )?;
    let secondary = instagram::InstagramTarget::new(
        ig_cfg
            .and_then(|i| i.api_url.clone())
            .unwrap_or_else(|| instagram::DEFAULT_API_URL.to_string()),
        ig_user,
        ig_token,
        timeout,
        retry,
    )?
    .with_publish_delay(Duration::from_secs(
        ig_cfg.and_then(|i| i.publish_delay_seconds).unwrap_or(5),
    ));

    let events_path = config
        .events
        .as_ref()
        .and_then(|e| e.path.clone())
        .unwrap_or_else(|| "logs/post_events.log".to_string());

    Ok(Collaborators {
        source: Arc::new(source),
        llm: Arc::new(llm),
        image_search: Arc::new(image_search),
        downloader: Arc::new(downloader),
        asset_host: Arc::new(asset_host),
        primary: Arc::new(primary),
        secondary: Arc::new(secondary),
        events: Arc::new(JsonlEventSink::new(events_path)),
    })
}
