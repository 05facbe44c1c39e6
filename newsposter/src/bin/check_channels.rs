// Prints what each configured channel currently exposes, without touching the
// content store. Useful to check channel names and the preview parser.

use std::path::PathBuf;

use clap::Parser;
use common::Config;
use newsposter::retry::RetryPolicy;
use newsposter::sources::telegram_web::{TelegramWebSource, DEFAULT_BASE_URL};
use newsposter::sources::ChannelSource;

#[derive(Parser, Debug)]
#[command(name = "check_channels", about = "List recent messages of the configured channels")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Messages to show per channel
    #[arg(long, default_value_t = 5)]
    limit: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = Config::load_for_cli(args.config.as_deref()).await?;
    let sources = config
        .sources
        .ok_or_else(|| anyhow::anyhow!("no [sources] section in configuration"))?;

    let source = TelegramWebSource::new(
        sources.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        sources.timeout_seconds.unwrap_or(20),
        RetryPolicy::once(),
    )?;

    for channel in &sources.channels {
        println!("\n{}", "=".repeat(60));
        println!("Channel: {}", channel);
        println!("{}", "=".repeat(60));

        match source.fetch(channel, args.limit).await {
            Ok(messages) => {
                println!("✓ {} messages", messages.len());
                for (i, message) in messages.iter().enumerate() {
                    let preview: String = message.text.chars().take(120).collect();
                    println!("  {}. [{}] {}", i + 1, message.timestamp.to_rfc3339(), preview.replace('\n', " "));
                }
            }
            Err(e) => {
                println!("✗ Failed: {:#}", e);
            }
        }
    }
    Ok(())
}
