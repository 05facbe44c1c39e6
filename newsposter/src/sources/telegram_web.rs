use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use scraper::{ElementRef, Html, Node, Selector};
use std::time::Duration;
use tracing::{debug, info};

use super::{ChannelMessage, ChannelSource};
use crate::retry::{RemoteError, RetryPolicy};

const SERVICE: &str = "telegram-web";
pub const DEFAULT_BASE_URL: &str = "https://t.me/s";

/// Reads public channels through the Telegram web preview (`t.me/s/<name>`),
/// which needs no account or API credentials.
pub struct TelegramWebSource {
    base_url: String,
    client: Client,
    retry: RetryPolicy,
}

impl TelegramWebSource {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Newsposter/0.1.0")
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            retry,
        })
    }

    async fn fetch_page(&self, url: &str) -> Result<String, RemoteError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(SERVICE, status, body));
        }
        response
            .text()
            .await
            .map_err(|e| RemoteError::from_reqwest(SERVICE, e))
    }
}

#[async_trait::async_trait]
impl ChannelSource for TelegramWebSource {
    async fn fetch(&self, channel: &str, limit: usize) -> Result<Vec<ChannelMessage>> {
        let name = channel_name(channel).ok_or_else(|| anyhow!("invalid channel reference: {}", channel))?;
        let url = format!("{}/{}", self.base_url, name);

        let html = self
            .retry
            .run(&format!("fetch channel {}", name), || self.fetch_page(&url))
            .await?;

        let messages = parse_channel_page(&html)?;
        let skip = messages.len().saturating_sub(limit);
        info!(channel = name, found = messages.len(), kept = messages.len() - skip, "fetched channel page");
        Ok(messages.into_iter().skip(skip).collect())
    }
}

/// Extract the bare channel name from `https://t.me/name`, `t.me/s/name`,
/// `@name` or `name`.
pub fn channel_name(reference: &str) -> Option<&str> {
    let trimmed = reference.trim().trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let rest = rest
        .strip_prefix("t.me/")
        .or_else(|| rest.strip_prefix("telegram.me/"))
        .unwrap_or(rest);
    let rest = rest.strip_prefix("s/").unwrap_or(rest);
    let rest = rest.strip_prefix('@').unwrap_or(rest);

    let valid = !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(rest)
}

/// Parse the messages of a channel preview page, in page order (oldest first).
/// Messages without a timestamp are skipped; messages without text are kept
/// with an empty body.
pub fn parse_channel_page(html: &str) -> Result<Vec<ChannelMessage>> {
    let document = Html::parse_document(html);
    let message_sel = selector(".tgme_widget_message")?;
    let text_sel = selector(".tgme_widget_message_text")?;
    let time_sel = selector(".tgme_widget_message_date time")?;

    let mut messages = Vec::new();
    for message in document.select(&message_sel) {
        let Some(datetime) = message
            .select(&time_sel)
            .next()
            .and_then(|t| t.value().attr("datetime"))
        else {
            debug!("skipping channel message without timestamp");
            continue;
        };
        let Ok(timestamp) = DateTime::parse_from_rfc3339(datetime) else {
            debug!(datetime, "skipping channel message with unparseable timestamp");
            continue;
        };

        let text = message
            .select(&text_sel)
            .next()
            .map(message_text)
            .unwrap_or_default();

        messages.push(ChannelMessage::new(text, timestamp.with_timezone(&Utc)));
    }
    Ok(messages)
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {}: {:?}", css, e))
}

fn message_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in element.descendants() {
        match node.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) if el.name() == "br" => out.push('\n'),
            _ => {}
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PAGE: &str = r#"
    <html><body><section class="tgme_channel_history">
      <div class="tgme_widget_message_wrap">
        <div class="tgme_widget_message" data-post="markettwits/100">
          <div class="tgme_widget_message_text">Индекс Мосбиржи <b>растёт</b><br/>+1,2%</div>
          <div class="tgme_widget_message_info">
            <a class="tgme_widget_message_date" href="https://t.me/markettwits/100">
              <time datetime="2024-05-10T04:30:00+00:00">07:30</time>
            </a>
          </div>
        </div>
      </div>
      <div class="tgme_widget_message_wrap">
        <div class="tgme_widget_message" data-post="markettwits/101">
          <div class="tgme_widget_message_photo_wrap"></div>
          <div class="tgme_widget_message_info">
            <a class="tgme_widget_message_date" href="https://t.me/markettwits/101">
              <time datetime="2024-05-10T05:00:00+00:00">08:00</time>
            </a>
          </div>
        </div>
      </div>
      <div class="tgme_widget_message_wrap">
        <div class="tgme_widget_message" data-post="markettwits/102">
          <div class="tgme_widget_message_text">no date here</div>
        </div>
      </div>
    </section></body></html>
    "#;

    #[test]
    fn parses_text_and_timestamps() {
        let messages = parse_channel_page(PAGE).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "Индекс Мосбиржи растёт\n+1,2%");
        assert_eq!(
            messages[0].timestamp,
            Utc.with_ymd_and_hms(2024, 5, 10, 4, 30, 0).unwrap()
        );
        assert_eq!(messages[1].text, "");
    }

    #[test]
    fn channel_name_accepts_common_forms() {
        assert_eq!(channel_name("https://t.me/markettwits"), Some("markettwits"));
        assert_eq!(channel_name("https://t.me/s/moexdiv/"), Some("moexdiv"));
        assert_eq!(channel_name("@if_market_news"), Some("if_market_news"));
        assert_eq!(channel_name("thewallstreetpro"), Some("thewallstreetpro"));
        assert_eq!(channel_name("https://t.me/"), None);
        assert_eq!(channel_name("bad name"), None);
    }

    #[tokio::test]
    async fn fetch_keeps_newest_messages() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/markettwits")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(PAGE)
            .create_async()
            .await;

        let source = TelegramWebSource::new(server.url(), 5, RetryPolicy::once()).unwrap();
        let messages = source.fetch("https://t.me/markettwits", 1).await.unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].timestamp,
            Utc.with_ymd_and_hms(2024, 5, 10, 5, 0, 0).unwrap()
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_surfaces_missing_channel() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/ghost")
            .with_status(404)
            .create_async()
            .await;

        let source = TelegramWebSource::new(server.url(), 5, RetryPolicy::once()).unwrap();
        let err = source.fetch("ghost", 10).await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
