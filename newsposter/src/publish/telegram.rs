use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use super::{split_caption, PostPayload, PublishTarget};
use crate::retry::{RemoteError, RetryPolicy};

const SERVICE: &str = "telegram";
pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Photo captions longer than this are rejected by the Bot API.
pub const MAX_CAPTION_CHARS: usize = 1024;

/// Posts the cover with the head of the digest as caption, then the rest of
/// the digest as a follow-up text message.
pub struct TelegramTarget {
    api_url: String,
    bot_token: String,
    chat_id: String,
    client: Client,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramTarget {
    pub fn new(
        api_url: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        timeout_secs: u64,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            client,
            retry,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.bot_token, method)
    }

    async fn send_photo(&self, post: &PostPayload, caption: &str) -> Result<(), RemoteError> {
        let photo = Part::bytes(post.image_bytes.clone())
            .file_name(post.filename.clone())
            .mime_str("image/jpeg")
            .map_err(|e| RemoteError::InvalidResponse {
                service: SERVICE,
                message: e.to_string(),
            })?;
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", escape_html(caption))
            .text("parse_mode", "HTML")
            .part("photo", photo);

        let response = self
            .client
            .post(self.method_url("sendPhoto"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(SERVICE, e))?;
        check_reply(response).await
    }

    async fn send_message(&self, text: &str) -> Result<(), RemoteError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": escape_html(text),
            "parse_mode": "HTML",
        });
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(SERVICE, e))?;
        check_reply(response).await
    }
}

#[async_trait::async_trait]
impl PublishTarget for TelegramTarget {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn create_post(&self, post: &PostPayload) -> Result<(), RemoteError> {
        let (caption, remainder) = split_caption(&post.caption, MAX_CAPTION_CHARS);

        self.retry
            .run("telegram sendPhoto", || self.send_photo(post, &caption))
            .await?;
        info!(chat = %self.chat_id, "photo posted to telegram");

        if let Some(rest) = remainder {
            self.retry
                .run("telegram sendMessage", || self.send_message(&rest))
                .await?;
            info!(chat = %self.chat_id, chars = rest.chars().count(), "caption remainder posted to telegram");
        }
        Ok(())
    }
}

async fn check_reply(response: reqwest::Response) -> Result<(), RemoteError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(RemoteError::from_status(SERVICE, status, body));
    }
    match serde_json::from_str::<ApiReply>(&body) {
        Ok(reply) if reply.ok => Ok(()),
        Ok(reply) => Err(RemoteError::InvalidResponse {
            service: SERVICE,
            message: reply.description.unwrap_or(body),
        }),
        Err(e) => Err(RemoteError::InvalidResponse {
            service: SERVICE,
            message: format!("{}: {}", e, body),
        }),
    }
}

/// Escape the characters the Bot API HTML parse mode treats as markup.
fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_characters() {
        assert_eq!(escape_html("S&P < 5000 > x"), "S&amp;P &lt; 5000 &gt; x");
    }
}
